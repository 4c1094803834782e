mod config;
mod error;
mod models;
mod routes;
mod runtime;
mod search;
mod snapshot;
mod stream;

use std::{fs, sync::Arc};

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use config::AppConfig;
use routes::register;
use runtime::{ContainerRuntime, DockerClient};
use search::{IndexBuilder, QueryResolver, SharedIndex};
use snapshot::SnapshotProvider;
use stream::{EventMultiplexer, LogMultiplexer};
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct AppState {
    pub snapshots: Arc<SnapshotProvider>,
    pub indexer: Arc<IndexBuilder>,
    pub resolver: QueryResolver,
    pub logs: LogMultiplexer,
    pub events: EventMultiplexer,
    pub stream_buffer: usize,
}

impl AppState {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &AppConfig) -> Self {
        let snapshots = Arc::new(SnapshotProvider::new(runtime, config.metadata_timeout));
        let index = SharedIndex::new();
        Self {
            indexer: Arc::new(IndexBuilder::new(Arc::clone(&snapshots), index.clone())),
            resolver: QueryResolver::new(index, Arc::clone(&snapshots), config.search_max_hits),
            logs: LogMultiplexer::new(Arc::clone(&snapshots), config.stream_buffer),
            events: EventMultiplexer::new(Arc::clone(&snapshots), config.stream_buffer),
            stream_buffer: config.stream_buffer,
            snapshots,
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::from_env().map_err(std::io::Error::other)?;

    fs::create_dir_all(&config.log_dir)?;
    let file_appender = rolling::never(&config.log_dir, "dockside.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let _guard = guard;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(std::io::Error::other)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let docker = DockerClient::new(&config.docker_socket);
    info!(
        host = %config.host,
        port = config.port,
        socket = %docker.socket_path().display(),
        "starting dockside"
    );

    let shared_state = web::Data::new(AppState::new(Arc::new(docker), &config));
    shared_state.indexer.trigger_rebuild();

    let bind_addr = format!("{}:{}", config.host, config.port);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(shared_state.clone())
            .configure(register)
    })
    .bind(bind_addr)?
    .run()
    .await
}
