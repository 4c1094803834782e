use std::{env, path::PathBuf, time::Duration};

use crate::error::AppError;

const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub docker_socket: PathBuf,
    pub log_dir: PathBuf,
    pub metadata_timeout: Duration,
    pub search_max_hits: usize,
    pub stream_buffer: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let port: u16 = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "4242".into())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid SERVER_PORT: {err}")))?;

        let docker_socket = parse_docker_host(
            &env::var("DOCKER_HOST").unwrap_or_else(|_| format!("unix://{DEFAULT_DOCKER_SOCKET}")),
        )?;

        let log_dir = PathBuf::from(env::var("DOCKSIDE_LOG_DIR").unwrap_or_else(|_| "./log".into()));

        let timeout_ms: u64 = env::var("METADATA_TIMEOUT_MS")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid METADATA_TIMEOUT_MS: {err}")))?;

        let search_max_hits: usize = env::var("SEARCH_MAX_HITS")
            .unwrap_or_else(|_| "10".into())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid SEARCH_MAX_HITS: {err}")))?;

        let stream_buffer: usize = env::var("STREAM_BUFFER")
            .unwrap_or_else(|_| "64".into())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid STREAM_BUFFER: {err}")))?;
        if stream_buffer == 0 {
            return Err(AppError::Config("STREAM_BUFFER must be positive".into()));
        }

        Ok(Self {
            host,
            port,
            docker_socket,
            log_dir,
            metadata_timeout: Duration::from_millis(timeout_ms),
            search_max_hits,
            stream_buffer,
        })
    }
}

/// Accepts `unix:///path` or a bare socket path. TCP hosts are rejected.
fn parse_docker_host(value: &str) -> Result<PathBuf, AppError> {
    let value = value.trim();
    if let Some(path) = value.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(AppError::Config("DOCKER_HOST has an empty socket path".into()));
        }
        return Ok(PathBuf::from(path));
    }
    if value.contains("://") {
        return Err(AppError::Config(format!(
            "unsupported DOCKER_HOST {value}: only unix sockets are supported"
        )));
    }
    Ok(PathBuf::from(value))
}
