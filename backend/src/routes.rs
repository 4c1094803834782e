use actix_web::{HttpRequest, HttpResponse, get, rt, web};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, trace};
use url::form_urlencoded;

use crate::{
    AppState,
    error::AppError,
    models::resources::{
        ContainerDetailsView, ContainerView, HostInfo, ImageDetailsView, ImageView, VolumeView,
    },
    stream::{self, DomainEvent},
};

const LAST_EVENT_ID: &str = "Last-Event-ID";

pub fn register(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(search)
        .service(log_events)
        .service(lifecycle_events)
        .service(list_containers)
        .service(container_details)
        .service(list_images)
        .service(image_details)
        .service(list_volumes)
        .service(host_info)
        .service(index_stats);
}

#[get("/healthz")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "dockside",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

#[get("/search")]
async fn search(
    query: web::Query<SearchQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let term = query.into_inner().q.unwrap_or_default();
    // Answered from the current index; the rebuild only affects later queries.
    if !term.trim().is_empty() {
        state.indexer.trigger_rebuild();
    }
    let response = state.resolver.search(&term).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[get("/logs/events")]
async fn log_events(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let ids = container_ids(req.query_string());
    if let Some(last_event_id) = last_event_id(&req) {
        debug!(last_event_id, "log client reconnected");
    }

    let logs = state.logs.stream_logs(ids).await?;
    info!(sources = logs.source_count(), "streaming container logs");

    let (writer, body) = stream::channel(state.stream_buffer);
    rt::spawn(async move {
        let events = logs.map(|line| {
            trace!(source = %line.source_id, timestamp = line.timestamp.as_deref(), "log line");
            DomainEvent::from(line)
        });
        let end = stream::forward(events, writer).await;
        debug!(?end, "log stream finished");
    });
    Ok(stream::sse_response(body))
}

#[get("/events")]
async fn lifecycle_events(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let events = state.events.stream_events(last_event_id(&req)).await?;

    let (writer, body) = stream::channel(state.stream_buffer);
    rt::spawn(async move {
        let end = stream::forward(events, writer).await;
        debug!(?end, "event stream finished");
    });
    Ok(stream::sse_response(body))
}

#[get("/containers")]
async fn list_containers(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut containers: Vec<ContainerView> = state
        .snapshots
        .containers()
        .await?
        .into_iter()
        .map(ContainerView::from)
        .collect();
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(containers))
}

#[get("/containers/{id}")]
async fn container_details(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let (details, processes) = state.snapshots.container_details(&id).await?;
    Ok(HttpResponse::Ok().json(ContainerDetailsView::new(details, processes)))
}

#[get("/images")]
async fn list_images(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut images: Vec<ImageView> = state
        .snapshots
        .images()
        .await?
        .into_iter()
        .map(ImageView::from)
        .collect();
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(images))
}

/// Accepts ids and references such as `ghcr.io/acme/api:1.2`.
#[get("/images/{reference:.*}")]
async fn image_details(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let reference = path.into_inner();
    let image = state.snapshots.image_details(&reference).await?;
    Ok(HttpResponse::Ok().json(ImageDetailsView::from(image)))
}

#[get("/volumes")]
async fn list_volumes(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut volumes: Vec<VolumeView> = state
        .snapshots
        .volumes()
        .await?
        .into_iter()
        .map(VolumeView::from)
        .collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(volumes))
}

#[get("/info")]
async fn host_info(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let info = state.snapshots.info().await?;
    Ok(HttpResponse::Ok().json(HostInfo::from(info)))
}

#[get("/index")]
async fn index_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.indexer.stats())
}

/// Every non-empty `containers_id` value, in request order.
fn container_ids(query_string: &str) -> Vec<String> {
    form_urlencoded::parse(query_string.as_bytes())
        .filter(|(key, _)| key == "containers_id")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn last_event_id(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
