use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("index build error: {0}")]
    IndexBuild(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("search index error: {0}")]
    Index(#[from] tantivy::TantivyError),
    #[error("stream source {source_id} failed: {message}")]
    StreamSource { source_id: String, message: String },
    #[error("stream write error: {0}")]
    StreamWrite(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Runtime(_) => StatusCode::BAD_GATEWAY,
            AppError::Snapshot(_) => StatusCode::BAD_GATEWAY,
            AppError::IndexBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Query(_) => StatusCode::BAD_REQUEST,
            AppError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::StreamSource { .. } => StatusCode::BAD_GATEWAY,
            AppError::StreamWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string()
        }))
    }
}
