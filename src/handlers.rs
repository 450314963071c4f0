//! Fixed-content handlers: the dashboard page and the health check

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::Path;
use tracing::error;

use crate::error::text_response;

/// Health check document. Field order matters for the wire format, so this
/// is a struct rather than an ad-hoc JSON value.
#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    services: [&'static str; 2],
}

const HEALTH: HealthStatus = HealthStatus {
    status: "healthy",
    services: ["streamlit", "api"],
};

/// Respond to `GET /api/health`. Always the same body, regardless of query
/// string or headers.
pub fn health_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_string(&HEALTH).expect("static health document serializes");

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with static headers")
}

/// Respond to `GET /` with the dashboard page read from disk. The file is
/// read per request and never written by the gateway, so repeated requests
/// return byte-identical content.
pub async fn index_response(page_path: &Path) -> Response<BoxBody<Bytes, hyper::Error>> {
    match tokio::fs::read(page_path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(bytes)).map_err(|e| match e {}).boxed())
            .expect("valid response with static headers"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!(path = %page_path.display(), "Dashboard page not found");
            text_response(StatusCode::NOT_FOUND, "Not Found")
        }
        Err(e) => {
            error!(path = %page_path.display(), error = %e, "Failed to read dashboard page");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_body_is_exact() {
        let body = serde_json::to_string(&HEALTH).unwrap();
        assert_eq!(
            body,
            r#"{"status":"healthy","services":["streamlit","api"]}"#
        );
    }

    #[test]
    fn test_health_response_headers() {
        let response = health_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_index_serves_file() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("dashboard.html");
        std::fs::write(&page, "<html><body>dash</body></html>").unwrap();

        let response = index_response(&page).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_index_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = index_response(&dir.path().join("missing.html")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
