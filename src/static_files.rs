//! Static asset handler
//!
//! Serves files from the configured static directory. Paths are resolved
//! strictly under the root; any `..` component is rejected before touching
//! the filesystem.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::text_response;

/// Get the Content-Type for a file extension
pub fn content_type_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js" | "mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("txt" | "md") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Resolve a URL path remainder to a file path under the static root.
/// Returns None for empty paths and for anything containing a parent or
/// absolute component.
fn resolve_under_root(root: &Path, rest: &str) -> Option<PathBuf> {
    let relative = rest.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }

    let relative = Path::new(relative);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }

    Some(root.join(relative))
}

/// Serve a file from the static directory. `rest` is the path remainder
/// after the static prefix, leading slash included.
pub async fn serve(root: &Path, rest: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let file_path = match resolve_under_root(root, rest) {
        Some(p) => p,
        None => {
            warn!(path = rest, "Rejected static path");
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        }
    };

    match tokio::fs::read(&file_path).await {
        Ok(bytes) => {
            let content_type =
                content_type_for(file_path.extension().and_then(|e| e.to_str()));
            debug!(path = %file_path.display(), bytes = bytes.len(), "Serving static file");
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type)
                .body(Full::new(Bytes::from(bytes)).map_err(|e| match e {}).boxed())
                .expect("valid response with static headers")
        }
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => text_response(StatusCode::NOT_FOUND, "Not Found"),
            std::io::ErrorKind::PermissionDenied => {
                warn!(path = %file_path.display(), "Permission denied reading static file");
                text_response(StatusCode::FORBIDDEN, "Forbidden")
            }
            _ => {
                warn!(path = %file_path.display(), error = %e, "Failed to read static file");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_mapping() {
        assert_eq!(content_type_for(Some("html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Some("css")), "text/css");
        assert_eq!(content_type_for(Some("js")), "application/javascript");
        assert_eq!(content_type_for(Some("png")), "image/png");
        assert_eq!(content_type_for(Some("bin")), "application/octet-stream");
        assert_eq!(content_type_for(None), "application/octet-stream");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = Path::new("/srv/static");
        assert!(resolve_under_root(root, "/../etc/passwd").is_none());
        assert!(resolve_under_root(root, "/a/../../b").is_none());
        assert!(resolve_under_root(root, "/..").is_none());
        assert!(resolve_under_root(root, "").is_none());
        assert!(resolve_under_root(root, "/").is_none());
    }

    #[test]
    fn test_resolve_normal_paths() {
        let root = Path::new("/srv/static");
        assert_eq!(
            resolve_under_root(root, "/app.css"),
            Some(PathBuf::from("/srv/static/app.css"))
        );
        assert_eq!(
            resolve_under_root(root, "/img/logo.png"),
            Some(PathBuf::from("/srv/static/img/logo.png"))
        );
    }

    #[tokio::test]
    async fn test_serve_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("style.css"), "body { margin: 0; }").unwrap();

        let response = serve(dir.path(), "/style.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/css");
    }

    #[tokio::test]
    async fn test_serve_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = serve(dir.path(), "/nope.js").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serve_unreadable_file_is_403() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.txt");
        std::fs::write(&path, "secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        // File modes don't apply to root, so the mapping is only observable
        // when the read actually fails
        if std::fs::read(&path).is_ok() {
            return;
        }

        let response = serve(dir.path(), "/locked.txt").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_serve_traversal_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = serve(dir.path(), "/../secret.txt").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
