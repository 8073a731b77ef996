//! Host-header routing onto mocked directories.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::debug;

use crate::daemon::registry::Registry;

/// Build the router shared by the HTTP and HTTPS listeners.
///
/// Every request goes through a single fallback that picks the directory by
/// host, so there are no fixed routes.
pub fn build_router(registry: Registry) -> Router {
    Router::new().fallback(route_request).with_state(registry)
}

async fn route_request(State(registry): State<Registry>, req: Request<Body>) -> Response {
    let Some(host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    let Some(root) = registry.lookup(&host) else {
        debug!(host = %host, "No mocked host matches request");
        return (StatusCode::NOT_FOUND, format!("{} is not mocked\n", host)).into_response();
    };

    debug!(host = %host, directory = ?root, path = %req.uri().path(), "Serving request");
    match ServeDir::new(&root).oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unhandled internal error: {}", err),
        )
            .into_response(),
    }
}

/// Target host of a request, lowercased and without port.
///
/// Prefers the `Host` header and falls back to the URI authority.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let authority = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))?;

    let host = strip_port(authority.trim()).trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => authority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::MockedHost;
    use tempfile::TempDir;

    fn create_test_registry(temp_dir: &TempDir) -> Registry {
        std::fs::write(temp_dir.path().join("index.html"), "<h1>hello</h1>").unwrap();
        std::fs::write(temp_dir.path().join("app.js"), "console.log(1)").unwrap();

        let registry = Registry::new();
        registry.insert(MockedHost::new("test.local", temp_dir.path()));
        registry
    }

    fn request(host: Option<&str>, uri: &str) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_index_for_mocked_host() {
        let temp_dir = TempDir::new().unwrap();
        let app = build_router(create_test_registry(&temp_dir));

        let response = app.oneshot(request(Some("test.local"), "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<h1>hello</h1>");
    }

    #[tokio::test]
    async fn test_serves_file_with_content_type() {
        let temp_dir = TempDir::new().unwrap();
        let app = build_router(create_test_registry(&temp_dir));

        let response = app
            .oneshot(request(Some("TEST.local:8080"), "/app.js"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("javascript"));
    }

    #[tokio::test]
    async fn test_unknown_host_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let app = build_router(create_test_registry(&temp_dir));

        let response = app
            .oneshot(request(Some("other.local"), "/"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.contains("other.local"));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let app = build_router(create_test_registry(&temp_dir));

        let response = app
            .oneshot(request(Some("test.local"), "/missing.css"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_request() {
        let temp_dir = TempDir::new().unwrap();
        let app = build_router(create_test_registry(&temp_dir));

        let response = app.oneshot(request(None, "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_registry_changes_are_visible_without_rebuild() {
        let temp_dir = TempDir::new().unwrap();
        let registry = create_test_registry(&temp_dir);
        let app = build_router(registry.clone());

        registry.clear();
        let response = app.oneshot(request(Some("test.local"), "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_request_host_sources() {
        assert_eq!(
            request_host(&request(Some("Example.COM:443"), "/")),
            Some("example.com".to_string())
        );
        assert_eq!(
            request_host(&request(None, "http://test.local:8080/path")),
            Some("test.local".to_string())
        );
        assert_eq!(request_host(&request(Some("test.local."), "/")), Some("test.local".to_string()));
        assert_eq!(request_host(&request(None, "/")), None);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("test.local"), "test.local");
        assert_eq!(strip_port("test.local:80"), "test.local");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }
}
