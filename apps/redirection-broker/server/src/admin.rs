use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;

use crate::facade::RedirectionService;
use crate::session::SessionSnapshot;

pub struct AdminState {
    pub service: RedirectionService,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    active_sessions: usize,
    sessions: Vec<SessionSnapshot>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/sessions", get(sessions_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn sessions_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let sessions = state.service.snapshot();
    Json(SessionsResponse {
        active_sessions: sessions.len(),
        sessions,
    })
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::ScriptedConnector;
    use crate::config::ServiceConfig;
    use crate::directory::StaticDirectory;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use redirection_core::ConnectionParameters;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test_timeout::tokio_timeout_test]
    async fn serves_health_and_session_snapshot() {
        let directory = StaticDirectory::from_entries([(
            "dev-1".into(),
            ConnectionParameters::new("10.0.0.5", "admin", "pw"),
        )]);
        let service = RedirectionService::new(
            Arc::new(directory),
            Arc::new(ScriptedConnector::accepting()),
            ServiceConfig::default(),
        );
        service.open(&"dev-1".into()).await.unwrap();

        let state = Arc::new(AdminState {
            service,
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });

        let health = get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#"{"status":"ok"}"#));

        let sessions = get(addr, "/debug/sessions").await;
        assert!(sessions.contains(r#""active_sessions":1"#));
        assert!(sessions.contains(r#""endpoint_id":"dev-1""#));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.contains("text/plain"));

        server.abort();
    }
}
