use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Status,
    core::status,
    utils::response::{CommonErrors, ResponseBuilder},
};

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Readiness probe on its own listener.
///
/// `/status/ready` answers 200 with `{"status": "ok"}` once the schema catalog and the
/// request log are up, and 503 naming what is still pending otherwise.
pub struct StatusHttpApp {
    config: Status,
}

impl StatusHttpApp {
    pub fn new(cfg: &Status) -> Self {
        Self {
            config: cfg.clone(),
        }
    }

    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let app = Self::new(cfg);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        match http_session.req_header().uri.path() {
            "/status/ready" => ready_response(),
            _ => CommonErrors::not_found(),
        }
    }
}

fn ready_response() -> Response<Vec<u8>> {
    let pending = status::pending();
    if pending.is_empty() {
        let response = StatusResponse {
            status: "ok".to_string(),
            error: None,
        };
        ResponseBuilder::json(StatusCode::OK, &response)
    } else {
        let names: Vec<&str> = pending.iter().map(|c| c.as_str()).collect();
        let response = StatusResponse {
            status: "error".to_string(),
            error: Some(format!("waiting for {}", names.join(", "))),
        };
        ResponseBuilder::json(StatusCode::SERVICE_UNAVAILABLE, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::{tests::TEST_LOCK, Component};

    #[test]
    fn test_ready_response() {
        let _guard = TEST_LOCK.lock().unwrap();
        status::reset();

        status::mark_ready(Component::SchemaCatalog);
        let resp = ready_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "waiting for request log");

        status::mark_ready(Component::RequestLog);
        let resp = ready_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_slice(), br#"{"status":"ok"}"#);
    }
}
