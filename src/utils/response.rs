//! Response helpers shared by the intake API and the status probe.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;

use crate::core::error::IntakeError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
    pub const APPLICATION_JSON: &str = "application/json";
    pub const OCTET_STREAM: &str = "application/octet-stream";

    /// Content type of a stored file, from its extension.
    pub fn for_file_name(name: &str) -> &'static str {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "log" => TEXT_PLAIN,
            "json" => APPLICATION_JSON,
            "csv" => "text/csv",
            "pdf" => "application/pdf",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "doc" => "application/msword",
            "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            _ => OCTET_STREAM,
        }
    }
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn success_http(body: Vec<u8>, content_type: Option<&str>) -> Response<Vec<u8>> {
        Self::with_status(StatusCode::OK, body, content_type)
    }

    pub fn with_status(
        status: StatusCode,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Response<Vec<u8>> {
        let mut builder = Response::builder().status(status);

        if let Some(ct) = content_type {
            match HeaderValue::from_str(ct) {
                Ok(header_value) => {
                    builder = builder.header(header::CONTENT_TYPE, header_value);
                }
                Err(e) => {
                    log::error!("Invalid content type '{ct}': {e}");
                }
            }
        }

        builder.body(body).unwrap_or_else(|e| {
            log::error!("Failed to build response: {e}");
            Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        })
    }

    /// Plain-text error response.
    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        let mut response = Response::new(message.as_bytes().to_vec());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type::TEXT_PLAIN),
        );
        response
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(json_body) => {
                Self::with_status(status, json_body, Some(content_type::APPLICATION_JSON))
            }
            Err(e) => {
                log::error!("Failed to serialize JSON response: {e}");
                Self::error_http(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                )
            }
        }
    }

    /// Map an [`IntakeError`] onto its status code with the message as body.
    pub fn from_error(err: &IntakeError) -> Response<Vec<u8>> {
        let status = err.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {err}");
        } else {
            log::debug!("Request rejected: {err}");
        }
        Self::error_http(status, &err.to_string())
    }
}

/// Common error response helpers
pub struct CommonErrors;

impl CommonErrors {
    pub fn not_found() -> Response<Vec<u8>> {
        ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn method_not_allowed() -> Response<Vec<u8>> {
        ResponseBuilder::error_http(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response() {
        let response =
            ResponseBuilder::success_http(b"OK".to_vec(), Some(content_type::TEXT_PLAIN));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"OK");
    }

    #[test]
    fn test_json_response() {
        use serde_json::json;
        let data = json!({"success": true, "id": "REQ-1"});
        let response = ResponseBuilder::success_json(&data);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            content_type::APPLICATION_JSON
        );
        assert_eq!(response.body(), br#"{"id":"REQ-1","success":true}"#);
    }

    #[test]
    fn test_error_mapping() {
        let response =
            ResponseBuilder::from_error(&IntakeError::SchemaMalformed("bad.json".into()));
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.body(), b"Schema malformed: bad.json");

        let response = ResponseBuilder::from_error(&IntakeError::Workflow("busy".into()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_content_type_for_file_name() {
        assert_eq!(content_type::for_file_name("1_quote.PDF"), "application/pdf");
        assert_eq!(content_type::for_file_name("REQ-1_rfp.txt"), content_type::TEXT_PLAIN);
        assert_eq!(content_type::for_file_name("blob"), content_type::OCTET_STREAM);
    }
}
