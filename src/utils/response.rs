//! Response helpers shared by the control surface and the edge proxy.

use http::{header, Response, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use serde::Serialize;
use serde_json::json;

/// Standard content types
pub mod content_type {
    pub const APPLICATION_JSON: &str = "application/json";
}

/// Body substituted for intercepted upstream 404s.
pub const NOT_FOUND_BODY: &[u8] = br#"{"error": "Not Found"}"#;

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Build a JSON HTTP Response with the given status
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(body) => Self::with_body(status, content_type::APPLICATION_JSON, body),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::error_json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                )
            }
        }
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        Self::json(StatusCode::OK, data)
    }

    /// `{"error": message}` with the given status
    pub fn error_json(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        let body = json!({ "error": message }).to_string().into_bytes();
        Self::with_body(status, content_type::APPLICATION_JSON, body)
    }

    fn with_body(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("Failed to build response: {}", e);
                let mut fallback = Response::new(b"Internal Server Error".to_vec());
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }

    /// Rewrites an upstream response header so it frames [`NOT_FOUND_BODY`].
    ///
    /// The status is kept; only the entity headers change.
    pub fn rewrite_as_not_found_json(resp: &mut ResponseHeader) -> Result<()> {
        resp.remove_header(&header::TRANSFER_ENCODING);
        resp.remove_header(&header::CONTENT_ENCODING);
        resp.remove_header(&header::ETAG);
        resp.insert_header(header::CONTENT_TYPE, content_type::APPLICATION_JSON)?;
        resp.insert_header(header::CONTENT_LENGTH, NOT_FOUND_BODY.len().to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response() {
        let data = json!({"message": "success", "code": 200});
        let response = ResponseBuilder::success_json(&data);
        assert_eq!(response.status(), StatusCode::OK);
        let expected = r#"{"code":200,"message":"success"}"#;
        assert_eq!(response.body(), expected.as_bytes());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            content_type::APPLICATION_JSON
        );
    }

    #[test]
    fn test_error_json() {
        let response = ResponseBuilder::error_json(StatusCode::CONFLICT, "busy");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.body(), br#"{"error":"busy"}"#);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "16");
    }

    #[test]
    fn test_not_found_rewrite() {
        let mut resp = ResponseHeader::build(StatusCode::NOT_FOUND, None).unwrap();
        resp.insert_header(header::CONTENT_TYPE, "text/html").unwrap();
        resp.insert_header(header::TRANSFER_ENCODING, "chunked")
            .unwrap();

        ResponseBuilder::rewrite_as_not_found_json(&mut resp).unwrap();

        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(resp.headers.get(header::CONTENT_LENGTH).unwrap(), "22");
        assert!(resp.headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(NOT_FOUND_BODY, br#"{"error": "Not Found"}"#);
    }
}
