use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use http::{header, Uri};
use pingora::protocols::http::ServerSession;

use crate::core::error::{IntakeError, IntakeResult};

/// Extracts the value of a specific query parameter from the request URI.
///
/// Returns the first occurrence of the parameter's value.
pub fn get_query_value<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
    uri.query().and_then(|query| {
        query.split('&').find_map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == name => Some(v.trim()),
            None if pair == name => Some(""),
            _ => None,
        })
    })
}

/// Percent-decode matched path parameters.
pub fn decode_path_params<'k, 'v>(
    params: impl IntoIterator<Item = (&'k str, &'v str)>,
) -> IntakeResult<BTreeMap<String, String>> {
    params
        .into_iter()
        .map(|(key, value)| {
            let decoded = urlencoding::decode(value).map_err(|_| {
                IntakeError::Validation(format!("path parameter {key} is not valid UTF-8"))
            })?;
            Ok((key.to_string(), decoded.into_owned()))
        })
        .collect()
}

/// Content type of the request, if present and valid UTF-8.
pub fn get_content_type(http_session: &ServerSession) -> Option<String> {
    http_session
        .get_header(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Read the whole request body, refusing anything above `limit` bytes.
pub async fn read_request_body(
    http_session: &mut ServerSession,
    limit: usize,
) -> IntakeResult<Bytes> {
    let mut body = BytesMut::new();
    while let Some(chunk) = http_session
        .read_request_body()
        .await
        .map_err(|e| IntakeError::Validation(format!("reading request body: {e}")))?
    {
        if body.len() + chunk.len() > limit {
            return Err(IntakeError::Validation(format!(
                "request body exceeds {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_query_value() {
        let uri: Uri = "/api/requests?order=desc&limit=5&flag".parse().unwrap();
        assert_eq!(get_query_value(&uri, "order"), Some("desc"));
        assert_eq!(get_query_value(&uri, "limit"), Some("5"));
        assert_eq!(get_query_value(&uri, "flag"), Some(""));
        assert_eq!(get_query_value(&uri, "missing"), None);

        let uri: Uri = "/api/requests".parse().unwrap();
        assert_eq!(get_query_value(&uri, "order"), None);
    }

    #[test]
    fn test_decode_path_params() {
        let params =
            decode_path_params([("id", "abc-1"), ("name", "project%20name"), ("file", "a%2Fb")])
                .unwrap();
        assert_eq!(params["id"], "abc-1");
        assert_eq!(params["name"], "project name");
        assert_eq!(params["file"], "a/b");

        assert!(matches!(
            decode_path_params([("name", "bad%FF")]),
            Err(IntakeError::Validation(_))
        ));
    }
}
