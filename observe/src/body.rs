/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Snapshots of request and response data, redacted and bounded.
//!
//! Nothing here fails: data that cannot be read or parsed degrades to a descriptor, and
//! bodies are handed back byte-identical. A body whose stream broke mid-read is handed back
//! failing with the same error.

use std::borrow::Cow;
use std::collections::BTreeMap;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request};
use axum::response::Response;
use futures::{future, stream};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::form_urlencoded;
use vigil::mask::truncate_appended;
use vigil::{Config, MASK_SENTINEL};

/// Longest multipart field value kept before truncation.
pub const MAX_FIELD_LEN: usize = 200;

const MULTIPART: &str = "multipart/form-data";

/// Folds url-encoded pairs into an object. Keys seen once map to a string, repeated keys to
/// an array of every value in order.
pub fn fold_pairs<'a>(pairs: impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>) -> Map<String, Value> {
    let mut folded: Map<String, Value> = Map::new();
    for (key, value) in pairs {
        let value = Value::String(value.into_owned());
        match folded.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                folded.insert(key.into_owned(), value);
            }
        }
    }
    folded
}

/// Query string parameters, masked. An absent query yields an empty object.
pub fn query_params(query: Option<&str>, config: &Config) -> Value {
    let mut params = Value::Object(fold_pairs(form_urlencoded::parse(
        query.unwrap_or_default().as_bytes(),
    )));
    config.mask_json(&mut params);
    params
}

/// Header snapshot with masked values replaced. Repeated headers are joined with `, `.
pub fn capture_headers(headers: &HeaderMap, config: &Config) -> BTreeMap<String, String> {
    let mut captured: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        let value = if config.is_masked(name) {
            MASK_SENTINEL.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        captured
            .entry(name.to_string())
            .and_modify(|existing| {
                if existing != MASK_SENTINEL {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
            })
            .or_insert(value);
    }
    captured
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn size_descriptor(note: String, size: usize) -> Value {
    json!({"_note": note, "size": size})
}

/// Parses a request body according to its content type, masking every sensitive field.
pub fn parse_body(bytes: &[u8], content_type: &str, config: &Config) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }

    let lowered = content_type.to_ascii_lowercase();
    let mut value = if lowered.contains("application/json") {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => value,
            Err(_) => return Some(size_descriptor("unparseable json body".to_string(), bytes.len())),
        }
    } else if lowered.contains("application/x-www-form-urlencoded") {
        Value::Object(fold_pairs(form_urlencoded::parse(bytes)))
    } else if lowered.contains(MULTIPART) {
        match boundary(content_type) {
            Some(boundary) => json!({
                "_type": MULTIPART,
                "fields": Value::Object(parse_multipart(bytes, &boundary)),
            }),
            None => return Some(size_descriptor("multipart body without boundary".to_string(), bytes.len())),
        }
    } else {
        let shown = if lowered.is_empty() { "unknown" } else { lowered.as_str() };
        return Some(size_descriptor(format!("binary data ({shown})"), bytes.len()));
    };

    config.mask_json(&mut value);
    Some(value)
}

fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim().eq_ignore_ascii_case("boundary").then(|| value.trim().trim_matches('"').to_string())
    })
}

fn disposition_param(disposition: &str, key: &str) -> Option<String> {
    disposition.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        (k.trim().eq_ignore_ascii_case(key)).then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Field name to value for every part. File parts become a `[FILE: name]` marker.
pub fn parse_multipart(bytes: &[u8], boundary: &str) -> Map<String, Value> {
    let text = String::from_utf8_lossy(bytes);
    let delimiter = format!("--{boundary}");
    let mut fields = Map::new();

    for part in text.split(delimiter.as_str()) {
        let part = part.strip_prefix("\r\n").unwrap_or(part);
        if part.is_empty() || part.starts_with("--") {
            continue;
        }
        let Some((head, body)) = part.split_once("\r\n\r\n") else {
            continue;
        };
        let Some(disposition) = head.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-disposition")
                .then_some(value)
        }) else {
            continue;
        };
        let Some(name) = disposition_param(disposition, "name") else {
            continue;
        };

        let value = match disposition_param(disposition, "filename") {
            Some(filename) => format!("[FILE: {filename}]"),
            None => truncate_appended(body.strip_suffix("\r\n").unwrap_or(body), MAX_FIELD_LEN),
        };
        fields.insert(name, Value::String(value));
    }
    fields
}

/// Reads, parses and reinserts the body of a `POST`, `PUT` or `PATCH` request.
pub async fn capture_request_body(req: Request<Body>, config: &Config) -> (Request<Body>, Option<Value>) {
    if !matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
        return (req, None);
    }

    let content_type = content_type(req.headers());
    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            let value = parse_body(&bytes, &content_type, config);
            (Request::from_parts(parts, Body::from(bytes)), value)
        }
        Err(e) => {
            debug!("Could not read request body: {e}");
            (
                Request::from_parts(parts, failed_body(e)),
                Some(json!({"_note": "unreadable body"})),
            )
        }
    }
}

/// Buffers and parses JSON response bodies when response capture is on. Everything else
/// passes through untouched.
pub async fn capture_response_body(response: Response, config: &Config) -> (Response, Option<Value>) {
    let is_json = content_type(response.headers())
        .to_ascii_lowercase()
        .starts_with("application/json");
    if !config.enable_response_body || !is_json {
        return (response, None);
    }

    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => {
            let value = parse_json(&bytes, config);
            (Response::from_parts(parts, Body::from(bytes)), value)
        }
        Err(e) => {
            debug!("Could not read response body: {e}");
            (Response::from_parts(parts, failed_body(e)), None)
        }
    }
}

/// A body that fails with `error` on first read. The bytes consumed before the failure
/// cannot be recovered, so downstream sees the broken stream rather than a short body.
fn failed_body(error: axum::Error) -> Body {
    Body::from_stream(stream::once(future::ready(Err::<Bytes, _>(error))))
}

fn parse_json(bytes: &Bytes, config: &Config) -> Option<Value> {
    let mut value = serde_json::from_slice::<Value>(bytes).ok()?;
    config.mask_json(&mut value);
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn repeated_form_keys_become_arrays() {
        let config = Config::default();
        let body = parse_body(
            b"name=ann&tag=a&tag=b&tag=c&password=pw",
            "application/x-www-form-urlencoded",
            &config,
        )
        .unwrap();
        assert_eq!(
            body,
            json!({"name": "ann", "tag": ["a", "b", "c"], "password": MASK_SENTINEL})
        );
    }

    #[test]
    fn multipart_fields_and_files() {
        let long = "y".repeat(250);
        let raw = format!(
            "--XyZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n\
             --XyZ\r\nContent-Disposition: form-data; name=\"token\"\r\n\r\nsecret-value\r\n\
             --XyZ\r\nContent-Disposition: form-data; name=\"bio\"\r\n\r\n{long}\r\n\
             --XyZ\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\n\x01\x02\r\n--XyZ--\r\n"
        );
        let body = parse_body(raw.as_bytes(), "multipart/form-data; boundary=XyZ", &Config::default()).unwrap();

        assert_eq!(body["_type"], json!(MULTIPART));
        let fields = &body["fields"];
        assert_eq!(fields["title"], json!("hello"));
        assert_eq!(fields["token"], json!(MASK_SENTINEL));
        assert_eq!(fields["upload"], json!("[FILE: a.png]"));
        let bio = fields["bio"].as_str().unwrap();
        assert_eq!(bio.len(), MAX_FIELD_LEN + 3);
        assert!(bio.ends_with("..."));
    }

    #[test]
    fn unknown_and_broken_bodies_degrade_to_descriptors() {
        let config = Config::default();
        assert_eq!(
            parse_body(&[0xde, 0xad], "application/octet-stream", &config),
            Some(json!({"_note": "binary data (application/octet-stream)", "size": 2}))
        );
        assert_eq!(
            parse_body(b"{not json", "application/json", &config).unwrap()["size"],
            json!(9)
        );
        assert_eq!(parse_body(b"", "application/json", &config), None);
    }

    #[test]
    fn headers_are_masked_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert("x-api-key", HeaderValue::from_static("k"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let captured = capture_headers(&headers, &Config::default());
        assert_eq!(captured["authorization"], MASK_SENTINEL);
        assert_eq!(captured["x-api-key"], MASK_SENTINEL);
        assert_eq!(captured["accept"], "text/html, application/json");
    }

    fn broken_body() -> Body {
        Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"{\"name\":")),
            Err(std::io::Error::other("connection reset")),
        ]))
    }

    #[tokio::test]
    async fn unreadable_request_body_still_fails_for_the_handler() {
        let req = Request::post("/items")
            .header(header::CONTENT_TYPE, "application/json")
            .body(broken_body())
            .unwrap();

        let (req, value) = capture_request_body(req, &Config::default()).await;
        assert_eq!(value, Some(json!({"_note": "unreadable body"})));
        let err = axum::body::to_bytes(req.into_body(), usize::MAX).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn unreadable_response_body_still_fails_for_the_client() {
        let response = Response::builder()
            .status(201)
            .header(header::CONTENT_TYPE, "application/json")
            .body(broken_body())
            .unwrap();

        let (response, value) = capture_response_body(response, &Config::default()).await;
        assert_eq!(value, None);
        assert_eq!(response.status(), 201);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    #[test]
    fn query_params_fold_and_mask() {
        let params = query_params(Some("a=1&a=2&api_key=z&b=x"), &Config::default());
        assert_eq!(params, json!({"a": ["1", "2"], "api_key": MASK_SENTINEL, "b": "x"}));
        assert_eq!(query_params(None, &Config::default()), json!({}));
    }
}
