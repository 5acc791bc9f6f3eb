use crate::error::{Result, SupervisorError};
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Long read timeout to accommodate slow generation; a pooled client per
/// child port is reused across requests rather than built fresh each time.
static CLIENTS: Lazy<Mutex<HashMap<u16, reqwest::Client>>> = Lazy::new(|| Mutex::new(HashMap::new()));

const HOP_BY_HOP: &[&str] = &["host", "content-length", "transfer-encoding"];

fn client_for(port: u16) -> reqwest::Client {
    let mut clients = CLIENTS.lock();
    clients
        .entry(port)
        .or_insert_with(|| {
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .timeout(Duration::from_secs(600))
                .build()
                .expect("reqwest client builder should not fail with static config")
        })
        .clone()
}

/// Compose the upstream URL, strip hop-by-hop headers, send the
/// buffered body, and stream the response straight back without parsing it.
pub async fn forward(
    port: u16,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let url = format!("http://127.0.0.1:{port}{path}{}", query.unwrap_or_default());
    let client = client_for(port);

    let mut request = client.request(method.clone(), &url);
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        request = request.header(name, value);
    }
    request = request.body(body);

    let upstream = request
        .send()
        .await
        .map_err(|e| SupervisorError::Internal(format!("upstream request failed: {e}")))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let upstream_headers = upstream.headers().clone();

    let stream = upstream.bytes_stream().map(|chunk| {
        chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    });

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str().to_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| SupervisorError::Internal(e.to_string()))
}
