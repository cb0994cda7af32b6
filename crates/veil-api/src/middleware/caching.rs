//! Response caching middleware.
//!
//! Requests on the cacheable path prefixes are keyed by method, path,
//! sorted query, the Accept headers and — for multipart POSTs — a
//! normalized digest of field names plus the sha256 of each file part.
//! Responses carry an ETag (sha256 of the body); a matching
//! `If-None-Match` short-circuits to 304 without a body.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::{header, HeaderValue, Request, Response, StatusCode},
    middleware::Next,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use veil_cache::{body_etag, CachedResponse};

use crate::state::AppContext;

const CACHEABLE_PREFIXES: [&str; 5] = ["/ai", "/ml", "/batch", "/pdf", "/help"];

/// Upper bound on buffered request and response bodies; sized above the
/// upload limit so caching never rejects what a handler would accept.
const MAX_CACHEABLE_BODY: usize = 128 * 1024 * 1024;

/// TTL override header endpoints may set on their responses.
const TTL_OVERRIDE_HEADER: &str = "x-cache-ttl";

fn is_cacheable_path(path: &str) -> bool {
    CACHEABLE_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

/// Digest of a multipart body: sorted field names, and the sha256 of each
/// part's content. Falls back to hashing the raw bytes when the payload
/// does not parse as multipart.
fn multipart_digest(content_type: &str, body: &[u8]) -> String {
    let Some(boundary) = content_type
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
    else {
        return hex::encode(Sha256::digest(body));
    };

    let delimiter = format!("--{boundary}");
    let mut part_digests: Vec<String> = Vec::new();
    for raw_part in split_bytes(body, delimiter.as_bytes()) {
        let Some(header_end) = find_subslice(raw_part, b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&raw_part[..header_end]);
        let Some(name) = headers
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(|l| {
                l.split(';')
                    .map(str::trim)
                    .find_map(|p| p.strip_prefix("name="))
            })
            .map(|n| n.trim_matches('"').to_string())
        else {
            continue;
        };
        let content = raw_part[header_end + 4..]
            .strip_suffix(b"\r\n")
            .unwrap_or(&raw_part[header_end + 4..]);
        part_digests.push(format!("{name}:{}", hex::encode(Sha256::digest(content))));
    }
    part_digests.sort();
    hex::encode(Sha256::digest(part_digests.join("|").as_bytes()))
}

fn split_bytes<'a>(haystack: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut cursor = 0usize;
    while let Some(at) = find_subslice(&haystack[cursor..], delimiter) {
        let absolute = cursor + at;
        if absolute > cursor {
            parts.push(&haystack[cursor..absolute]);
        }
        cursor = absolute + delimiter.len();
    }
    if cursor < haystack.len() {
        parts.push(&haystack[cursor..]);
    }
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn sorted_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    let mut params: Vec<&str> = query.split('&').collect();
    params.sort_unstable();
    params.join("&")
}

pub async fn response_cache_middleware(
    State(context): State<Arc<AppContext>>,
    req: Request<Body>,
    next: Next,
) -> Response<Body> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    if !is_cacheable_path(&path) || !(method == http::Method::GET || method == http::Method::POST) {
        return next.run(req).await;
    }

    let accept = header_string(&req, header::ACCEPT);
    let accept_encoding = header_string(&req, header::ACCEPT_ENCODING);
    let if_none_match = header_string(&req, header::IF_NONE_MATCH);
    let query = sorted_query(req.uri().query());

    // POST bodies participate in the key; buffer and replay them.
    let (req, body_digest) = if method == http::Method::POST {
        let content_type = header_string(&req, header::CONTENT_TYPE);
        let (parts, body) = req.into_parts();
        let bytes = match to_bytes(body, MAX_CACHEABLE_BODY).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(error = %error, "Request body too large to cache, rejecting");
                return Response::builder()
                    .status(StatusCode::PAYLOAD_TOO_LARGE)
                    .body(Body::empty())
                    .expect("static response");
            }
        };
        let digest = if content_type.starts_with("multipart/") {
            multipart_digest(&content_type, &bytes)
        } else {
            hex::encode(Sha256::digest(&bytes))
        };
        (
            Request::from_parts(parts, Body::from(bytes)),
            digest,
        )
    } else {
        (req, String::new())
    };

    let cache_key = format!("{method}|{path}|{query}|{accept}|{accept_encoding}|{body_digest}");

    if let Some(hit) = context.response_cache.get(&cache_key) {
        if let Some(etag) = &hit.etag {
            if !if_none_match.is_empty() && if_none_match.trim_matches('"') == etag.as_str() {
                debug!(path = %path, "ETag match, responding 304");
                return Response::builder()
                    .status(StatusCode::NOT_MODIFIED)
                    .header(header::ETAG, format!("\"{etag}\""))
                    .body(Body::empty())
                    .expect("static response");
            }
        }
        debug!(path = %path, "Response cache hit");
        return replay(hit);
    }

    let response = next.run(req).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    let ttl_override = response
        .headers()
        .get(TTL_OVERRIDE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_CACHEABLE_BODY).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(error = %error, "Response body unreadable, passing through uncached");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let etag = body_etag(&bytes);
    let media_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    // Replayed alongside the body; everything else is re-derived.
    let kept_headers: Vec<(String, String)> = parts
        .headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(|v| vec![("content-disposition".to_string(), v.to_string())])
        .unwrap_or_default();

    context
        .response_cache
        .set(
            &cache_key,
            CachedResponse {
                body: bytes.to_vec(),
                status: parts.status.as_u16(),
                media_type,
                headers: kept_headers,
                etag: Some(etag.clone()),
            },
            ttl_override,
        )
        .await;

    parts.headers.insert(
        header::ETAG,
        HeaderValue::from_str(&format!("\"{etag}\"")).expect("hex etag is ascii"),
    );
    Response::from_parts(parts, Body::from(bytes))
}

fn header_string(req: &Request<Body>, name: header::HeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn replay(hit: CachedResponse) -> Response<Body> {
    let mut builder = Response::builder().status(hit.status);
    builder = builder.header(header::CONTENT_TYPE, hit.media_type);
    for (name, value) in &hit.headers {
        builder = builder.header(name, value);
    }
    if let Some(etag) = &hit.etag {
        builder = builder.header(header::ETAG, format!("\"{etag}\""));
    }
    builder = builder.header("x-veil-cache", "hit");
    builder.body(Body::from(hit.body)).expect("cached response rebuild")
}
