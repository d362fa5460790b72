//! HTTP Asset Server: serves the host-supplied PWA bundle from a pinned
//! root directory, confined against path traversal.
//!
//! Unlike an embedded-file endpoint (assets baked into the binary), the
//! bundle here lives at a path supplied by the host application, so this is
//! a hand-rolled confined-root endpoint.

use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use poem::http::{HeaderValue, StatusCode};
use poem::web::Data;
use poem::{handler, IntoResponse, Request, Response};
use tracing::*;

/// Extension allow-list mapped to MIME types. Anything else is served as
/// `application/octet-stream`.
const MIME_WHITELIST: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "text/javascript; charset=utf-8"),
    ("mjs", "text/javascript; charset=utf-8"),
    ("json", "application/json; charset=utf-8"),
    ("webmanifest", "application/manifest+json"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("ico", "image/x-icon"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("wasm", "application/wasm"),
    ("txt", "text/plain; charset=utf-8"),
];

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) => MIME_WHITELIST
            .iter()
            .find(|(candidate, _)| *candidate == ext)
            .map(|(_, mime)| *mime)
            .unwrap_or("application/octet-stream"),
        None => "application/octet-stream",
    }
}

/// Resolves `requested` (the URL-decoded request path) against `root`,
/// rejecting null bytes and anything that normalizes outside the root.
/// Returns `None` for a rejected path (caller responds 403).
fn resolve_confined_path(root: &Path, requested: &str) -> Option<PathBuf> {
    if requested.contains('\0') {
        return None;
    }
    let relative = requested.trim_start_matches('/');
    let relative = if relative.is_empty() { "index.html" } else { relative };

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            // ParentDir, RootDir, Prefix: any attempt to escape the root is rejected outright.
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let candidate = root.join(&normalized);
    Some(candidate)
}

#[handler]
pub async fn serve_asset(req: &Request, root: Data<&PathBuf>) -> Response {
    let decoded = match percent_decode_str(req.uri().path()).decode_utf8() {
        Ok(d) => d.into_owned(),
        Err(_) => return StatusCode::FORBIDDEN.into_response(),
    };

    let Some(candidate) = resolve_confined_path(root.0, &decoded) else {
        return StatusCode::FORBIDDEN.into_response();
    };

    // Canonicalize both sides so `..`-free but symlink-escaping paths are
    // still caught; a missing file canonicalizes to an error, handled below
    // as 404 rather than leaking the distinction from a 403.
    let root_canon = match tokio::fs::canonicalize(root.0).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let candidate = match tokio::fs::canonicalize(&candidate).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if candidate != root_canon && !candidate.starts_with(&root_canon) {
        warn!(?candidate, "asset request resolved outside confined root");
        return StatusCode::FORBIDDEN.into_response();
    }

    let body = match tokio::fs::read(&candidate).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let content_type = mime_for(&candidate);
    Response::builder()
        .header(poem::http::header::CONTENT_TYPE, HeaderValue::from_static(content_type))
        .body(body)
}
