//! Loading page and the static assets it pulls in
//!
//! Everything is embedded in the binary. The page carries the poll interval
//! and endpoint prefix in meta tags; `loading.js` reads them, polls the
//! health endpoint and reloads once the project reports ready.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::time::Duration;

/// URL prefix the bundled assets are served under
pub const STATIC_PREFIX: &str = "/static/";

/// Render the loading page for a project that is starting
pub fn render_loading_page(poll_interval: Duration, endpoint_prefix: &str) -> Response<ProxyBody> {
    let html = LOADING_HTML
        .replace("{{CHECK_INTERVAL_MS}}", &poll_interval.as_millis().to_string())
        .replace("{{ENDPOINT_PREFIX}}", &escape_attr(endpoint_prefix));

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(CACHE_CONTROL, "no-store")
        .body(Full::new(Bytes::from(html)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Serve a bundled asset by its path below [`STATIC_PREFIX`]
pub fn serve_static(name: &str) -> Response<ProxyBody> {
    let (content_type, body) = match name {
        "loading.js" => ("application/javascript", LOADING_JS),
        "loading.css" => ("text/css", LOADING_CSS),
        _ => return json_error_response(ProxyErrorCode::NotFound, "Asset not found"),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(CACHE_CONTROL, "public, max-age=3600")
        .body(Full::new(Bytes::from_static(body.as_bytes())).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

const LOADING_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta name="check-interval" content="{{CHECK_INTERVAL_MS}}">
    <meta name="endpoint-prefix" content="{{ENDPOINT_PREFIX}}">
    <title>Starting up...</title>
    <link rel="stylesheet" href="/static/loading.css">
</head>
<body>
    <main class="card">
        <div class="spinner" aria-hidden="true"></div>
        <h1>Waking things up</h1>
        <p>The application was asleep and is starting now.</p>
        <p class="hint">This page reloads on its own as soon as it is ready.</p>
    </main>
    <script src="/static/loading.js"></script>
</body>
</html>
"##;

const LOADING_JS: &str = r##"
const checkInterval = parseInt(
    document.querySelector('meta[name="check-interval"]')?.content || '5000',
    10
);
const endpointPrefix =
    document.querySelector('meta[name="endpoint-prefix"]')?.content || 'sleep-proxy';

async function pollHealth() {
    try {
        const response = await fetch(`/${endpointPrefix}/health`, { cache: 'no-store' });
        const data = await response.json();
        if (data.status === 'ready') {
            window.location.reload();
        }
    } catch (err) {
        console.debug('Still starting', err);
    }
}

pollHealth();
setInterval(pollHealth, checkInterval);
"##;

const LOADING_CSS: &str = r##"
* {
    box-sizing: border-box;
}

body {
    margin: 0;
    min-height: 100vh;
    display: flex;
    align-items: center;
    justify-content: center;
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
    background: #0f172a;
    color: #e2e8f0;
}

.card {
    text-align: center;
    padding: 3rem 2.5rem;
    border-radius: 12px;
    background: #1e293b;
    box-shadow: 0 10px 30px rgba(0, 0, 0, 0.35);
    max-width: 28rem;
}

h1 {
    font-size: 1.5rem;
    margin: 1.5rem 0 0.75rem;
}

p {
    margin: 0.25rem 0;
    color: #94a3b8;
}

.hint {
    font-size: 0.85rem;
    margin-top: 1rem;
}

.spinner {
    width: 48px;
    height: 48px;
    margin: 0 auto;
    border: 4px solid #334155;
    border-top-color: #38bdf8;
    border-radius: 50%;
    animation: spin 0.9s linear infinite;
}

@keyframes spin {
    to {
        transform: rotate(360deg);
    }
}
"##;
