//! Static HTTP Responder: index/token/parent routes plus the Basic/header
//! auth gate they share with the WebSocket upgrade path (spec.md §4.6).
//!
//! The embedded page is shipped gzip-compressed (built once, ahead of time,
//! the same way the pack's `early-boot-config` crate ships precompressed
//! fixtures) and served as-is with `Content-Encoding: gzip` when the client
//! advertises support; otherwise it is decompressed once and the plain
//! bytes are cached behind a `OnceLock` so repeat requests don't re-inflate.

use std::io::Read;
use std::sync::{Arc, OnceLock};

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use flate2::read::GzDecoder;

use crate::admission;
use crate::server::AppState;

/// The packaged index page, compressed ahead of time (see `assets/`).
static INDEX_HTML_GZ: &[u8] = include_bytes!("../assets/index.html.gz");
static INDEX_HTML_PLAIN: OnceLock<Vec<u8>> = OnceLock::new();

fn decompressed_index() -> &'static [u8] {
    INDEX_HTML_PLAIN.get_or_init(|| {
        let mut out = Vec::new();
        GzDecoder::new(INDEX_HTML_GZ)
            .read_to_end(&mut out)
            .expect("embedded index.html.gz is valid gzip");
        out
    })
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|enc| enc.trim().starts_with("gzip")))
        .unwrap_or(false)
}

/// 401 with the `WWW-Authenticate` challenge the spec's Basic-auth scenario
/// expects, shared by every HTTP route that requires a credential.
fn unauthorized() -> Response {
    let mut resp = StatusCode::UNAUTHORIZED.into_response();
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(r#"Basic realm="ttyd""#),
    );
    resp
}

/// `GET index` (or base-path root): the embedded HTML, or a file named by
/// `-I/--index` if the operator supplied one.
pub async fn index(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if admission::check_http_auth(&state.config, &headers).is_err() {
        return unauthorized();
    }

    if let Some(path) = &state.config.index_override {
        return match std::fs::read(path) {
            Ok(bytes) => ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], bytes).into_response(),
            Err(e) => {
                log::error!("failed to read index override {}: {e}", path.display());
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
    }

    if accepts_gzip(&headers) {
        (
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
                (header::CONTENT_ENCODING, "gzip".to_string()),
            ],
            INDEX_HTML_GZ,
        )
            .into_response()
    } else {
        (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            decompressed_index().to_vec(),
        )
            .into_response()
    }
}

/// `GET token`: `{"token":"<credential-or-empty>"}`. The browser front-end
/// reads this back as the WebSocket handshake's `AuthToken` so the same
/// credential is never hand-typed twice.
pub async fn token(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if admission::check_http_auth(&state.config, &headers).is_err() {
        return unauthorized();
    }

    let token = match &state.config.auth {
        crate::config::AuthMode::Basic { credential_b64 } => credential_b64.clone(),
        _ => String::new(),
    };
    let body = serde_json::json!({ "token": token });
    (
        [(header::CONTENT_TYPE, "application/json;charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}

/// `GET parent`: redirects to `index`, adding a trailing slash when a base
/// path is configured.
pub async fn parent(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if admission::check_http_auth(&state.config, &headers).is_err() {
        return unauthorized();
    }
    Redirect::to(&state.config.endpoints.index).into_response()
}
