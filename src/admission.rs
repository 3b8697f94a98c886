//! Admission & Routing: per-request policy checks applied before a
//! `Session` is ever created (spec.md §4.4).

use axum::http::HeaderMap;

use crate::config::{AuthMode, Config};
use crate::error::AdmissionError;

/// Outcome of the header/header-auth check: whether the request is allowed
/// through, and (for header auth) the user label to export as `TTYD_USER`.
pub struct AdmissionResult {
    pub user: Option<String>,
}

/// The client-count policy (`once`/`max_clients`), evaluated against a given
/// count. Pure and separately testable; the live path applies this same
/// logic inside `ServerState::try_reserve_slot`'s CAS loop so the check and
/// the increment happen atomically — a plain load-then-add here would let
/// two concurrent upgrades both observe `current == max_clients - 1` and
/// both be admitted, breaking `0 ≤ client_count ≤ max_clients`.
pub fn client_count_policy(config: &Config, current_clients: usize) -> Result<(), AdmissionError> {
    if config.once && current_clients > 0 {
        return Err(AdmissionError::OnceAlreadyServed);
    }
    if config.max_clients > 0 && current_clients >= config.max_clients {
        return Err(AdmissionError::MaxClientsReached);
    }
    Ok(())
}

/// Runs the remaining admission checks in the order spec.md §4.4 fixes,
/// after the caller has already reserved a client-count slot: authentication,
/// then path match, then origin.
pub fn check_admission(
    config: &Config,
    headers: &HeaderMap,
    request_path: &str,
) -> Result<AdmissionResult, AdmissionError> {
    let user = check_http_auth(config, headers)?;

    if request_path != config.endpoints.ws {
        return Err(AdmissionError::PathMismatch);
    }

    if config.check_origin {
        check_origin(headers)?;
    }

    Ok(AdmissionResult { user })
}

/// The authentication half of admission, factored out so the static HTTP
/// responder (`http.rs`) can apply the same `basic`/`header`/`none` policy
/// to plain requests as the WebSocket upgrade path does (spec.md §4.6).
pub fn check_http_auth(config: &Config, headers: &HeaderMap) -> Result<Option<String>, AdmissionError> {
    match &config.auth {
        AuthMode::None => Ok(None),
        AuthMode::Header { name } => {
            let value = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or(AdmissionError::AuthRejected)?;
            Ok(Some(value.to_string()))
        }
        AuthMode::Basic { credential_b64 } => {
            let provided = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split_once(' '))
                .map(|(_, b64)| b64)
                .ok_or(AdmissionError::AuthRejected)?;
            if provided != credential_b64 {
                return Err(AdmissionError::AuthRejected);
            }
            Ok(None)
        }
    }
}

/// Normalizes `Origin` and `Host` to `host[:port]` (eliding default ports
/// 80/443) and compares case-insensitively.
fn check_origin(headers: &HeaderMap) -> Result<(), AdmissionError> {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or(AdmissionError::OriginMismatch)?;
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or(AdmissionError::OriginMismatch)?;

    let origin_authority = strip_scheme_and_normalize(origin);
    let host_authority = normalize_authority(host);

    if origin_authority.eq_ignore_ascii_case(&host_authority) {
        Ok(())
    } else {
        Err(AdmissionError::OriginMismatch)
    }
}

fn strip_scheme_and_normalize(origin: &str) -> String {
    let without_scheme = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    normalize_authority(without_scheme)
}

fn normalize_authority(authority: &str) -> String {
    let authority = authority.trim_end_matches('/');
    match authority.rsplit_once(':') {
        Some((host, port)) if port == "80" || port == "443" => host.to_string(),
        _ => authority.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_rejects_when_already_serving_one() {
        let config = test_config(AuthMode::None);
        assert!(client_count_policy(&config, 0).is_ok());
        let mut once_config = config;
        once_config.once = true;
        assert!(client_count_policy(&once_config, 0).is_ok());
        assert_eq!(
            client_count_policy(&once_config, 1),
            Err(AdmissionError::OnceAlreadyServed)
        );
    }

    #[test]
    fn max_clients_rejects_at_cap() {
        let mut config = test_config(AuthMode::None);
        config.max_clients = 2;
        assert!(client_count_policy(&config, 1).is_ok());
        assert_eq!(
            client_count_policy(&config, 2),
            Err(AdmissionError::MaxClientsReached)
        );
    }

    #[test]
    fn same_origin_and_host_accepted() {
        assert!(check_origin(&headers(&[("origin", "http://example.com"), ("host", "example.com")])).is_ok());
    }

    #[test]
    fn different_origin_rejected() {
        assert!(check_origin(&headers(&[("origin", "http://other.com"), ("host", "example.com")])).is_err());
    }

    #[test]
    fn default_port_elided() {
        assert!(check_origin(&headers(&[("origin", "http://example.com:80"), ("host", "example.com")])).is_ok());
        assert!(check_origin(&headers(&[("origin", "https://example.com:443"), ("host", "example.com")])).is_ok());
    }

    #[test]
    fn case_insensitive_compare() {
        assert!(check_origin(&headers(&[("origin", "http://EXAMPLE.com"), ("host", "example.com")])).is_ok());
    }

    #[test]
    fn http_auth_none_always_passes() {
        let config = test_config(AuthMode::None);
        assert!(check_http_auth(&config, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn http_auth_basic_rejects_missing_header() {
        let config = test_config(AuthMode::Basic {
            credential_b64: "dXNlcjpwdw==".to_string(),
        });
        assert_eq!(
            check_http_auth(&config, &HeaderMap::new()),
            Err(AdmissionError::AuthRejected)
        );
    }

    #[test]
    fn http_auth_basic_accepts_matching_credential() {
        let config = test_config(AuthMode::Basic {
            credential_b64: "dXNlcjpwdw==".to_string(),
        });
        let h = headers(&[("authorization", "Basic dXNlcjpwdw==")]);
        assert_eq!(check_http_auth(&config, &h), Ok(None));
    }

    #[test]
    fn http_auth_header_exports_user() {
        let config = test_config(AuthMode::Header {
            name: "x-forwarded-user".to_string(),
        });
        let h = headers(&[("x-forwarded-user", "alice")]);
        assert_eq!(check_http_auth(&config, &h), Ok(Some("alice".to_string())));
    }

    fn test_config(auth: AuthMode) -> Config {
        Config {
            listen_addr: "0.0.0.0".to_string(),
            port: 7681,
            unix_socket: None,
            socket_owner: None,
            ipv6: false,
            tls: None,
            argv: vec!["/bin/sh".to_string()],
            cwd: None,
            terminal_type: "xterm-256color".to_string(),
            close_signal: libc::SIGHUP,
            auth,
            url_arg: false,
            writable: false,
            check_origin: false,
            max_clients: 0,
            once: false,
            exit_no_conn: false,
            ping_interval: std::time::Duration::from_secs(300),
            base_path: String::new(),
            index_override: None,
            client_preferences: serde_json::Value::Object(serde_json::Map::new()),
            endpoints: crate::config::Endpoints {
                ws: "/ws".to_string(),
                index: "/".to_string(),
                token: "/token".to_string(),
                parent: String::new(),
            },
            uid: None,
            gid: None,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                axum::http::HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }
}
