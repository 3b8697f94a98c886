//! Server Core: process-wide config and counters, the listener, the axum
//! router, signal handling and graceful shutdown (spec.md §4.5).
//!
//! Generalizes the teacher's `StatusServer` (one POST route, a single
//! `Arc<ServerState>`, never shuts down) to the full `{ws, index, token,
//! parent}` surface, TCP/UNIX-socket/TLS listening, and the two-signal
//! escalation the spec's exit-code table requires.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, OriginalUri, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::admission::{self, AdmissionResult};
use crate::config::Config;
use crate::error::{AdmissionError, ServerError};
use crate::http as static_http;
use crate::session::{self, Session};

/// Mutable, process-wide state, shared via `Arc` across every handler and
/// session task. Mirrors the teacher's `Inner { sessions, next_id }`
/// pattern in `process_manager.rs`, generalized with the force-exit flag
/// and shutdown notifier the spec's signal/once/exit-no-conn rules need.
pub struct ServerState {
    pub client_count: AtomicUsize,
    pub force_exit: AtomicBool,
    pub shutdown_notify: Notify,
    next_session_id: AtomicU64,
    /// Live sessions keyed by id. Entries exist for logging/introspection
    /// only — each session owns and tears down its own PTY independently
    /// (spec.md §1 Non-goals: no cross-session sharing).
    sessions: DashMap<u64, String>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            client_count: AtomicUsize::new(0),
            force_exit: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            next_session_id: AtomicU64::new(1),
            sessions: DashMap::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, id: u64, peer_addr: &str) {
        self.sessions.insert(id, peer_addr.to_string());
    }

    pub fn deregister(&self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Atomically applies the `once`/`max_clients` count policy and, if it
    /// passes, reserves the slot in the same operation. A separate
    /// `load()`-then-`fetch_add()` would let two concurrent upgrades both
    /// observe `count == max_clients - 1`, both pass, and both increment —
    /// pushing `client_count` past `max_clients`. The CAS loop inside
    /// `fetch_update` closes that window: only one of two racing updaters
    /// can ever see the decision that passes.
    pub fn try_reserve_slot(&self, config: &Config) -> Result<(), AdmissionError> {
        let outcome = self
            .client_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                admission::client_count_policy(config, current).ok().map(|()| current + 1)
            });
        match outcome {
            Ok(_) => Ok(()),
            Err(current) => Err(admission::client_count_policy(config, current)
                .expect_err("fetch_update only fails when the policy itself rejects")),
        }
    }

    /// Releases a slot reserved by `try_reserve_slot` when a later admission
    /// check (auth/path/origin) rejects the request before a session ever
    /// starts — otherwise the reserved-but-unused slot would never be freed.
    pub fn release_slot(&self) {
        self.client_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared `axum` state: immutable config plus the mutable counters/registry.
pub struct AppState {
    pub config: Arc<Config>,
    pub state: Arc<ServerState>,
}

pub struct Server {
    config: Arc<Config>,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(ServerState::new()),
        }
    }

    /// Exposes the `state` handle so a caller (tests, or an embedder driving
    /// its own listener) can observe `client_count` / trigger shutdown
    /// without waiting on `run`.
    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// Builds the full `{ws, index, token, parent}` router against this
    /// server's state. `pub` so integration tests can bind it to their own
    /// ephemeral listener the same way `run` does internally.
    pub fn router(&self) -> Router {
        let app_state = Arc::new(AppState {
            config: self.config.clone(),
            state: self.state.clone(),
        });

        let ep = &self.config.endpoints;
        let mut router = Router::new()
            .route(&ep.ws, get(ws_handler))
            .route(&ep.index, get(static_http::index))
            .route(&ep.token, get(static_http::token));
        if !ep.parent.is_empty() && ep.parent != ep.index {
            router = router.route(&ep.parent, get(static_http::parent));
        }
        router.with_state(app_state)
    }

    /// Binds the configured listener (TCP, optionally IPv6-dual-stack, or a
    /// UNIX socket), drops privileges if `-u/-g` were given, logs the
    /// effective configuration, then serves until signaled or a
    /// once/exit-no-conn condition fires.
    ///
    /// Privilege drop happens after the bind, not before: a low TCP port
    /// (e.g. 80/443) or a socket path in a root-owned directory typically
    /// needs root to bind at all, and only needs to give it up once the
    /// listening fd already exists.
    pub async fn run(self) -> Result<(), ServerError> {
        log::info!(
            "webtty starting: argv={:?} writable={} check_origin={} max_clients={} once={} base_path={:?}",
            self.config.argv,
            self.config.writable,
            self.config.check_origin,
            self.config.max_clients,
            self.config.once,
            self.config.base_path
        );

        let state = self.state.clone();
        spawn_signal_handler(state.clone());

        if let Some(socket_path) = &self.config.unix_socket {
            // UNIX peers have no `SocketAddr`; the router omits connect-info
            // and the session's peer label falls back to "unix" (see
            // `ws_handler`'s `Option<ConnectInfo<_>>` extractor).
            let router = self.router().into_make_service();
            serve_unix(socket_path.clone(), self.config.socket_owner.clone(), self.config.uid, self.config.gid, router, state).await
        } else if let Some(tls) = &self.config.tls {
            let router = self.router().into_make_service_with_connect_info::<SocketAddr>();
            serve_tls(&self.config, tls, router, state).await
        } else {
            let router = self.router().into_make_service_with_connect_info::<SocketAddr>();
            serve_tcp(&self.config, router, state).await
        }
    }
}

async fn serve_tcp(
    config: &Config,
    router: axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    let addr = format!("{}:{}", config.listen_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::BindFailed { addr: addr.clone(), source: e })?;
    let local_addr = listener.local_addr().map_err(ServerError::Io)?;
    log::info!("listening on http://{local_addr}");

    drop_privileges(config.uid, config.gid)?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .map_err(ServerError::Io)
}

async fn serve_unix(
    path: PathBuf,
    owner: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    router: axum::routing::IntoMakeService<Router>,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path).map_err(|e| ServerError::BindFailed {
        addr: path.display().to_string(),
        source: e,
    })?;
    if let Some(owner) = owner {
        chown_unix_socket(&path, &owner)?;
    }
    log::info!("listening on unix:{}", path.display());

    drop_privileges(uid, gid)?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .map_err(ServerError::Io)
}

async fn serve_tls(
    config: &Config,
    tls: &crate::config::TlsConfig,
    router: axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
    state: Arc<ServerState>,
) -> Result<(), ServerError> {
    let cert = tls.cert.as_ref().ok_or(ServerError::TlsMissingMaterial)?;
    let key = tls.key.as_ref().ok_or(ServerError::TlsMissingMaterial)?;
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| ServerError::TlsInit(e.to_string()))?;

    let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| ServerError::BindFailed {
            addr: config.listen_addr.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
    log::info!("listening on https://{addr}");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal(state).await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    // axum-server binds lazily inside `serve`, so there is no separate
    // "already bound" point to drop privileges at without reaching into its
    // internals; drop here, immediately before the accept loop starts.
    drop_privileges(config.uid, config.gid)?;

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(router)
        .await
        .map_err(ServerError::Io)
}

/// Resolves once the signal handler (or a session's once/exit-no-conn
/// logic) has flipped `force_exit`.
async fn shutdown_signal(state: Arc<ServerState>) {
    loop {
        if state.force_exit.load(Ordering::Acquire) {
            return;
        }
        state.shutdown_notify.notified().await;
        if state.force_exit.load(Ordering::Acquire) {
            return;
        }
    }
}

/// Installs SIGINT/SIGTERM handlers. The first signal requests graceful
/// shutdown (flips `force_exit`, wakes the listener's shutdown future); a
/// second signal before the process has exited escalates to an immediate
/// `EXIT_FAILURE`, matching spec.md §6's exit-code table.
fn spawn_signal_handler(state: Arc<ServerState>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        log::info!("received shutdown signal, exiting gracefully");
        state.force_exit.store(true, Ordering::Release);
        state.shutdown_notify.notify_waiters();

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        log::warn!("received second shutdown signal, forcing immediate exit");
        std::process::exit(1);
    });
}

async fn ws_handler(
    State(app_state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = app_state.state.try_reserve_slot(&app_state.config) {
        return admission_error_response(e);
    }

    let admission = match admission::check_admission(&app_state.config, &headers, uri.path()) {
        Ok(result) => result,
        Err(e) => {
            app_state.state.release_slot();
            return admission_error_response(e);
        }
    };

    let session_id = app_state.state.next_id();

    let url_args = if app_state.config.url_arg {
        parse_url_args(uri.query().unwrap_or(""))
    } else {
        Vec::new()
    };

    let AdmissionResult { user } = admission;
    let peer_addr = peer.map(|ConnectInfo(addr)| addr.to_string()).unwrap_or_else(|| "unix".to_string());
    let session = Session {
        id: session_id,
        peer_addr,
        path: uri.path().to_string(),
        url_args,
        user,
    };

    let config = app_state.config.clone();
    let state = app_state.state.clone();
    ws.protocols(["tty"])
        .on_upgrade(move |socket| session::run(socket, config, state, session))
}

fn admission_error_response(err: AdmissionError) -> Response {
    let status = match err {
        AdmissionError::AuthRejected => StatusCode::UNAUTHORIZED,
        AdmissionError::OnceAlreadyServed
        | AdmissionError::MaxClientsReached
        | AdmissionError::OriginMismatch => StatusCode::FORBIDDEN,
        AdmissionError::PathMismatch => StatusCode::NOT_FOUND,
    };
    log::warn!("admission rejected: {err}");
    (status, err.to_string()).into_response()
}

/// Collects repeated `?arg=...` query parameters in order, percent-decoded
/// via `url`'s `form_urlencoded` parser — the teacher's own dependency for
/// this (`Cargo.toml` carries `url = "2"`), not a hand-rolled decoder.
fn parse_url_args(query: &str) -> Vec<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k == "arg")
        .map(|(_, v)| v.into_owned())
        .collect()
}

#[cfg(unix)]
fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> Result<(), ServerError> {
    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(ServerError::PrivilegeDrop(std::io::Error::last_os_error()));
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(ServerError::PrivilegeDrop(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_uid: Option<u32>, _gid: Option<u32>) -> Result<(), ServerError> {
    Ok(())
}

#[cfg(unix)]
fn chown_unix_socket(path: &std::path::Path, owner: &str) -> Result<(), ServerError> {
    use std::ffi::CString;

    let (user, group) = owner.split_once(':').unwrap_or((owner, ""));
    let uid = resolve_uid(user)?;
    let gid = if group.is_empty() { u32::MAX } else { resolve_gid(group)? };

    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| ServerError::InvalidSocketOwner(owner.to_string()))?;
    if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } != 0 {
        return Err(ServerError::PrivilegeDrop(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(unix)]
fn resolve_uid(user: &str) -> Result<u32, ServerError> {
    if let Ok(n) = user.parse::<u32>() {
        return Ok(n);
    }
    use std::ffi::CString;
    let c_user = CString::new(user).map_err(|_| ServerError::InvalidSocketOwner(user.to_string()))?;
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        return Err(ServerError::InvalidSocketOwner(user.to_string()));
    }
    Ok(unsafe { (*pw).pw_uid })
}

#[cfg(unix)]
fn resolve_gid(group: &str) -> Result<u32, ServerError> {
    if let Ok(n) = group.parse::<u32>() {
        return Ok(n);
    }
    use std::ffi::CString;
    let c_group = CString::new(group).map_err(|_| ServerError::InvalidSocketOwner(group.to_string()))?;
    let gr = unsafe { libc::getgrnam(c_group.as_ptr()) };
    if gr.is_null() {
        return Err(ServerError::InvalidSocketOwner(group.to_string()));
    }
    Ok(unsafe { (*gr).gr_gid })
}

#[cfg(not(unix))]
fn chown_unix_socket(_path: &std::path::Path, _owner: &str) -> Result<(), ServerError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_url_args_in_order() {
        assert_eq!(
            parse_url_args("arg=-c&arg=echo%20hi&other=ignored"),
            vec!["-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn no_args_is_empty() {
        assert!(parse_url_args("").is_empty());
    }

    #[test]
    fn plus_decodes_to_space() {
        assert_eq!(parse_url_args("arg=hello+world"), vec!["hello world".to_string()]);
    }
}
