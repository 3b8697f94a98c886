use thiserror::Error;

/// Errors raised while driving a PTY-backed child process.
///
/// A small closed set of named failure modes instead of a single opaque
/// string, so callers can match on the kind that matters (e.g. `NoProcess`
/// vs everything else).
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenFailed(String),

    #[error("failed to spawn child: {0}")]
    SpawnFailed(String),

    #[error("no process")]
    NoProcess,

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Errors raised while parsing CLI flags or a JSON config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing command: ttyd requires a command to run")]
    MissingCommand,

    #[error("could not read index file {path}: {source}")]
    IndexUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed credential, expected USER:PASS: {0}")]
    MalformedCredential(String),

    #[error("could not read config file {path}: {source}")]
    ConfigUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {source}")]
    ConfigMalformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid signal name or number: {0}")]
    InvalidSignal(String),

    #[error("invalid client option, expected KEY=VALUE: {0}")]
    InvalidClientOption(String),
}

/// Reasons a WebSocket upgrade or HTTP request is refused before a session
/// is ever created. Kept separate from `PtyError` since these never touch a
/// child process.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("server is only accepting one client and is already full")]
    OnceAlreadyServed,
    #[error("maximum client count reached")]
    MaxClientsReached,
    #[error("missing or mismatched authentication")]
    AuthRejected,
    #[error("path does not match the configured websocket endpoint")]
    PathMismatch,
    #[error("origin does not match host")]
    OriginMismatch,
}

/// System-wide fatal errors: bind/listen failures, TLS context
/// initialization, privilege drop. These are the only errors spec.md §7
/// says should propagate all the way to process exit.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed { addr: String, source: std::io::Error },

    #[error("tls material (cert/key) not configured")]
    TlsMissingMaterial,

    #[error("failed to initialize tls context: {0}")]
    TlsInit(String),

    #[error("failed to drop privileges: {0}")]
    PrivilegeDrop(std::io::Error),

    #[error("invalid socket owner: {0}")]
    InvalidSocketOwner(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
