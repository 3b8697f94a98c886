//! Command-line surface, following the `clap` derive style the pack's
//! `attractor-cli` uses: one `Parser` struct, doc comments become `--help`
//! text, defaults documented inline rather than duplicated in prose.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "webtty", version, about = "Share a terminal over the web")]
pub struct Cli {
    /// TCP port to listen on; `0` picks an ephemeral port.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Network interface or bind address, or a UNIX-socket path (suffix
    /// `.sock`/`.socket`).
    #[arg(short = 'i', long)]
    pub interface: Option<String>,

    /// `user:group` to chown a UNIX socket to after binding.
    #[arg(short = 'U', long)]
    pub socket_owner: Option<String>,

    /// Basic-auth credential, format `username:password`.
    #[arg(short = 'c', long)]
    pub credential: Option<String>,

    /// Trust a reverse-proxy-set header for authentication instead.
    #[arg(short = 'H', long)]
    pub auth_header: Option<String>,

    /// Drop privileges to this uid after binding.
    #[arg(short = 'u', long)]
    pub uid: Option<u32>,

    /// Drop privileges to this gid after binding.
    #[arg(short = 'g', long)]
    pub gid: Option<u32>,

    /// Signal sent to the child's process group on disconnect (default SIGHUP).
    #[arg(short = 's', long)]
    pub signal: Option<String>,

    /// Working directory for the spawned command.
    #[arg(short = 'w', long)]
    pub cwd: Option<PathBuf>,

    /// Custom index.html path (`~/` expands to `$HOME`).
    #[arg(short = 'I', long)]
    pub index: Option<PathBuf>,

    /// Prefix applied to all endpoints; a trailing `/` is trimmed.
    #[arg(short = 'b', long)]
    pub base_path: Option<String>,

    /// WebSocket ping cadence, in seconds.
    #[arg(short = 'P', long)]
    pub ping_interval: Option<u64>,

    /// Listen on IPv6 as well as IPv4.
    #[arg(short = '6', long)]
    pub ipv6: bool,

    /// Enable TLS.
    #[arg(short = 'S', long)]
    pub ssl: bool,

    /// TLS certificate file.
    #[arg(short = 'C', long)]
    pub ssl_cert: Option<PathBuf>,

    /// TLS private key file.
    #[arg(short = 'K', long)]
    pub ssl_key: Option<PathBuf>,

    /// TLS CA file, for client-certificate verification.
    #[arg(short = 'A', long)]
    pub ssl_ca: Option<PathBuf>,

    /// Accept `?arg=...` repeated URL arguments, appended to the command.
    #[arg(short = 'a', long)]
    pub url_arg: bool,

    /// Allow clients to send input to the command (default: read-only).
    #[arg(short = 'W', long)]
    pub writable: bool,

    /// Add a `key=value` entry to the client-preferences blob. Repeatable.
    #[arg(short = 't', long = "client-option")]
    pub client_option: Vec<String>,

    /// Value reported as `TERM` to the child.
    #[arg(short = 'T', long)]
    pub terminal_type: Option<String>,

    /// Enforce that the WebSocket `Origin` matches `Host`.
    #[arg(short = 'O', long)]
    pub check_origin: bool,

    /// Maximum concurrent clients (0 = unlimited).
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// Serve exactly one client, then exit.
    #[arg(short = 'o', long)]
    pub once: bool,

    /// Exit once the last connected client disconnects.
    #[arg(short = 'q', long)]
    pub exit_no_conn: bool,

    /// Open the URL in the local system browser. No-op on headless hosts;
    /// kept for CLI compatibility with the original flag set.
    #[arg(short = 'B', long)]
    pub browser: bool,

    /// Log verbosity, 0 (quiet) through 7 (trace). Mapped onto `env_logger`
    /// level filters.
    #[arg(short = 'd', long, default_value_t = 7)]
    pub debug: u8,

    /// JSON config file; merged first, CLI flags override it.
    #[arg(short = 'F', long)]
    pub config: Option<PathBuf>,

    /// The command (and its arguments) to run under the PTY.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// Maps `-d/--debug` onto an `env_logger` level filter. ttyd's original
/// scale is a libwebsockets bitmask; ours is a plain verbosity ladder since
/// this crate has no libwebsockets-equivalent log source to filter.
pub fn debug_level_filter(debug: u8) -> log::LevelFilter {
    match debug {
        0 => log::LevelFilter::Off,
        1..=3 => log::LevelFilter::Error,
        4 => log::LevelFilter::Warn,
        5 => log::LevelFilter::Info,
        6 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}
