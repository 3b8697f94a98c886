//! Process-wide, immutable configuration assembled from an optional JSON
//! config file (merged first) and CLI flags (which override it), mirroring
//! the precedence the original ttyd documents for `-F/--config`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::ConfigError;

/// How a connecting client proves who it is.
#[derive(Debug, Clone)]
pub enum AuthMode {
    None,
    /// Stored as the bare `base64(user:pass)` text (no `"Basic "` prefix),
    /// matching what the original compares both the HTTP `Authorization`
    /// header and the WebSocket handshake's `AuthToken` against.
    Basic { credential_b64: String },
    /// Trust a header set by a reverse proxy in front of us.
    Header { name: String },
}

/// Endpoint paths, all relative to `base_path`.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub ws: String,
    pub index: String,
    pub token: String,
    pub parent: String,
}

/// TLS material, only consulted when `ssl` is set.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
}

/// One JSON config file as accepted by `-F/--config`. Every field is
/// optional; CLI flags take precedence over whatever is present here.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigFile {
    pub port: Option<u16>,
    pub interface: Option<String>,
    pub credential: Option<String>,
    pub auth_header: Option<String>,
    pub signal: Option<String>,
    pub cwd: Option<String>,
    pub index: Option<String>,
    pub base_path: Option<String>,
    pub ping_interval: Option<u64>,
    pub url_arg: Option<bool>,
    pub writable: Option<bool>,
    pub check_origin: Option<bool>,
    pub max_clients: Option<usize>,
    pub once: Option<bool>,
    pub exit_no_conn: Option<bool>,
    pub terminal_type: Option<String>,
    pub client_option: Option<HashMap<String, String>>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigUnreadable {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::ConfigMalformed {
            path: path.display().to_string(),
            source,
        })
    }
}

/// The fully resolved, immutable server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub port: u16,
    pub unix_socket: Option<PathBuf>,
    pub socket_owner: Option<String>,
    pub ipv6: bool,

    pub tls: Option<TlsConfig>,

    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub terminal_type: String,

    pub close_signal: i32,
    pub auth: AuthMode,
    pub url_arg: bool,
    pub writable: bool,
    pub check_origin: bool,
    pub max_clients: usize,
    pub once: bool,
    pub exit_no_conn: bool,
    pub ping_interval: std::time::Duration,
    pub base_path: String,
    pub index_override: Option<PathBuf>,
    pub client_preferences: serde_json::Value,
    pub endpoints: Endpoints,

    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

fn make_endpoints(base_path: &str) -> Endpoints {
    let base = base_path.trim_end_matches('/');
    Endpoints {
        ws: format!("{base}/ws"),
        index: format!("{base}/"),
        token: format!("{base}/token"),
        parent: base.to_string(),
    }
}

fn encode_basic(credential: &str) -> Result<String, ConfigError> {
    if !credential.contains(':') {
        return Err(ConfigError::MalformedCredential(credential.to_string()));
    }
    use base64::Engine;
    Ok(base64::engine::general_purpose::STANDARD.encode(credential.as_bytes()))
}

impl Config {
    /// Merges an optional config file with CLI flags (CLI wins) and
    /// validates the result, matching `-F`'s documented precedence.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        if cli.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }

        let port = cli.port.unwrap_or(file.port.unwrap_or(7681));
        let interface = cli
            .interface
            .clone()
            .or(file.interface)
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let (unix_socket, listen_addr) = if interface.ends_with(".sock") || interface.ends_with(".socket") {
            (Some(PathBuf::from(&interface)), String::new())
        } else {
            (None, interface)
        };

        let credential = cli.credential.clone().or(file.credential);
        let auth_header = cli.auth_header.clone().or(file.auth_header);
        let auth = match (credential, auth_header) {
            (Some(cred), _) => AuthMode::Basic {
                credential_b64: encode_basic(&cred)?,
            },
            (None, Some(name)) => AuthMode::Header { name },
            (None, None) => AuthMode::None,
        };

        let signal_spec = cli.signal.clone().or(file.signal).unwrap_or_else(|| "SIGHUP".to_string());
        let close_signal = parse_signal(&signal_spec)?;

        let base_path = cli
            .base_path
            .clone()
            .or(file.base_path)
            .unwrap_or_default();
        let base_path = base_path.trim_end_matches('/').to_string();

        let mut client_preferences = serde_json::Map::new();
        for kv in file.client_option.unwrap_or_default() {
            client_preferences.insert(kv.0, serde_json::Value::String(kv.1));
        }
        for opt in &cli.client_option {
            let (k, v) = opt
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidClientOption(opt.clone()))?;
            client_preferences.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }

        let index_override = cli
            .index
            .clone()
            .or(file.index.map(PathBuf::from))
            .map(|p| expand_home(&p));
        if let Some(path) = &index_override {
            if !path.is_file() {
                return Err(ConfigError::IndexUnreadable {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a file"),
                });
            }
        }

        Ok(Config {
            listen_addr,
            port,
            unix_socket,
            socket_owner: cli.socket_owner.clone(),
            ipv6: cli.ipv6,
            tls: if cli.ssl {
                Some(TlsConfig {
                    cert: cli.ssl_cert.clone(),
                    key: cli.ssl_key.clone(),
                    ca: cli.ssl_ca.clone(),
                })
            } else {
                None
            },
            argv: cli.command.clone(),
            cwd: cli.cwd.clone().or(file.cwd.map(PathBuf::from)),
            terminal_type: cli
                .terminal_type
                .clone()
                .or(file.terminal_type)
                .unwrap_or_else(|| "xterm-256color".to_string()),
            close_signal,
            auth,
            url_arg: cli.url_arg || file.url_arg.unwrap_or(false),
            writable: cli.writable || file.writable.unwrap_or(false),
            check_origin: cli.check_origin || file.check_origin.unwrap_or(false),
            max_clients: cli.max_clients.or(file.max_clients).unwrap_or(0),
            once: cli.once || file.once.unwrap_or(false),
            exit_no_conn: cli.exit_no_conn || file.exit_no_conn.unwrap_or(false),
            ping_interval: std::time::Duration::from_secs(
                cli.ping_interval.or(file.ping_interval).unwrap_or(300),
            ),
            base_path: base_path.clone(),
            index_override,
            client_preferences: serde_json::Value::Object(client_preferences),
            endpoints: make_endpoints(&base_path),
            uid: cli.uid,
            gid: cli.gid,
        })
    }
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

/// Parses a signal as a bare number or a `SIG*` name. Only the small set
/// ttyd itself documents (`-s/--signal`) is named; anything else must be
/// numeric. No platform signal-name table is ported (see spec.md §9).
fn parse_signal(spec: &str) -> Result<i32, ConfigError> {
    if let Ok(n) = spec.parse::<i32>() {
        return Ok(n);
    }
    let name = spec.strip_prefix("SIG").unwrap_or(spec);
    let signo = match name.to_ascii_uppercase().as_str() {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "TERM" => libc::SIGTERM,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        _ => return Err(ConfigError::InvalidSignal(spec.to_string())),
    };
    Ok(signo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credential_encodes_to_known_value() {
        assert_eq!(encode_basic("user:pw").unwrap(), "dXNlcjpwdw==");
    }

    #[test]
    fn malformed_credential_rejected() {
        assert!(encode_basic("no-colon").is_err());
    }

    #[test]
    fn endpoints_with_base_path() {
        let e = make_endpoints("/term");
        assert_eq!(e.ws, "/term/ws");
        assert_eq!(e.index, "/term/");
        assert_eq!(e.token, "/term/token");
        assert_eq!(e.parent, "/term");
    }

    #[test]
    fn endpoints_without_base_path() {
        let e = make_endpoints("");
        assert_eq!(e.ws, "/ws");
        assert_eq!(e.token, "/token");
    }

    #[test]
    fn signal_parses_name_and_number() {
        assert_eq!(parse_signal("SIGHUP").unwrap(), libc::SIGHUP);
        assert_eq!(parse_signal("HUP").unwrap(), libc::SIGHUP);
        assert_eq!(parse_signal("9").unwrap(), 9);
        assert!(parse_signal("NOTASIGNAL").is_err());
    }
}
