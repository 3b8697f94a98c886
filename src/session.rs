//! Session State Machine: per-WebSocket-connection object that owns one
//! PTY process, performs the handshake, pumps bytes in both directions,
//! and tears down on any terminating event.
//!
//! Framing/reassembly of client WebSocket messages is delegated to
//! `axum`'s `WebSocket` (backed by `tokio-tungstenite`), which always
//! yields one complete `Message` per logical WebSocket message regardless
//! of how many frames it was fragmented into.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use crate::config::{AuthMode, Config};
use crate::protocol::{self, ClientMessage, HandshakePayload};
use crate::pty::{PtyEvent, PtyProcess, PtySpawnConfig};
use crate::server::ServerState;

/// Identity and auth state captured at admission time, before the PTY
/// exists.
pub struct Session {
    pub id: u64,
    pub peer_addr: String,
    pub path: String,
    pub url_args: Vec<String>,
    pub user: Option<String>,
}

/// WebSocket close codes this crate ever sends.
mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Decrements `client_count` and evaluates the once/exit-no-conn exit
/// policy exactly once, no matter which of `run`'s several early-return
/// points is taken. Without this, a session that dies during the initial
/// messages or handshake (before the bottom of the function) would leak
/// its slot in `client_count` forever.
struct ClientCountGuard {
    state: Arc<ServerState>,
    session_id: u64,
    peer_addr: String,
    once: bool,
    exit_no_conn: bool,
}

impl Drop for ClientCountGuard {
    fn drop(&mut self) {
        self.state.deregister(self.session_id);
        let remaining = self.state.client_count.fetch_sub(1, Ordering::AcqRel) - 1;
        log::info!("session ended: peer={} remaining_clients={}", self.peer_addr, remaining);
        if self.once || (self.exit_no_conn && remaining == 0) {
            self.state.force_exit.store(true, Ordering::Release);
            self.state.shutdown_notify.notify_one();
        }
    }
}

/// Drives one session end to end: initial messages, handshake, the PTY
/// read/write pump, and teardown. Never returns an error — all failures
/// are resolved into a WebSocket close.
pub async fn run(socket: WebSocket, config: Arc<Config>, state: Arc<ServerState>, session: Session) {
    state.register(session.id, &session.peer_addr);
    let _guard = ClientCountGuard {
        state: state.clone(),
        session_id: session.id,
        peer_addr: session.peer_addr.clone(),
        once: config.once,
        exit_no_conn: config.exit_no_conn,
    };

    let (mut sink, mut stream) = socket.split();

    // InitialSending: window title, then client preferences, fixed order.
    let hostname = local_hostname();
    let title_frame = protocol::encode_window_title(&command_label(&config.argv), &hostname);
    if sink.send(Message::Binary(title_frame.into())).await.is_err() {
        return;
    }
    let prefs_frame = protocol::encode_preferences(&config.client_preferences.to_string());
    if sink.send(Message::Binary(prefs_frame.into())).await.is_err() {
        return;
    }

    // AwaitingHandshake: only JSON_DATA is acted on. When a credential is
    // configured, any other tag arriving before authentication is a policy
    // violation (spec.md §4.3's readable-half rule), not something to
    // silently ignore.
    let requires_credential = matches!(config.auth, AuthMode::Basic { .. });
    let mut authenticated = matches!(config.auth, AuthMode::None) || matches!(config.auth, AuthMode::Header { .. });
    let handshake = loop {
        let Some(Ok(msg)) = stream.next().await else {
            return;
        };
        let Message::Binary(bytes) = msg else { continue };
        match protocol::decode_client_message(&bytes) {
            ClientMessage::Handshake(h) => break h,
            _ if requires_credential => {
                let _ = close_with(&mut sink, close_code::POLICY_VIOLATION).await;
                return;
            }
            _ => continue,
        }
    };

    if let AuthMode::Basic { credential_b64 } = &config.auth {
        // Secondary check: the WebSocket handshake's `AuthToken` must equal
        // the same pre-encoded credential the HTTP Basic check compared
        // against. Checked again here since a client can open a raw
        // WebSocket without ever loading the HTML page first.
        authenticated = handshake.auth_token.as_deref() == Some(credential_b64.as_str());
        if !authenticated {
            let _ = close_with(&mut sink, close_code::POLICY_VIOLATION).await;
            return;
        }
    }

    let columns = handshake.columns.unwrap_or(80).max(1);
    let rows = handshake.rows.unwrap_or(24).max(1);

    let argv = build_argv(&config.argv, &session.url_args, config.url_arg);
    let envp = build_envp(&config.terminal_type, session.user.as_deref());

    let (process, mut pty_rx) = match PtyProcess::spawn(PtySpawnConfig {
        argv,
        envp,
        cwd: config.cwd.clone(),
        columns,
        rows,
    }) {
        Ok(ok) => ok,
        Err(e) => {
            log::warn!("failed to spawn pty for {}: {e}", session.peer_addr);
            let _ = close_with(&mut sink, close_code::ABNORMAL).await;
            return;
        }
    };

    log::info!(
        "session started: peer={} path={} pid={}",
        session.peer_addr,
        session.path,
        process.pid()
    );

    // Running: the reader starts delivering output now that the client is
    // ready for it.
    process.resume();

    let mut ping_timer = if config.ping_interval.is_zero() {
        None
    } else {
        Some(tokio::time::interval(config.ping_interval))
    };

    let mut close_status: Option<u16> = None;
    loop {
        tokio::select! {
            _ = tick_or_pending(&mut ping_timer) => {
                // Idle-hangup detection: a client whose TCP connection died
                // without a clean close will fail to ack this, and the next
                // read (or the underlying socket) surfaces the error.
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        if handle_client_message(&bytes, &process, config.writable) {
                            // handled inline
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("websocket read error for {}: {e}", session.peer_addr);
                        break;
                    }
                }
            }
            event = pty_rx.recv() => {
                match event {
                    Some(PtyEvent::Output(buf)) => {
                        let frame = protocol::encode_output(&buf);
                        if sink.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                        process.resume();
                    }
                    Some(PtyEvent::Eof) => {
                        if !process.running() {
                            close_status = Some(if process.exit_code() == 0 { close_code::NORMAL } else { close_code::ABNORMAL });
                            break;
                        }
                    }
                    Some(PtyEvent::Exit { code }) => {
                        close_status = Some(if code == 0 { close_code::NORMAL } else { close_code::ABNORMAL });
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = close_with(&mut sink, close_status.unwrap_or(close_code::NORMAL)).await;

    process.kill(config.close_signal);
    process.free().await;
}

/// Dispatches one reassembled client message. Returns true once handled
/// (the return value only exists to keep call sites symmetric — side
/// effects, not the bool, are what matters).
fn handle_client_message(bytes: &[u8], process: &PtyProcess, writable: bool) -> bool {
    match protocol::decode_client_message(bytes) {
        ClientMessage::Input(data) => {
            if writable && !data.is_empty() {
                if let Err(e) = process.write(&data) {
                    log::debug!("pty write failed: {e}");
                }
            }
            true
        }
        ClientMessage::Resize { columns, rows } => {
            process.resize(columns, rows);
            true
        }
        ClientMessage::Pause => {
            process.pause();
            true
        }
        ClientMessage::Resume => {
            process.resume();
            true
        }
        ClientMessage::Handshake(_) | ClientMessage::Unknown => true,
    }
}

/// Ticks `timer` if configured, otherwise never resolves — lets the ping
/// branch drop out of the `select!` entirely when `--ping-interval 0` turns
/// pinging off, without a separate `if` guard on the branch itself.
async fn tick_or_pending(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn close_with(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    code: u16,
) -> Result<(), axum::Error> {
    sink.send(Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: std::borrow::Cow::Borrowed(""),
    })))
    .await
}

/// `server.argv ++ session.url_args` when `url-arg` is enabled.
fn build_argv(base: &[String], url_args: &[String], url_arg_enabled: bool) -> Vec<String> {
    let mut argv = base.to_vec();
    if url_arg_enabled {
        argv.extend(url_args.iter().cloned());
    }
    argv
}

fn build_envp(terminal_type: &str, user: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("TERM".to_string(), terminal_type.to_string());
    if let Some(user) = user {
        env.insert("TTYD_USER".to_string(), user.to_string());
    }
    env
}

fn command_label(argv: &[String]) -> String {
    argv.first().cloned().unwrap_or_default()
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    #[cfg(unix)]
    unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(s) = std::str::from_utf8(&buf[..len]) {
                return s.to_string();
            }
        }
    }
    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_with_url_args_disabled_ignores_overrides() {
        let base = vec!["bash".to_string()];
        let overrides = vec!["-c".to_string(), "echo hi".to_string()];
        assert_eq!(build_argv(&base, &overrides, false), base);
    }

    #[test]
    fn argv_with_url_args_enabled_appends() {
        let base = vec!["bash".to_string()];
        let overrides = vec!["-c".to_string()];
        assert_eq!(build_argv(&base, &overrides, true), vec!["bash", "-c"]);
    }

    #[test]
    fn envp_always_has_term() {
        let env = build_envp("xterm-256color", None);
        assert_eq!(env.get("TERM").unwrap(), "xterm-256color");
        assert!(!env.contains_key("TTYD_USER"));
    }

    #[test]
    fn envp_includes_user_when_present() {
        let env = build_envp("xterm-256color", Some("alice"));
        assert_eq!(env.get("TTYD_USER").unwrap(), "alice");
    }
}
