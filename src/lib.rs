//! webtty: shares a locally executed command, attached to a PTY, with
//! browsers over a WebSocket.
//!
//! The library surface mirrors the components spec.md lays out: a PTY
//! process manager (`pty`), a tag-framed message codec (`protocol`), a
//! per-connection session state machine (`session`), admission/routing
//! policy (`admission`), the process-wide server core (`server`), and a
//! small static HTTP responder (`http`). `main.rs` is a thin CLI shell
//! around [`Server`].

pub mod admission;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::Server;
