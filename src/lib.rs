//! triplex: a single-reactor TCP server and RESP client pool.
//!
//! One [`Listener`] accepts connections whose payloads may be HTTP/1.1 (with
//! chunked responses and WebSocket upgrade), RESP2, or WebSocket frames,
//! distinguished on the fly from the first bytes. An optional TLS layer wraps
//! raw sockets transparently. The companion [`client::Client`] speaks RESP to
//! an upstream peer over its own reactor with idle-pool bookkeeping, an AUTH
//! prelude and per-request timeouts.
//!
//! ```no_run
//! use triplex::{Listener, ServerConfig};
//!
//! let mut ln = Listener::bind(false, "127.0.0.1:8080", ServerConfig::default())?;
//! ln.on_error(|err| eprintln!("{err}"));
//! ln.on_http(|req| {
//!     req.text(200, "hello world").flush();
//!     req.release();
//!     true
//! });
//! ln.serve()?;
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod client;
mod config;
mod conn;
mod error;
mod poller;
mod protocols;
mod recency;
mod server;
mod tls;
mod util;

pub use config::{ClientConfig, ServerConfig};
pub use conn::Conn;
pub use error::{Error, ErrorKind};
pub use protocols::http::HttpRequest;
pub use protocols::resp::RespRequest;
pub use protocols::ws::Websocket;
pub use server::{Listener, ShutdownHandle};
pub use tls::{TlsContext, TlsError};
