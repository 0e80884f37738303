#![deny(rust_2018_idioms, unused_imports)]
#![doc(test(attr(deny(warnings))))]

//! Multithreaded network manager for DNS servers.
//!
//! The manager owns a pool of single-threaded event-loop workers built on
//! [`mio`]. Every socket is owned by exactly one worker; operations invoked
//! from other threads are posted to the owning worker as value-carrying
//! events and executed on the next loop iteration, so all socket state is
//! mutated single-threaded. Callers interact with the manager through
//! [`Handle`]s representing a single conversation (one datagram exchange,
//! one DNS message, or one connection depending on the socket variant).
//!
//! Supported transports: plain UDP and TCP byte streams, plus the DNS
//! stream transports (`tcpdns`, `tlsdns`) which frame every message with a
//! 16-bit big-endian length prefix as required by RFC 1035 §4.2.2. TLS is
//! driven through [`rustls`] with the worker pumping bytes between the TLS
//! engine and the non-blocking TCP stream.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netmgr::{ListenOpts, Manager};
//!
//! let mgr = Manager::new(2).unwrap();
//! let listener = mgr
//!     .listen_tcpdns(
//!         "127.0.0.1:5300".parse().unwrap(),
//!         Arc::new(|handle, msg| {
//!             if let Ok(msg) = msg {
//!                 // Echo the query back to the peer.
//!                 handle.send(msg.to_vec(), None);
//!             }
//!         }),
//!         None,
//!         ListenOpts::default(),
//!     )
//!     .unwrap();
//!
//! // ... serve ...
//! listener.stop_listening();
//! mgr.shutdown();
//! ```

use std::sync::Arc;

mod errors;
mod event;
mod framing;
mod handle;
mod listener;
mod manager;
mod queue;
mod quota;
mod socket;
mod sys;
mod tcp;
mod tcpdns;
mod timer;
mod tlsdns;
mod udp;
mod worker;

pub use errors::{Error, Result};
pub use handle::Handle;
pub use listener::Listener;
pub use manager::{ConnectOpts, ListenOpts, Manager, StatEvent, StatsSink, Timeouts};
pub use quota::Quota;

/// Receive callback. Invoked on the socket's owning worker with a region
/// borrowed from an internal buffer; the bytes are only valid for the
/// duration of the call and must be copied out to be retained.
pub type RecvFn = Arc<dyn Fn(&Handle, Result<&[u8]>) + Send + Sync>;

/// Accept callback for stream listeners. Returning an error closes the
/// freshly accepted connection.
pub type AcceptFn = Arc<dyn Fn(&Handle) -> Result<()> + Send + Sync>;

/// Connect completion callback.
pub type ConnectFn = Box<dyn FnOnce(Result<Handle>) + Send>;

/// Send completion callback.
pub type SendFn = Box<dyn FnOnce(&Handle, Result<()>) + Send>;

/// Largest DNS message representable with the 2-byte length prefix.
pub const MAX_MESSAGE_SIZE: usize = 65_535;

/// Size of the per-worker receive buffer.
pub(crate) const RECV_BUFFER_SIZE: usize = 65_536;

/// Ceiling on concurrently active handles per server stream connection.
/// Reads stop once this many messages are in flight and resume as their
/// handles are released.
pub(crate) const STREAM_CLIENTS_PER_CONN: usize = 23;

/// Slack added on top of the kernel-level connect timeout so the kernel
/// observes the timeout first.
pub(crate) const TIMEOUT_SLACK_MS: u64 = 10;
