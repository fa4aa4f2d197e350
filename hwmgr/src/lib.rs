//! # Hardware Manager
//!
//! A distributed cluster-membership and liveness-notification service.
//! Each instance tracks the health and HA role of *locations* (hardware
//! instances), the *nodes* running on them and the *processes* inside
//! those nodes. Clients subscribe to entities they care about and are
//! notified when those entities come up, fail or change role.
//!
//! ## Architecture
//!
//! - **`hwmgr-core`**: entity model, global index, subscription and
//!   notification engines, liveness state machines, HA resolver
//! - **`hwmgr-proto`**: peer and node wire codecs
//! - **`hwmgr`** (this crate): transports, timers, configuration and the
//!   single-threaded engine that ties it all together
//!
//! The runtime model is strictly cooperative: one compio task owns every
//! data structure; socket pumps and timers communicate with it only
//! through an event channel. Nothing in the engine blocks and nothing is
//! shared, so there are no locks.

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::future_not_send)] // single-threaded runtime by design
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod engine;
pub mod event;
pub mod sock;
pub mod timer;
pub mod transport;

pub use config::Config;
pub use engine::Cluster;
pub use event::{AcceptKind, Event, EventTx};
pub use timer::{TimerMode, TimerService};
pub use transport::{Transport, TransportKind, TransportOwner, TransportTable, WriterCmd};

/// Initialize tracing from `RUST_LOG`, defaulting to `info`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
