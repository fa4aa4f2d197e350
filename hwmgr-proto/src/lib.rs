//! Hardware Manager wire protocol.
//!
//! Two codecs share this crate:
//! - `peer`: the cluster protocol spoken between managers (multicast
//!   beacon plus unicast INIT / REPLAY / NODE_UPDATE / PROCESS_UPDATE /
//!   HA_UPDATE / BINDING)
//! - `node`: the application protocol spoken with managed nodes (INIT,
//!   KEEPALIVE, REGISTER, PROCESS_CREATE/DESTROY, HA_UPDATE, NOTIFY)
//!
//! Every multi-byte integer is big-endian and goes through explicit
//! `put`/`get` calls; receivers never rely on in-place struct layout. All
//! peer frames are fixed-size per message type; node frames carry an
//! explicit length in the header. The message-type constants are stable;
//! renaming them is a protocol break.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod node;
pub mod peer;
pub mod replay;

pub use error::{ProtoError, Result};
