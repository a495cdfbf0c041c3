//! IWP link layer
//!
//! - [`LinkLayer`]: session table, inbound demultiplexer, maintenance tick
//! - [`Session`]: per-peer handshake state machine and frame sealing
//! - [`AuthTable`]: address → verified identity bindings
//! - [`ReplayCache`]: verified handshakes, for replay rejection
//! - [`WorkQueue`]: bounded crypto worker pool
//! - [`LinkService`]: tokio driver over a UDP socket

mod auth_table;
mod completion;
mod config;
mod layer;
mod replay;
mod service;
mod session;
mod work_queue;

pub use auth_table::*;
pub use completion::*;
pub use config::*;
pub use layer::*;
pub use replay::*;
pub use service::*;
pub use session::*;
pub use work_queue::*;
