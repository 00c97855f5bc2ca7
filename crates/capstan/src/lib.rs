//! The capstan stream manager.
//!
//! capstan is the server core of a packet-capture investigation tool. The
//! [`Manager`](manager::Manager) owns the set of immutable stream indexes,
//! runs import/merge/tag/convert jobs on a single-writer command actor,
//! supervises converter and filter subprocesses, persists tag definitions
//! and pcap metadata, and hands lock-counted [`View`](view::View)
//! snapshots to searches.

pub mod config;
pub mod converters;
pub mod error;
pub mod filters;
pub mod manager;
pub mod state;
pub mod telemetry;
pub mod view;
pub mod watcher;

pub use config::CapstanConfig;
pub use error::{ManagerError, Result};
pub use manager::{Manager, Statistics, TagInfo, UpdateTagOp};
pub use view::View;
