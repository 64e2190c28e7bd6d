//! Multi-port TCP ingestion server for live plot panels.
//!
//! Each port in a contiguous range owns one panel slot. Clients stream a
//! line-based command protocol to configure a panel and append samples; the
//! server keeps the panel state in memory and persists it as JSON documents
//! (plus a `filelist.json` manifest) through a debounced writer, for an
//! external viewer to poll.

pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod panel;
pub mod persistence;
pub mod protocol;
pub mod session;

pub use config::{PersistenceConfig, ServerConfig};
pub use error::NetplotError;
pub use listener::{NetplotServer, ServerHandle};
pub use protocol::{LineOutcome, LineProcessor, LineSplitter, PROTOCOL_VERSION};
