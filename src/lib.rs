//! Periscope - real-time status for local agentic coding sessions.
//!
//! A loopback-only daemon that ingests agent lifecycle hooks, reduces them
//! through a pure state machine, tails per-session transcript logs for
//! content metadata, and publishes immutable session snapshots to WebSocket
//! subscribers.

pub mod audit;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gitinfo;
pub mod hook;
pub mod machine;
pub mod parser;
pub mod registry;
pub mod routes;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod summarizer;
pub mod tailer;

pub use broadcast::{SnapshotOp, SnapshotPublisher};
pub use config::Config;
pub use machine::{transition, MachineEvent, MachineState, PublishedStatus};
pub use registry::Registry;
pub use snapshot::Snapshot;
