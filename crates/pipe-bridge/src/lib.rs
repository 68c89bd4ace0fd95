//! pipe-bridge
//!
//! Relays bytes between the process's stdio and a pair of named pipes:
//! stdin is copied into one FIFO, and whatever arrives on a second FIFO is
//! copied to stdout. The bytes are passed through untouched.
//!
//! - [`fifo`]: create-if-absent and the two-phase open of the write end
//! - [`stdio`]: non-blocking duplicates of stdin/stdout
//! - [`bridge`]: the `poll`-driven copy loop
//! - [`config`]: poll interval and the full-sink write policy

pub mod bridge;
pub mod config;
pub mod error;
pub mod fifo;
pub mod stdio;
pub mod tracing_init;

pub use bridge::{Bridge, BridgeReport, Direction, Endpoint, Endpoints, StopReason, TransferStats};
pub use config::{BridgeConfig, CHUNK_SIZE, DEFAULT_POLL_INTERVAL, WritePolicy};
pub use error::{BridgeError, Result};
