//! Relay node core: replay guard and the packet pipeline.
//!
//! The pipeline is the only place where the onion transform and the payment
//! channels meet. Data flow for one relayed packet:
//!
//! ```text
//! transport frame ─> Packet::from_bytes ─> onion transform ─> replay guard
//!    ─> channel module (validate + persist embedded transaction, ticket)
//!    ─> re-sealed next frame ─> transport
//! ```
//!
//! At the destination the transform terminates and the plaintext surfaces
//! instead.

pub mod config;
pub mod pipeline;
pub mod replay;

pub use config::{Network, NodeConfig};
pub use pipeline::{
    DropReason, Effect, Outbound, PacketPipeline, PipelineStats, RelayError, StatsSnapshot,
};
pub use replay::ReplayGuard;
