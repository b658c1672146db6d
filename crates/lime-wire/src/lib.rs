//! LIME wire protocol: the agent ↔ mediator link.
//!
//! Agents connect to the mediator over mutually authenticated TLS 1.3, prove
//! liveness of the channel with a challenge echo, then receive tasks and
//! stream statistics back over a small length-prefixed binary protocol.
//!
//! ## Architecture
//!
//! - **Mediator**: TCP listener that authenticates agents and owns their sessions
//! - **Session**: One agent connection, its state machine and task queue
//! - **SessionRegistry**: Live sessions, with exactly-once disconnect
//! - **Packet**: `[opcode:u32][len:u32][payload]` frames, little-endian
//! - **TaskDispatcher**: Per-session FIFO writer for `TASK`/`JOB` packets
//! - **Heartbeat monitor**: Periodic nonce probes and stale-session eviction
//! - **MediatorHandle**: Trait for the agent directory and result storage
//! - **AgentClient**: The agent end of the protocol

// `testutil` names this crate `lime_wire` so integration tests can include it by path.
extern crate self as lime_wire;

pub mod agent;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handshake;
pub mod heartbeat;
pub mod packet;
pub mod registry;
pub mod session;
pub mod tls;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use agent::{AgentClient, AgentConfig, TaskRunner};
pub use dispatch::TaskDispatcher;
pub use error::{WireError, WireResult};
pub use events::{EventBus, MediatorEvent};
pub use gateway::{GatewayConfig, HealthSnapshot, Mediator, MediatorHandle};
pub use heartbeat::{HeartbeatConfig, HeartbeatSummary, ProbeOutcome};
pub use packet::{Frame, Opcode, Packet};
pub use registry::SessionRegistry;
pub use session::{Session, SessionInfo};
pub use tls::{CertificateValidator, RootThumbprintValidator, TlsMaterial};
