//! # scope-core
//!
//! Client protocol stack for a telescope's two network channels.
//!
//! This crate contains:
//! - **Network**: `Connection`, a TCP stream with bounded-time I/O and backoff reconnection
//! - **Protocols**: `TextProtocol` (request/response correlation over JSON lines) and
//!   `BinaryProtocol` (80-byte frame headers + JPEG decoding)
//! - **Messages**: `InboundMessage` classification, `CommandResponse`, typed `ScopeEvent`s
//! - **Commands**: the `Command` trait, the built-in commands and `RawCommand`
//! - **Events**: `EventBus`, an in-process fan-out shared between clients
//! - **Clients**: `ScopeClient` (text channel) and `ImagingClient` (binary channel)
//! - **State**: `ClientState`, `ClientMode` and the status snapshots
//! - **Sequencer**: `Sequence` documents and the `SequenceRunner` that executes them
//! - **Task**: `TaskGroup` for owning and cancelling background tasks
//! - **Error**: `ScopeError`, a typed `thiserror`-based error hierarchy

pub mod client;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod header;
pub mod message;
pub mod network;
pub mod protocol;
pub mod rtsp;
pub mod sequencer;
pub mod state;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::{FrameTiming, ImagingClient, ScopeClient};
pub use command::{Command, CommandRequest, RawCommand};
pub use config::{ClientConfig, ConnectionConfig, ImagingConfig};
pub use discovery::{Discovery, StaticDiscovery, first_reachable};
pub use error::{ErrorKind, ScopeError};
pub use event::{ANY_EVENT, EventBus, Subscription, SubscriptionId};
pub use header::{FrameHeader, HEADER_SIZE};
pub use message::{CLIENT_MODE_CHANGED, CommandResponse, EventBody, InboundMessage, ScopeEvent};
pub use network::{BackoffPolicy, Connection, ConnectionInfo, Timeouts};
pub use protocol::{BinaryProtocol, ScopeImage, TextProtocol};
pub use rtsp::{FrameSource, RtspConnector};
pub use sequencer::{
    AstronomicalEvent, EventClock, Sequence, SequenceContext, SequenceRunner, SequenceState, Site,
    Step, StepAction, StepStatus,
};
pub use state::{ClientMode, ClientState, ImagingStatus, ScopeStatus};
pub use task::TaskGroup;
