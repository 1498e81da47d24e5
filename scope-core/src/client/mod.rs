//! The two device clients.
//!
//! * [`ScopeClient`]: commands, responses and events on the text channel.
//! * [`ImagingClient`]: frames and control messages on the binary channel.
//!
//! Give both the same [`EventBus`](crate::event::EventBus) so the imaging
//! client can follow the text channel's mode changes.

pub mod imaging;
pub mod metrics;
pub mod text;

pub use imaging::ImagingClient;
pub use metrics::FrameTiming;
pub use text::ScopeClient;
