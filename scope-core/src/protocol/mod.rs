//! Wire protocols for the two device channels.
//!
//! * [`text`]: request/response correlation over JSON lines.
//! * [`binary`]: header parsing and JPEG decoding for image frames.

pub mod binary;
pub mod text;

pub use binary::{BinaryProtocol, ScopeImage};
pub use text::{PendingResponse, Routing, TextProtocol};
