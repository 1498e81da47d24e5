pub mod connection;
pub mod mode;
pub mod status;

pub use connection::ClientState;
pub use mode::ClientMode;
pub use status::{ImagingStatus, ScopeStatus};
