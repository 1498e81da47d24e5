//! Finding a telescope to connect to.
//!
//! Network scanning is left to implementors of [`Discovery`].
//! [`StaticDiscovery`] covers the common case of a known address list.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ScopeError;
use crate::network::ConnectionInfo;

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Candidate endpoints found within `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<Vec<ConnectionInfo>, ScopeError>;
}

/// Returns a fixed list of candidates.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    candidates: Vec<ConnectionInfo>,
}

impl StaticDiscovery {
    pub fn new(candidates: Vec<ConnectionInfo>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, _timeout: Duration) -> Result<Vec<ConnectionInfo>, ScopeError> {
        Ok(self.candidates.clone())
    }
}

/// First candidate accepting a TCP connection within `timeout`.
pub async fn first_reachable(
    discovery: &dyn Discovery,
    timeout: Duration,
) -> Result<Option<ConnectionInfo>, ScopeError> {
    for candidate in discovery.discover(timeout).await? {
        let target = candidate.to_string();
        match tokio::time::timeout(timeout, TcpStream::connect(target.as_str())).await {
            Ok(Ok(_)) => return Ok(Some(candidate)),
            Ok(Err(e)) => debug!("{target} unreachable: {e}"),
            Err(_) => debug!("{target} did not answer within {timeout:?}"),
        }
    }
    Ok(None)
}
