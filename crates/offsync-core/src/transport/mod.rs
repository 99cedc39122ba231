//! Remote sync transport.
//!
//! The engine only sees the `SyncTransport` port. `HttpTransport` talks to
//! `offsync-server`; `LoopbackTransport` calls a `Hub` in-process and can
//! inject network faults.

mod http;
mod loopback;

pub use http::HttpTransport;
pub use loopback::LoopbackTransport;

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{PullResponse, PushEntry, PushResult};

/// Network boundary failures. All of them are retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Port to the authoritative server.
///
/// Both calls must be safe to repeat: the server recognises replayed pushes
/// by idempotency key and pulls are read-only.
#[allow(async_fn_in_trait)]
pub trait SyncTransport {
    /// Submit entries in order; the server answers each one by `sequence`
    async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, TransportError>;

    /// Fetch server changes after `since` (`None` means from the beginning)
    async fn pull(&self, since: Option<&str>, limit: usize)
        -> Result<PullResponse, TransportError>;
}

impl<T: SyncTransport> SyncTransport for std::sync::Arc<T> {
    async fn push(&self, entries: &[PushEntry]) -> Result<Vec<PushResult>, TransportError> {
        (**self).push(entries).await
    }

    async fn pull(
        &self,
        since: Option<&str>,
        limit: usize,
    ) -> Result<PullResponse, TransportError> {
        (**self).pull(since, limit).await
    }
}
