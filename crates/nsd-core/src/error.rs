//! The broker's closed error taxonomy (spec §7).
//!
//! Every failure the broker reports to a client — whether synchronous
//! (a bad `discover_services` call) or asynchronous (an engine callback
//! that failed) — is translated into one of these five variants before it
//! crosses the IPC boundary. The broker never lets an engine-specific error
//! type leak to a client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A client-facing error. Carries no engine-specific detail by design —
/// engines can fail in arbitrarily platform-specific ways, but clients only
/// ever need to know which of these five buckets they landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum NsdError {
    /// Catch-all: an engine failed, a required collaborator was unavailable,
    /// or a precondition not otherwise named here was violated.
    #[error("internal error")]
    Internal,
    /// The client already holds `MAX_LIMIT` outstanding requests.
    #[error("maximum number of outstanding requests reached")]
    MaxLimit,
    /// The client already has a resolve (or watch) in flight for this
    /// listener key.
    #[error("an operation is already active for this listener")]
    AlreadyActive,
    /// The request's parameters failed validation (e.g. malformed service
    /// type) before any backend was consulted.
    #[error("bad parameters")]
    BadParameters,
    /// A stop/unregister was requested for a listener key with no matching
    /// live request.
    #[error("operation not running")]
    OperationNotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_serde_json_roundtrip() {
        for err in [
            NsdError::Internal,
            NsdError::MaxLimit,
            NsdError::AlreadyActive,
            NsdError::BadParameters,
            NsdError::OperationNotRunning,
        ] {
            let json = serde_json::to_string(&err).unwrap();
            let parsed: NsdError = serde_json::from_str(&json).unwrap();
            assert_eq!(err, parsed);
        }
    }
}
