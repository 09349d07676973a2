//! Custom error types for the RPC bridge.
//!
//! `RpcError` is the primary error type for the server side. It covers the
//! lifecycle of the adapter layer: startup classification of the native API,
//! handle resolution against the object registry, member dispatch, and the
//! payload codec. Failures raised by the native library itself are carried
//! through unchanged in the `Native` variant so the original diagnostic
//! reaches the caller.
//!
//! At the gRPC boundary every variant maps to a stable `tonic::Status` code,
//! so clients can distinguish a stale reference (`NOT_FOUND`) from a call on
//! an already-closed object (`FAILED_PRECONDITION`) or a native fault
//! (`INTERNAL`).

use thiserror::Error;

use crate::codec::CodecError;
use crate::native::NativeError;

/// Convenience alias for results using the server error type.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

#[derive(Error, Debug)]
pub enum RpcError {
    /// A native class matched zero or multiple adapter kinds at startup.
    #[error("classification error: {0}")]
    Classification(String),

    /// An identity was not found in the object registry. Covers handles to
    /// objects that were already closed as well as fabricated identities.
    #[error("stale object reference '{0}'")]
    StaleReference(String),

    /// A member was invoked on an adapter whose native handle has been
    /// released. Distinct from `close`, which is idempotent.
    #[error("object '{0}' is already closed")]
    AlreadyClosed(String),

    /// The requested member is not part of the exposed surface.
    #[error("'{target}' has no member '{member}'")]
    UnknownMember { target: String, member: String },

    /// Arguments did not match what the member expects (wrong count, or a
    /// value where an object reference is required).
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The session id does not name a live connection.
    #[error("unknown session '{0}'")]
    UnknownSession(String),

    /// Failure raised by the native library, forwarded unchanged.
    #[error("native call failed: {0}")]
    Native(#[from] NativeError),

    /// Payload encode/decode failure.
    #[error("codec error: {0}")]
    Decode(#[from] CodecError),

    /// Invariant violation inside the adapter layer itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RpcError> for tonic::Status {
    fn from(err: RpcError) -> Self {
        use tonic::Status;
        let message = err.to_string();
        match err {
            RpcError::StaleReference(_) => Status::not_found(message),
            RpcError::AlreadyClosed(_) => Status::failed_precondition(message),
            RpcError::UnknownMember { .. } => Status::unimplemented(message),
            RpcError::InvalidArguments(_) | RpcError::Decode(_) => {
                Status::invalid_argument(message)
            }
            RpcError::UnknownSession(_) => Status::unauthenticated(message),
            RpcError::Classification(_) | RpcError::Native(_) | RpcError::Internal(_) => {
                Status::internal(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::StaleReference("Countrate-abc".into());
        assert_eq!(err.to_string(), "stale object reference 'Countrate-abc'");
    }

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = RpcError::StaleReference("x".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = RpcError::AlreadyClosed("x".into()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = RpcError::Native(NativeError::Call("boom".into())).into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("boom"));
    }
}
