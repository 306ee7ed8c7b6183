// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error handling for collective operations
//!
//! Synchronous errors are returned by the call that detected them. Errors that
//! happen after an operation was posted are only observable through the
//! terminal state of its [`Work`](crate::net::work::Work), which is why
//! [`CommError`] is `Clone`: every waiter receives its own copy.

use std::fmt;
use std::time::Duration;

/// Coarse error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Invalid = 4,
    IoError = 5,
    NotImplemented = 10,
    UnsupportedMemoryKind = 12,
    RendezvousTimeout = 20,
    TransportInitError = 21,
    CommunicatorDestroyed = 22,
    TransportOpError = 23,
    CommunicatorInvalidated = 24,
    Aborted = 25,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::Invalid => write!(f, "Invalid argument"),
            Code::IoError => write!(f, "IO error"),
            Code::NotImplemented => write!(f, "Not implemented"),
            Code::UnsupportedMemoryKind => write!(f, "Unsupported memory kind"),
            Code::RendezvousTimeout => write!(f, "Rendezvous timeout"),
            Code::TransportInitError => write!(f, "Transport init error"),
            Code::CommunicatorDestroyed => write!(f, "Communicator destroyed"),
            Code::TransportOpError => write!(f, "Transport operation error"),
            Code::CommunicatorInvalidated => write!(f, "Communicator invalidated"),
            Code::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Main error type
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CommError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported memory kind: {0}")]
    UnsupportedMemoryKind(String),

    #[error("Rendezvous for group '{group}' timed out after {timeout:?}; missing ranks {missing:?}")]
    RendezvousTimeout {
        group: String,
        missing: Vec<usize>,
        timeout: Duration,
    },

    #[error("Transport init failed: {0}")]
    TransportInit(String),

    #[error("Communicator destroyed: {0}")]
    CommunicatorDestroyed(String),

    #[error("Transport operation failed: {0}")]
    TransportOp(String),

    #[error("Communicator invalidated after a failed operation: {0}")]
    CommunicatorInvalidated(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl CommError {
    /// Shorthand for [`CommError::InvalidArgument`]
    pub fn invalid(message: impl Into<String>) -> Self {
        CommError::InvalidArgument(message.into())
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            CommError::InvalidArgument(_) => Code::Invalid,
            CommError::UnsupportedMemoryKind(_) => Code::UnsupportedMemoryKind,
            CommError::RendezvousTimeout { .. } => Code::RendezvousTimeout,
            CommError::TransportInit(_) => Code::TransportInitError,
            CommError::CommunicatorDestroyed(_) => Code::CommunicatorDestroyed,
            CommError::TransportOp(_) => Code::TransportOpError,
            CommError::CommunicatorInvalidated(_) => Code::CommunicatorInvalidated,
            CommError::Aborted => Code::Aborted,
            CommError::Store(_) => Code::IoError,
            CommError::NotImplemented(_) => Code::NotImplemented,
        }
    }

    /// Whether a fresh `get_or_create` may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommError::RendezvousTimeout { .. } | CommError::TransportInit(_) | CommError::Store(_)
        )
    }
}

/// Type alias for Results using CommError
pub type CommResult<T> = Result<T, CommError>;

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CommError {
    fn from(e: redis::RedisError) -> Self {
        CommError::Store(e.to_string())
    }
}
