//! # Error Types
//!
//! General error handling for brokers, transports and the marshaller.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages. Every variant belongs to exactly one
//! [`FailureKind`], which is the closed taxonomy that crosses the wire when a
//! remote broker reports a failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Address;

/// Closed failure taxonomy shared by every transport.
///
/// A remote peer never sends error objects, only a kind and a message. The
/// receiving side rebuilds a [`TetherError::Remote`] carrying the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind
{
    /// Connection refused/reset, malformed frames, timeouts
    Transport,
    /// Unrecognized request/response kinds or undecodable payloads
    Protocol,
    /// The privileged backend failed while executing an operation
    Target,
    /// Arguments could not be converted to the target's native form
    Marshal,
    /// An allocation handle was used after release
    Allocation,
}

impl fmt::Display for FailureKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            FailureKind::Transport => "transport",
            FailureKind::Protocol => "protocol",
            FailureKind::Target => "target",
            FailureKind::Marshal => "marshal",
            FailureKind::Allocation => "allocation",
        };
        f.write_str(name)
    }
}

/// Main error type for broker operations
///
/// ## Error Categories
///
/// 1. **Transport errors**: Io, Transport, MalformedFrame
/// 2. **Protocol errors**: UnknownRequestKind, UnknownResponseKind, UnknownFfiType, Protocol
/// 3. **Target errors**: Target
/// 4. **Marshalling errors**: everything describing a bad argument, type or layout
/// 5. **Allocation errors**: AllocationReleased
/// 6. **Remote errors**: failures reported by a broker server
#[derive(Error, Debug)]
pub enum TetherError
{
    /// I/O error on a broker connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure that isn't a plain I/O error
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame's length prefix is inconsistent with the bytes received
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Request envelope carried a kind this side doesn't know
    #[error("Unrecognized request type {0}")]
    UnknownRequestKind(u8),

    /// Response envelope carried a kind this side doesn't know
    #[error("Got unknown response type from remote broker: {0}")]
    UnknownResponseKind(u8),

    /// A byte that should have been an `FfiType` tag isn't one
    #[error("Unknown FFI type tag: {0}")]
    UnknownFfiType(u8),

    /// Envelope or payload could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The privileged backend raised while servicing a request
    ///
    /// Examples:
    /// - The module or routine could not be found
    /// - A memory access fell outside any live region
    /// - An address that was never allocated was freed
    #[error("Target execution failed: {0}")]
    Target(String),

    /// A type can't be represented on the target
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    /// The broker reported a pointer size other than 4 or 8
    #[error("Unsupported pointer size: {0} bytes")]
    UnsupportedPointerSize(usize),

    /// The caller supplied the wrong number of arguments for a declaration
    #[error("{function}() takes exactly {expected} arguments ({given} given)")]
    ArgumentCount
    {
        function: String,
        expected: usize,
        given: usize,
    },

    /// No declaration exists for the requested routine
    #[error("Function {module}!{function} has not been declared")]
    UndeclaredFunction
    {
        module: String,
        function: String,
    },

    /// Strings must be encoded to bytes by the caller
    #[error("Strings are not directly supported, please encode them")]
    StringArgument,

    /// `write`/`read_at` offset lies past the end of the allocation
    #[error("Offset {offset} is too great, only {size} bytes available")]
    OffsetOutOfBounds
    {
        offset: usize,
        size: usize,
    },

    /// `write`/`read_at` length runs past the end of the allocation
    #[error("Data length is too great, only {available} bytes available (attempted {len})")]
    LengthOutOfBounds
    {
        available: usize,
        len: usize,
    },

    /// Encoded value size differs from its destination allocation
    #[error("Encoded value is {actual} bytes but its allocation holds {expected}")]
    EncodedSizeMismatch
    {
        expected: usize,
        actual: usize,
    },

    /// A value's shape doesn't fit the type it's encoded as
    #[error("Value {found} does not fit type {expected}")]
    ValueMismatch
    {
        expected: String,
        found: String,
    },

    /// A followed local pointer has no object behind it
    #[error("Local pointer {0} does not refer to a live object")]
    DanglingPointer(Address),

    /// Zero-sized remote allocations are refused
    #[error("Zero-sized allocations are not supported")]
    ZeroSizedAllocation,

    /// Request could not be laid out (name too long, too many arguments, ...)
    #[error("Marshalling error: {0}")]
    Marshal(String),

    /// Read or write attempted through a released allocation
    #[error("Allocation has already been released")]
    AllocationReleased,

    /// Failure reported by a remote broker
    ///
    /// `message` is the peer's error text verbatim.
    #[error("{message}")]
    Remote
    {
        kind: FailureKind,
        message: String,
    },
}

impl TetherError
{
    /// The taxonomy bucket this error belongs to.
    #[must_use]
    pub fn kind(&self) -> FailureKind
    {
        match self {
            TetherError::Io(_) | TetherError::Transport(_) | TetherError::MalformedFrame(_) => FailureKind::Transport,
            TetherError::UnknownRequestKind(_)
            | TetherError::UnknownResponseKind(_)
            | TetherError::UnknownFfiType(_)
            | TetherError::Protocol(_) => FailureKind::Protocol,
            TetherError::Target(_) => FailureKind::Target,
            TetherError::UnsupportedType(_)
            | TetherError::UnsupportedPointerSize(_)
            | TetherError::ArgumentCount { .. }
            | TetherError::UndeclaredFunction { .. }
            | TetherError::StringArgument
            | TetherError::OffsetOutOfBounds { .. }
            | TetherError::LengthOutOfBounds { .. }
            | TetherError::EncodedSizeMismatch { .. }
            | TetherError::ValueMismatch { .. }
            | TetherError::DanglingPointer(_)
            | TetherError::ZeroSizedAllocation
            | TetherError::Marshal(_) => FailureKind::Marshal,
            TetherError::AllocationReleased => FailureKind::Allocation,
            TetherError::Remote { kind, .. } => *kind,
        }
    }

    /// Rebuild a failure reported by a peer.
    pub fn remote(kind: FailureKind, message: impl Into<String>) -> Self
    {
        TetherError::Remote {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn mismatch(expected: impl fmt::Display, found: impl fmt::Debug) -> Self
    {
        TetherError::ValueMismatch {
            expected: expected.to_string(),
            found: format!("{found:?}"),
        }
    }
}

/// Convenience type alias for `Result<T, TetherError>`
///
/// ```rust
/// use tether_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, TetherError>;
