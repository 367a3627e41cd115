//! Request and response envelopes.
//!
//! Both directions use the same `{kind, data}` shape. For requests `data` is
//! the bincode encoding of the matching `tether_core::requests` struct (empty
//! for `GET_POINTER_SIZE`). For responses it's either the encoded result or a
//! [`Failure`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_core::error::{FailureKind, Result, TetherError};
use tether_core::requests::{Allocate, CallRequest, Free, ReadBytes, WriteBytes};

/// Request kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind
{
    GetPointerSize = 0,
    CallFunction = 1,
    ReadBytes = 2,
    WriteBytes = 3,
    Allocate = 4,
    Free = 5,
}

impl TryFrom<u8> for RequestKind
{
    type Error = TetherError;

    fn try_from(tag: u8) -> Result<Self>
    {
        match tag {
            0 => Ok(RequestKind::GetPointerSize),
            1 => Ok(RequestKind::CallFunction),
            2 => Ok(RequestKind::ReadBytes),
            3 => Ok(RequestKind::WriteBytes),
            4 => Ok(RequestKind::Allocate),
            5 => Ok(RequestKind::Free),
            other => Err(TetherError::UnknownRequestKind(other)),
        }
    }
}

impl fmt::Display for RequestKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            RequestKind::GetPointerSize => "GET_POINTER_SIZE",
            RequestKind::CallFunction => "CALL_FUNCTION",
            RequestKind::ReadBytes => "READ_BYTES",
            RequestKind::WriteBytes => "WRITE_BYTES",
            RequestKind::Allocate => "ALLOCATE",
            RequestKind::Free => "FREE",
        };
        f.write_str(name)
    }
}

/// Response kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind
{
    Success = 0,
    Exception = 1,
}

impl TryFrom<u8> for ResponseKind
{
    type Error = TetherError;

    fn try_from(tag: u8) -> Result<Self>
    {
        match tag {
            0 => Ok(ResponseKind::Success),
            1 => Ok(ResponseKind::Exception),
            other => Err(TetherError::UnknownResponseKind(other)),
        }
    }
}

/// The unit carried by one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope
{
    pub kind: u8,
    pub data: Vec<u8>,
}

impl Envelope
{
    pub fn new(kind: u8, data: Vec<u8>) -> Self
    {
        Self { kind, data }
    }

    /// A `SUCCESS` response carrying `result`.
    ///
    /// ## Errors
    ///
    /// `Protocol` if the result can't be encoded.
    pub fn success<T: Serialize>(result: &T) -> Result<Self>
    {
        Ok(Self::new(ResponseKind::Success as u8, encode(result)?))
    }

    /// An `EXCEPTION` response describing `error`.
    ///
    /// ## Errors
    ///
    /// `Protocol` if the failure record can't be encoded.
    pub fn exception(error: &TetherError) -> Result<Self>
    {
        let data = encode(&Failure::from(error))?;
        Ok(Self::new(ResponseKind::Exception as u8, data))
    }

    /// Serialize for framing.
    ///
    /// ## Errors
    ///
    /// `Protocol` on encoder failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>>
    {
        encode(self)
    }

    /// Parse a received frame payload.
    ///
    /// ## Errors
    ///
    /// `Protocol` if the payload isn't an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self>
    {
        decode(bytes)
    }

    /// Unpack a response: decode the result on `SUCCESS`, rebuild the remote
    /// failure on `EXCEPTION`.
    ///
    /// ## Errors
    ///
    /// - `UnknownResponseKind` for any other kind
    /// - `Protocol` if the body doesn't decode
    /// - `Remote` carrying the peer's failure
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T>
    {
        match ResponseKind::try_from(self.kind)? {
            ResponseKind::Success => decode(&self.data),
            ResponseKind::Exception => Err(decode::<Failure>(&self.data)?.into_error()),
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerRequest
{
    GetPointerSize,
    CallFunction(CallRequest),
    ReadBytes(ReadBytes),
    WriteBytes(WriteBytes),
    Allocate(Allocate),
    Free(Free),
}

impl BrokerRequest
{
    #[must_use]
    pub fn kind(&self) -> RequestKind
    {
        match self {
            BrokerRequest::GetPointerSize => RequestKind::GetPointerSize,
            BrokerRequest::CallFunction(_) => RequestKind::CallFunction,
            BrokerRequest::ReadBytes(_) => RequestKind::ReadBytes,
            BrokerRequest::WriteBytes(_) => RequestKind::WriteBytes,
            BrokerRequest::Allocate(_) => RequestKind::Allocate,
            BrokerRequest::Free(_) => RequestKind::Free,
        }
    }

    /// Wrap in a request envelope.
    ///
    /// ## Errors
    ///
    /// `Protocol` on encoder failure.
    pub fn to_envelope(&self) -> Result<Envelope>
    {
        let data = match self {
            BrokerRequest::GetPointerSize => Vec::new(),
            BrokerRequest::CallFunction(request) => encode(request)?,
            BrokerRequest::ReadBytes(request) => encode(request)?,
            BrokerRequest::WriteBytes(request) => encode(request)?,
            BrokerRequest::Allocate(request) => encode(request)?,
            BrokerRequest::Free(request) => encode(request)?,
        };
        Ok(Envelope::new(self.kind() as u8, data))
    }

    /// Unwrap a request envelope.
    ///
    /// ## Errors
    ///
    /// `UnknownRequestKind` for tags outside `0..=5`, `Protocol` if the body
    /// doesn't decode as the kind's request.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self>
    {
        let data = &envelope.data;
        Ok(match RequestKind::try_from(envelope.kind)? {
            RequestKind::GetPointerSize => BrokerRequest::GetPointerSize,
            RequestKind::CallFunction => BrokerRequest::CallFunction(decode(data)?),
            RequestKind::ReadBytes => BrokerRequest::ReadBytes(decode(data)?),
            RequestKind::WriteBytes => BrokerRequest::WriteBytes(decode(data)?),
            RequestKind::Allocate => BrokerRequest::Allocate(decode(data)?),
            RequestKind::Free => BrokerRequest::Free(decode(data)?),
        })
    }
}

/// Body of an `EXCEPTION` response.
///
/// Only the closed failure kind and text cross the wire, never error objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure
{
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl Failure
{
    /// Rebuild the failure as a local error with the same kind and message.
    #[must_use]
    pub fn into_error(self) -> TetherError
    {
        TetherError::remote(self.kind, self.message)
    }
}

impl From<&TetherError> for Failure
{
    fn from(error: &TetherError) -> Self
    {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            detail: Some(format!("{error:?}")),
        }
    }
}

/// bincode-encode a payload.
///
/// ## Errors
///
/// `Protocol` on encoder failure.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>
{
    bincode::serialize(value).map_err(|e| TetherError::Protocol(format!("Failed to encode payload: {e}")))
}

/// bincode-decode a payload.
///
/// ## Errors
///
/// `Protocol` if the bytes don't decode as `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>
{
    bincode::deserialize(bytes).map_err(|e| TetherError::Protocol(format!("Failed to decode payload: {e}")))
}

#[cfg(test)]
mod tests
{
    use tether_core::requests::FfiArgument;
    use tether_core::types::{Address, FfiType, PointerWidth, Value};

    use super::*;

    #[test]
    fn test_request_kind_tags()
    {
        assert_eq!(RequestKind::GetPointerSize as u8, 0);
        assert_eq!(RequestKind::Free as u8, 5);
        assert_eq!(RequestKind::try_from(3).unwrap(), RequestKind::WriteBytes);
        assert!(matches!(RequestKind::try_from(6), Err(TetherError::UnknownRequestKind(6))));
        assert!(matches!(ResponseKind::try_from(2), Err(TetherError::UnknownResponseKind(2))));
    }

    #[test]
    fn test_request_envelopes()
    {
        let call = BrokerRequest::CallFunction(CallRequest::new(
            "ntoskrnl",
            "RtlCompareMemory",
            FfiType::UInt64,
            vec![FfiArgument::new(FfiType::Pointer, Address::new(0x10)), FfiArgument::new(FfiType::UInt64, 4_u64)],
        ));
        let envelope = call.to_envelope().unwrap();
        assert_eq!(envelope.kind, 1);
        assert_eq!(BrokerRequest::from_envelope(&envelope).unwrap(), call);

        let size = BrokerRequest::GetPointerSize.to_envelope().unwrap();
        assert_eq!(size, Envelope::new(0, Vec::new()));
    }

    #[test]
    fn test_truncated_request_body_is_a_protocol_error()
    {
        let envelope = Envelope::new(RequestKind::ReadBytes as u8, vec![1, 2]);
        let err = BrokerRequest::from_envelope(&envelope).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
    }

    #[test]
    fn test_success_and_exception_responses()
    {
        let ok = Envelope::success(&PointerWidth::Bits64).unwrap();
        assert_eq!(ok.kind, 0);
        assert_eq!(ok.into_result::<PointerWidth>().unwrap(), PointerWidth::Bits64);

        let value = Envelope::success(&Value::Int(-7)).unwrap();
        assert_eq!(value.into_result::<Value>().unwrap(), Value::Int(-7));

        let failure = Envelope::exception(&TetherError::Target("Module missing not found".into())).unwrap();
        assert_eq!(failure.kind, 1);
        let err = failure.into_result::<Value>().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Target);
        assert_eq!(err.to_string(), "Target execution failed: Module missing not found");
    }

    #[test]
    fn test_exception_body_carries_the_failure_record()
    {
        let error = TetherError::Transport("peer reset".into());
        let envelope = Envelope::exception(&error).unwrap();
        assert!(!envelope.data.is_empty());

        let failure: Failure = decode(&envelope.data).unwrap();
        assert_eq!(failure.kind, FailureKind::Transport);
        assert_eq!(failure.message, "Transport error: peer reset");
        assert!(failure.detail.unwrap().contains("Transport"));
    }

    #[test]
    fn test_unknown_response_kind()
    {
        let err = Envelope::new(9, Vec::new()).into_result::<()>().unwrap_err();
        assert!(matches!(err, TetherError::UnknownResponseKind(9)));
        assert_eq!(err.kind(), FailureKind::Protocol);
    }
}
