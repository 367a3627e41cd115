//! Typed broker requests.
//!
//! These are transport-neutral: the local transport lays them out in the
//! fixed binary format, the remote transport serializes them into request
//! envelopes.

use serde::{Deserialize, Serialize};

use crate::types::{Address, FfiType, Value};

/// One positional argument of a call, already in target-native form.
///
/// ```text
/// Function(1024);
/// ---------^^^^
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FfiArgument
{
    pub ty: FfiType,
    pub value: Value,
}

impl FfiArgument
{
    #[must_use]
    pub fn new(ty: FfiType, value: impl Into<Value>) -> Self
    {
        Self { ty, value: value.into() }
    }
}

/// Call a routine exported by a module on the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest
{
    pub module: String,
    pub function: String,
    pub return_type: FfiType,
    pub arguments: Vec<FfiArgument>,
}

impl CallRequest
{
    #[must_use]
    pub fn new(module: impl Into<String>, function: impl Into<String>, return_type: FfiType, arguments: Vec<FfiArgument>) -> Self
    {
        Self {
            module: module.into(),
            function: function.into(),
            return_type,
            arguments,
        }
    }
}

/// Read `size` bytes starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBytes
{
    pub address: Address,
    pub size: usize,
}

impl ReadBytes
{
    #[must_use]
    pub fn new(address: Address, size: usize) -> Self
    {
        Self { address, size }
    }
}

/// Write `data` into existing memory at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBytes
{
    pub address: Address,
    pub data: Vec<u8>,
}

impl WriteBytes
{
    #[must_use]
    pub fn new(address: Address, data: impl Into<Vec<u8>>) -> Self
    {
        Self {
            address,
            data: data.into(),
        }
    }
}

/// Allocate a fresh region of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocate
{
    pub size: usize,
}

impl Allocate
{
    #[must_use]
    pub fn new(size: usize) -> Self
    {
        Self { size }
    }
}

/// Release a region obtained from [`Allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Free
{
    pub address: Address,
}

impl Free
{
    #[must_use]
    pub fn new(address: Address) -> Self
    {
        Self { address }
    }
}
