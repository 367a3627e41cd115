//! Common module for library exports

pub use crate::allocation::Allocation;
pub use crate::broker::Broker;
pub use crate::client::{Client, ExCallOptions, ExCallOutcome};
pub use crate::device::{Device, EmulatedDevice};
pub use crate::error::{FailureKind, Result, TetherError};
pub use crate::local::LocalBroker;
pub use crate::requests::{Allocate, CallRequest, FfiArgument, Free, ReadBytes, WriteBytes};
pub use crate::translate::{Argument, LocalMemory};
pub use crate::types::{Address, FfiFunction, FfiType, PointerWidth, TypeDescriptor, TypeRef, Value};
