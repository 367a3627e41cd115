//! # Types
//!
//! The FFI vocabulary shared by every other component: primitive machine
//! types, structural descriptors, values, addresses and declared signatures.

pub mod address;
pub mod descriptor;
pub mod ffi;
pub mod function;
pub mod value;

// Re-export all public types
pub use address::Address;
pub use descriptor::{Field, Record, RecordLayout, TypeDescriptor, TypeRef};
pub use ffi::{FfiType, PointerWidth};
pub use function::{FfiFunction, FfiParameter, FunctionRegistry};
pub use value::Value;
