//! # tether-core
//!
//! Userland half of a privileged FFI broker.
//!
//! This crate lets ordinary code call routines that live inside a privileged
//! execution context (typically an OS kernel), marshal structured arguments
//! across that boundary, and manage memory on the privileged side. It
//! provides:
//! - The [`Broker`] trait, the single capability interface every transport implements
//! - A structural type IR ([`types::TypeDescriptor`]) and a value codec
//! - The pointer-graph [`translate`] engine that copies argument graphs to the target
//! - Owned [`Allocation`] handles with bounds-checked reads and writes
//! - The [`local`] transport and an in-process [`device::EmulatedDevice`]
//! - A [`Client`] facade with declared signatures and string helpers
//!
//! ## Transports
//!
//! - **Local**: [`local::LocalBroker`] speaks a fixed binary layout to a [`device::Device`]
//! - **Remote**: the `tether-protocol` crate forwards requests over TCP
//!
//! ## No unsafe code
//!
//! Local pointers are modelled as addresses into a [`translate::LocalMemory`]
//! arena and the device only ever sees scratch addresses, so the crate
//! needs no `unsafe` at all.

pub mod allocation;
pub mod broker;
pub mod client;
pub mod codec;
pub mod device;
pub mod error;
pub mod local;
pub mod native;
pub mod prelude;
pub mod requests;
pub mod translate;
pub mod types;

pub use allocation::Allocation;
pub use broker::Broker;
pub use client::{Client, ExCallOptions, ExCallOutcome};
// Re-export commonly used types
pub use error::{FailureKind, Result, TetherError};
pub use types::{Address, FfiType, PointerWidth, TypeDescriptor, Value};
