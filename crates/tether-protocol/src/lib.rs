//! # tether-protocol
//!
//! Remote transport for Tether brokers.
//!
//! A [`BrokerServer`] wraps any [`Broker`](tether_core::Broker) (usually a
//! local broker talking to the privileged device) and exposes it over TCP. A
//! [`RemoteBroker`] is the client side and itself implements `Broker`, so the
//! translator, allocations and the client facade work unchanged across a
//! machine boundary.
//!
//! ## Wire format
//!
//! - Every message is one frame: `[u32 big-endian length][payload]`
//! - The payload is a bincode-encoded [`Envelope`] `{kind, data}`
//! - One connection carries exactly one request and one response

pub mod client;
pub mod framing;
pub mod message;
pub mod server;

pub use client::{RemoteBroker, RemoteBrokerConfig};
pub use framing::MAX_FRAME_LEN;
pub use message::{BrokerRequest, Envelope, Failure, RequestKind, ResponseKind};
pub use server::{BrokerServer, ServerConfig, ServerHandle};

/// Port used by the `tether` binary and both config defaults.
pub const DEFAULT_PORT: u16 = 16350;
