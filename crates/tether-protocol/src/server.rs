//! # Broker Server
//!
//! Exposes a local [`Broker`] to remote clients.
//!
//! Connections are served concurrently (one worker thread each), but every
//! delegated broker operation goes through a single mutex, so the wrapped
//! broker sees strictly one request at a time. Any failure while handling a
//! request is captured and sent back as an `EXCEPTION` response.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tether_core::broker::Broker;
use tether_core::error::{Result, TetherError};
use tracing::{debug, error, info, warn};

use crate::framing::{read_frame, write_frame, MAX_FRAME_LEN};
use crate::message::{encode, BrokerRequest, Envelope, ResponseKind};
use crate::DEFAULT_PORT;

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig
{
    pub address: String,
    /// `0` picks a free port
    pub port: u16,
    pub max_frame_len: usize,
}

impl Default for ServerConfig
{
    fn default() -> Self
    {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug)]
struct ServerState
{
    local_addr: SocketAddr,
    max_frame_len: usize,
    served: AtomicU64,
    shutdown: AtomicBool,
}

/// A bound, not yet running, broker server.
pub struct BrokerServer<B>
{
    listener: TcpListener,
    broker: Arc<Mutex<B>>,
    state: Arc<ServerState>,
}

impl<B: Broker + 'static> BrokerServer<B>
{
    /// Bind the listening socket.
    ///
    /// ## Errors
    ///
    /// `Io` if the address can't be bound.
    pub fn bind(broker: B, config: &ServerConfig) -> Result<Self>
    {
        let listener = TcpListener::bind((config.address.as_str(), config.port))?;
        let local_addr = listener.local_addr()?;
        info!("Broker server listening on {local_addr}");

        Ok(Self {
            listener,
            broker: Arc::new(Mutex::new(broker)),
            state: Arc::new(ServerState {
                local_addr,
                max_frame_len: config.max_frame_len,
                served: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// The address actually bound (useful with port `0`).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr
    {
        self.state.local_addr
    }

    /// A handle that can observe and stop this server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle
    {
        ServerHandle {
            state: Arc::clone(&self.state),
            thread: None,
        }
    }

    /// Run the accept loop on a background thread.
    ///
    /// ## Errors
    ///
    /// `Io` if the thread can't be spawned.
    pub fn spawn(self) -> Result<ServerHandle>
    {
        let mut handle = self.handle();
        let thread = thread::Builder::new()
            .name("tether-server".to_string())
            .spawn(move || {
                if let Err(e) = self.serve_forever() {
                    error!("Broker server stopped: {e}");
                }
            })?;
        handle.thread = Some(thread);
        Ok(handle)
    }

    /// Accept connections until a [`ServerHandle`] asks for shutdown.
    ///
    /// ## Errors
    ///
    /// `Io` if accepting fails for a reason other than a dropped peer.
    pub fn serve_forever(self) -> Result<()>
    {
        let mut next_id = 0_u64;
        for stream in self.listener.incoming() {
            if self.state.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e.into()),
            };

            next_id += 1;
            let broker = Arc::clone(&self.broker);
            let state = Arc::clone(&self.state);
            let spawned = thread::Builder::new()
                .name(format!("tether-conn-{next_id}"))
                .spawn(move || {
                    if let Err(e) = handle_connection(stream, &broker, &state) {
                        warn!("Connection {next_id} failed: {e}");
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to spawn worker for connection {next_id}: {e}");
            }
        }

        info!("Broker server on {} shut down", self.state.local_addr);
        Ok(())
    }
}

/// Observes a running server and stops it.
#[derive(Debug)]
pub struct ServerHandle
{
    state: Arc<ServerState>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle
{
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr
    {
        self.state.local_addr
    }

    /// Number of requests answered so far, exceptions included.
    #[must_use]
    pub fn requests_served(&self) -> u64
    {
        self.state.served.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Connections already being served run to completion.
    ///
    /// ## Errors
    ///
    /// `Transport` if the accept loop thread panicked.
    pub fn shutdown(mut self) -> Result<()>
    {
        self.state.shutdown.store(true, Ordering::SeqCst);

        // Wake the blocking accept
        let wake = wake_addr(self.state.local_addr);
        if let Err(e) = TcpStream::connect(wake) {
            debug!("Wake-up connection to {wake} failed: {e}");
        }

        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| TetherError::Transport("Broker server thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

/// Where to connect to reach a listener bound to `local`.
///
/// A wildcard bind is reached through the loopback address of the same
/// family; anything else is connected to as bound.
fn wake_addr(local: SocketAddr) -> SocketAddr
{
    let ip: IpAddr = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.into(),
        IpAddr::V6(ip) if ip.is_unspecified() => Ipv6Addr::LOCALHOST.into(),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

fn handle_connection<B: Broker>(mut stream: TcpStream, broker: &Mutex<B>, state: &ServerState) -> Result<()>
{
    let peer = stream.peer_addr()?;
    debug!("Accepted connection from {peer}");

    let request = read_frame(&mut stream, state.max_frame_len).and_then(|frame| Envelope::from_bytes(&frame));
    let response = match request {
        Ok(envelope) => dispatch(broker, &envelope)?,
        Err(e) => {
            error!("Bad request from {peer}: {e}");
            Envelope::exception(&e)?
        }
    };

    let payload = response.to_bytes()?;
    state.served.fetch_add(1, Ordering::SeqCst);
    write_frame(&mut stream, &payload)
}

/// Execute one request envelope against `broker` and build the response.
///
/// Request and broker errors become `EXCEPTION` responses.
///
/// ## Errors
///
/// `Protocol` only if a response can't be encoded at all.
pub fn dispatch<B: Broker + ?Sized>(broker: &Mutex<B>, envelope: &Envelope) -> Result<Envelope>
{
    let outcome = BrokerRequest::from_envelope(envelope).and_then(|request| {
        debug!(kind = %request.kind(), "Dispatching request");
        let broker = broker.lock();
        execute(&*broker, &request)
    });

    match outcome {
        Ok(data) => Ok(Envelope::new(ResponseKind::Success as u8, data)),
        Err(e) => {
            error!("Request failed: {e}");
            Envelope::exception(&e)
        }
    }
}

fn execute<B: Broker + ?Sized>(broker: &B, request: &BrokerRequest) -> Result<Vec<u8>>
{
    match request {
        BrokerRequest::GetPointerSize => encode(&broker.pointer_width()?),
        BrokerRequest::CallFunction(call) => encode(&broker.call_function(call)?),
        BrokerRequest::ReadBytes(read) => encode(&broker.read_bytes(read)?),
        BrokerRequest::WriteBytes(write) => encode(&broker.write_bytes(write)?),
        BrokerRequest::Allocate(allocate) => encode(&broker.allocate(allocate)?),
        BrokerRequest::Free(free) => encode(&broker.free(free)?),
    }
}

#[cfg(test)]
mod tests
{
    use tether_core::device::EmulatedDevice;
    use tether_core::error::FailureKind;
    use tether_core::local::LocalBroker;
    use tether_core::types::PointerWidth;

    use super::*;
    use crate::message::RequestKind;

    fn broker() -> Mutex<LocalBroker<EmulatedDevice>>
    {
        Mutex::new(LocalBroker::new(EmulatedDevice::new(PointerWidth::Bits32)))
    }

    #[test]
    fn test_dispatch_pointer_size()
    {
        let response = dispatch(&broker(), &Envelope::new(RequestKind::GetPointerSize as u8, Vec::new())).unwrap();
        assert_eq!(response.kind, ResponseKind::Success as u8);
        assert_eq!(response.into_result::<PointerWidth>().unwrap(), PointerWidth::Bits32);
    }

    #[test]
    fn test_wake_addr_matches_the_bound_family()
    {
        let v4: SocketAddr = "0.0.0.0:16350".parse().unwrap();
        assert_eq!(wake_addr(v4), "127.0.0.1:16350".parse().unwrap());

        let v6: SocketAddr = "[::]:16350".parse().unwrap();
        assert_eq!(wake_addr(v6), "[::1]:16350".parse().unwrap());

        let bound: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        assert_eq!(wake_addr(bound), bound);
    }

    #[test]
    fn test_dispatch_unknown_kind_is_an_exception()
    {
        let response = dispatch(&broker(), &Envelope::new(42, vec![1, 2, 3])).unwrap();
        assert_eq!(response.kind, ResponseKind::Exception as u8);

        let err = response.into_result::<()>().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
        assert_eq!(err.to_string(), "Unrecognized request type 42");
    }
}
