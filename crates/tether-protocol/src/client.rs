//! Client side of the remote transport.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use tether_core::broker::Broker;
use tether_core::error::{Result, TetherError};
use tether_core::requests::{Allocate, CallRequest, Free, ReadBytes, WriteBytes};
use tether_core::types::{Address, PointerWidth, Value};
use tracing::debug;

use crate::framing::{read_frame, write_frame, MAX_FRAME_LEN};
use crate::message::{BrokerRequest, Envelope};
use crate::DEFAULT_PORT;

/// Where to find a broker server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBrokerConfig
{
    pub host: String,
    pub port: u16,
    /// Applied to connect, read and write. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RemoteBrokerConfig
{
    fn default() -> Self
    {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            timeout: None,
        }
    }
}

/// A [`Broker`] that forwards every operation to a `BrokerServer`.
///
/// Each call opens a fresh connection, sends one request frame and waits for
/// the full response. The target's pointer width never changes, so it's
/// fetched once and cached.
///
/// ## Example
///
/// ```rust,no_run
/// use tether_core::Broker;
/// use tether_protocol::{RemoteBroker, RemoteBrokerConfig};
///
/// let broker = RemoteBroker::new(RemoteBrokerConfig {
///     host: "10.0.0.5".to_string(),
///     ..RemoteBrokerConfig::default()
/// });
/// println!("target is {}", broker.pointer_width()?);
/// # Ok::<(), tether_core::TetherError>(())
/// ```
#[derive(Debug)]
pub struct RemoteBroker
{
    config: RemoteBrokerConfig,
    pointer_width: OnceCell<PointerWidth>,
}

impl RemoteBroker
{
    #[must_use]
    pub fn new(config: RemoteBrokerConfig) -> Self
    {
        Self {
            config,
            pointer_width: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RemoteBrokerConfig
    {
        &self.config
    }

    /// Send one request and decode its response.
    fn request<T: DeserializeOwned>(&self, request: &BrokerRequest) -> Result<T>
    {
        let envelope = request.to_envelope()?;
        debug!(kind = %request.kind(), "Sending request to {}:{}", self.config.host, self.config.port);

        let response = self.exchange(&envelope.to_bytes()?).map_err(|e| self.timed_out(e))?;
        Envelope::from_bytes(&response)?.into_result()
    }

    fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>>
    {
        let mut stream = self.connect()?;
        write_frame(&mut stream, payload)?;
        read_frame(&mut stream, MAX_FRAME_LEN)
    }

    fn connect(&self) -> Result<TcpStream>
    {
        let target = (self.config.host.as_str(), self.config.port);
        let stream = match self.config.timeout {
            None => TcpStream::connect(target)?,
            Some(timeout) => {
                let mut last = None;
                let mut connected = None;
                for addr in target.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last = Some(e),
                    }
                }
                match (connected, last) {
                    (Some(stream), _) => stream,
                    (None, Some(e)) => return Err(e.into()),
                    (None, None) => {
                        return Err(TetherError::Transport(format!(
                            "{} did not resolve to any address",
                            self.config.host
                        )));
                    }
                }
            }
        };

        stream.set_read_timeout(self.config.timeout)?;
        stream.set_write_timeout(self.config.timeout)?;
        Ok(stream)
    }

    fn timed_out(&self, error: TetherError) -> TetherError
    {
        match error {
            TetherError::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                TetherError::Transport(format!(
                    "Timed out talking to broker at {}:{}",
                    self.config.host, self.config.port
                ))
            }
            other => other,
        }
    }
}

impl Broker for RemoteBroker
{
    fn pointer_width(&self) -> Result<PointerWidth>
    {
        self.pointer_width
            .get_or_try_init(|| self.request(&BrokerRequest::GetPointerSize))
            .copied()
    }

    fn call_function(&self, request: &CallRequest) -> Result<Value>
    {
        self.request(&BrokerRequest::CallFunction(request.clone()))
    }

    fn read_bytes(&self, request: &ReadBytes) -> Result<Vec<u8>>
    {
        self.request(&BrokerRequest::ReadBytes(*request))
    }

    fn write_bytes(&self, request: &WriteBytes) -> Result<()>
    {
        self.request(&BrokerRequest::WriteBytes(request.clone()))
    }

    fn allocate(&self, request: &Allocate) -> Result<Address>
    {
        self.request(&BrokerRequest::Allocate(*request))
    }

    fn free(&self, request: &Free) -> Result<()>
    {
        self.request(&BrokerRequest::Free(*request))
    }
}
