use std::process;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tether_core::device::EmulatedDevice;
use tether_core::local::LocalBroker;
use tether_core::requests::{Allocate, Free, ReadBytes, WriteBytes};
use tether_core::{Address, Broker, PointerWidth};
use tether_protocol::{BrokerServer, RemoteBroker, RemoteBrokerConfig, ServerConfig, DEFAULT_PORT, MAX_FRAME_LEN};
use tether_utils::{info, init_logging, warn, LogConfig, LogLevel};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Call functions and manage memory inside a privileged target through a narrow broker.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Call functions and manage memory inside a privileged target through a narrow broker", long_about = None)]
struct Cli
{
    /// Log level (error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Expose a privileged device to remote clients
    Serve
    {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        address: String,
        /// Port to bind
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Device to serve (only `emulator` is built in)
        #[arg(long, default_value = "emulator")]
        device: String,
        /// Pointer width of the emulated target in bytes (4 or 8)
        #[arg(long, default_value_t = 8)]
        pointer_width: usize,
    },
    /// Print the target's pointer size in bytes
    PointerSize
    {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Read target memory and print it as hex
    Read
    {
        #[command(flatten)]
        target: TargetArgs,
        /// Address to read from (hex format: 0x1000 or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Number of bytes to read
        length: usize,
    },
    /// Write hex-encoded bytes to target memory
    Write
    {
        #[command(flatten)]
        target: TargetArgs,
        /// Address to write to (hex format: 0x1000 or decimal)
        #[arg(value_parser = parse_address)]
        address: Address,
        /// Bytes to write, hex encoded (e.g. 48656c6c6f)
        data: String,
    },
    /// Allocate target memory and print its address
    Alloc
    {
        #[command(flatten)]
        target: TargetArgs,
        /// Size in bytes
        size: usize,
    },
    /// Free target memory
    Free
    {
        #[command(flatten)]
        target: TargetArgs,
        /// Address returned by `alloc`
        #[arg(value_parser = parse_address)]
        address: Address,
    },
}

/// Which broker server to talk to.
#[derive(Args, Debug)]
struct TargetArgs
{
    /// Broker server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Broker server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Connect/read/write timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl TargetArgs
{
    fn connect(self) -> RemoteBroker
    {
        RemoteBroker::new(RemoteBrokerConfig {
            host: self.host,
            port: self.port,
            timeout: self.timeout_ms.map(Duration::from_millis),
        })
    }
}

fn parse_address(s: &str) -> Result<Address, String>
{
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed
        .map(Address::new)
        .map_err(|e| format!("Invalid address {s}: {e}"))
}

fn main()
{
    let cli = Cli::parse();

    let config = match LogConfig::from_env() {
        Ok(config) => config.with_level(cli.log_level),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };
    let _guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Commands) -> CliResult<()>
{
    match command {
        Commands::Serve {
            address,
            port,
            device,
            pointer_width,
        } => serve(address, port, &device, pointer_width),
        Commands::PointerSize { target } => {
            let width = target.connect().pointer_width()?;
            println!("{}", width.bytes());
            Ok(())
        }
        Commands::Read { target, address, length } => {
            let bytes = target.connect().read_bytes(&ReadBytes::new(address, length))?;
            println!("{}", hex::encode(bytes));
            Ok(())
        }
        Commands::Write { target, address, data } => {
            let bytes = hex::decode(data.trim())?;
            let len = bytes.len();
            target.connect().write_bytes(&WriteBytes::new(address, bytes))?;
            println!("Wrote {len} bytes to {address}");
            Ok(())
        }
        Commands::Alloc { target, size } => {
            let address = target.connect().allocate(&Allocate::new(size))?;
            println!("{address}");
            Ok(())
        }
        Commands::Free { target, address } => {
            target.connect().free(&Free::new(address))?;
            println!("Freed {address}");
            Ok(())
        }
    }
}

fn serve(address: String, port: u16, device: &str, pointer_width: usize) -> CliResult<()>
{
    if device != "emulator" {
        return Err(format!("Unknown device '{device}'. Only 'emulator' is built in").into());
    }
    let width = PointerWidth::from_bytes(pointer_width)?;

    let broker = LocalBroker::new(EmulatedDevice::with_kernel_routines(width));
    let config = ServerConfig {
        address,
        port,
        max_frame_len: MAX_FRAME_LEN,
    };
    let server = BrokerServer::bind(broker, &config)?;
    info!("Serving a {width} emulated target on {}", server.local_addr());
    let handle = server.spawn()?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        if let Err(e) = stop_tx.send(()) {
            warn!("Failed to deliver the shutdown signal: {e}");
        }
    })?;
    wait_for_stop(&stop_rx);

    let served = handle.requests_served();
    handle.shutdown()?;
    info!("Shut down after serving {served} requests");
    Ok(())
}

/// Block until the interrupt handler signals, or its sender is gone.
fn wait_for_stop(stop_rx: &mpsc::Receiver<()>) -> bool
{
    match stop_rx.recv() {
        Ok(()) => true,
        Err(e) => {
            warn!("Shutdown channel closed early: {e}");
            false
        }
    }
}
