//! Loopback tests for the remote transport

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tether_core::device::{EmulatedDevice, KERNEL_MODULE};
use tether_core::prelude::*;
use tether_protocol::framing::{read_frame, write_frame};
use tether_protocol::{BrokerServer, Envelope, RemoteBroker, RemoteBrokerConfig, ServerConfig, ServerHandle, MAX_FRAME_LEN};

fn loopback(max_frame_len: usize) -> ServerConfig
{
    ServerConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        max_frame_len,
    }
}

fn spawn_server(width: PointerWidth) -> ServerHandle
{
    let broker = LocalBroker::new(EmulatedDevice::with_kernel_routines(width));
    BrokerServer::bind(broker, &loopback(MAX_FRAME_LEN)).unwrap().spawn().unwrap()
}

fn remote(handle: &ServerHandle) -> RemoteBroker
{
    RemoteBroker::new(RemoteBrokerConfig {
        host: "127.0.0.1".to_string(),
        port: handle.local_addr().port(),
        timeout: Some(Duration::from_secs(5)),
    })
}

fn raw_exchange(handle: &ServerHandle, payload: &[u8]) -> Envelope
{
    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    write_frame(&mut stream, payload).unwrap();
    Envelope::from_bytes(&read_frame(&mut stream, MAX_FRAME_LEN).unwrap()).unwrap()
}

#[test]
fn test_pointer_size_is_cached()
{
    let handle = spawn_server(PointerWidth::Bits64);
    let broker = remote(&handle);

    assert_eq!(broker.pointer_width().unwrap().bytes(), 8);
    assert_eq!(broker.pointer_width().unwrap().bytes(), 8);
    assert_eq!(handle.requests_served(), 1);

    handle.shutdown().unwrap();
}

#[test]
fn test_unknown_module_message_matches_server()
{
    let handle = spawn_server(PointerWidth::Bits64);
    let broker = remote(&handle);
    let request = CallRequest::new("missing", "Routine", FfiType::Void, Vec::new());

    let local = LocalBroker::new(EmulatedDevice::new(PointerWidth::Bits64));
    let expected = local.call_function(&request).unwrap_err();

    let err = broker.call_function(&request).unwrap_err();
    assert!(matches!(err, TetherError::Remote { .. }));
    assert_eq!(err.kind(), FailureKind::Target);
    assert_eq!(err.to_string(), expected.to_string());

    handle.shutdown().unwrap();
}

#[test]
fn test_memory_operations_over_the_wire()
{
    let handle = spawn_server(PointerWidth::Bits32);
    let broker = remote(&handle);

    let address = broker.allocate(&Allocate::new(8)).unwrap();
    broker.write_bytes(&WriteBytes::new(address, vec![1, 2, 3, 4])).unwrap();
    assert_eq!(broker.read_bytes(&ReadBytes::new(address, 5)).unwrap(), [1, 2, 3, 4, 0]);
    broker.free(&Free::new(address)).unwrap();

    let err = broker.free(&Free::new(address)).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Target);
    assert!(err.to_string().contains("No allocation found"));

    handle.shutdown().unwrap();
}

#[test]
fn test_client_facade_over_the_wire()
{
    let handle = spawn_server(PointerWidth::Bits64);
    let mut client = Client::new(remote(&handle));
    client.declare(
        KERNEL_MODULE,
        FfiFunction::new("RtlInitUnicodeString", FfiType::Void)
            .param("DestinationString", FfiType::Pointer)
            .param("SourceString", FfiType::Pointer),
    );

    let unicode_string = TypeDescriptor::record(
        "UNICODE_STRING",
        [
            ("Length", TypeDescriptor::scalar(FfiType::UShort)),
            ("MaximumLength", TypeDescriptor::scalar(FfiType::UShort)),
            ("Buffer", TypeDescriptor::opaque_pointer()),
        ],
    );
    let mut memory = LocalMemory::new();
    let destination = memory.reserve(unicode_string);
    let source: Vec<u8> = "Tether\0".encode_utf16().flat_map(u16::to_le_bytes).collect();

    let outcome = client
        .ex_call(
            KERNEL_MODULE,
            "RtlInitUnicodeString",
            &memory,
            vec![Argument::Pointer(destination), Argument::Bytes(source)],
            ExCallOptions::default(),
        )
        .unwrap();

    let Value::Record(fields) = &outcome.arguments[0] else {
        panic!("expected a record, got {:?}", outcome.arguments[0]);
    };
    assert_eq!(fields[0], Value::UInt(12));
    let buffer = Address::new(fields[2].as_u64().unwrap());
    assert_eq!(client.read_wide_string(buffer).unwrap(), "Tether");

    drop(outcome);
    handle.shutdown().unwrap();
}

#[test]
fn test_unknown_request_kind_is_a_protocol_exception()
{
    let handle = spawn_server(PointerWidth::Bits64);

    let response = raw_exchange(&handle, &Envelope::new(9, Vec::new()).to_bytes().unwrap());
    assert_eq!(response.kind, 1);
    let err = response.into_result::<()>().unwrap_err();
    assert_eq!(err.kind(), FailureKind::Protocol);
    assert_eq!(err.to_string(), "Unrecognized request type 9");

    let garbage = raw_exchange(&handle, &[0xff]);
    assert_eq!(garbage.into_result::<()>().unwrap_err().kind(), FailureKind::Protocol);

    handle.shutdown().unwrap();
}

#[test]
fn test_oversize_frame_is_rejected()
{
    let broker = LocalBroker::new(EmulatedDevice::new(PointerWidth::Bits64));
    let handle = BrokerServer::bind(broker, &loopback(16)).unwrap().spawn().unwrap();

    let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.write_all(&1024_u32.to_be_bytes()).unwrap();
    let response = Envelope::from_bytes(&read_frame(&mut stream, MAX_FRAME_LEN).unwrap()).unwrap();
    let err = response.into_result::<()>().unwrap_err();
    assert_eq!(err.kind(), FailureKind::Transport);
    assert!(err.to_string().contains("exceeds the 16 byte limit"));

    handle.shutdown().unwrap();
}

#[test]
fn test_connection_refused_is_a_transport_error()
{
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let broker = RemoteBroker::new(RemoteBrokerConfig {
        port,
        ..RemoteBrokerConfig::default()
    });

    let err = broker.pointer_width().unwrap_err();
    assert_eq!(err.kind(), FailureKind::Transport);
}

#[test]
fn test_silent_server_times_out()
{
    // Accepts into the backlog but never answers
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let broker = RemoteBroker::new(RemoteBrokerConfig {
        host: "127.0.0.1".to_string(),
        port: listener.local_addr().unwrap().port(),
        timeout: Some(Duration::from_millis(200)),
    });

    let err = broker.allocate(&Allocate::new(4)).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Transport);
    assert!(err.to_string().starts_with("Transport error: Timed out"));
}

#[test]
fn test_requests_served_counts_exceptions()
{
    let handle = spawn_server(PointerWidth::Bits64);
    let broker = remote(&handle);

    broker.allocate(&Allocate::new(4)).unwrap();
    let _ = broker.read_bytes(&ReadBytes::new(Address::new(0x10), 1));
    assert_eq!(handle.requests_served(), 2);

    handle.shutdown().unwrap();
}

#[test]
fn test_concurrent_clients_are_serialized()
{
    const CLIENTS: u8 = 8;
    const ROUNDS: usize = 10;
    const SHARED_LEN: u64 = 256;
    // fill, read shared, write own, read own, compare
    const REQUESTS_PER_ROUND: u64 = 5;

    let handle = spawn_server(PointerWidth::Bits64);
    let shared = remote(&handle).allocate(&Allocate::new(SHARED_LEN as usize)).unwrap();

    thread::scope(|scope| {
        for id in 1..=CLIENTS {
            let broker = remote(&handle);
            scope.spawn(move || {
                let own = broker.allocate(&Allocate::new(32)).unwrap();
                let pattern = vec![id; 32];

                for _ in 0..ROUNDS {
                    let fill = CallRequest::new(
                        KERNEL_MODULE,
                        "RtlFillMemory",
                        FfiType::Void,
                        vec![
                            FfiArgument::new(FfiType::Pointer, Value::UInt(shared.value())),
                            FfiArgument::new(FfiType::UInt64, Value::UInt(SHARED_LEN)),
                            FfiArgument::new(FfiType::UChar, Value::UInt(u64::from(id))),
                        ],
                    );
                    assert_eq!(broker.call_function(&fill).unwrap(), Value::Void);

                    // Whole fills never interleave, so the region is uniform
                    let seen = broker.read_bytes(&ReadBytes::new(shared, SHARED_LEN as usize)).unwrap();
                    assert!(seen.iter().all(|b| *b == seen[0]), "torn fill: {seen:?}");
                    assert!((1..=CLIENTS).contains(&seen[0]));

                    broker.write_bytes(&WriteBytes::new(own, pattern.clone())).unwrap();
                    assert_eq!(broker.read_bytes(&ReadBytes::new(own, 32)).unwrap(), pattern);

                    let compare = CallRequest::new(
                        KERNEL_MODULE,
                        "RtlCompareMemory",
                        FfiType::UInt64,
                        vec![
                            FfiArgument::new(FfiType::Pointer, Value::UInt(own.value())),
                            FfiArgument::new(FfiType::Pointer, Value::UInt(own.value())),
                            FfiArgument::new(FfiType::UInt64, Value::UInt(32)),
                        ],
                    );
                    assert_eq!(broker.call_function(&compare).unwrap(), Value::UInt(32));
                }

                broker.free(&Free::new(own)).unwrap();
            });
        }
    });

    // shared allocation, then per client: own allocation, rounds, own free
    let expected = 1 + u64::from(CLIENTS) * (2 + ROUNDS as u64 * REQUESTS_PER_ROUND);
    assert_eq!(handle.requests_served(), expected);

    handle.shutdown().unwrap();
}

#[test]
fn test_shutdown_of_a_wildcard_bind()
{
    let broker = LocalBroker::new(EmulatedDevice::new(PointerWidth::Bits64));
    let config = ServerConfig {
        address: "0.0.0.0".to_string(),
        port: 0,
        max_frame_len: MAX_FRAME_LEN,
    };
    let handle = BrokerServer::bind(broker, &config).unwrap().spawn().unwrap();
    assert!(handle.local_addr().ip().is_unspecified());

    handle.shutdown().unwrap();
}
