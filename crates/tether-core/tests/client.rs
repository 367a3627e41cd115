//! Tests for the client facade against the emulated device

use tether_core::device::{EmulatedDevice, KERNEL_MODULE};
use tether_core::prelude::*;

fn unicode_string() -> TypeRef
{
    TypeDescriptor::record(
        "UNICODE_STRING",
        [
            ("Length", TypeDescriptor::scalar(FfiType::UShort)),
            ("MaximumLength", TypeDescriptor::scalar(FfiType::UShort)),
            ("Buffer", TypeDescriptor::pointer(TypeDescriptor::scalar(FfiType::UInt16))),
        ],
    )
}

fn point() -> TypeRef
{
    TypeDescriptor::record(
        "POINT",
        [("x", TypeDescriptor::scalar(FfiType::SLong)), ("y", TypeDescriptor::scalar(FfiType::SLong))],
    )
}

fn test_device() -> EmulatedDevice
{
    let mut device = EmulatedDevice::with_kernel_routines(PointerWidth::Bits64);
    device.register("hal", "Bump", |heap, args| {
        let address = Address::new(args[0].as_u64().unwrap_or_default());
        let mut raw = [0; 4];
        raw.copy_from_slice(&heap.read(address, 4)?);
        let bumped = i32::from_le_bytes(raw) + 1;
        heap.write(address, &bumped.to_le_bytes())?;
        Ok(Value::Void)
    });
    device.register("hal", "MakePoint", |heap, args| {
        if args[0].as_u64() == Some(0) {
            return Ok(Value::UInt(0));
        }
        let address = heap.allocate(8)?;
        heap.write(address, &[3, 0, 0, 0, 4, 0, 0, 0])?;
        Ok(Value::UInt(address.value()))
    });
    device.register("hal", "Wide", |_, _| Ok(Value::UInt(0x1ff)));
    device
}

fn client() -> Client<LocalBroker<EmulatedDevice>>
{
    let mut client = Client::new(LocalBroker::new(test_device()));
    client.declare(
        KERNEL_MODULE,
        FfiFunction::new("RtlInitUnicodeString", FfiType::Void)
            .param("DestinationString", FfiType::Pointer)
            .param("SourceString", FfiType::Pointer),
    );
    client.declare_all(
        "hal",
        [
            FfiFunction::new("Bump", FfiType::Void).param("value", FfiType::Pointer),
            FfiFunction::new("MakePoint", FfiType::Pointer).param("make", FfiType::SInt),
            FfiFunction::new("Wide", FfiType::UInt32),
        ],
    );
    client
}

fn live_regions(client: &Client<LocalBroker<EmulatedDevice>>) -> usize
{
    client.broker().with_device(|device| device.heap().live_regions())
}

#[test]
fn test_init_unicode_string_out_param()
{
    let client = client();
    let mut memory = LocalMemory::new();
    let destination = memory.reserve(unicode_string());
    let source: Vec<u8> = "Hello\0".encode_utf16().flat_map(u16::to_le_bytes).collect();

    let outcome = client
        .ex_call(
            KERNEL_MODULE,
            "RtlInitUnicodeString",
            &memory,
            vec![Argument::Pointer(destination), Argument::Bytes(source.clone())],
            ExCallOptions::default(),
        )
        .unwrap();

    assert_eq!(outcome.return_value, Value::Void);
    let Value::Record(fields) = &outcome.arguments[0] else {
        panic!("expected a record, got {:?}", outcome.arguments[0]);
    };
    assert_eq!(fields[0], Value::UInt(10));
    assert_eq!(fields[1], Value::UInt(12));

    let buffer = Address::new(fields[2].as_u64().unwrap());
    assert_eq!(client.read_wide_string(buffer).unwrap(), "Hello");
    assert_eq!(outcome.arguments[1], Value::Bytes(source));

    for mut allocation in outcome.allocations {
        allocation.free().unwrap();
    }
    assert_eq!(live_regions(&client), 0);
}

#[test]
fn test_read_back_sees_routine_writes()
{
    let client = client();
    let mut memory = LocalMemory::new();
    let counter = memory.place(TypeDescriptor::scalar(FfiType::SInt), Value::Int(41));

    let outcome = client
        .ex_call("hal", "Bump", &memory, vec![Argument::Pointer(counter)], ExCallOptions::default())
        .unwrap();
    assert_eq!(outcome.arguments, vec![Value::Int(42)]);

    let without = client
        .ex_call(
            "hal",
            "Bump",
            &memory,
            vec![Argument::Pointer(counter)],
            ExCallOptions {
                read_back: false,
                ..ExCallOptions::default()
            },
        )
        .unwrap();
    assert_eq!(without.arguments, vec![Value::UInt(without.allocations[0].address().value())]);
}

#[test]
fn test_pointer_return_is_dereferenced()
{
    let client = client();
    let memory = LocalMemory::new();
    let options = ExCallOptions {
        return_type: Some(TypeDescriptor::pointer(point())),
        read_back: true,
    };

    let outcome = client
        .ex_call("hal", "MakePoint", &memory, vec![Argument::Scalar(Value::Int(1))], options.clone())
        .unwrap();
    assert_eq!(outcome.return_value, Value::Record(vec![Value::Int(3), Value::Int(4)]));

    let null = client
        .ex_call("hal", "MakePoint", &memory, vec![Argument::Scalar(Value::Int(0))], options)
        .unwrap();
    assert_eq!(null.return_value, Value::Void);
}

#[test]
fn test_scalar_return_is_cast()
{
    let client = client();
    let memory = LocalMemory::new();

    let outcome = client
        .ex_call(
            "hal",
            "Wide",
            &memory,
            Vec::new(),
            ExCallOptions {
                return_type: Some(TypeDescriptor::scalar(FfiType::UInt8)),
                read_back: true,
            },
        )
        .unwrap();
    assert_eq!(outcome.return_value, Value::UInt(0xff));
    assert_eq!(client.call("hal", "Wide", &[]).unwrap(), Value::UInt(0x1ff));
}

#[test]
fn test_argument_count_checked_before_allocating()
{
    let client = client();
    let memory = LocalMemory::new();

    let err = client
        .ex_call(
            "hal",
            "Bump",
            &memory,
            vec![Argument::Bytes(vec![1, 2, 3]), Argument::Bytes(vec![4])],
            ExCallOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "Bump() takes exactly 1 arguments (2 given)");
    assert_eq!(live_regions(&client), 0);

    let err = client.call("hal", "Wide", &[Value::Int(1)]).unwrap_err();
    assert!(matches!(err, TetherError::ArgumentCount { expected: 0, given: 1, .. }));
}

#[test]
fn test_undeclared_function()
{
    let client = client();
    assert!(client.is_declared("hal", "Bump"));
    assert!(!client.is_declared("hal", "Nope"));

    let err = client.call("hal", "Nope", &[]).unwrap_err();
    assert!(matches!(err, TetherError::UndeclaredFunction { .. }));
    assert_eq!(err.kind(), FailureKind::Marshal);
}

#[test]
fn test_target_failure_releases_allocations()
{
    let mut client = client();
    client.declare("missing", FfiFunction::new("Routine", FfiType::Void).param("buffer", FfiType::Pointer));
    let memory = LocalMemory::new();

    let err = client
        .ex_call(
            "missing",
            "Routine",
            &memory,
            vec![Argument::Bytes(vec![0; 8])],
            ExCallOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Target);
    assert_eq!(err.to_string(), "Target execution failed: Module missing not found");
    assert_eq!(live_regions(&client), 0);
}

#[test]
fn test_string_helpers()
{
    let client = client();
    let mut allocation = client.allocate(16).unwrap();
    allocation.write(b"kernel\0", 0).unwrap();
    assert_eq!(client.read_string(allocation.address()).unwrap(), "kernel");

    let wide: Vec<u8> = "ok\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
    client.write_bytes(allocation.address(), &wide).unwrap();
    assert_eq!(client.read_wide_string(allocation.address()).unwrap(), "ok");
    assert_eq!(client.read_bytes(allocation.address(), 2).unwrap(), b"o\0");

    allocation.free().unwrap();
}
