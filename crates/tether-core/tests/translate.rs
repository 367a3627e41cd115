//! Tests for pointer-graph translation

use std::sync::atomic::{AtomicUsize, Ordering};

use tether_core::device::EmulatedDevice;
use tether_core::prelude::*;
use tether_core::translate::Translator;

fn broker(width: PointerWidth) -> LocalBroker<EmulatedDevice>
{
    LocalBroker::new(EmulatedDevice::new(width))
}

fn live_regions(broker: &LocalBroker<EmulatedDevice>) -> usize
{
    broker.with_device(|device| device.heap().live_regions())
}

/// Counts every target-side operation other than the pointer-size query.
struct CountingBroker
{
    inner: LocalBroker<EmulatedDevice>,
    operations: AtomicUsize,
}

impl CountingBroker
{
    fn new(width: PointerWidth) -> Self
    {
        Self {
            inner: broker(width),
            operations: AtomicUsize::new(0),
        }
    }

    fn operations(&self) -> usize
    {
        self.operations.load(Ordering::SeqCst)
    }

    fn count(&self)
    {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Broker for CountingBroker
{
    fn pointer_width(&self) -> Result<PointerWidth>
    {
        self.inner.pointer_width()
    }

    fn call_function(&self, request: &CallRequest) -> Result<Value>
    {
        self.count();
        self.inner.call_function(request)
    }

    fn read_bytes(&self, request: &ReadBytes) -> Result<Vec<u8>>
    {
        self.count();
        self.inner.read_bytes(request)
    }

    fn write_bytes(&self, request: &WriteBytes) -> Result<()>
    {
        self.count();
        self.inner.write_bytes(request)
    }

    fn allocate(&self, request: &Allocate) -> Result<Address>
    {
        self.count();
        self.inner.allocate(request)
    }

    fn free(&self, request: &Free) -> Result<()>
    {
        self.count();
        self.inner.free(request)
    }
}

fn node() -> TypeRef
{
    TypeDescriptor::record(
        "NODE",
        [
            ("value", TypeDescriptor::scalar(FfiType::SInt)),
            ("next", TypeDescriptor::opaque_pointer()),
            ("shared", TypeDescriptor::opaque_pointer()),
        ],
    )
}

#[test]
fn test_pointer_and_scalar_arguments()
{
    let broker = broker(PointerWidth::Bits64);
    let mut memory = LocalMemory::new();
    let x = memory.place(TypeDescriptor::scalar(FfiType::SInt), Value::Int(10));

    let translator = Translator::new(&broker).unwrap();
    let translated = translator
        .translate(&memory, vec![Argument::Pointer(x), Argument::Scalar(Value::Int(20))])
        .unwrap();

    assert_eq!(translated.allocations().len(), 1);
    let allocation = &translated.allocations()[0];
    assert_eq!(allocation.len(), 4);
    assert_eq!(allocation.read().unwrap(), 10_i32.to_le_bytes());
    assert_eq!(
        translated.values(),
        vec![Value::UInt(allocation.address().value()), Value::Int(20)]
    );
    assert!(translated.contexts(1).is_empty());

    translated.release().unwrap();
    assert_eq!(live_regions(&broker), 0);
}

#[test]
fn test_byte_buffer_argument()
{
    let broker = broker(PointerWidth::Bits64);
    let memory = LocalMemory::new();

    let translated = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Bytes(b"abc\0".to_vec())])
        .unwrap();

    assert_eq!(translated.allocations().len(), 1);
    let allocation = &translated.allocations()[0];
    assert_eq!(allocation.len(), 4);
    assert_eq!(allocation.read().unwrap(), b"abc\0");
    assert_eq!(translated.values(), vec![Value::UInt(allocation.address().value())]);
    assert_eq!(
        **translated.contexts(0)[0].native_type(),
        TypeDescriptor::Array {
            element: TypeDescriptor::scalar(FfiType::UInt8),
            len: 4
        }
    );
    assert_eq!(translated.read_back().unwrap(), vec![Value::Bytes(b"abc\0".to_vec())]);

    translated.release().unwrap();
}

#[test]
fn test_cycles_and_aliases_allocate_once()
{
    let broker = broker(PointerWidth::Bits64);
    let mut memory = LocalMemory::new();
    let shared = memory.place(TypeDescriptor::scalar(FfiType::UInt64), Value::UInt(0xfeed));
    let a = memory.reserve(node());
    let b = memory.reserve(node());
    memory
        .store(a, Value::Record(vec![Value::Int(1), Value::Pointer(b), Value::Pointer(shared)]))
        .unwrap();
    memory
        .store(b, Value::Record(vec![Value::Int(2), Value::Pointer(a), Value::Pointer(shared)]))
        .unwrap();

    let translated = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Pointer(a)])
        .unwrap();

    assert_eq!(translated.allocations().len(), 3);
    let map = translated.address_map(0).unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(translated.contexts(0).len(), 3);

    let remote_a = map.get(a).unwrap();
    let remote_b = map.get(b).unwrap();
    let remote_shared = map.get(shared).unwrap();
    assert_eq!(translated.values(), vec![Value::UInt(remote_a.value())]);

    // a's pointer fields now hold target addresses
    let read_back = translated.read_back().unwrap();
    assert_eq!(
        read_back,
        vec![Value::Record(vec![
            Value::Int(1),
            Value::UInt(remote_b.value()),
            Value::UInt(remote_shared.value()),
        ])]
    );

    translated.release().unwrap();
    assert_eq!(live_regions(&broker), 0);
}

#[test]
fn test_filtered_pointers_pass_through()
{
    let broker = broker(PointerWidth::Bits32);
    let mut memory = LocalMemory::new();
    let kernel = Address::new(0x8000_1000);
    let holder = memory.place(node(), Value::Record(vec![Value::Int(7), Value::NULL, Value::Pointer(kernel)]));

    let translated = Translator::new(&broker)
        .unwrap()
        .translate(
            &memory,
            vec![Argument::Pointer(holder), Argument::Pointer(kernel), Argument::Pointer(Address::ZERO)],
        )
        .unwrap();

    assert_eq!(translated.allocations().len(), 1);
    let values = translated.values();
    assert_eq!(values[1], Value::UInt(0x8000_1000));
    assert_eq!(values[2], Value::UInt(0));

    let bytes = translated.allocations()[0].read().unwrap();
    // NODE_NATIVE on a 32-bit target: value, next, shared
    assert_eq!(&bytes[0..4], &7_i32.to_le_bytes());
    assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    assert_eq!(&bytes[8..12], &0x8000_1000_u32.to_le_bytes());

    translated.release().unwrap();
}

#[test]
fn test_text_is_rejected_without_leaking()
{
    let broker = broker(PointerWidth::Bits64);
    let memory = LocalMemory::new();

    let err = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Bytes(vec![1, 2]), Argument::Text("hello".to_string())])
        .unwrap_err();

    assert!(matches!(err, TetherError::StringArgument));
    assert_eq!(live_regions(&broker), 0);
}

#[test]
fn test_dangling_pointer_is_a_marshal_error()
{
    let broker = broker(PointerWidth::Bits64);
    let memory = LocalMemory::new();

    let err = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Pointer(Address::new(0x5000))])
        .unwrap_err();

    assert!(matches!(err, TetherError::DanglingPointer(_)));
    assert_eq!(err.kind(), FailureKind::Marshal);
}

#[test]
fn test_text_after_a_buffer_never_reaches_the_target()
{
    let broker = CountingBroker::new(PointerWidth::Bits64);
    let memory = LocalMemory::new();

    let err = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Bytes(vec![1, 2]), Argument::Text("x".to_string())])
        .unwrap_err();

    assert!(matches!(err, TetherError::StringArgument));
    assert_eq!(broker.operations(), 0);
}

#[test]
fn test_shape_mismatch_never_reaches_the_target()
{
    let broker = CountingBroker::new(PointerWidth::Bits64);
    let mut memory = LocalMemory::new();
    let x = memory.place(TypeDescriptor::scalar(FfiType::SInt), Value::Bytes(vec![1]));

    let err = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Scalar(Value::Int(1)), Argument::Pointer(x)])
        .unwrap_err();

    assert!(matches!(err, TetherError::ValueMismatch { .. }));
    assert_eq!(err.kind(), FailureKind::Marshal);
    assert_eq!(broker.operations(), 0);
}

#[test]
fn test_mismatch_deep_in_a_graph_never_reaches_the_target()
{
    let broker = CountingBroker::new(PointerWidth::Bits32);
    let mut memory = LocalMemory::new();
    let tail = memory.place(node(), Value::Record(vec![Value::Bytes(vec![2]), Value::NULL, Value::NULL]));
    let head = memory.place(
        node(),
        Value::Record(vec![Value::Int(1), Value::Pointer(tail), Value::NULL]),
    );

    let err = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Bytes(vec![9]), Argument::Pointer(head)])
        .unwrap_err();

    assert!(matches!(err, TetherError::ValueMismatch { .. }));
    assert_eq!(broker.operations(), 0);
}

#[test]
fn test_empty_buffer_never_reaches_the_target()
{
    let broker = CountingBroker::new(PointerWidth::Bits64);

    let err = Translator::new(&broker)
        .unwrap()
        .translate(&LocalMemory::new(), vec![Argument::Bytes(vec![1]), Argument::Bytes(Vec::new())])
        .unwrap_err();

    assert!(matches!(err, TetherError::ZeroSizedAllocation));
    assert_eq!(broker.operations(), 0);
}

#[test]
fn test_valid_arguments_still_allocate_and_write()
{
    let broker = CountingBroker::new(PointerWidth::Bits64);
    let mut memory = LocalMemory::new();
    let x = memory.place(TypeDescriptor::scalar(FfiType::SInt), Value::Int(10));

    let translated = Translator::new(&broker)
        .unwrap()
        .translate(&memory, vec![Argument::Bytes(vec![1, 2]), Argument::Pointer(x)])
        .unwrap();

    // allocate and write for each argument
    assert_eq!(broker.operations(), 4);
    translated.release().unwrap();
    assert_eq!(broker.operations(), 6);
}
