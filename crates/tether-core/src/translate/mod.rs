//! # Argument Translation
//!
//! Turns caller-side argument graphs into target memory.
//!
//! A pointer argument may lead to a whole graph of local objects: records
//! whose fields point at buffers, other records, or back at themselves. The
//! translator finds every distinct object reachable from the argument,
//! allocates one target region per object sized to its native type, and
//! writes each object with its embedded pointers rewritten to the matching
//! target addresses. After the call, [`TranslatedArgs::read_back`] decodes
//! the root objects again so callers can see what the routine wrote.
//!
//! ## Steps, per pointer argument
//!
//! 1. Walk the graph from the root, skipping null and privileged addresses
//! 2. Encode every reached object once against stand-in addresses
//! 3. Allocate one region per reached object
//! 4. Record local → remote in an [`AddressMap`]
//! 5. Encode each object against its native type using that map and write it
//!
//! Steps 1 and 2 run for every argument before any of them reaches step 3.

mod collect;
mod filter;
mod memory;

use std::collections::HashMap;

use tracing::{debug, warn};

pub use self::filter::AddressFilter;
pub use self::memory::{LocalMemory, LocalObject};
use crate::allocation::Allocation;
use crate::broker::Broker;
use crate::codec;
use crate::error::{Result, TetherError};
use crate::native::native_type;
use crate::types::{Address, PointerWidth, TypeDescriptor, TypeRef, Value};

/// A caller-supplied argument before translation.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument
{
    /// Passed through unchanged
    Scalar(Value),
    /// Copied into a fresh target buffer; the buffer's address is passed
    Bytes(Vec<u8>),
    /// A local pointer; the graph behind it is copied to the target
    Pointer(Address),
    /// Rejected: text must be encoded to bytes first
    Text(String),
}

impl From<Value> for Argument
{
    fn from(value: Value) -> Self
    {
        Argument::Scalar(value)
    }
}

/// Local → remote address mapping for one argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap
{
    entries: HashMap<Address, Address>,
}

impl AddressMap
{
    /// Record a mapping. Returns `false` if `local` was already mapped.
    pub fn insert(&mut self, local: Address, remote: Address) -> bool
    {
        self.entries.insert(local, remote).is_none()
    }

    #[must_use]
    pub fn get(&self, local: Address) -> Option<Address>
    {
        self.entries.get(&local).copied()
    }

    /// The address to put on the wire for `local`: its remote counterpart if
    /// there is one, otherwise `local` unchanged.
    #[must_use]
    pub fn resolve(&self, local: Address) -> u64
    {
        self.get(local).unwrap_or(local).value()
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, Address)> + '_
    {
        self.entries.iter().map(|(local, remote)| (*local, *remote))
    }
}

/// Ties an allocation to the native type that was written into it.
#[derive(Debug, Clone)]
pub struct TranslationContext
{
    allocation: usize,
    native_type: TypeRef,
}

impl TranslationContext
{
    /// Index into [`TranslatedArgs::allocations`].
    #[must_use]
    pub fn allocation(&self) -> usize
    {
        self.allocation
    }

    #[must_use]
    pub fn native_type(&self) -> &TypeRef
    {
        &self.native_type
    }
}

#[derive(Debug)]
struct TranslatedArgument
{
    value: Value,
    contexts: Vec<TranslationContext>,
    address_map: AddressMap,
}

/// Result of translating a call's arguments.
///
/// Owns every allocation made for the call. They are released by
/// [`release`](Self::release), handed over with
/// [`into_allocations`](Self::into_allocations), or freed on drop.
#[derive(Debug)]
pub struct TranslatedArgs<'b>
{
    arguments: Vec<TranslatedArgument>,
    allocations: Vec<Allocation<'b>>,
    width: PointerWidth,
}

impl<'b> TranslatedArgs<'b>
{
    /// Target-native argument values, in order.
    #[must_use]
    pub fn values(&self) -> Vec<Value>
    {
        self.arguments.iter().map(|arg| arg.value.clone()).collect()
    }

    #[must_use]
    pub fn allocations(&self) -> &[Allocation<'b>]
    {
        &self.allocations
    }

    /// Contexts recorded for argument `index`.
    #[must_use]
    pub fn contexts(&self, index: usize) -> &[TranslationContext]
    {
        self.arguments.get(index).map_or(&[][..], |arg| arg.contexts.as_slice())
    }

    /// Address map built for argument `index`.
    #[must_use]
    pub fn address_map(&self, index: usize) -> Option<&AddressMap>
    {
        self.arguments.get(index).map(|arg| &arg.address_map)
    }

    /// Re-read every argument from the target.
    ///
    /// An argument whose value is the address of one of its own allocations
    /// is decoded from that allocation (byte buffers come back as
    /// [`Value::Bytes`]). Anything else is returned as translated.
    ///
    /// ## Errors
    ///
    /// Broker read failures.
    pub fn read_back(&self) -> Result<Vec<Value>>
    {
        self.arguments
            .iter()
            .map(|arg| {
                let owning = arg.contexts.iter().find(|context| {
                    let allocation = &self.allocations[context.allocation];
                    arg.value.as_u64() == Some(allocation.address().value())
                });
                match owning {
                    Some(context) => {
                        let bytes = self.allocations[context.allocation].read()?;
                        codec::decode(&bytes, &context.native_type, self.width)
                    }
                    None => Ok(arg.value.clone()),
                }
            })
            .collect()
    }

    /// Hand the allocations to the caller.
    #[must_use]
    pub fn into_allocations(self) -> Vec<Allocation<'b>>
    {
        self.allocations
    }

    /// Free every allocation.
    ///
    /// ## Errors
    ///
    /// The first broker error; remaining allocations are still freed.
    pub fn release(self) -> Result<()>
    {
        let mut first = None;
        for mut allocation in self.allocations {
            if let Err(e) = allocation.free() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Translates argument lists for one broker.
pub struct Translator<'b>
{
    broker: &'b dyn Broker,
    width: PointerWidth,
    filter: AddressFilter,
}

impl<'b> Translator<'b>
{
    /// Build a translator, asking the broker for its pointer width.
    ///
    /// ## Errors
    ///
    /// Whatever [`Broker::pointer_width`] reports.
    pub fn new(broker: &'b dyn Broker) -> Result<Self>
    {
        let width = broker.pointer_width()?;
        Ok(Self::with_width(broker, width))
    }

    #[must_use]
    pub fn with_width(broker: &'b dyn Broker, width: PointerWidth) -> Self
    {
        Self {
            broker,
            width,
            filter: AddressFilter::new(width),
        }
    }

    #[must_use]
    pub fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }

    /// Translate `args` against the objects in `memory`.
    ///
    /// Every argument is checked before the broker sees any request, so a
    /// malformed argument list never touches the target.
    ///
    /// ## Errors
    ///
    /// - `StringArgument` for [`Argument::Text`]
    /// - `DanglingPointer` / `ValueMismatch` for a malformed graph
    /// - `ZeroSizedAllocation` for an empty buffer or a zero-sized object
    /// - `EncodedSizeMismatch` if an object doesn't encode to its allocation's size
    /// - Broker errors from allocating or writing
    ///
    /// Allocations made before a broker failure are freed on the way out.
    pub fn translate(&self, memory: &LocalMemory, args: Vec<Argument>) -> Result<TranslatedArgs<'b>>
    {
        let plans = args
            .into_iter()
            .map(|arg| self.plan(memory, arg))
            .collect::<Result<Vec<_>>>()?;

        let mut translated = TranslatedArgs {
            arguments: Vec::with_capacity(plans.len()),
            allocations: Vec::new(),
            width: self.width,
        };

        for plan in plans {
            match self.apply(plan, &mut translated.allocations) {
                Ok(argument) => translated.arguments.push(argument),
                Err(e) => {
                    if let Err(release_err) = translated.release() {
                        warn!("Failed to release allocations after a translation error: {release_err}");
                    }
                    return Err(e);
                }
            }
        }

        Ok(translated)
    }

    /// Validate one argument without talking to the broker.
    fn plan<'m>(&self, memory: &'m LocalMemory, arg: Argument) -> Result<Plan<'m>>
    {
        match arg {
            Argument::Text(_) => Err(TetherError::StringArgument),
            Argument::Scalar(value) => Ok(Plan::Direct(value)),
            Argument::Bytes(bytes) if bytes.is_empty() => Err(TetherError::ZeroSizedAllocation),
            Argument::Bytes(bytes) => Ok(Plan::Bytes(bytes)),
            Argument::Pointer(root) if !self.filter.accepts(root) => {
                debug!("Passing {root} through untranslated");
                Ok(Plan::Direct(Value::UInt(root.value())))
            }
            Argument::Pointer(root) => self.plan_graph(memory, root),
        }
    }

    fn plan_graph<'m>(&self, memory: &'m LocalMemory, root: Address) -> Result<Plan<'m>>
    {
        let reachable = collect::reachable_from(root, memory, self.filter)?;

        let objects = reachable
            .into_iter()
            .map(|reached| {
                let native = native_type(&reached.object.ty, self.width);
                if native.size(self.width) == 0 {
                    return Err(TetherError::ZeroSizedAllocation);
                }
                Ok(PlannedObject {
                    address: reached.address,
                    value: &reached.object.value,
                    native,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Dry run against stand-in addresses that fit any pointer width
        let mut provisional = AddressMap::default();
        for (stand_in, object) in (1_u64..).zip(&objects) {
            provisional.insert(object.address, Address::new(stand_in * 0x10));
        }
        for object in &objects {
            self.encode_object(object, &provisional)?;
        }

        Ok(Plan::Graph { root, objects })
    }

    fn encode_object(&self, object: &PlannedObject<'_>, map: &AddressMap) -> Result<Vec<u8>>
    {
        let bytes = codec::encode(object.value, &object.native, self.width, map)?;
        let expected = object.native.size(self.width);
        if bytes.len() != expected {
            return Err(TetherError::EncodedSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    fn apply(&self, plan: Plan<'_>, allocations: &mut Vec<Allocation<'b>>) -> Result<TranslatedArgument>
    {
        match plan {
            Plan::Direct(value) => Ok(TranslatedArgument {
                value,
                contexts: Vec::new(),
                address_map: AddressMap::default(),
            }),
            Plan::Bytes(bytes) => self.translate_bytes(&bytes, allocations),
            Plan::Graph { root, objects } => self.translate_graph(root, &objects, allocations),
        }
    }

    fn translate_bytes(&self, bytes: &[u8], allocations: &mut Vec<Allocation<'b>>) -> Result<TranslatedArgument>
    {
        let allocation = Allocation::new(self.broker, bytes.len())?;
        allocation.write(bytes, 0)?;

        let remote = allocation.address();
        let context = TranslationContext {
            allocation: allocations.len(),
            native_type: TypeDescriptor::bytes(bytes.len()),
        };
        allocations.push(allocation);

        Ok(TranslatedArgument {
            value: Value::UInt(remote.value()),
            contexts: vec![context],
            address_map: AddressMap::default(),
        })
    }

    fn translate_graph(
        &self,
        root: Address,
        objects: &[PlannedObject<'_>],
        allocations: &mut Vec<Allocation<'b>>,
    ) -> Result<TranslatedArgument>
    {
        let mut address_map = AddressMap::default();
        let mut contexts = Vec::with_capacity(objects.len());
        for object in objects {
            let allocation = Allocation::new(self.broker, object.native.size(self.width))?;
            address_map.insert(object.address, allocation.address());
            contexts.push(TranslationContext {
                allocation: allocations.len(),
                native_type: object.native.clone(),
            });
            allocations.push(allocation);
        }

        for (object, context) in objects.iter().zip(&contexts) {
            let bytes = self.encode_object(object, &address_map)?;
            allocations[context.allocation].write(&bytes, 0)?;
        }

        debug!("Translated {root} into {} target objects", objects.len());
        let remote = address_map.get(root).ok_or(TetherError::DanglingPointer(root))?;
        Ok(TranslatedArgument {
            value: Value::UInt(remote.value()),
            contexts,
            address_map,
        })
    }
}

/// A checked argument, ready to be copied to the target.
enum Plan<'m>
{
    /// Passed as is
    Direct(Value),
    Bytes(Vec<u8>),
    Graph
    {
        root: Address,
        objects: Vec<PlannedObject<'m>>,
    },
}

struct PlannedObject<'m>
{
    address: Address,
    value: &'m Value,
    native: TypeRef,
}
