//! Hearth error module.
//!
//! Every fallible operation in the crate returns one of the typed enums in
//! this module. Operational failures inside systems and event handlers are
//! carried as [`BoxedErr`] so callers can surface arbitrary error payloads
//! through the isolation machinery without the core depending on their types.

use std::error::Error as StdError;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use crate::world::{Entity, Generation};

/// A boxed error implementing `Debug`, `Display` and `Error`.
pub struct BoxedErr(pub Box<dyn StdError + Send + Sync + 'static>);

impl BoxedErr {
    /// Creates a new boxed error.
    pub fn new<T>(err: T) -> Self
    where
        T: StdError + Send + Sync + 'static,
    {
        BoxedErr(Box::new(err))
    }

    /// Creates a boxed error from a plain message.
    pub fn msg<S: Into<String>>(msg: S) -> Self {
        BoxedErr(Box::new(StringError(msg.into())))
    }
}

impl AsRef<dyn StdError> for BoxedErr {
    fn as_ref(&self) -> &(dyn StdError + 'static) {
        self.0.as_ref()
    }
}

impl Debug for BoxedErr {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{:}", self.0)
    }
}

impl Display for BoxedErr {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.as_ref())
    }
}

impl StdError for BoxedErr {}

macro_rules! impl_into_boxed {
    ($($ty:ident),*) => {
        $(impl From<$ty> for BoxedErr {
            fn from(err: $ty) -> BoxedErr {
                BoxedErr::new(err)
            }
        })*
    };
}

impl_into_boxed!(
    WrongGeneration,
    StoreError,
    MemoryError,
    SystemRegistryError,
    EventError,
    SnapshotError
);

#[derive(Debug)]
struct StringError(String);

impl Display for StringError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl StdError for StringError {}

/// Wrong generation error.
///
/// Returned when an operation is attempted with an [`Entity`] whose
/// generation no longer matches its slot, i.e. the entity has been
/// destroyed and the id the caller holds is stale.
#[derive(Debug, PartialEq, Eq)]
pub struct WrongGeneration {
    /// The action that failed because of the wrong generation.
    pub action: &'static str,
    /// The actual generation of this id.
    pub actual_gen: Generation,
    /// The entity that has been passed, containing
    /// the id and the invalid generation.
    pub entity: Entity,
}

impl Display for WrongGeneration {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(
            f,
            "Tried to {} entity {:?}, but the generation is wrong; it should be {:?}",
            self.action, self.entity, self.actual_gen
        )
    }
}

impl StdError for WrongGeneration {}

/// Errors produced by component stores and the world's component API.
#[derive(Debug)]
pub enum StoreError {
    /// The entity is not alive (stale generation or never allocated).
    EntityInvalid(Entity),
    /// The entity already holds a component of this type.
    ComponentAlreadyPresent(Entity),
    /// The entity holds no component of this type.
    ComponentNotPresent(Entity),
    /// The component value failed its registered validation hook.
    ComponentInvalid(BoxedErr),
    /// The component type has not been registered with the world.
    ComponentNotRegistered(&'static str),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            StoreError::EntityInvalid(e) => write!(f, "Entity {:?} is not alive", e),
            StoreError::ComponentAlreadyPresent(e) => {
                write!(f, "Entity {:?} already has a component of this type", e)
            }
            StoreError::ComponentNotPresent(e) => {
                write!(f, "Entity {:?} has no component of this type", e)
            }
            StoreError::ComponentInvalid(ref e) => write!(f, "Component failed validation: {}", e),
            StoreError::ComponentNotRegistered(name) => {
                write!(f, "Component type `{}` is not registered", name)
            }
        }
    }
}

impl StdError for StoreError {}

/// Errors produced by the memory manager and its pools.
#[derive(Debug)]
pub enum MemoryError {
    /// A pool with this name is already registered.
    PoolAlreadyExists(String),
    /// No pool with this name is registered.
    PoolNotFound(String),
    /// The allocation would push `used` past the configured memory limit.
    MemoryLimitExceeded {
        /// Bytes requested by the failing allocation.
        requested: usize,
        /// The configured limit in bytes.
        limit: usize,
        /// Bytes in use at the time of the request.
        used: usize,
    },
    /// The handle does not refer to a live allocation (double release,
    /// or a slot that never came from this pool).
    InvalidHandle,
    /// Alignment is zero or not a power of two.
    BadAlignment(usize),
}

impl Display for MemoryError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            MemoryError::PoolAlreadyExists(ref name) => {
                write!(f, "Pool `{}` already exists", name)
            }
            MemoryError::PoolNotFound(ref name) => write!(f, "Pool `{}` not found", name),
            MemoryError::MemoryLimitExceeded {
                requested,
                limit,
                used,
            } => write!(
                f,
                "Allocating {} bytes would exceed the memory limit ({} used of {})",
                requested, used, limit
            ),
            MemoryError::InvalidHandle => write!(f, "Handle does not refer to a live allocation"),
            MemoryError::BadAlignment(align) => {
                write!(f, "Alignment {} is not a power of two", align)
            }
        }
    }
}

impl StdError for MemoryError {}

/// Caller errors from the system registry and dependency graph.
#[derive(Debug, PartialEq, Eq)]
pub enum SystemRegistryError {
    /// `register` was handed an empty (nil) system slot.
    NilSystem,
    /// A system with the same type id is already registered.
    SystemAlreadyRegistered(&'static str),
    /// No system with this type id is registered.
    SystemNotFound(&'static str),
    /// One of the endpoints of a dependency edge is not registered.
    InvalidDependency,
    /// Adding the edge would close a cycle in the dependency graph.
    CyclicDependency,
}

impl Display for SystemRegistryError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            SystemRegistryError::NilSystem => write!(f, "Cannot register a nil system"),
            SystemRegistryError::SystemAlreadyRegistered(name) => {
                write!(f, "System `{}` is already registered", name)
            }
            SystemRegistryError::SystemNotFound(name) => {
                write!(f, "System `{}` is not registered", name)
            }
            SystemRegistryError::InvalidDependency => {
                write!(f, "Both systems of a dependency edge must be registered")
            }
            SystemRegistryError::CyclicDependency => {
                write!(f, "Dependency edge would create a cycle")
            }
        }
    }
}

impl StdError for SystemRegistryError {}

/// Errors surfaced by the event bus to publishers and subscribers.
#[derive(Debug)]
pub enum EventError {
    /// The bus is not running; `start` it first.
    EventBusNotStarted,
    /// The event type has not been registered on this bus.
    InvalidEventType(&'static str),
    /// A null event payload was handed to `publish`.
    EventNil,
    /// The async queue is full and the drop policy rejected the event.
    QueueFull,
    /// No subscription with this id exists.
    SubscriptionNotFound(u64),
}

impl Display for EventError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            EventError::EventBusNotStarted => write!(f, "Event bus is not started"),
            EventError::InvalidEventType(name) => {
                write!(f, "Event type `{}` is not registered", name)
            }
            EventError::EventNil => write!(f, "Cannot publish a nil event"),
            EventError::QueueFull => write!(f, "Event queue is full"),
            EventError::SubscriptionNotFound(id) => {
                write!(f, "No subscription with id {}", id)
            }
        }
    }
}

impl StdError for EventError {}

/// Errors from world snapshot encoding and decoding.
#[derive(Debug)]
pub enum SnapshotError {
    /// The byte stream does not start with the snapshot magic.
    BadMagic,
    /// The format version is newer than this build understands.
    UnsupportedVersion(u16),
    /// The stream ended in the middle of a section or record.
    Truncated,
    /// A section names a component type that is not registered here.
    UnknownComponentType(String),
    /// The section's component type has no serialize/deserialize hooks.
    NotSerializable(&'static str),
    /// A payload failed to encode or decode.
    Payload(BoxedErr),
    /// An entity id embedded in the stream is malformed.
    BadEntityId(u64),
}

impl Display for SnapshotError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            SnapshotError::BadMagic => write!(f, "Snapshot does not start with the HRTH magic"),
            SnapshotError::UnsupportedVersion(v) => {
                write!(f, "Snapshot format version {} is not supported", v)
            }
            SnapshotError::Truncated => write!(f, "Snapshot stream is truncated"),
            SnapshotError::UnknownComponentType(ref name) => {
                write!(f, "Snapshot section for unknown component type `{}`", name)
            }
            SnapshotError::NotSerializable(name) => {
                write!(f, "Component type `{}` has no serialization hooks", name)
            }
            SnapshotError::Payload(ref e) => write!(f, "Snapshot payload error: {}", e),
            SnapshotError::BadEntityId(bits) => {
                write!(f, "Snapshot contains malformed entity id {:#x}", bits)
            }
        }
    }
}

impl StdError for SnapshotError {}
