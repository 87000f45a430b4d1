//! Prelude module.
//!
//! Contains all of the most common types, re-exported for convenience.

pub use crate::error::BoxedErr;
pub use crate::event::{
    BackpressurePolicy, Event, EventBus, EventBusConfig, EventPriority, SubscriptionId,
};
pub use crate::external::{AudioEngine, NullRenderer, Renderer, Vec2};
pub use crate::memory::MemoryManager;
pub use crate::storage::{ComponentStore, ComponentTypeId, DensityHint};
pub use crate::system::{System, SystemId, SystemManager, ThreadSafety};
pub use crate::world::{Component, Entity, QueryBuilder, World};
