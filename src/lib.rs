#![deny(missing_docs)]

//! # Hearth
//!
//! Hearth is a data-oriented Entity-Component-System runtime for real-time
//! game simulations. It provides the pieces a simulation core actually
//! needs and nothing above them:
//!
//! * **Entities** — versioned ids allocated and recycled by the
//!   [`World`](world::World); stale ids turn into lookup misses, never
//!   dangling data.
//! * **Components** — plain values in per-type sparse-set stores
//!   ([`storage`]): contiguous iteration, O(1) lookup, swap-remove.
//! * **Systems** — units of per-tick behavior ordered by a dependency DAG
//!   and dispatched by the [`SystemManager`](system::SystemManager),
//!   optionally in parallel stages, with per-system fault isolation and
//!   metrics.
//! * **Events** — a typed pub/sub [`EventBus`](event::EventBus) with
//!   synchronous and queued asynchronous delivery, filters, and a worker
//!   pool.
//! * **Memory** — named object pools and raw aligned allocation with
//!   usage accounting behind the [`MemoryManager`](memory::MemoryManager).
//!
//! ## Example
//!
//! ```
//! use hearth::prelude::*;
//!
//! #[derive(Clone, Debug)]
//! struct Position {
//!     x: f32,
//!     y: f32,
//! }
//! impl Component for Position {}
//!
//! #[derive(Clone, Debug)]
//! struct Velocity {
//!     x: f32,
//!     y: f32,
//! }
//! impl Component for Velocity {}
//!
//! struct Movement;
//!
//! impl System for Movement {
//!     fn required_components(&self) -> Vec<std::any::TypeId> {
//!         vec![
//!             std::any::TypeId::of::<Position>(),
//!             std::any::TypeId::of::<Velocity>(),
//!         ]
//!     }
//!
//!     fn thread_safety(&self) -> ThreadSafety {
//!         ThreadSafety::Full
//!     }
//!
//!     fn update(&mut self, world: &World, dt: f32) -> Result<(), BoxedErr> {
//!         let mut positions = world.write_store::<Position>()?;
//!         let velocities = world.read_store::<Velocity>()?;
//!         for (entity, pos) in positions.iter_mut() {
//!             if let Some(vel) = velocities.get(entity) {
//!                 pos.x += vel.x * dt;
//!                 pos.y += vel.y * dt;
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut world = World::new();
//! world.register::<Position>();
//! world.register::<Velocity>();
//!
//! let e = world.create_entity();
//! world.add_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
//! world.add_component(e, Velocity { x: 1.0, y: 0.0 }).unwrap();
//!
//! world.systems().register(Movement).unwrap();
//! world.update(1.0).unwrap();
//!
//! assert_eq!(world.get_component::<Position>(e).unwrap().x, 1.0);
//! ```

pub mod error;
pub mod event;
pub mod external;
pub mod memory;
pub mod prelude;
pub mod saveload;
pub mod storage;
pub mod system;
pub mod world;

pub use crate::{
    error::{
        BoxedErr, EventError, MemoryError, SnapshotError, StoreError, SystemRegistryError,
        WrongGeneration,
    },
    event::{
        BackpressurePolicy, Event, EventBus, EventBusConfig, EventBusStats, EventPriority,
        EventTypeId, SubscriptionId,
    },
    external::{AudioEngine, ErrorSink, NullRenderer, Renderer, Vec2},
    memory::{MemoryManager, MemoryUsage, Pool, PoolSlot},
    storage::{ComponentRegistry, ComponentStore, ComponentTypeId, DensityHint},
    system::{System, SystemId, SystemManager, SystemMetrics, ThreadSafety},
    world::{Component, Entity, Generation, Index, QueryBuilder, World},
};
