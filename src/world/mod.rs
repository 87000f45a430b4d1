//! The world: entity table, component stores, and the top-level API.
//!
//! All mutation goes through the `World` so invariants are enforced in one
//! place: every component belongs to a live entity, stale entity ids miss,
//! and lifecycle transitions are announced on the event bus. Component
//! stores are reached through type-erased cells so destroy sweeps and
//! snapshots can walk every registered type without knowing it.
//!
//! Locking: the entity table sits behind the world's reader-writer lock;
//! each store carries its own. Registering component types takes `&mut
//! World`, which is what makes the borrowed store guards handed to systems
//! safe.

pub mod comp;
pub mod entity;
pub mod query;

pub use self::comp::Component;
pub use self::entity::{Entity, Generation, Index};
pub use self::query::QueryBuilder;

use std::any::{Any, TypeId};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap as HashMap;
use log::debug;

use self::entity::Allocator;
use crate::{
    error::{BoxedErr, StoreError, WrongGeneration},
    event::{
        ComponentAdded, ComponentRemoved, EntityCreated, EntityDestroyed, EventBus,
        EventBusConfig,
    },
    external::Renderer,
    memory::MemoryManager,
    storage::{ComponentRegistry, ComponentStore, ComponentTypeId, DensityHint},
    system::SystemManager,
};

/// Read guard over one component store.
pub type StoreRead<'a, T> = RwLockReadGuard<'a, ComponentStore<T>>;

/// Write guard over one component store; exclusive w.r.t. this type only.
pub type StoreWrite<'a, T> = RwLockWriteGuard<'a, ComponentStore<T>>;

/// Type-erased handle to one typed store, letting the world sweep, clone,
/// and snapshot components without knowing their types.
pub(crate) trait StoreCell: Send + Sync + 'static {
    fn comp_id(&self) -> ComponentTypeId;
    fn len(&self) -> usize;
    fn has(&self, entity: Entity) -> bool;
    fn remove_erased(&self, entity: Entity) -> bool;
    fn insert_erased(
        &self,
        entity: Entity,
        value: Box<dyn Any + Send + Sync>,
    ) -> Result<(), StoreError>;
    fn clone_into(&self, src: Entity, dst: Entity) -> Result<bool, StoreError>;
    fn entities_snapshot(&self) -> Vec<Entity>;
    fn for_each_erased(&self, f: &mut dyn FnMut(Entity, &dyn Any));
    fn as_any(&self) -> &dyn Any;
}

struct TypedStoreCell<T: Component> {
    id: ComponentTypeId,
    store: RwLock<ComponentStore<T>>,
}

impl<T: Component> StoreCell for TypedStoreCell<T> {
    fn comp_id(&self) -> ComponentTypeId {
        self.id
    }

    fn len(&self) -> usize {
        self.store.read().expect("store poisoned").len()
    }

    fn has(&self, entity: Entity) -> bool {
        self.store.read().expect("store poisoned").has(entity)
    }

    fn remove_erased(&self, entity: Entity) -> bool {
        self.store
            .write()
            .expect("store poisoned")
            .remove(entity)
            .is_ok()
    }

    fn insert_erased(
        &self,
        entity: Entity,
        value: Box<dyn Any + Send + Sync>,
    ) -> Result<(), StoreError> {
        let value = *value
            .downcast::<T>()
            .expect("store cell handed a value of the wrong type");
        self.store.write().expect("store poisoned").add(entity, value)
    }

    fn clone_into(&self, src: Entity, dst: Entity) -> Result<bool, StoreError> {
        let cloned = {
            let store = self.store.read().expect("store poisoned");
            store.get(src).cloned()
        };
        match cloned {
            Some(value) => {
                self.store.write().expect("store poisoned").add(dst, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn entities_snapshot(&self) -> Vec<Entity> {
        self.store.read().expect("store poisoned").entities().to_vec()
    }

    fn for_each_erased(&self, f: &mut dyn FnMut(Entity, &dyn Any)) {
        let store = self.store.read().expect("store poisoned");
        for (entity, value) in store.iter() {
            f(entity, value);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The `World` contains all the data: the entity table and one store per
/// registered component type, plus handles to the system manager, the
/// event bus, and the memory manager.
///
/// ## Example
///
/// ```
/// use hearth::prelude::*;
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Position {
///     x: f32,
///     y: f32,
/// }
/// impl Component for Position {}
///
/// let mut world = World::new();
/// world.register::<Position>();
///
/// let e = world.create_entity();
/// world.add_component(e, Position { x: 1.0, y: 2.0 }).unwrap();
///
/// assert_eq!(
///     world.get_component::<Position>(e),
///     Some(Position { x: 1.0, y: 2.0 })
/// );
///
/// world.destroy_entity(e).unwrap();
/// assert!(!world.is_entity_valid(e));
/// assert_eq!(world.get_component::<Position>(e), None);
/// ```
pub struct World {
    allocator: RwLock<Allocator>,
    registry: ComponentRegistry,
    stores: HashMap<TypeId, Arc<dyn StoreCell>>,
    systems: SystemManager,
    events: Arc<EventBus>,
    memory: Arc<MemoryManager>,
}

impl Default for World {
    fn default() -> Self {
        Self::with_bus_config(EventBusConfig::default())
    }
}

impl World {
    /// Creates an empty world with a default (stopped) event bus.
    pub fn new() -> World {
        Default::default()
    }

    /// Creates an empty world whose event bus uses `config`.
    pub fn with_bus_config(config: EventBusConfig) -> World {
        let events = Arc::new(EventBus::new(config));
        events.register_event_type::<EntityCreated>();
        events.register_event_type::<EntityDestroyed>();
        events.register_event_type::<ComponentAdded>();
        events.register_event_type::<ComponentRemoved>();

        World {
            allocator: RwLock::new(Allocator::default()),
            registry: ComponentRegistry::new(),
            stores: HashMap::new(),
            systems: SystemManager::new(),
            events,
            memory: Arc::new(MemoryManager::new()),
        }
    }

    /// Registers component type `T` with the default (dense) layout hint.
    ///
    /// Does nothing if the type was already registered.
    pub fn register<T: Component>(&mut self) -> ComponentTypeId {
        self.register_with_hint::<T>(DensityHint::Dense)
    }

    /// Registers component type `T`, choosing the sparse-index layout from
    /// `hint`.
    pub fn register_with_hint<T: Component>(&mut self, hint: DensityHint) -> ComponentTypeId {
        let id = self.registry.register::<T>();
        self.stores.entry(TypeId::of::<T>()).or_insert_with(|| {
            debug!("registered component store for {}", std::any::type_name::<T>());
            Arc::new(TypedStoreCell::<T> {
                id,
                store: RwLock::new(ComponentStore::new(hint)),
            })
        });
        id
    }

    /// Registers `T` (if needed) and installs its serde snapshot hooks.
    pub fn register_serializable<T>(&mut self) -> ComponentTypeId
    where
        T: Component + serde::Serialize + serde::de::DeserializeOwned,
    {
        self.register::<T>();
        self.registry.set_serializable::<T>()
    }

    /// The component type registry.
    pub fn component_registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// The system manager.
    pub fn systems(&self) -> &SystemManager {
        &self.systems
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The memory manager.
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Routes system and event-handler failures into one
    /// [`ErrorSink`](crate::external::ErrorSink). Failures stay isolated;
    /// the sink only observes them.
    pub fn set_error_sink(&self, sink: Arc<dyn crate::external::ErrorSink>) {
        let systems_sink = sink.clone();
        self.systems.set_error_handler(Arc::new(move |id, err| {
            systems_sink.on_system_error(id, err);
            Ok(())
        }));
        self.events.set_error_sink(Arc::new(move |event_type, subscription, err| {
            sink.on_handler_error(event_type, subscription, err);
        }));
    }

    fn typed_cell<T: Component>(&self) -> Result<&TypedStoreCell<T>, StoreError> {
        let cell = self
            .stores
            .get(&TypeId::of::<T>())
            .ok_or(StoreError::ComponentNotRegistered(std::any::type_name::<T>()))?;
        Ok(cell
            .as_any()
            .downcast_ref::<TypedStoreCell<T>>()
            .expect("store cell type confusion"))
    }

    pub(crate) fn cell_by_type(&self, id: TypeId) -> Option<&Arc<dyn StoreCell>> {
        self.stores.get(&id)
    }

    /// Locks `T`'s store for reading.
    pub fn read_store<T: Component>(&self) -> Result<StoreRead<'_, T>, StoreError> {
        Ok(self.typed_cell::<T>()?.store.read().expect("store poisoned"))
    }

    /// Locks `T`'s store for writing. Exclusive for this type only; other
    /// types' stores stay available.
    pub fn write_store<T: Component>(&self) -> Result<StoreWrite<'_, T>, StoreError> {
        Ok(self.typed_cell::<T>()?.store.write().expect("store poisoned"))
    }

    /// Creates a new entity immediately, taking the world's write lock.
    pub fn create_entity(&self) -> Entity {
        let entity = self.allocator.write().expect("entity table poisoned").allocate();
        let _ = self.events.publish(EntityCreated { entity });
        entity
    }

    /// Creates a new entity without the write lock; it becomes persistent
    /// on the next [`maintain`](Self::maintain).
    pub fn create_entity_deferred(&self) -> Entity {
        self.allocator
            .read()
            .expect("entity table poisoned")
            .allocate_deferred()
    }

    /// Destroys an entity immediately: validates the generation, removes
    /// its components (running destructors), frees the slot, and publishes
    /// [`EntityDestroyed`] best-effort.
    pub fn destroy_entity(&self, entity: Entity) -> Result<(), WrongGeneration> {
        {
            let alloc = self.allocator.read().expect("entity table poisoned");
            if !alloc.is_alive(entity) {
                return alloc.del_err(entity);
            }
        }
        for cell in self.stores.values() {
            cell.remove_erased(entity);
        }
        self.allocator
            .write()
            .expect("entity table poisoned")
            .kill(&[entity])?;
        let _ = self.events.publish(EntityDestroyed { entity });
        Ok(())
    }

    /// Marks an entity for destruction on the next
    /// [`maintain`](Self::maintain).
    pub fn destroy_entity_deferred(&self, entity: Entity) -> Result<(), WrongGeneration> {
        self.allocator
            .read()
            .expect("entity table poisoned")
            .kill_deferred(entity)
    }

    /// Merges deferred entity creations and destructions, sweeping the
    /// components of destroyed entities and publishing their events.
    pub fn maintain(&self) {
        let deleted = self.allocator.write().expect("entity table poisoned").merge();
        for &entity in &deleted {
            for cell in self.stores.values() {
                cell.remove_erased(entity);
            }
            let _ = self.events.publish(EntityDestroyed { entity });
        }
    }

    /// Whether this id refers to a live entity (its generation matches).
    pub fn is_entity_valid(&self, entity: Entity) -> bool {
        self.allocator
            .read()
            .expect("entity table poisoned")
            .is_alive(entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.allocator.read().expect("entity table poisoned").count()
    }

    /// Every live entity, in slot order.
    pub fn all_entities(&self) -> Vec<Entity> {
        self.allocator
            .read()
            .expect("entity table poisoned")
            .live_entities()
    }

    /// Attaches a component to a live entity.
    ///
    /// Validates the entity, then the value (via its
    /// [`validate`](Component::validate) hook), then inserts; publishes
    /// [`ComponentAdded`] best-effort.
    pub fn add_component<T: Component>(
        &self,
        entity: Entity,
        component: T,
    ) -> Result<(), StoreError> {
        if !self.is_entity_valid(entity) {
            return Err(StoreError::EntityInvalid(entity));
        }
        component
            .validate()
            .map_err(StoreError::ComponentInvalid)?;
        let cell = self.typed_cell::<T>()?;
        cell.store
            .write()
            .expect("store poisoned")
            .add(entity, component)?;
        let _ = self.events.publish(ComponentAdded {
            entity,
            component: cell.id,
        });
        Ok(())
    }

    /// Detaches and returns a component; publishes [`ComponentRemoved`]
    /// best-effort.
    pub fn remove_component<T: Component>(&self, entity: Entity) -> Result<T, StoreError> {
        if !self.is_entity_valid(entity) {
            return Err(StoreError::EntityInvalid(entity));
        }
        let cell = self.typed_cell::<T>()?;
        let removed = cell.store.write().expect("store poisoned").remove(entity)?;
        let _ = self.events.publish(ComponentRemoved {
            entity,
            component: cell.id,
        });
        Ok(removed)
    }

    /// A clone of the entity's component, if present.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<T> {
        self.read_store::<T>().ok()?.get(entity).cloned()
    }

    /// Whether the entity holds a component of type `T`.
    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        self.read_store::<T>()
            .map(|store| store.has(entity))
            .unwrap_or(false)
    }

    /// Creates a new entity carrying clones of every component of `src`.
    /// Each cloned component is announced with [`ComponentAdded`], exactly
    /// like [`add_component`](Self::add_component).
    pub fn clone_entity(&self, src: Entity) -> Result<Entity, StoreError> {
        if !self.is_entity_valid(src) {
            return Err(StoreError::EntityInvalid(src));
        }
        let dst = self.create_entity();
        for cell in self.stores.values() {
            if StoreCell::clone_into(cell.as_ref(), src, dst)? {
                let _ = self.events.publish(ComponentAdded {
                    entity: dst,
                    component: cell.comp_id(),
                });
            }
        }
        Ok(dst)
    }

    /// Starts composing an entity query; see [`QueryBuilder`].
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Runs one update tick through the system manager.
    pub fn update(&self, dt: f32) -> Result<(), BoxedErr> {
        self.systems.update_systems(self, dt)
    }

    /// Runs one render pass through the system manager.
    pub fn render(&self, renderer: &mut dyn Renderer) -> Result<(), BoxedErr> {
        self.systems.render_systems(self, renderer)
    }

    /// Initializes all systems; fatal on first failure.
    pub fn initialize(&self) -> Result<(), BoxedErr> {
        self.systems.initialize_systems(self)
    }

    /// Shuts systems down in reverse order, collecting their errors.
    pub fn shutdown(&self) -> Vec<(crate::system::SystemId, BoxedErr)> {
        self.systems.shutdown_systems(self)
    }
}
