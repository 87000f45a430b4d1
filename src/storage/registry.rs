//! Component type registry.
//!
//! Every component type is registered exactly once and receives a stable
//! small-integer [`ComponentTypeId`] plus a [`ComponentInfo`] record: the
//! type's size and alignment (captured here, never queried per allocation)
//! and its type-erased clone / validate / serialize hooks. The registry is
//! the only place the crate goes through a virtual surface for components;
//! the stores themselves are monomorphic.

use std::any::{Any, TypeId};

use ahash::AHashMap as HashMap;
use serde::{de::DeserializeOwned, Serialize};

use crate::{error::BoxedErr, world::Component};

/// Stable small-integer id of a registered component type, assigned in
/// registration order.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u32);

/// Type-erased clone hook.
pub type CloneFn = fn(&dyn Any) -> Box<dyn Any + Send + Sync>;
/// Type-erased validation hook.
pub type ValidateFn = fn(&dyn Any) -> Result<(), BoxedErr>;
/// Type-erased serialize hook; produces the component's payload bytes.
pub type SerializeFn = fn(&dyn Any) -> Result<Vec<u8>, BoxedErr>;
/// Type-erased deserialize hook; parses payload bytes back into a value.
pub type DeserializeFn = fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, BoxedErr>;

/// Everything the core records about a component type at registration.
pub struct ComponentInfo {
    /// The type's name, as reported by `std::any::type_name`.
    pub name: &'static str,
    /// The assigned stable id.
    pub id: ComponentTypeId,
    /// In-memory size in bytes.
    pub size: usize,
    /// In-memory alignment in bytes.
    pub align: usize,
    pub(crate) rust_id: TypeId,
    pub(crate) clone_fn: CloneFn,
    pub(crate) validate_fn: ValidateFn,
    pub(crate) serialize: Option<(SerializeFn, DeserializeFn)>,
}

impl ComponentInfo {
    /// Whether serialize/deserialize hooks are installed for this type.
    pub fn is_serializable(&self) -> bool {
        self.serialize.is_some()
    }

    /// Runs the validation hook against a type-erased value.
    pub fn validate(&self, value: &dyn Any) -> Result<(), BoxedErr> {
        (self.validate_fn)(value)
    }

    /// Clones a type-erased value through the registered clone hook.
    pub fn clone_value(&self, value: &dyn Any) -> Box<dyn Any + Send + Sync> {
        (self.clone_fn)(value)
    }
}

impl std::fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("serializable", &self.is_serializable())
            .finish()
    }
}

fn clone_erased<T: Component>(value: &dyn Any) -> Box<dyn Any + Send + Sync> {
    let value = value
        .downcast_ref::<T>()
        .expect("component registry handed a value of the wrong type");
    Box::new(value.clone())
}

fn validate_erased<T: Component>(value: &dyn Any) -> Result<(), BoxedErr> {
    let value = value
        .downcast_ref::<T>()
        .expect("component registry handed a value of the wrong type");
    value.validate()
}

fn serialize_erased<T: Component + Serialize>(value: &dyn Any) -> Result<Vec<u8>, BoxedErr> {
    let value = value
        .downcast_ref::<T>()
        .expect("component registry handed a value of the wrong type");
    serde_json::to_vec(value).map_err(BoxedErr::new)
}

fn deserialize_erased<T: Component + DeserializeOwned>(
    bytes: &[u8],
) -> Result<Box<dyn Any + Send + Sync>, BoxedErr> {
    let value: T = serde_json::from_slice(bytes).map_err(BoxedErr::new)?;
    Ok(Box::new(value))
}

/// Registry of component types known to one world.
#[derive(Default)]
pub struct ComponentRegistry {
    ids: HashMap<TypeId, u32>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `T`, assigning the next [`ComponentTypeId`].
    ///
    /// Registration is idempotent: a second call returns the id assigned by
    /// the first and changes nothing.
    pub fn register<T: Component>(&mut self) -> ComponentTypeId {
        let rust_id = TypeId::of::<T>();
        if let Some(&raw) = self.ids.get(&rust_id) {
            return ComponentTypeId(raw);
        }

        let raw = self.infos.len() as u32;
        self.ids.insert(rust_id, raw);
        self.infos.push(ComponentInfo {
            name: std::any::type_name::<T>(),
            id: ComponentTypeId(raw),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            rust_id,
            clone_fn: clone_erased::<T>,
            validate_fn: validate_erased::<T>,
            serialize: None,
        });
        ComponentTypeId(raw)
    }

    /// Installs serde-backed serialize/deserialize hooks for `T`,
    /// registering it first if needed.
    pub fn set_serializable<T>(&mut self) -> ComponentTypeId
    where
        T: Component + Serialize + DeserializeOwned,
    {
        let id = self.register::<T>();
        self.infos[id.0 as usize].serialize =
            Some((serialize_erased::<T>, deserialize_erased::<T>));
        id
    }

    /// Looks up the id assigned to `T`, if registered.
    pub fn id_of<T: Component>(&self) -> Option<ComponentTypeId> {
        self.ids.get(&TypeId::of::<T>()).map(|&raw| ComponentTypeId(raw))
    }

    /// The info record for an id.
    pub fn info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.0 as usize)
    }

    /// The info record for `T`.
    pub fn info_of<T: Component>(&self) -> Option<&ComponentInfo> {
        self.id_of::<T>().and_then(|id| self.info(id))
    }

    /// Finds a registered type by its recorded name.
    pub fn id_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.infos.iter().find(|i| i.name == name).map(|i| i.id)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Returns `true` if no types are registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Iterates all info records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Health(i32);
    impl Component for Health {
        fn validate(&self) -> Result<(), BoxedErr> {
            if self.0 < 0 {
                return Err(BoxedErr::msg("health must be non-negative"));
            }
            Ok(())
        }
    }

    #[derive(Clone, Debug)]
    struct Tag;
    impl Component for Tag {}

    #[test]
    fn ids_are_stable_and_idempotent() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<Health>();
        let b = reg.register::<Tag>();
        assert_eq!(a, ComponentTypeId(0));
        assert_eq!(b, ComponentTypeId(1));
        assert_eq!(reg.register::<Health>(), a);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn records_layout_at_registration() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Health>();
        let info = reg.info(id).unwrap();
        assert_eq!(info.size, std::mem::size_of::<Health>());
        assert_eq!(info.align, std::mem::align_of::<Health>());
    }

    #[test]
    fn validate_hook_runs_through_erased_surface() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Health>();
        let info = reg.info(id).unwrap();
        assert!(info.validate(&Health(10)).is_ok());
        assert!(info.validate(&Health(-1)).is_err());
    }

    #[test]
    fn serde_hooks_round_trip() {
        let mut reg = ComponentRegistry::new();
        let id = reg.set_serializable::<Health>();
        let info = reg.info(id).unwrap();
        let (ser, de) = info.serialize.unwrap();

        let bytes = ser(&Health(42)).unwrap();
        let back = de(&bytes).unwrap();
        assert_eq!(back.downcast_ref::<Health>(), Some(&Health(42)));
    }

    #[test]
    fn clone_hook_clones() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Health>();
        let info = reg.info(id).unwrap();
        let cloned = (info.clone_fn)(&Health(7));
        assert_eq!(cloned.downcast_ref::<Health>(), Some(&Health(7)));
    }
}
