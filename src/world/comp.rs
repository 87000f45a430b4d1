//! The component trait.

use std::any::Any;

use crate::error::BoxedErr;

/// Abstract component type.
///
/// A component is a plain value owned by exactly one entity at a time. It
/// carries no pointers into other components; cross-entity references are
/// stored [`Entity`](crate::world::Entity) ids resolved by lookup.
///
/// `Clone` backs the registry's clone hook (and
/// [`World::clone_entity`](crate::world::World::clone_entity)); `validate`
/// is consulted by the world's add path and may reject malformed values.
///
/// ## Example
///
/// ```
/// use hearth::prelude::*;
///
/// #[derive(Clone, Debug)]
/// struct Velocity {
///     x: f32,
///     y: f32,
/// }
///
/// impl Component for Velocity {}
/// ```
pub trait Component: Any + Send + Sync + Clone {
    /// Checks the value's internal consistency. The default accepts
    /// everything.
    fn validate(&self) -> Result<(), BoxedErr> {
        Ok(())
    }
}
