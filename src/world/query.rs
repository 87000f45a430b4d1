//! Fluent entity queries.
//!
//! A query composes component-presence constraints and executes against the
//! world's stores. Execution drives iteration from the smallest required
//! store and sparse-rejects candidates against the remaining constraints,
//! so cost is proportional to the rarest required component, not to the
//! total entity count. With no required types, the live-entity set drives.

use std::any::TypeId;

use super::{Component, Entity, World};

/// Builder for entity queries; obtained from [`World::query`].
///
/// ## Example
///
/// ```
/// use hearth::prelude::*;
///
/// #[derive(Clone, Debug)]
/// struct Pos(f32);
/// impl Component for Pos {}
/// #[derive(Clone, Debug)]
/// struct Frozen;
/// impl Component for Frozen {}
///
/// let mut world = World::new();
/// world.register::<Pos>();
/// world.register::<Frozen>();
///
/// let a = world.create_entity();
/// world.add_component(a, Pos(1.0)).unwrap();
/// let b = world.create_entity();
/// world.add_component(b, Pos(2.0)).unwrap();
/// world.add_component(b, Frozen).unwrap();
///
/// let movable = world.query().with::<Pos>().without::<Frozen>().execute();
/// assert_eq!(movable, vec![a]);
/// ```
pub struct QueryBuilder<'w> {
    world: &'w World,
    required: Vec<TypeId>,
    excluded: Vec<TypeId>,
    any_groups: Vec<Vec<TypeId>>,
    not_all_groups: Vec<Vec<TypeId>>,
}

impl<'w> QueryBuilder<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        QueryBuilder {
            world,
            required: Vec::new(),
            excluded: Vec::new(),
            any_groups: Vec::new(),
            not_all_groups: Vec::new(),
        }
    }

    /// Matches entities holding a `T` component.
    pub fn with<T: Component>(mut self) -> Self {
        self.required.push(TypeId::of::<T>());
        self
    }

    /// Matches entities not holding a `T` component.
    pub fn without<T: Component>(mut self) -> Self {
        self.excluded.push(TypeId::of::<T>());
        self
    }

    /// Matches entities holding every one of `types`.
    pub fn with_all(mut self, types: &[TypeId]) -> Self {
        self.required.extend_from_slice(types);
        self
    }

    /// Matches entities holding at least one of `types`.
    pub fn with_any(mut self, types: &[TypeId]) -> Self {
        if !types.is_empty() {
            self.any_groups.push(types.to_vec());
        }
        self
    }

    /// Rejects entities holding every one of `types` at once; partial
    /// holders still match. Compose [`without`](Self::without) for
    /// "none of these".
    pub fn without_all(mut self, types: &[TypeId]) -> Self {
        if !types.is_empty() {
            self.not_all_groups.push(types.to_vec());
        }
        self
    }

    fn matches(&self, entity: Entity, skip_required: Option<TypeId>) -> bool {
        let has = |ty: &TypeId| {
            self.world
                .cell_by_type(*ty)
                .map(|cell| cell.has(entity))
                .unwrap_or(false)
        };

        self.required
            .iter()
            .filter(|&&ty| Some(ty) != skip_required)
            .all(has)
            && !self.excluded.iter().any(has)
            && self.any_groups.iter().all(|group| group.iter().any(has))
            && !self
                .not_all_groups
                .iter()
                .any(|group| group.iter().all(has))
    }

    /// Runs the query, returning the matching entities.
    ///
    /// Results follow the driving store's dense order (or slot order when
    /// nothing is required).
    pub fn execute(&self) -> Vec<Entity> {
        // Pick the smallest required store as the driver.
        let driver = self
            .required
            .iter()
            .map(|&ty| (ty, self.world.cell_by_type(ty)))
            .min_by_key(|(_, cell)| cell.map(|c| c.len()).unwrap_or(0));

        match driver {
            // A required type that was never registered matches nothing.
            Some((_, None)) => Vec::new(),
            Some((ty, Some(cell))) => cell
                .entities_snapshot()
                .into_iter()
                .filter(|&e| self.world.is_entity_valid(e))
                .filter(|&e| self.matches(e, Some(ty)))
                .collect(),
            None => self
                .world
                .all_entities()
                .into_iter()
                .filter(|&e| self.matches(e, None))
                .collect(),
        }
    }

    /// Number of matching entities.
    pub fn count(&self) -> usize {
        self.execute().len()
    }
}

impl<'w> IntoIterator for QueryBuilder<'w> {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.execute().into_iter()
    }
}
