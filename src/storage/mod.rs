//! Component storage.
//!
//! Each registered component type gets one [`ComponentStore`], a sparse set:
//! a dense value array for cache-friendly iteration, a parallel array of
//! owning entities, and a reverse index from entity slot to dense row.
//! Lookup is one sparse probe plus one dense access; removal is swap-remove,
//! so the dense arrays never carry tombstones.

pub mod registry;

pub use self::registry::{ComponentInfo, ComponentRegistry, ComponentTypeId};

use crate::{
    error::StoreError,
    world::{Component, Entity, Index},
};

/// Hint given at registration time for how densely a component type will
/// populate the entity range.
///
/// `Dense` backs the reverse index with a flat array indexed by entity slot;
/// `Sparse` uses a two-level page table so rare components don't pay for the
/// whole slot range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DensityHint {
    /// Most entities are expected to carry this component.
    #[default]
    Dense,
    /// Few entities carry this component; page the reverse index.
    Sparse,
}

const NO_ROW: Index = Index::MAX;

/// Entity slots per sparse page. Power of two so page/offset splits are a
/// shift and a mask.
const PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Reverse index from entity slot to dense row.
#[derive(Debug)]
enum SparseTable {
    Direct(Vec<Index>),
    Paged(Vec<Option<Box<[Index; PAGE_SIZE]>>>),
}

impl SparseTable {
    fn new(hint: DensityHint) -> Self {
        match hint {
            DensityHint::Dense => SparseTable::Direct(Vec::new()),
            DensityHint::Sparse => SparseTable::Paged(Vec::new()),
        }
    }

    fn get(&self, id: Index) -> Option<Index> {
        let row = match *self {
            SparseTable::Direct(ref v) => *v.get(id as usize)?,
            SparseTable::Paged(ref pages) => {
                let page = pages.get(id as usize >> PAGE_SHIFT)?.as_ref()?;
                page[id as usize & PAGE_MASK]
            }
        };
        (row != NO_ROW).then_some(row)
    }

    fn set(&mut self, id: Index, row: Index) {
        match *self {
            SparseTable::Direct(ref mut v) => {
                if v.len() <= id as usize {
                    v.resize(id as usize + 1, NO_ROW);
                }
                v[id as usize] = row;
            }
            SparseTable::Paged(ref mut pages) => {
                let pi = id as usize >> PAGE_SHIFT;
                if pages.len() <= pi {
                    pages.resize_with(pi + 1, || None);
                }
                let page = pages[pi].get_or_insert_with(|| Box::new([NO_ROW; PAGE_SIZE]));
                page[id as usize & PAGE_MASK] = row;
            }
        }
    }

    fn clear_slot(&mut self, id: Index) {
        match *self {
            SparseTable::Direct(ref mut v) => {
                if let Some(slot) = v.get_mut(id as usize) {
                    *slot = NO_ROW;
                }
            }
            SparseTable::Paged(ref mut pages) => {
                if let Some(Some(page)) = pages.get_mut(id as usize >> PAGE_SHIFT) {
                    page[id as usize & PAGE_MASK] = NO_ROW;
                }
            }
        }
    }

    fn clear(&mut self) {
        match *self {
            SparseTable::Direct(ref mut v) => v.clear(),
            SparseTable::Paged(ref mut pages) => pages.clear(),
        }
    }
}

/// Dense per-type component storage.
///
/// The store itself works purely on ids; entity liveness is the
/// [`World`](crate::world::World)'s concern and is checked there before the
/// store is touched. Stale ids still miss here, because every slot records
/// the full `Entity` (index and generation) that owns it.
#[derive(Debug)]
pub struct ComponentStore<T> {
    dense: Vec<T>,
    entities: Vec<Entity>,
    sparse: SparseTable,
}

impl<T: Component> ComponentStore<T> {
    /// Creates an empty store with the given density hint.
    pub fn new(hint: DensityHint) -> Self {
        ComponentStore {
            dense: Vec::new(),
            entities: Vec::new(),
            sparse: SparseTable::new(hint),
        }
    }

    /// Number of components currently stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    /// Returns `true` if no components are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    fn row_of(&self, entity: Entity) -> Option<usize> {
        let row = self.sparse.get(entity.id())? as usize;
        (self.entities[row] == entity).then_some(row)
    }

    /// Returns `true` if `entity` holds a component in this store.
    #[inline]
    pub fn has(&self, entity: Entity) -> bool {
        self.row_of(entity).is_some()
    }

    /// Adds a component for `entity`.
    ///
    /// Fails with `ComponentAlreadyPresent` if the entity already holds one.
    /// A slot left behind by a stale generation is reclaimed in place.
    pub fn add(&mut self, entity: Entity, component: T) -> Result<(), StoreError> {
        if let Some(row) = self.sparse.get(entity.id()) {
            let row = row as usize;
            if self.entities[row] == entity {
                return Err(StoreError::ComponentAlreadyPresent(entity));
            }
            // Same slot, older generation: the owner is gone, reuse the row.
            self.entities[row] = entity;
            self.dense[row] = component;
            return Ok(());
        }

        let row = self.dense.len() as Index;
        self.dense.push(component);
        self.entities.push(entity);
        self.sparse.set(entity.id(), row);
        Ok(())
    }

    /// Returns a reference to `entity`'s component, if present.
    #[inline]
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.row_of(entity).map(|row| &self.dense[row])
    }

    /// Returns a mutable reference to `entity`'s component, if present.
    #[inline]
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        self.row_of(entity).map(move |row| &mut self.dense[row])
    }

    /// Removes and returns `entity`'s component.
    ///
    /// Swap-remove: the last dense element moves into the vacated row and its
    /// reverse index is fixed up, so the dense arrays stay gap-free.
    pub fn remove(&mut self, entity: Entity) -> Result<T, StoreError> {
        let row = self
            .row_of(entity)
            .ok_or(StoreError::ComponentNotPresent(entity))?;

        let last = *self.entities.last().expect("row_of implies non-empty");
        if last != entity {
            self.sparse.set(last.id(), row as Index);
        }
        self.sparse.clear_slot(entity.id());
        self.entities.swap_remove(row);
        Ok(self.dense.swap_remove(row))
    }

    /// Iterates `(Entity, &T)` pairs in dense (insertion-modulo-swap) order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> {
        self.entities.iter().copied().zip(self.dense.iter())
    }

    /// Iterates `(Entity, &mut T)` pairs in dense order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Entity, &mut T)> {
        self.entities.iter().copied().zip(self.dense.iter_mut())
    }

    /// Removes all components, running destructors.
    pub fn clear(&mut self) {
        self.dense.clear();
        self.entities.clear();
        self.sparse.clear();
    }

    /// The entities currently holding a component, in dense order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Generation;

    #[derive(Clone, Debug, PartialEq)]
    struct Transform {
        x: f32,
        y: f32,
    }
    impl Component for Transform {}

    fn ent(i: Index) -> Entity {
        Entity::from_raw_parts(i, Generation::new(1))
    }

    fn store(hint: DensityHint) -> ComponentStore<Transform> {
        ComponentStore::new(hint)
    }

    #[test]
    fn add_get_remove() {
        for hint in [DensityHint::Dense, DensityHint::Sparse] {
            let mut s = store(hint);
            for i in 0..1_000 {
                s.add(ent(i), Transform {
                    x: i as f32,
                    y: 0.0,
                })
                .unwrap();
            }
            for i in 0..1_000 {
                assert_eq!(s.get(ent(i)).unwrap().x, i as f32);
            }
            for i in 0..1_000 {
                s.remove(ent(i)).unwrap();
            }
            for i in 0..1_000 {
                assert!(s.get(ent(i)).is_none());
            }
            assert!(s.is_empty());
        }
    }

    #[test]
    fn double_add_fails() {
        let mut s = store(DensityHint::Dense);
        s.add(ent(3), Transform { x: 1.0, y: 2.0 }).unwrap();
        assert!(matches!(
            s.add(ent(3), Transform { x: 9.0, y: 9.0 }),
            Err(StoreError::ComponentAlreadyPresent(_))
        ));
        assert_eq!(s.get(ent(3)).unwrap().x, 1.0);
    }

    #[test]
    fn swap_remove_keeps_dense_contiguous() {
        let mut s = store(DensityHint::Dense);
        let (e1, e2, e3) = (ent(1), ent(2), ent(3));
        s.add(e1, Transform { x: 1.0, y: 0.0 }).unwrap();
        s.add(e2, Transform { x: 2.0, y: 0.0 }).unwrap();
        s.add(e3, Transform { x: 3.0, y: 0.0 }).unwrap();

        s.remove(e1).unwrap();

        assert_eq!(s.len(), 2);
        assert!(s.get(e1).is_none());

        let seen: Vec<_> = s.iter().map(|(e, t)| (e, t.x)).collect();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&(e2, 2.0)));
        assert!(seen.contains(&(e3, 3.0)));
    }

    #[test]
    fn stale_generation_misses() {
        let mut s = store(DensityHint::Sparse);
        let old = Entity::from_raw_parts(5, Generation::new(1));
        let new = Entity::from_raw_parts(5, Generation::new(2));
        s.add(old, Transform { x: 1.0, y: 1.0 }).unwrap();

        assert!(s.get(new).is_none());
        assert!(!s.has(new));
        assert!(matches!(
            s.remove(new),
            Err(StoreError::ComponentNotPresent(_))
        ));

        // Reclaiming the slot under the new generation evicts the stale row.
        s.add(new, Transform { x: 7.0, y: 7.0 }).unwrap();
        assert_eq!(s.len(), 1);
        assert!(s.get(old).is_none());
        assert_eq!(s.get(new).unwrap().x, 7.0);
    }

    #[test]
    fn add_remove_pair_restores_state() {
        let mut s = store(DensityHint::Dense);
        for i in 0..100 {
            s.add(ent(i), Transform { x: 0.0, y: 0.0 }).unwrap();
        }
        let count = s.len();
        let probe = ent(200);
        assert!(!s.has(probe));

        s.add(probe, Transform { x: 4.0, y: 4.0 }).unwrap();
        s.remove(probe).unwrap();

        assert!(!s.has(probe));
        assert_eq!(s.len(), count);
    }

    #[test]
    fn paged_table_far_apart_slots() {
        let mut s = store(DensityHint::Sparse);
        s.add(ent(3), Transform { x: 3.0, y: 0.0 }).unwrap();
        s.add(ent(70_000), Transform { x: 70.0, y: 0.0 }).unwrap();

        assert_eq!(s.get(ent(3)).unwrap().x, 3.0);
        assert_eq!(s.get(ent(70_000)).unwrap().x, 70.0);
        assert!(s.get(ent(69_999)).is_none());
    }
}
