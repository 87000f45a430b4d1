//! Entity ids and their allocator.
//!
//! An entity id is a slot index paired with the generation the slot had
//! when the id was issued. The allocator keeps one [`Slot`] per index and a
//! LIFO free list of recycled indices; freeing a slot bumps its generation,
//! so every previously issued id for that index stops matching. Fresh
//! indices are handed out sequentially past the end of the table.
//!
//! Deferred creation and destruction go through a small pending-ops queue
//! behind the allocator's own mutex, so callers holding only a read lock on
//! the world can spawn and despawn; `merge` folds the queue into the table.

use std::sync::Mutex;

use crate::error::WrongGeneration;

/// An index is basically the id of an `Entity`.
pub type Index = u32;

/// One entry of the entity table. `generation` is the value the slot will
/// issue next (or has issued, while alive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    generation: u32,
    alive: bool,
}

#[derive(Debug, Default)]
struct PendingOps {
    spawned: Vec<Entity>,
    killed: Vec<Entity>,
}

/// Internally used structure for `Entity` allocation.
#[derive(Debug, Default)]
pub(crate) struct Allocator {
    slots: Vec<Slot>,
    free: Vec<Index>,
    live: usize,
    pending: Mutex<PendingOps>,
}

impl Allocator {
    /// Allocate a new entity, preferring a recycled slot.
    pub fn allocate(&mut self) -> Entity {
        self.flush_spawns();
        let entity = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.alive = true;
                Entity(idx, Generation(slot.generation))
            }
            None => {
                let idx = self.slots.len() as Index;
                self.slots.push(Slot {
                    generation: 1,
                    alive: true,
                });
                Entity(idx, Generation(1))
            }
        };
        self.live += 1;
        entity
    }

    /// Allocate a new entity without exclusive access to the table. The
    /// entity is immediately visible to liveness checks and becomes part of
    /// the table on the next `merge` (or any exclusive allocation).
    ///
    /// Deferred allocations always take fresh indices; recycling only
    /// happens through the exclusive path.
    pub fn allocate_deferred(&self) -> Entity {
        let mut pending = self.pending.lock().expect("pending ops poisoned");
        let idx = (self.slots.len() + pending.spawned.len()) as Index;
        let entity = Entity(idx, Generation(1));
        pending.spawned.push(entity);
        entity
    }

    /// Kills a list of entities immediately.
    pub fn kill(&mut self, delete: &[Entity]) -> Result<(), WrongGeneration> {
        self.flush_spawns();
        for &entity in delete {
            if !self.is_alive(entity) {
                return self.del_err(entity);
            }
            self.release(entity.id());
        }
        Ok(())
    }

    /// Queues an entity for destruction on the next `merge`. It stays alive
    /// until then.
    pub fn kill_deferred(&self, entity: Entity) -> Result<(), WrongGeneration> {
        if !self.is_alive(entity) {
            return self.del_err(entity);
        }
        self.pending
            .lock()
            .expect("pending ops poisoned")
            .killed
            .push(entity);
        Ok(())
    }

    fn release(&mut self, idx: Index) {
        let slot = &mut self.slots[idx as usize];
        slot.alive = false;
        slot.generation += 1;
        self.free.push(idx);
        self.live -= 1;
    }

    /// Moves pending spawns into the table. Their indices were assigned
    /// sequentially past the table end, so pushing in queue order lands
    /// each one on its reserved index.
    fn flush_spawns(&mut self) {
        let spawned = std::mem::take(
            &mut self
                .pending
                .get_mut()
                .expect("pending ops poisoned")
                .spawned,
        );
        for entity in spawned {
            debug_assert_eq!(entity.id() as usize, self.slots.len());
            self.slots.push(Slot {
                generation: entity.gen().0,
                alive: true,
            });
            self.live += 1;
        }
    }

    /// Folds the pending queue into the table and returns the entities
    /// whose deferred destruction took effect.
    pub fn merge(&mut self) -> Vec<Entity> {
        self.flush_spawns();
        let killed = std::mem::take(
            &mut self
                .pending
                .get_mut()
                .expect("pending ops poisoned")
                .killed,
        );
        let mut deleted = Vec::new();
        for entity in killed {
            let slot = &mut self.slots[entity.id() as usize];
            // A duplicate queue entry or an interleaved immediate kill
            // leaves a stale generation; skip it.
            if slot.alive && slot.generation == entity.gen().0 {
                self.release(entity.id());
                deleted.push(entity);
            }
        }
        deleted
    }

    pub(crate) fn del_err(&self, e: Entity) -> Result<(), WrongGeneration> {
        Err(WrongGeneration {
            action: "delete",
            actual_gen: self
                .slots
                .get(e.id() as usize)
                .map(|slot| Generation(slot.generation))
                .unwrap_or(Generation(0)),
            entity: e,
        })
    }

    /// Return `true` if the entity is alive.
    pub fn is_alive(&self, e: Entity) -> bool {
        match self.slots.get(e.id() as usize) {
            Some(slot) => slot.alive && slot.generation == e.gen().0,
            // Past the table end: only a pending spawn can match.
            None => self
                .pending
                .lock()
                .expect("pending ops poisoned")
                .spawned
                .contains(&e),
        }
    }

    /// Number of currently alive entities, pending spawns included.
    pub fn count(&self) -> usize {
        self.live
            + self
                .pending
                .lock()
                .expect("pending ops poisoned")
                .spawned
                .len()
    }

    /// Every live entity in slot order, pending spawns last.
    pub fn live_entities(&self) -> Vec<Entity> {
        let mut out: Vec<Entity> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(idx, slot)| Entity(idx as Index, Generation(slot.generation)))
            .collect();
        out.extend(
            self.pending
                .lock()
                .expect("pending ops poisoned")
                .spawned
                .iter()
                .copied(),
        );
        out
    }
}

/// `Entity` type, as seen by the user.
///
/// An entity is a versioned identifier: a slot index paired with the
/// generation the slot had when this id was issued. Destroying the entity
/// bumps the slot's generation, so stale copies of the id turn into lookup
/// misses instead of aliasing whatever reuses the slot.
#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct Entity(Index, Generation);

impl Entity {
    /// Creates an entity from raw parts. Mostly useful for tests; ids
    /// fabricated this way are only valid if the world agrees.
    pub fn from_raw_parts(index: Index, gen: Generation) -> Entity {
        Entity(index, gen)
    }

    /// Returns the index of the `Entity`.
    #[inline]
    pub fn id(&self) -> Index {
        self.0
    }

    /// Returns the `Generation` of the `Entity`.
    #[inline]
    pub fn gen(&self) -> Generation {
        self.1
    }

    /// Packs this id into a single 64-bit word: generation in the high half,
    /// index in the low half. Issued ids never pack to zero because issued
    /// generations start at 1.
    #[inline]
    pub fn to_bits(self) -> u64 {
        ((self.1 .0 as u64) << 32) | self.0 as u64
    }

    /// Reverses [`Entity::to_bits`]. Returns `None` when the generation
    /// half is zero — in particular for the all-zeros word, which is never
    /// issued.
    pub fn from_bits(bits: u64) -> Option<Entity> {
        let gen = (bits >> 32) as u32;
        if gen == 0 {
            return None;
        }
        Some(Entity(bits as u32, Generation(gen)))
    }
}

/// Slot reuse counter carried inside every [`Entity`] id. Issued
/// generations start at 1 and grow by one each time the slot is freed, so
/// an id from an earlier lease of the slot can never match again.
#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct Generation(pub(crate) u32);

impl Generation {
    /// Creates a generation from a raw counter value. See
    /// [`Entity::from_raw_parts`].
    pub fn new(v: u32) -> Self {
        Generation(v)
    }

    /// Returns the raw counter value.
    #[inline]
    pub fn id(&self) -> u32 {
        self.0
    }
}
