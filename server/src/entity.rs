//! Generational entity storage for the arena simulation.
//!
//! Slots are recycled but generations are not, so a stale [`EntityId`] held
//! across a delete can never alias the entity that later reuses the slot.

use std::collections::HashSet;

use shared::math::Vec3;

use crate::physics::BodyId;
use crate::session::SessionHandle;

/// Handle to an entity inside an [`EntityStore`]. The slot index doubles as
/// the wire-visible entity id; the generation is server-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub index: u32,
    pub generation: u32,
}

/// Hit points of a destructible entity.
#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub current: u16,
    pub max: u16,
}

impl Health {
    pub fn new(max: u16) -> Self {
        Self { current: max, max }
    }

    /// Integrity as the 0..=255 fraction sent to clients.
    pub fn integrity(&self) -> u8 {
        if self.max == 0 {
            return 0;
        }
        ((u32::from(self.current) * 255) / u32::from(self.max)) as u8
    }
}

/// Projectile payload: damage dealt per victim, and the set of entities
/// already hit so repeated contacts stay idempotent.
#[derive(Debug, Clone)]
pub struct Projectile {
    pub damage: u16,
    pub hits: HashSet<EntityId>,
}

impl Projectile {
    pub fn new(damage: u16) -> Self {
        Self {
            damage,
            hits: HashSet::new(),
        }
    }

    /// Marks the victim as hit. Returns false if it was already marked.
    pub fn mark_hit(&mut self, victim: EntityId) -> bool {
        self.hits.insert(victim)
    }
}

/// Latest accepted movement input for a player-controlled entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShipInput {
    pub last_input_time: u64,
    pub direction: Vec3,
    pub rotation: Vec3,
}

/// One simulated object: a spaceship, a projectile, or scenery.
#[derive(Debug)]
pub struct Entity {
    pub body: BodyId,
    pub type_tag: String,
    pub name: String,
    /// Whether the entity is replicated to clients at all.
    pub synchronized: bool,
    pub health: Option<Health>,
    pub projectile: Option<Projectile>,
    /// Seconds until the entity self-destructs.
    pub lifetime: Option<f32>,
    pub input: Option<ShipInput>,
    /// Session that fired or pilots this entity.
    pub owner: Option<SessionHandle>,
}

impl Entity {
    pub fn new(body: BodyId, type_tag: &str, name: &str) -> Self {
        Self {
            body,
            type_tag: type_tag.to_string(),
            name: name.to_string(),
            synchronized: true,
            health: None,
            projectile: None,
            lifetime: None,
            input: None,
            owner: None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// Slot map holding every entity of one arena.
#[derive(Debug, Default)]
pub struct EntityStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) -> EntityId {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entity = Some(entity);
            return EntityId {
                index,
                generation: slot.generation,
            };
        }

        self.slots.push(Slot {
            generation: 0,
            entity: Some(entity),
        });
        EntityId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Removes an entity, bumping the slot generation so the id goes stale.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.entity.is_none() {
            return None;
        }

        let entity = slot.entity.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        entity
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_ref()
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entity.as_mut()
    }

    /// Whether the id still names a live entity.
    pub fn contains(&self, id: EntityId) -> bool {
        self.get(id).is_some()
    }

    /// Resolves a wire-visible slot index back to a live id.
    pub fn id_at(&self, index: u32) -> Option<EntityId> {
        let slot = self.slots.get(index as usize)?;
        slot.entity.as_ref()?;
        Some(EntityId {
            index,
            generation: slot.generation,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entity.as_ref().map(|entity| {
                (
                    EntityId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entity,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut Entity)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entity.as_mut().map(|entity| {
                (
                    EntityId {
                        index: index as u32,
                        generation,
                    },
                    entity,
                )
            })
        })
    }

    /// Ids of every live entity, collected up front so callers can mutate
    /// the store while walking them.
    pub fn ids(&self) -> Vec<EntityId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
