//! One arena: its entities, physics, roster and broadcast schedule.
//!
//! The arena is the authority. Client inputs only ever become forces on the
//! entity a session controls; everything else (spawns, hits, deaths,
//! respawns) is decided here and fanned out to the roster.

use std::collections::{HashMap, HashSet};

use log::{info, warn};
use rand::Rng;

use shared::math::{Quat, Vec3};
use shared::packets::{EntityState, Packet, Prefab, PrefabModel, PrefabSound};
use shared::string_table::NetworkStringTable;
use shared::MAX_CHAT_LINE;

use crate::config::GameConfig;
use crate::entity::{Entity, EntityId, EntityStore, Health, Projectile, ShipInput};
use crate::physics::{Body, PhysicsWorld};
use crate::session::{SessionHandle, SessionRegistry};

const SPACESHIP_MASS: f32 = 42.0;
const SPACESHIP_RADIUS: f32 = 5.0;
const SPACESHIP_LINEAR_DAMPING: f32 = 0.25;
const SPACESHIP_ANGULAR_DAMPING: f32 = 0.4;
const SPACESHIP_HEALTH: u16 = 1000;
const SPACESHIP_THRUST: f32 = 2_500.0;
const SPACESHIP_TORQUE: f32 = 400.0;

const PROJECTILE_SPEED: f32 = 250.0;
const PROJECTILE_SPAWN_OFFSET: f32 = 12.0;
const PROJECTILE_LIFETIME: f32 = 10.0;
const PROJECTILE_RADIUS: f32 = 2.0;
const PROJECTILE_MASS: f32 = 1.0;
const PROJECTILE_DAMAGE_MIN: u16 = 40;
const PROJECTILE_DAMAGE_MAX: u16 = 60;

/// Roster entry for a player present in the arena.
#[derive(Debug)]
struct ArenaPlayer {
    handle: SessionHandle,
    /// Set when the player's ship was destroyed; cleared on respawn.
    death_time: Option<u64>,
}

pub struct Arena {
    pub name: String,
    entities: EntityStore,
    physics: PhysicsWorld,
    players: HashMap<u32, ArenaPlayer>,
    snapshot_id: u16,
    broadcast_accumulator: f32,
    config: GameConfig,
    sounds: Vec<String>,
    prefabs: Vec<Prefab>,
}

impl Arena {
    /// Builds the arena scenery and registers its asset strings.
    pub fn new(name: &str, config: GameConfig, strings: &mut NetworkStringTable) -> Self {
        let spaceship_model = strings.register("spaceship/spaceship.obj");
        let earth_model = strings.register("earth/earth.obj");
        let ball_model = strings.register("ball/ball.obj");
        strings.register("spaceship");
        strings.register("earth");
        strings.register("light");
        strings.register("ball");
        strings.register("plasmabeam");

        let sounds = vec![
            "sounds/laser.ogg".to_string(),
            "sounds/explosion.ogg".to_string(),
        ];

        let prefabs = vec![
            Prefab {
                models: vec![PrefabModel {
                    model_path_id: spaceship_model,
                    position: Vec3::ZERO,
                    rotation: Quat::IDENTITY,
                    scale: Vec3::splat(0.01),
                }],
                sounds: vec![PrefabSound {
                    sound_id: 1,
                    position: Vec3::ZERO,
                }],
                visual_effects: Vec::new(),
            },
            Prefab {
                models: vec![PrefabModel {
                    model_path_id: earth_model,
                    position: Vec3::ZERO,
                    rotation: Quat::IDENTITY,
                    scale: Vec3::splat(20.0),
                }],
                sounds: Vec::new(),
                visual_effects: Vec::new(),
            },
            Prefab {
                models: vec![PrefabModel {
                    model_path_id: ball_model,
                    position: Vec3::ZERO,
                    rotation: Quat::IDENTITY,
                    scale: Vec3::splat(5.0),
                }],
                sounds: Vec::new(),
                visual_effects: Vec::new(),
            },
        ];

        let mut arena = Self {
            name: name.to_string(),
            entities: EntityStore::new(),
            physics: PhysicsWorld::new(),
            players: HashMap::new(),
            snapshot_id: 0,
            broadcast_accumulator: 0.0,
            config,
            sounds,
            prefabs,
        };

        arena.spawn_scenery();
        arena
    }

    fn spawn_scenery(&mut self) {
        let earth_body = self.physics.create_body(Body::new(
            Vec3::FORWARD * 60.0,
            Quat::IDENTITY,
            0.0,
            20.0,
        ));
        self.entities.insert(Entity::new(earth_body, "earth", "The Earth"));

        let light_body = self
            .physics
            .create_body(Body::new(Vec3::UP * 500.0, Quat::IDENTITY, 0.0, 0.0));
        self.entities.insert(Entity::new(light_body, "light", "sun"));

        let ball_body = self
            .physics
            .create_body(Body::new(Vec3::UP * 50.0, Quat::IDENTITY, 100.0, 5.0));
        self.entities.insert(Entity::new(ball_body, "ball", "ball"));
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn snapshot_id(&self) -> u16 {
        self.snapshot_id
    }

    fn broadcast(&self, sessions: &SessionRegistry, packet: &Packet) {
        for player in self.players.values() {
            if let Some(session) = sessions.resolve(player.handle) {
                session.send_packet(packet);
            }
        }
    }

    fn create_entity_packet(&self, id: EntityId, entity: &Entity) -> Option<Packet> {
        let body = self.physics.body(entity.body)?;
        Some(Packet::CreateEntity {
            id: id.index,
            angular_velocity: body.angular_velocity,
            linear_velocity: body.linear_velocity,
            position: body.position,
            rotation: body.rotation,
            name: entity.name.clone(),
            entity_type: entity.type_tag.clone(),
        })
    }

    /// Inserts an entity and announces it to the roster immediately, without
    /// waiting for the next snapshot.
    fn create_entity(&mut self, sessions: &SessionRegistry, entity: Entity) -> EntityId {
        let id = self.entities.insert(entity);

        if let Some(entity) = self.entities.get(id) {
            if entity.synchronized {
                if let Some(packet) = self.create_entity_packet(id, entity) {
                    self.broadcast(sessions, &packet);
                }
            }
        }

        id
    }

    /// Removes an entity, its body, and announces the removal immediately.
    fn delete_entity(&mut self, sessions: &SessionRegistry, id: EntityId) {
        let Some(entity) = self.entities.remove(id) else {
            return;
        };

        self.physics.remove_body(entity.body);

        if entity.synchronized {
            self.broadcast(sessions, &Packet::DeleteEntity { id: id.index });
        }
    }

    fn create_spaceship(
        &mut self,
        sessions: &SessionRegistry,
        owner: SessionHandle,
        name: &str,
        position: Vec3,
    ) -> EntityId {
        let mut body = Body::new(position, Quat::IDENTITY, SPACESHIP_MASS, SPACESHIP_RADIUS);
        body.linear_damping = SPACESHIP_LINEAR_DAMPING;
        body.angular_damping = SPACESHIP_ANGULAR_DAMPING;
        let body = self.physics.create_body(body);

        let mut entity = Entity::new(body, "spaceship", name);
        entity.health = Some(Health::new(SPACESHIP_HEALTH));
        entity.input = Some(ShipInput::default());
        entity.owner = Some(owner);

        self.create_entity(sessions, entity)
    }

    fn create_plasma_projectile(
        &mut self,
        sessions: &SessionRegistry,
        owner: SessionHandle,
        ship: EntityId,
    ) -> Option<EntityId> {
        let ship_body = self.entities.get(ship)?.body;
        let body = self.physics.body(ship_body)?;

        let forward = body.rotation.forward();
        let position = body.position + forward * PROJECTILE_SPAWN_OFFSET;
        let velocity = forward * PROJECTILE_SPEED;
        let rotation = body.rotation;

        let mut projectile_body = Body::new(position, rotation, PROJECTILE_MASS, PROJECTILE_RADIUS);
        projectile_body.linear_velocity = velocity;
        let projectile_body = self.physics.create_body(projectile_body);

        let damage = rand::thread_rng().gen_range(PROJECTILE_DAMAGE_MIN..=PROJECTILE_DAMAGE_MAX);

        let mut entity = Entity::new(projectile_body, "plasmabeam", "plasmabeam");
        entity.projectile = Some(Projectile::new(damage));
        entity.lifetime = Some(PROJECTILE_LIFETIME);
        entity.owner = Some(owner);

        Some(self.create_entity(sessions, entity))
    }

    fn spawn_position(&self) -> Vec3 {
        Vec3::new(self.players.len() as f32 * 30.0 - 60.0, 0.0, -40.0)
    }

    /// Runs the join sequence: asset tables, the full entity burst, then the
    /// player's own ship once it is on the roster.
    pub fn handle_player_join(&mut self, sessions: &mut SessionRegistry, peer_id: u32) {
        let Some(session) = sessions.get(peer_id) else {
            return;
        };
        let handle = session.handle();
        let display_name = session.display_name.clone();

        session.send_packet(&Packet::ArenaSounds {
            start_id: 0,
            sounds: self.sounds.clone(),
        });
        session.send_packet(&Packet::ArenaPrefabs {
            start_id: 0,
            prefabs: self.prefabs.clone(),
        });

        // Full state burst before the roster add, so the newcomer never sees
        // a snapshot referencing an entity it has not been told about.
        for (id, entity) in self.entities.iter() {
            if !entity.synchronized {
                continue;
            }
            if let Some(packet) = self.create_entity_packet(id, entity) {
                session.send_packet(&packet);
            }
        }

        self.players.insert(
            peer_id,
            ArenaPlayer {
                handle,
                death_time: None,
            },
        );

        let ship = self.create_spaceship(sessions, handle, &display_name, self.spawn_position());

        if let Some(session) = sessions.resolve_mut(handle) {
            session.controlled_entity = Some(ship);
            session.send_packet(&Packet::ControlEntity { id: ship.index });
        }

        info!("{} joined arena {:?}", display_name, self.name);
        self.dispatch_chat(sessions, &format!("{} has joined", display_name));
    }

    /// Removes a departing player and their ship.
    pub fn handle_player_leave(&mut self, sessions: &mut SessionRegistry, peer_id: u32) {
        let Some(player) = self.players.remove(&peer_id) else {
            return;
        };

        let mut display_name = String::new();
        let mut controlled = None;
        if let Some(session) = sessions.resolve_mut(player.handle) {
            display_name = session.display_name.clone();
            controlled = session.controlled_entity.take();
            session.arena_index = None;
        }

        if let Some(ship) = controlled {
            self.delete_entity(sessions, ship);
        }

        // Orphan any projectiles the player still owns so later hits cannot
        // resolve against a stale handle.
        for (_, entity) in self.entities.iter_mut() {
            if entity.owner == Some(player.handle) {
                entity.owner = None;
            }
        }

        if !display_name.is_empty() {
            info!("{} left arena {:?}", display_name, self.name);
            self.dispatch_chat(sessions, &format!("{} has left", display_name));
        }
    }

    /// Stores a movement input on the player's ship. The caller has already
    /// checked staleness and finiteness.
    pub fn handle_movement_input(
        &mut self,
        ship: EntityId,
        input_time: u64,
        direction: Vec3,
        rotation: Vec3,
    ) {
        if let Some(entity) = self.entities.get_mut(ship) {
            if let Some(input) = entity.input.as_mut() {
                input.last_input_time = input_time;
                input.direction = direction.clamp_components(-1.0, 1.0);
                input.rotation = rotation.clamp_components(-1.0, 1.0);
            }
        }
    }

    /// Fires a projectile from the player's ship, subject to the shot
    /// cooldown.
    pub fn handle_player_shoot(
        &mut self,
        sessions: &mut SessionRegistry,
        peer_id: u32,
        now_ms: u64,
    ) {
        let Some(session) = sessions.get_mut(peer_id) else {
            return;
        };
        let Some(ship) = session.controlled_entity else {
            return;
        };

        if now_ms.saturating_sub(session.last_shoot_time) < self.config.shoot_cooldown_ms {
            return;
        }
        session.last_shoot_time = now_ms;

        let handle = session.handle();
        self.create_plasma_projectile(sessions, handle, ship);
    }

    /// Relays a chat line to everyone, truncating oversized input.
    pub fn dispatch_chat(&self, sessions: &SessionRegistry, message: &str) {
        let message = if message.len() > MAX_CHAT_LINE {
            let mut cut = MAX_CHAT_LINE - 3;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &message[..cut])
        } else {
            message.to_string()
        };

        self.broadcast(sessions, &Packet::ChatMessage { message });
    }

    /// Advances the simulation by `dt` seconds and emits whatever the tick
    /// produced: hits, deaths, respawns, and due snapshots.
    pub fn update(&mut self, sessions: &mut SessionRegistry, now_ms: u64, dt: f32) {
        self.apply_ship_inputs();

        let contacts = self.physics.step(dt);
        self.resolve_projectile_contacts(sessions, now_ms, &contacts);
        self.expire_lifetimes(sessions, dt);
        self.respawn_dead_players(sessions, now_ms);

        self.broadcast_accumulator += dt;
        while self.broadcast_accumulator >= self.config.broadcast_interval {
            self.broadcast_accumulator -= self.config.broadcast_interval;
            self.broadcast_snapshot(sessions, now_ms);
        }
    }

    fn apply_ship_inputs(&mut self) {
        let mut forces = Vec::new();

        for (_, entity) in self.entities.iter() {
            let Some(input) = entity.input.as_ref() else {
                continue;
            };
            let Some(body) = self.physics.body(entity.body) else {
                continue;
            };

            let force = body.rotation.rotate(input.direction) * SPACESHIP_THRUST;
            let torque = input.rotation * SPACESHIP_TORQUE;
            forces.push((entity.body, force, torque));
        }

        for (body, force, torque) in forces {
            self.physics.apply_force(body, force);
            self.physics.apply_torque(body, torque);
        }
    }

    fn resolve_projectile_contacts(
        &mut self,
        sessions: &mut SessionRegistry,
        now_ms: u64,
        contacts: &[crate::physics::Contact],
    ) {
        let body_to_entity: HashMap<_, _> = self
            .entities
            .iter()
            .map(|(id, entity)| (entity.body, id))
            .collect();

        let mut spent_projectiles: HashSet<EntityId> = HashSet::new();
        let mut destroyed: Vec<(EntityId, Option<SessionHandle>)> = Vec::new();

        for contact in contacts {
            let (Some(&a), Some(&b)) = (
                body_to_entity.get(&contact.first),
                body_to_entity.get(&contact.second),
            ) else {
                continue;
            };

            for (projectile_id, victim_id) in [(a, b), (b, a)] {
                if !self.apply_projectile_hit(sessions, projectile_id, victim_id) {
                    continue;
                }
                spent_projectiles.insert(projectile_id);

                let dead = self
                    .entities
                    .get(victim_id)
                    .and_then(|e| e.health)
                    .is_some_and(|h| h.current == 0);
                if dead {
                    let killer = self.entities.get(projectile_id).and_then(|e| e.owner);
                    destroyed.push((victim_id, killer));
                }
            }
        }

        for id in spent_projectiles {
            self.delete_entity(sessions, id);
        }

        for (victim_id, killer) in destroyed {
            self.destroy_ship(sessions, victim_id, killer, now_ms);
        }
    }

    /// Applies one projectile-versus-entity contact. Returns true if the
    /// projectile hit something it had not hit before.
    fn apply_projectile_hit(
        &mut self,
        sessions: &SessionRegistry,
        projectile_id: EntityId,
        victim_id: EntityId,
    ) -> bool {
        let owner = match self.entities.get(projectile_id) {
            Some(entity) if entity.projectile.is_some() => entity.owner,
            _ => return false,
        };

        // A projectile never hits its own shooter or their other shots.
        let victim_owner = self.entities.get(victim_id).and_then(|e| e.owner);
        if owner.is_some() && owner == victim_owner {
            return false;
        }

        let Some(projectile) = self
            .entities
            .get_mut(projectile_id)
            .and_then(|e| e.projectile.as_mut())
        else {
            return false;
        };

        // Repeated contacts with the same victim are a single hit.
        if !projectile.mark_hit(victim_id) {
            return false;
        }
        let damage = projectile.damage;

        let impulse = self
            .entities
            .get(projectile_id)
            .and_then(|e| self.physics.body(e.body))
            .map(|body| {
                let velocity = body.linear_velocity;
                velocity.normalized() * (velocity.length_squared() * 0.5)
            });

        let Some(victim) = self.entities.get_mut(victim_id) else {
            return true;
        };
        let victim_body = victim.body;

        if let Some(health) = victim.health.as_mut() {
            health.current = health.current.saturating_sub(damage);
            let integrity = health.integrity();

            if let Some(owner) = victim.owner {
                if let Some(session) = sessions.resolve(owner) {
                    session.send_packet(&Packet::IntegrityUpdate { integrity });
                }
            }
        }

        if let Some(impulse) = impulse {
            self.physics.apply_impulse(victim_body, impulse);
        }

        true
    }

    fn destroy_ship(
        &mut self,
        sessions: &mut SessionRegistry,
        ship: EntityId,
        killer: Option<SessionHandle>,
        now_ms: u64,
    ) {
        if !self.entities.contains(ship) {
            return;
        }

        let victim_owner = self.entities.get(ship).and_then(|e| e.owner);
        let victim_name = self
            .entities
            .get(ship)
            .map(|e| e.name.clone())
            .unwrap_or_default();

        self.delete_entity(sessions, ship);

        if let Some(owner) = victim_owner {
            if let Some(session) = sessions.resolve_mut(owner) {
                session.controlled_entity = None;
            }
            if let Some(player) = self.players.get_mut(&owner.peer_id) {
                player.death_time = Some(now_ms);
            }
        }

        let killer_name = killer
            .and_then(|handle| sessions.resolve(handle))
            .map(|session| session.display_name.clone());

        let line = match killer_name {
            Some(killer_name) => format!("{} has destroyed {}", killer_name, victim_name),
            None => format!("{} has been destroyed", victim_name),
        };
        self.dispatch_chat(sessions, &line);
    }

    fn expire_lifetimes(&mut self, sessions: &SessionRegistry, dt: f32) {
        let mut expired = Vec::new();

        for (id, entity) in self.entities.iter_mut() {
            if let Some(lifetime) = entity.lifetime.as_mut() {
                *lifetime -= dt;
                if *lifetime <= 0.0 {
                    expired.push(id);
                }
            }
        }

        for id in expired {
            self.delete_entity(sessions, id);
        }
    }

    fn respawn_dead_players(&mut self, sessions: &mut SessionRegistry, now_ms: u64) {
        let due: Vec<(u32, SessionHandle)> = self
            .players
            .iter()
            .filter_map(|(&peer_id, player)| {
                let death_time = player.death_time?;
                (now_ms.saturating_sub(death_time) >= self.config.respawn_cooldown_ms)
                    .then_some((peer_id, player.handle))
            })
            .collect();

        for (peer_id, handle) in due {
            let Some(session) = sessions.resolve(handle) else {
                self.players.remove(&peer_id);
                continue;
            };
            let display_name = session.display_name.clone();

            let ship =
                self.create_spaceship(sessions, handle, &display_name, self.spawn_position());

            if let Some(player) = self.players.get_mut(&peer_id) {
                player.death_time = None;
            }
            if let Some(session) = sessions.resolve_mut(handle) {
                session.controlled_entity = Some(ship);
                session.send_packet(&Packet::ControlEntity { id: ship.index });
            } else {
                warn!("respawned ship for a vanished session; removing it");
                self.delete_entity(sessions, ship);
            }
        }
    }

    fn broadcast_snapshot(&mut self, sessions: &SessionRegistry, now_ms: u64) {
        self.snapshot_id = self.snapshot_id.wrapping_add(1);

        let entities: Vec<EntityState> = self
            .entities
            .iter()
            .filter(|(_, entity)| entity.synchronized)
            .filter_map(|(id, entity)| {
                let body = self.physics.body(entity.body)?;
                Some(EntityState {
                    id: id.index,
                    angular_velocity: body.angular_velocity,
                    linear_velocity: body.linear_velocity,
                    position: body.position,
                    rotation: body.rotation,
                })
            })
            .collect();

        for player in self.players.values() {
            let Some(session) = sessions.resolve(player.handle) else {
                continue;
            };

            session.send_packet(&Packet::ArenaState {
                state_id: self.snapshot_id,
                server_time: now_ms,
                last_processed_input_time: session.last_input_time,
                entities: entities.clone(),
            });
        }
    }
}
