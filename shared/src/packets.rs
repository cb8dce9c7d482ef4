//! Packet catalog and per-type serialization.
//!
//! Every packet has a fixed, versionless field order: a one-byte type
//! discriminant followed by its fields in declaration order. Unknown or
//! future discriminants are a protocol violation and terminate the
//! connection.

use crate::codec::{FormatError, PacketReader, PacketWriter};
use crate::math::{Quat, Vec3};

/// Why a login attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureReason {
    AccountNotFound,
    PasswordMismatch,
    ServerError,
}

impl LoginFailureReason {
    fn to_u8(self) -> u8 {
        match self {
            LoginFailureReason::AccountNotFound => 0,
            LoginFailureReason::PasswordMismatch => 1,
            LoginFailureReason::ServerError => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self, FormatError> {
        match value {
            0 => Ok(LoginFailureReason::AccountNotFound),
            1 => Ok(LoginFailureReason::PasswordMismatch),
            2 => Ok(LoginFailureReason::ServerError),
            other => Err(FormatError::InvalidEnumValue(other)),
        }
    }
}

/// Why a registration attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFailureReason {
    EmailAlreadyTaken,
    LoginAlreadyTaken,
    ServerError,
}

impl RegisterFailureReason {
    fn to_u8(self) -> u8 {
        match self {
            RegisterFailureReason::EmailAlreadyTaken => 0,
            RegisterFailureReason::LoginAlreadyTaken => 1,
            RegisterFailureReason::ServerError => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self, FormatError> {
        match value {
            0 => Ok(RegisterFailureReason::EmailAlreadyTaken),
            1 => Ok(RegisterFailureReason::LoginAlreadyTaken),
            2 => Ok(RegisterFailureReason::ServerError),
            other => Err(FormatError::InvalidEnumValue(other)),
        }
    }
}

/// Why a spaceship rename was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSpaceshipFailureReason {
    NotFound,
    ServerError,
}

impl UpdateSpaceshipFailureReason {
    fn to_u8(self) -> u8 {
        match self {
            UpdateSpaceshipFailureReason::NotFound => 0,
            UpdateSpaceshipFailureReason::ServerError => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self, FormatError> {
        match value {
            0 => Ok(UpdateSpaceshipFailureReason::NotFound),
            1 => Ok(UpdateSpaceshipFailureReason::ServerError),
            other => Err(FormatError::InvalidEnumValue(other)),
        }
    }
}

/// Synchronized transform of one entity inside an [`Packet::ArenaState`]
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub id: u32,
    pub angular_velocity: Vec3,
    pub linear_velocity: Vec3,
    pub position: Vec3,
    pub rotation: Quat,
}

/// A model attached to a prefab, referenced by its network string index.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefabModel {
    pub model_path_id: u32,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

/// A looping sound attached to a prefab, referenced into the arena sound
/// table.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefabSound {
    pub sound_id: u32,
    pub position: Vec3,
}

/// A visual effect attached to a prefab, referenced by its network string
/// index.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefabVisualEffect {
    pub effect_name_id: u32,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

/// Client-side instantiation recipe for one entity type tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prefab {
    pub models: Vec<PrefabModel>,
    pub sounds: Vec<PrefabSound>,
    pub visual_effects: Vec<PrefabVisualEffect>,
}

/// Every packet exchanged between server and client. The direction of each
/// type is fixed; receiving a server-to-client packet on the server is a
/// protocol violation.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ArenaPrefabs {
        start_id: u32,
        prefabs: Vec<Prefab>,
    },
    ArenaSounds {
        start_id: u32,
        sounds: Vec<String>,
    },
    ArenaState {
        state_id: u16,
        server_time: u64,
        last_processed_input_time: u64,
        entities: Vec<EntityState>,
    },
    ChatMessage {
        message: String,
    },
    ControlEntity {
        id: u32,
    },
    CreateEntity {
        id: u32,
        angular_velocity: Vec3,
        linear_velocity: Vec3,
        position: Vec3,
        rotation: Quat,
        name: String,
        entity_type: String,
    },
    DeleteEntity {
        id: u32,
    },
    IntegrityUpdate {
        integrity: u8,
    },
    JoinArena {
        arena_index: u32,
    },
    Login {
        login: String,
        password_hash: String,
    },
    LoginFailure {
        reason: LoginFailureReason,
    },
    LoginSuccess,
    NetworkStrings {
        start_id: u32,
        strings: Vec<String>,
    },
    PlayerChat {
        text: String,
    },
    PlayerMovement {
        input_time: u64,
        direction: Vec3,
        rotation: Vec3,
    },
    PlayerShoot,
    Register {
        login: String,
        email: String,
        password_hash: String,
    },
    RegisterFailure {
        reason: RegisterFailureReason,
    },
    RegisterSuccess,
    TimeSyncRequest {
        request_id: u8,
    },
    TimeSyncResponse {
        request_id: u8,
        server_time: u64,
    },
    UpdateSpaceship {
        name: String,
        new_name: String,
    },
    UpdateSpaceshipSuccess,
    UpdateSpaceshipFailure {
        reason: UpdateSpaceshipFailureReason,
    },
}

// Wire discriminants, in declaration order. Never renumbered.
const TYPE_ARENA_PREFABS: u8 = 0;
const TYPE_ARENA_SOUNDS: u8 = 1;
const TYPE_ARENA_STATE: u8 = 2;
const TYPE_CHAT_MESSAGE: u8 = 3;
const TYPE_CONTROL_ENTITY: u8 = 4;
const TYPE_CREATE_ENTITY: u8 = 5;
const TYPE_DELETE_ENTITY: u8 = 6;
const TYPE_INTEGRITY_UPDATE: u8 = 7;
const TYPE_JOIN_ARENA: u8 = 8;
const TYPE_LOGIN: u8 = 9;
const TYPE_LOGIN_FAILURE: u8 = 10;
const TYPE_LOGIN_SUCCESS: u8 = 11;
const TYPE_NETWORK_STRINGS: u8 = 12;
const TYPE_PLAYER_CHAT: u8 = 13;
const TYPE_PLAYER_MOVEMENT: u8 = 14;
const TYPE_PLAYER_SHOOT: u8 = 15;
const TYPE_REGISTER: u8 = 16;
const TYPE_REGISTER_FAILURE: u8 = 17;
const TYPE_REGISTER_SUCCESS: u8 = 18;
const TYPE_TIME_SYNC_REQUEST: u8 = 19;
const TYPE_TIME_SYNC_RESPONSE: u8 = 20;
const TYPE_UPDATE_SPACESHIP: u8 = 21;
const TYPE_UPDATE_SPACESHIP_SUCCESS: u8 = 22;
const TYPE_UPDATE_SPACESHIP_FAILURE: u8 = 23;

impl Packet {
    /// Serializes the packet into a body: type discriminant then fields in
    /// declaration order.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();

        match self {
            Packet::ArenaPrefabs { start_id, prefabs } => {
                w.write_u8(TYPE_ARENA_PREFABS);
                w.write_var_u32(*start_id);
                w.write_var_u32(prefabs.len() as u32);
                for prefab in prefabs {
                    write_prefab(&mut w, prefab);
                }
            }
            Packet::ArenaSounds { start_id, sounds } => {
                w.write_u8(TYPE_ARENA_SOUNDS);
                w.write_var_u32(*start_id);
                w.write_var_u32(sounds.len() as u32);
                for sound in sounds {
                    w.write_string(sound);
                }
            }
            Packet::ArenaState {
                state_id,
                server_time,
                last_processed_input_time,
                entities,
            } => {
                w.write_u8(TYPE_ARENA_STATE);
                w.write_var_u16(*state_id);
                w.write_var_u64(*server_time);
                w.write_var_u64(*last_processed_input_time);
                w.write_var_u32(entities.len() as u32);
                for entity in entities {
                    w.write_var_u32(entity.id);
                    w.write_vec3(entity.angular_velocity);
                    w.write_vec3(entity.linear_velocity);
                    w.write_vec3(entity.position);
                    w.write_quat(entity.rotation);
                }
            }
            Packet::ChatMessage { message } => {
                w.write_u8(TYPE_CHAT_MESSAGE);
                w.write_string(message);
            }
            Packet::ControlEntity { id } => {
                w.write_u8(TYPE_CONTROL_ENTITY);
                w.write_var_u32(*id);
            }
            Packet::CreateEntity {
                id,
                angular_velocity,
                linear_velocity,
                position,
                rotation,
                name,
                entity_type,
            } => {
                w.write_u8(TYPE_CREATE_ENTITY);
                w.write_var_u32(*id);
                w.write_vec3(*angular_velocity);
                w.write_vec3(*linear_velocity);
                w.write_vec3(*position);
                w.write_quat(*rotation);
                w.write_string(name);
                w.write_string(entity_type);
            }
            Packet::DeleteEntity { id } => {
                w.write_u8(TYPE_DELETE_ENTITY);
                w.write_var_u32(*id);
            }
            Packet::IntegrityUpdate { integrity } => {
                w.write_u8(TYPE_INTEGRITY_UPDATE);
                w.write_u8(*integrity);
            }
            Packet::JoinArena { arena_index } => {
                w.write_u8(TYPE_JOIN_ARENA);
                w.write_var_u32(*arena_index);
            }
            Packet::Login { login, password_hash } => {
                w.write_u8(TYPE_LOGIN);
                w.write_string(login);
                w.write_string(password_hash);
            }
            Packet::LoginFailure { reason } => {
                w.write_u8(TYPE_LOGIN_FAILURE);
                w.write_u8(reason.to_u8());
            }
            Packet::LoginSuccess => {
                w.write_u8(TYPE_LOGIN_SUCCESS);
            }
            Packet::NetworkStrings { start_id, strings } => {
                w.write_u8(TYPE_NETWORK_STRINGS);
                w.write_var_u32(*start_id);
                w.write_var_u32(strings.len() as u32);
                for s in strings {
                    w.write_string(s);
                }
            }
            Packet::PlayerChat { text } => {
                w.write_u8(TYPE_PLAYER_CHAT);
                w.write_string(text);
            }
            Packet::PlayerMovement {
                input_time,
                direction,
                rotation,
            } => {
                w.write_u8(TYPE_PLAYER_MOVEMENT);
                w.write_var_u64(*input_time);
                w.write_vec3(*direction);
                w.write_vec3(*rotation);
            }
            Packet::PlayerShoot => {
                w.write_u8(TYPE_PLAYER_SHOOT);
            }
            Packet::Register {
                login,
                email,
                password_hash,
            } => {
                w.write_u8(TYPE_REGISTER);
                w.write_string(login);
                w.write_string(email);
                w.write_string(password_hash);
            }
            Packet::RegisterFailure { reason } => {
                w.write_u8(TYPE_REGISTER_FAILURE);
                w.write_u8(reason.to_u8());
            }
            Packet::RegisterSuccess => {
                w.write_u8(TYPE_REGISTER_SUCCESS);
            }
            Packet::TimeSyncRequest { request_id } => {
                w.write_u8(TYPE_TIME_SYNC_REQUEST);
                w.write_u8(*request_id);
            }
            Packet::TimeSyncResponse {
                request_id,
                server_time,
            } => {
                w.write_u8(TYPE_TIME_SYNC_RESPONSE);
                w.write_u8(*request_id);
                w.write_var_u64(*server_time);
            }
            Packet::UpdateSpaceship { name, new_name } => {
                w.write_u8(TYPE_UPDATE_SPACESHIP);
                w.write_string(name);
                w.write_string(new_name);
            }
            Packet::UpdateSpaceshipSuccess => {
                w.write_u8(TYPE_UPDATE_SPACESHIP_SUCCESS);
            }
            Packet::UpdateSpaceshipFailure { reason } => {
                w.write_u8(TYPE_UPDATE_SPACESHIP_FAILURE);
                w.write_u8(reason.to_u8());
            }
        }

        w.into_bytes()
    }

    /// Decodes a packet body produced by [`Packet::encode`].
    pub fn decode(data: &[u8]) -> Result<Packet, FormatError> {
        let mut r = PacketReader::new(data);

        let packet = match r.read_u8()? {
            TYPE_ARENA_PREFABS => {
                let start_id = r.read_var_u32()?;
                let count = r.read_var_u32()? as usize;
                let mut prefabs = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    prefabs.push(read_prefab(&mut r)?);
                }
                Packet::ArenaPrefabs { start_id, prefabs }
            }
            TYPE_ARENA_SOUNDS => {
                let start_id = r.read_var_u32()?;
                let count = r.read_var_u32()? as usize;
                let mut sounds = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    sounds.push(r.read_string()?);
                }
                Packet::ArenaSounds { start_id, sounds }
            }
            TYPE_ARENA_STATE => {
                let state_id = r.read_var_u16()?;
                let server_time = r.read_var_u64()?;
                let last_processed_input_time = r.read_var_u64()?;
                let count = r.read_var_u32()? as usize;
                let mut entities = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    entities.push(EntityState {
                        id: r.read_var_u32()?,
                        angular_velocity: r.read_vec3()?,
                        linear_velocity: r.read_vec3()?,
                        position: r.read_vec3()?,
                        rotation: r.read_quat()?,
                    });
                }
                Packet::ArenaState {
                    state_id,
                    server_time,
                    last_processed_input_time,
                    entities,
                }
            }
            TYPE_CHAT_MESSAGE => Packet::ChatMessage {
                message: r.read_string()?,
            },
            TYPE_CONTROL_ENTITY => Packet::ControlEntity {
                id: r.read_var_u32()?,
            },
            TYPE_CREATE_ENTITY => Packet::CreateEntity {
                id: r.read_var_u32()?,
                angular_velocity: r.read_vec3()?,
                linear_velocity: r.read_vec3()?,
                position: r.read_vec3()?,
                rotation: r.read_quat()?,
                name: r.read_string()?,
                entity_type: r.read_string()?,
            },
            TYPE_DELETE_ENTITY => Packet::DeleteEntity {
                id: r.read_var_u32()?,
            },
            TYPE_INTEGRITY_UPDATE => Packet::IntegrityUpdate {
                integrity: r.read_u8()?,
            },
            TYPE_JOIN_ARENA => Packet::JoinArena {
                arena_index: r.read_var_u32()?,
            },
            TYPE_LOGIN => Packet::Login {
                login: r.read_string()?,
                password_hash: r.read_string()?,
            },
            TYPE_LOGIN_FAILURE => Packet::LoginFailure {
                reason: LoginFailureReason::from_u8(r.read_u8()?)?,
            },
            TYPE_LOGIN_SUCCESS => Packet::LoginSuccess,
            TYPE_NETWORK_STRINGS => {
                let start_id = r.read_var_u32()?;
                let count = r.read_var_u32()? as usize;
                let mut strings = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    strings.push(r.read_string()?);
                }
                Packet::NetworkStrings { start_id, strings }
            }
            TYPE_PLAYER_CHAT => Packet::PlayerChat {
                text: r.read_string()?,
            },
            TYPE_PLAYER_MOVEMENT => Packet::PlayerMovement {
                input_time: r.read_var_u64()?,
                direction: r.read_vec3()?,
                rotation: r.read_vec3()?,
            },
            TYPE_PLAYER_SHOOT => Packet::PlayerShoot,
            TYPE_REGISTER => Packet::Register {
                login: r.read_string()?,
                email: r.read_string()?,
                password_hash: r.read_string()?,
            },
            TYPE_REGISTER_FAILURE => Packet::RegisterFailure {
                reason: RegisterFailureReason::from_u8(r.read_u8()?)?,
            },
            TYPE_REGISTER_SUCCESS => Packet::RegisterSuccess,
            TYPE_TIME_SYNC_REQUEST => Packet::TimeSyncRequest {
                request_id: r.read_u8()?,
            },
            TYPE_TIME_SYNC_RESPONSE => Packet::TimeSyncResponse {
                request_id: r.read_u8()?,
                server_time: r.read_var_u64()?,
            },
            TYPE_UPDATE_SPACESHIP => Packet::UpdateSpaceship {
                name: r.read_string()?,
                new_name: r.read_string()?,
            },
            TYPE_UPDATE_SPACESHIP_SUCCESS => Packet::UpdateSpaceshipSuccess,
            TYPE_UPDATE_SPACESHIP_FAILURE => Packet::UpdateSpaceshipFailure {
                reason: UpdateSpaceshipFailureReason::from_u8(r.read_u8()?)?,
            },
            unknown => return Err(FormatError::UnknownPacketType(unknown)),
        };

        Ok(packet)
    }
}

fn write_prefab(w: &mut PacketWriter, prefab: &Prefab) {
    w.write_var_u32(prefab.models.len() as u32);
    for model in &prefab.models {
        w.write_var_u32(model.model_path_id);
        w.write_vec3(model.position);
        w.write_quat(model.rotation);
        w.write_vec3(model.scale);
    }

    w.write_var_u32(prefab.sounds.len() as u32);
    for sound in &prefab.sounds {
        w.write_var_u32(sound.sound_id);
        w.write_vec3(sound.position);
    }

    w.write_var_u32(prefab.visual_effects.len() as u32);
    for effect in &prefab.visual_effects {
        w.write_var_u32(effect.effect_name_id);
        w.write_vec3(effect.position);
        w.write_quat(effect.rotation);
        w.write_vec3(effect.scale);
    }
}

fn read_prefab(r: &mut PacketReader) -> Result<Prefab, FormatError> {
    let model_count = r.read_var_u32()? as usize;
    let mut models = Vec::with_capacity(model_count.min(64));
    for _ in 0..model_count {
        models.push(PrefabModel {
            model_path_id: r.read_var_u32()?,
            position: r.read_vec3()?,
            rotation: r.read_quat()?,
            scale: r.read_vec3()?,
        });
    }

    let sound_count = r.read_var_u32()? as usize;
    let mut sounds = Vec::with_capacity(sound_count.min(64));
    for _ in 0..sound_count {
        sounds.push(PrefabSound {
            sound_id: r.read_var_u32()?,
            position: r.read_vec3()?,
        });
    }

    let effect_count = r.read_var_u32()? as usize;
    let mut visual_effects = Vec::with_capacity(effect_count.min(64));
    for _ in 0..effect_count {
        visual_effects.push(PrefabVisualEffect {
            effect_name_id: r.read_var_u32()?,
            position: r.read_vec3()?,
            rotation: r.read_quat()?,
            scale: r.read_vec3()?,
        });
    }

    Ok(Prefab {
        models,
        sounds,
        visual_effects,
    })
}
