//! Protocol and math primitives shared between the arena server and its clients.
//!
//! Everything that must stay bit-exact on both ends of the wire lives here:
//! the variable-length integer codec, the packet catalog with its fixed field
//! order, the network string table used to intern asset paths, and the small
//! vector/quaternion types carried inside packets.

pub mod codec;
pub mod math;
pub mod packets;
pub mod string_table;

pub use codec::{FormatError, PacketReader, PacketWriter};
pub use math::{Quat, Vec3};
pub use packets::{
    EntityState, LoginFailureReason, Packet, Prefab, RegisterFailureReason,
    UpdateSpaceshipFailureReason,
};
pub use string_table::NetworkStringTable;

/// Maximum size of a single framed packet body, in bytes.
///
/// Frames announcing a larger body are a protocol violation and terminate
/// the connection before any allocation happens.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Login names are 1..=20 characters.
pub const MAX_LOGIN_LENGTH: usize = 20;

/// Email addresses are 1..=40 characters.
pub const MAX_EMAIL_LENGTH: usize = 40;

/// Client-side password hashes are 1..=128 characters.
pub const MAX_PASSWORD_HASH_LENGTH: usize = 128;

/// Chat lines longer than this are truncated with an ellipsis.
pub const MAX_CHAT_LINE: usize = 255;

/// Spaceship names are 1..=64 characters.
pub const MAX_SPACESHIP_NAME_LENGTH: usize = 64;
