pub mod avatar;
pub mod object;
pub mod ownership;
pub mod resources;
pub mod serialize;
pub mod snapshot;
pub mod store;

pub use avatar::Avatar;
pub use object::{Aabb, ObjectType, WorldMaterial, WorldObject};
pub use ownership::OwnershipDecision;
pub use snapshot::{Pose, SharedSnapshots, SnapshotBuffer, TransformSnapshot};
pub use store::{StoreError, TransformUpdateOutcome, WorldState, WorldStateStore};

use crate::math::{Vec3d, Vec3f};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle for an object or avatar. Both kinds share one allocator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Uid(pub u64);

impl Uid {
    pub const INVALID: Uid = Uid(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connected client or user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// No owner, or an unknown user.
    pub const NONE: ClientId = ClientId(u64::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectState {
    #[default]
    JustCreated,
    Alive,
    Dead,
}

bitflags::bitflags! {
    /// Per-entity dirty bits. The store keeps one set for changes that must be
    /// broadcast and one for changes received from the network.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirtyFlags: u32 {
        const TRANSFORM = 1 << 0;
        const OTHER = 1 << 1;
        const LIGHTMAP_URL = 1 << 2;
        const MODEL_URL = 1 << 3;
        const FLAGS = 1 << 4;
        const PHYSICS_OWNERSHIP = 1 << 5;
        const CONTENT = 1 << 6;
    }
}

impl DirtyFlags {
    /// Bits that require the full record to be resent.
    pub fn needs_full_update(self) -> bool {
        self.intersects(!(DirtyFlags::TRANSFORM | DirtyFlags::PHYSICS_OWNERSHIP))
    }
}

bitflags::bitflags! {
    /// Set by network reads for values that actually changed, so consumers
    /// only reload what they must.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangedFlags: u32 {
        const SCRIPT = 1 << 0;
        const AUDIO_SOURCE = 1 << 1;
        const PHYSICS_OWNER = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectFlags: u32 {
        const COLLIDABLE = 1 << 0;
        const DYNAMIC = 1 << 1;
        const VIDEO_AUTOPLAY = 1 << 2;
        const VIDEO_LOOP = 1 << 3;
        const VIDEO_MUTED = 1 << 4;
    }
}

impl Default for ObjectFlags {
    fn default() -> Self {
        ObjectFlags::COLLIDABLE
    }
}

/// Transform sent by the physics owner of an object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformUpdate {
    pub pos: Vec3d,
    pub axis: Vec3f,
    pub angle: f32,
    pub linear_velocity: Vec3f,
    pub angular_velocity: Vec3f,
    pub send_time: f64,
}

impl TransformUpdate {
    pub fn at_rest(pos: Vec3d, axis: Vec3f, angle: f32, send_time: f64) -> Self {
        Self {
            pos,
            axis,
            angle,
            linear_velocity: crate::math::ZERO_VEC3F,
            angular_velocity: crate::math::ZERO_VEC3F,
            send_time,
        }
    }
}

/// Microseconds since the UNIX epoch.
pub fn current_time_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
