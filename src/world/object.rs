use super::snapshot::{SharedSnapshots, TransformSnapshot};
use super::{
    ChangedFlags, ClientId, DirtyFlags, ObjectFlags, ObjectState, TransformUpdate, Uid, current_time_micros,
};
use crate::math::{self, DEFAULT_AXIS, UNIT_SCALE, Vec3d, Vec3f, ZERO_VEC3D, ZERO_VEC3F};
use crate::voxel::{CodecError, VoxelCodec, VoxelGroup};
use crate::wire::ProtocolError;
use cgmath::Vector3;
use once_cell::sync::OnceCell;

pub const DEFAULT_MASS: f32 = 50.0;
pub const DEFAULT_FRICTION: f32 = 0.5;
pub const DEFAULT_RESTITUTION: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectType {
    #[default]
    Generic,
    Hypercard,
    VoxelGroup,
    Spotlight,
    WebView,
    Video,
    Text,
}

impl ObjectType {
    pub fn as_u32(self) -> u32 {
        match self {
            ObjectType::Generic => 0,
            ObjectType::Hypercard => 1,
            ObjectType::VoxelGroup => 2,
            ObjectType::Spotlight => 3,
            ObjectType::WebView => 4,
            ObjectType::Video => 5,
            ObjectType::Text => 6,
        }
    }
}

impl TryFrom<u32> for ObjectType {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => ObjectType::Generic,
            1 => ObjectType::Hypercard,
            2 => ObjectType::VoxelGroup,
            3 => ObjectType::Spotlight,
            4 => ObjectType::WebView,
            5 => ObjectType::Video,
            6 => ObjectType::Text,
            other => return Err(ProtocolError::InvalidObjectType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldMaterial {
    pub colour_rgb: [f32; 3],
    pub colour_texture_url: String,
    pub roughness: f32,
    pub metallic_fraction: f32,
    pub opacity: f32,
    pub emission_lum_flux: f32,
    pub tex_matrix: [f32; 4],
    pub flags: u32,
}

impl Default for WorldMaterial {
    fn default() -> Self {
        Self {
            colour_rgb: [0.85, 0.85, 0.85],
            colour_texture_url: String::new(),
            roughness: 0.5,
            metallic_fraction: 0.0,
            opacity: 1.0,
            emission_lum_flux: 0.0,
            tex_matrix: [1.0, 0.0, 0.0, 1.0],
            flags: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3f,
    pub max: Vec3f,
}

impl Aabb {
    pub fn new(min: Vec3f, max: Vec3f) -> Self {
        Self { min, max }
    }

    /// Box of half extent `|scale| / 2` around `pos`.
    pub fn around(pos: Vec3d, scale: Vec3f) -> Self {
        let centre = Vector3::new(pos.x as f32, pos.y as f32, pos.z as f32);
        let half = Vector3::new(scale.x.abs(), scale.y.abs(), scale.z.abs()) * 0.5;
        Self {
            min: centre - half,
            max: centre + half,
        }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self {
            min: ZERO_VEC3F,
            max: ZERO_VEC3F,
        }
    }
}

/// One placed object in a world.
///
/// `compressed_voxels` is authoritative. The decompressed group is derived on
/// first access and dropped whenever the compressed bytes change.
#[derive(Debug, Clone)]
pub struct WorldObject {
    pub uid: Uid,
    pub object_type: ObjectType,

    pub model_url: String,
    pub materials: Vec<WorldMaterial>,
    pub lightmap_url: String,
    compressed_voxels: Vec<u8>,
    voxel_cache: OnceCell<VoxelGroup>,
    pub max_model_lod_level: i32,

    pub script: String,
    pub content: String,
    pub target_url: String,
    pub audio_source_url: String,
    pub audio_volume: f32,
    pub flags: ObjectFlags,

    pub pos: Vec3d,
    pub axis: Vec3f,
    pub angle: f32,
    pub scale: Vec3f,
    pub translation: Vec3f,
    pub aabb_ws: Aabb,

    pub mass: f32,
    pub friction: f32,
    pub restitution: f32,
    pub centre_of_mass_offset: Vec3f,
    pub physics_owner_id: ClientId,
    pub last_ownership_change_time: f64,

    pub created_time: u64,
    pub last_modified_time: u64,
    pub creator_id: ClientId,
    pub creator_name: String,

    pub state: ObjectState,
    pub from_remote_dirty: DirtyFlags,
    pub from_local_dirty: DirtyFlags,
    pub changed_flags: ChangedFlags,
    pub snapshots: SharedSnapshots,
}

impl WorldObject {
    pub fn new(object_type: ObjectType) -> Self {
        let now = current_time_micros();
        Self {
            uid: Uid::INVALID,
            object_type,
            model_url: String::new(),
            materials: Vec::new(),
            lightmap_url: String::new(),
            compressed_voxels: Vec::new(),
            voxel_cache: OnceCell::new(),
            max_model_lod_level: 0,
            script: String::new(),
            content: String::new(),
            target_url: String::new(),
            audio_source_url: String::new(),
            audio_volume: 1.0,
            flags: ObjectFlags::default(),
            pos: ZERO_VEC3D,
            axis: DEFAULT_AXIS,
            angle: 0.0,
            scale: UNIT_SCALE,
            translation: ZERO_VEC3F,
            aabb_ws: Aabb::around(ZERO_VEC3D, UNIT_SCALE),
            mass: DEFAULT_MASS,
            friction: DEFAULT_FRICTION,
            restitution: DEFAULT_RESTITUTION,
            centre_of_mass_offset: ZERO_VEC3F,
            physics_owner_id: ClientId::NONE,
            last_ownership_change_time: 0.0,
            created_time: now,
            last_modified_time: now,
            creator_id: ClientId::NONE,
            creator_name: String::new(),
            state: ObjectState::JustCreated,
            from_remote_dirty: DirtyFlags::empty(),
            from_local_dirty: DirtyFlags::empty(),
            changed_flags: ChangedFlags::empty(),
            snapshots: SharedSnapshots::default(),
        }
    }

    pub fn with_model(mut self, model_url: impl Into<String>) -> Self {
        self.model_url = model_url.into();
        self
    }

    pub fn with_pose(mut self, pos: Vec3d, axis: Vec3f, angle: f32) -> Self {
        self.set_transform_and_history(pos, axis, angle, 0.0);
        self
    }

    /// Sets the placement and teleports the snapshot history to it.
    pub fn set_transform_and_history(&mut self, pos: Vec3d, axis: Vec3f, angle: f32, local_time: f64) {
        self.pos = pos;
        self.axis = axis;
        self.angle = angle;
        self.snapshots
            .reset(TransformSnapshot::at_rest(pos, axis, angle, local_time));
    }

    /// Replaces non-finite transform fields with safe values. Returns whether
    /// anything was replaced.
    pub fn sanitize(&mut self) -> bool {
        let clean = math::sanitize_transform(self.pos, self.axis, self.angle, self.scale, self.translation);
        if clean.replaced {
            log::warn!(
                "[world] object {} had non-finite transform values, replaced",
                self.uid
            );
            self.pos = clean.pos;
            self.axis = clean.axis;
            self.angle = clean.angle;
            self.scale = clean.scale;
            self.translation = clean.translation;
        }
        clean.replaced
    }

    pub fn compressed_voxels(&self) -> &[u8] {
        &self.compressed_voxels
    }

    pub fn set_compressed_voxels(&mut self, bytes: Vec<u8>) {
        self.compressed_voxels = bytes;
        self.voxel_cache = OnceCell::new();
    }

    pub fn set_voxel_group(&mut self, group: &VoxelGroup, codec: &VoxelCodec) -> Result<(), CodecError> {
        let bytes = codec.encode(group)?;
        self.set_compressed_voxels(bytes);
        Ok(())
    }

    /// Decompressed voxels under the default limits.
    pub fn voxel_group(&self) -> &VoxelGroup {
        self.voxel_group_with(&VoxelCodec::default())
    }

    /// Decompressed voxels. A payload that fails to decode, or breaks the
    /// limits of `codec`, yields an empty group. The first decode is cached
    /// until the compressed bytes change.
    pub fn voxel_group_with(&self, codec: &VoxelCodec) -> &VoxelGroup {
        self.voxel_cache.get_or_init(|| {
            match codec.decode(&self.compressed_voxels) {
                Ok(group) => group,
                Err(err) => {
                    log::warn!(
                        "[world] object {} voxels failed to decompress: {err}",
                        self.uid
                    );
                    VoxelGroup::default()
                }
            }
        })
    }

    pub fn voxels_decompressed(&self) -> bool {
        self.voxel_cache.get().is_some()
    }

    pub fn approximate_aabb(&self) -> Aabb {
        Aabb::around(self.pos, self.scale)
    }

    /// Records a received transform in the history buffer.
    pub fn push_transform_snapshot(&self, snapshot: TransformSnapshot) -> bool {
        self.snapshots.push(snapshot)
    }

    /// Records `update` in the history and moves the object to it. A sample
    /// older than the newest one is dropped and the pose is left alone.
    pub fn apply_transform_update(&mut self, update: &TransformUpdate, local_time: f64) -> bool {
        let clean = math::sanitize_transform(update.pos, update.axis, update.angle, self.scale, self.translation);
        if clean.replaced {
            log::warn!(
                "[world] object {} received non-finite transform values, replaced",
                self.uid
            );
        }
        let accepted = self.push_transform_snapshot(TransformSnapshot {
            pos: clean.pos,
            axis: clean.axis,
            angle: clean.angle,
            linear_velocity: update.linear_velocity,
            angular_velocity: update.angular_velocity,
            source_send_time: update.send_time,
            local_time,
        });
        if !accepted {
            log::debug!(
                "[world] object {} dropped transform sample older than its history",
                self.uid
            );
            return false;
        }
        self.pos = clean.pos;
        self.axis = clean.axis;
        self.angle = clean.angle;
        self.scale = clean.scale;
        self.translation = clean.translation;
        true
    }

    pub fn is_dead(&self) -> bool {
        self.state == ObjectState::Dead
    }

    pub fn mark_local_dirty(&mut self, flags: DirtyFlags) {
        self.from_local_dirty |= flags;
    }
}

impl Default for WorldObject {
    fn default() -> Self {
        Self::new(ObjectType::Generic)
    }
}

/// Compares the persisted fields only.
impl PartialEq for WorldObject {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.object_type == other.object_type
            && self.model_url == other.model_url
            && self.materials == other.materials
            && self.lightmap_url == other.lightmap_url
            && self.compressed_voxels == other.compressed_voxels
            && self.max_model_lod_level == other.max_model_lod_level
            && self.script == other.script
            && self.content == other.content
            && self.target_url == other.target_url
            && self.audio_source_url == other.audio_source_url
            && self.audio_volume == other.audio_volume
            && self.flags == other.flags
            && self.pos == other.pos
            && self.axis == other.axis
            && self.angle == other.angle
            && self.scale == other.scale
            && self.translation == other.translation
            && self.aabb_ws == other.aabb_ws
            && self.mass == other.mass
            && self.friction == other.friction
            && self.restitution == other.restitution
            && self.centre_of_mass_offset == other.centre_of_mass_offset
            && self.created_time == other.created_time
            && self.last_modified_time == other.last_modified_time
            && self.creator_id == other.creator_id
    }
}
