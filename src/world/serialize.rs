//! Versioned full record and the network form of [`WorldObject`].
//!
//! The full record begins with a `u32` version and carries every persisted
//! field that existed at that version. The network form has no version: it is
//! a fixed baseline followed by trailing fields added over time. A reader that
//! runs out of input in the trailing section keeps its local values for
//! whatever is missing.

use super::object::{Aabb, ObjectType, WorldMaterial, WorldObject};
use super::ownership::OwnershipDecision;
use super::{ChangedFlags, ClientId, DirtyFlags, ObjectFlags, ObjectState, Uid, current_time_micros};
use crate::math::UNIT_SCALE;
use crate::voxel::{Voxel, VoxelCodec, VoxelGroup};
use crate::wire::{
    InStream, MAX_COMPRESSED_VOXEL_BYTES, MAX_CONTENT_LEN, MAX_STRING_LEN, OutStream,
    ProtocolError,
};

pub const WORLD_OBJECT_SERIALISATION_VERSION: u32 = 20;
pub const WORLD_MATERIAL_SERIALISATION_VERSION: u32 = 1;
/// Raw voxel count accepted from versions 9 to 11.
pub const MAX_LEGACY_VOXELS: usize = 1_000_000;
pub const MAX_MATERIALS_PER_OBJECT: usize = 10_000;

impl WorldMaterial {
    pub fn write_to_stream(&self, out: &mut OutStream) {
        out.write_u32(WORLD_MATERIAL_SERIALISATION_VERSION);
        for c in self.colour_rgb {
            out.write_f32(c);
        }
        out.write_string(&self.colour_texture_url);
        out.write_f32(self.roughness);
        out.write_f32(self.metallic_fraction);
        out.write_f32(self.opacity);
        out.write_f32(self.emission_lum_flux);
        for m in self.tex_matrix {
            out.write_f32(m);
        }
        out.write_u32(self.flags);
    }

    pub fn read_from_stream(input: &mut InStream<'_>) -> Result<Self, ProtocolError> {
        let version = input.read_u32()?;
        if version == 0 || version > WORLD_MATERIAL_SERIALISATION_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                max: WORLD_MATERIAL_SERIALISATION_VERSION,
            });
        }
        let colour_rgb = [input.read_f32()?, input.read_f32()?, input.read_f32()?];
        let colour_texture_url = input.read_string("colour_texture_url", MAX_STRING_LEN)?;
        let roughness = input.read_f32()?;
        let metallic_fraction = input.read_f32()?;
        let opacity = input.read_f32()?;
        let emission_lum_flux = input.read_f32()?;
        let tex_matrix = [
            input.read_f32()?,
            input.read_f32()?,
            input.read_f32()?,
            input.read_f32()?,
        ];
        let flags = input.read_u32()?;
        Ok(Self {
            colour_rgb,
            colour_texture_url,
            roughness,
            metallic_fraction,
            opacity,
            emission_lum_flux,
            tex_matrix,
            flags,
        })
    }
}

fn write_materials(out: &mut OutStream, materials: &[WorldMaterial]) {
    out.write_u32(materials.len() as u32);
    for material in materials {
        material.write_to_stream(out);
    }
}

fn read_materials(input: &mut InStream<'_>) -> Result<Vec<WorldMaterial>, ProtocolError> {
    let count = input.read_u32()? as usize;
    if count > MAX_MATERIALS_PER_OBJECT {
        return Err(ProtocolError::OversizedField {
            field: "materials",
            len: count,
            max: MAX_MATERIALS_PER_OBJECT,
        });
    }
    let mut materials = Vec::new();
    for _ in 0..count {
        materials.push(WorldMaterial::read_from_stream(input)?);
    }
    Ok(materials)
}

fn write_aabb(out: &mut OutStream, aabb: &Aabb) {
    out.write_vec3f(aabb.min);
    out.write_vec3f(aabb.max);
}

fn read_aabb(input: &mut InStream<'_>) -> Result<Aabb, ProtocolError> {
    Ok(Aabb::new(input.read_vec3f()?, input.read_vec3f()?))
}

fn read_legacy_voxels(input: &mut InStream<'_>) -> Result<VoxelGroup, ProtocolError> {
    let count = input.read_u32()? as usize;
    if count > MAX_LEGACY_VOXELS {
        return Err(ProtocolError::OversizedField {
            field: "voxels",
            len: count,
            max: MAX_LEGACY_VOXELS,
        });
    }
    let data = input.read_data(count * 16)?;
    let mut body = InStream::new(data);
    let mut voxels = Vec::with_capacity(count);
    for _ in 0..count {
        let pos = body.read_vec3i()?;
        let mat_index = body.read_u32()?;
        voxels.push(Voxel { pos, mat_index });
    }
    Ok(VoxelGroup::new(voxels))
}

fn write_legacy_voxels(out: &mut OutStream, group: &VoxelGroup) {
    out.write_u32(group.len() as u32);
    for voxel in &group.voxels {
        out.write_vec3i(voxel.pos);
        out.write_u32(voxel.mat_index);
    }
}

/// Reads one trailing network field group. `None` means the stream ended
/// before or inside the group.
fn trailing<'a, T>(
    input: &mut InStream<'a>,
    read: impl FnOnce(&mut InStream<'a>) -> Result<T, ProtocolError>,
) -> Result<Option<T>, ProtocolError> {
    if input.end_of_stream() {
        return Ok(None);
    }
    match read(input) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_truncation() => Ok(None),
        Err(err) => Err(err),
    }
}

impl WorldObject {
    /// Writes the current version of the full record.
    pub fn write_to_stream(&self, out: &mut OutStream) {
        self.write_fields(out, WORLD_OBJECT_SERIALISATION_VERSION, None);
    }

    /// Writes the full record as it looked at `version`.
    pub fn write_versioned(&self, out: &mut OutStream, version: u32) -> Result<(), ProtocolError> {
        self.write_versioned_with_codec(out, version, &VoxelCodec::default())
    }

    /// As [`write_versioned`](Self::write_versioned), decoding voxels for the
    /// legacy layouts with `codec`.
    pub fn write_versioned_with_codec(
        &self,
        out: &mut OutStream,
        version: u32,
        codec: &VoxelCodec,
    ) -> Result<(), ProtocolError> {
        if version == 0 || version > WORLD_OBJECT_SERIALISATION_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                max: WORLD_OBJECT_SERIALISATION_VERSION,
            });
        }
        let legacy = if (9..=11).contains(&version) && self.object_type == ObjectType::VoxelGroup {
            Some(codec.decode(self.compressed_voxels())?)
        } else {
            None
        };
        self.write_fields(out, version, legacy.as_ref());
        Ok(())
    }

    fn write_fields(&self, out: &mut OutStream, version: u32, legacy_voxels: Option<&VoxelGroup>) {
        out.write_u32(version);
        out.write_u64(self.uid.0);
        if version >= 7 {
            out.write_u32(self.object_type.as_u32());
        }
        out.write_string(&self.model_url);
        if version >= 2 {
            write_materials(out, &self.materials);
        }
        if version >= 13 {
            out.write_string(&self.lightmap_url);
        }
        if (4..10).contains(&version) {
            out.write_string("");
        }
        if version >= 10 {
            out.write_string(&self.script);
        }
        if version >= 6 {
            out.write_string(&self.content);
        }
        if version >= 8 {
            out.write_string(&self.target_url);
        }
        out.write_vec3d(self.pos);
        out.write_vec3f(self.axis);
        out.write_f32(self.angle);
        if version >= 3 {
            out.write_vec3f(self.scale);
        }
        if version >= 5 {
            out.write_u64(self.created_time);
            out.write_u64(self.creator_id.0);
        }
        if version >= 11 {
            out.write_u32(self.flags.bits());
        }
        if self.object_type == ObjectType::VoxelGroup {
            if (9..=11).contains(&version) {
                write_legacy_voxels(out, legacy_voxels.unwrap_or(&VoxelGroup::default()));
            } else if version >= 12 {
                out.write_bytes_len_first(self.compressed_voxels());
            }
        }
        if version >= 14 {
            out.write_vec3f(self.translation);
        }
        if version >= 15 {
            out.write_string(&self.audio_source_url);
            out.write_f32(self.audio_volume);
        }
        if version >= 16 {
            out.write_u64(self.last_modified_time);
        }
        if version >= 17 {
            out.write_f32(self.mass);
            out.write_f32(self.friction);
            out.write_f32(self.restitution);
        }
        if version >= 18 {
            out.write_i32(self.max_model_lod_level);
        }
        if version >= 19 {
            write_aabb(out, &self.aabb_ws);
        }
        if version >= 20 {
            out.write_vec3f(self.centre_of_mass_offset);
        }
    }

    /// Reads a full record of any supported version.
    pub fn read_from_stream(input: &mut InStream<'_>) -> Result<WorldObject, ProtocolError> {
        Self::read_from_stream_with_codec(input, &VoxelCodec::default())
    }

    /// Reads a full record, compressing legacy voxel arrays with `codec`.
    pub fn read_from_stream_with_codec(
        input: &mut InStream<'_>,
        codec: &VoxelCodec,
    ) -> Result<WorldObject, ProtocolError> {
        let version = input.read_u32()?;
        if version == 0 || version > WORLD_OBJECT_SERIALISATION_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                max: WORLD_OBJECT_SERIALISATION_VERSION,
            });
        }

        let mut ob = WorldObject::default();
        ob.uid = Uid(input.read_u64()?);
        ob.object_type = if version >= 7 {
            ObjectType::try_from(input.read_u32()?)?
        } else {
            ObjectType::Generic
        };
        ob.model_url = input.read_string("model_url", MAX_STRING_LEN)?;
        if version >= 2 {
            ob.materials = read_materials(input)?;
        }
        if version >= 13 {
            ob.lightmap_url = input.read_string("lightmap_url", MAX_STRING_LEN)?;
        }
        if (4..10).contains(&version) {
            input.read_string("script_url", MAX_STRING_LEN)?;
        }
        if version >= 10 {
            ob.script = input.read_string("script", MAX_CONTENT_LEN)?;
        }
        if version >= 6 {
            ob.content = input.read_string("content", MAX_CONTENT_LEN)?;
        }
        if version >= 8 {
            ob.target_url = input.read_string("target_url", MAX_STRING_LEN)?;
        }
        let pos = input.read_vec3d()?;
        let axis = input.read_vec3f()?;
        let angle = input.read_f32()?;
        ob.pos = pos;
        ob.axis = axis;
        ob.angle = angle;
        ob.scale = if version >= 3 {
            input.read_vec3f()?
        } else {
            UNIT_SCALE
        };
        if version >= 5 {
            ob.created_time = input.read_u64()?;
            ob.creator_id = ClientId(input.read_u64()?);
        } else {
            ob.created_time = current_time_micros();
            ob.creator_id = ClientId::NONE;
        }
        ob.flags = if version >= 11 {
            ObjectFlags::from_bits_retain(input.read_u32()?)
        } else {
            ObjectFlags::COLLIDABLE
        };
        if ob.object_type == ObjectType::VoxelGroup {
            if (9..=11).contains(&version) {
                let group = read_legacy_voxels(input)?;
                ob.set_voxel_group(&group, codec)?;
            } else if version >= 12 {
                let bytes = input.read_bytes_len_first("compressed_voxels", MAX_COMPRESSED_VOXEL_BYTES)?;
                ob.set_compressed_voxels(bytes.to_vec());
            }
        }
        if version >= 14 {
            ob.translation = input.read_vec3f()?;
        }
        if version >= 15 {
            ob.audio_source_url = input.read_string("audio_source_url", MAX_STRING_LEN)?;
            ob.audio_volume = input.read_f32()?;
        }
        ob.last_modified_time = if version >= 16 {
            input.read_u64()?
        } else {
            ob.created_time
        };
        if version >= 17 {
            ob.mass = input.read_f32()?;
            ob.friction = input.read_f32()?;
            ob.restitution = input.read_f32()?;
        }
        if version >= 18 {
            ob.max_model_lod_level = input.read_i32()?;
        }
        if version >= 19 {
            ob.aabb_ws = read_aabb(input)?;
        }
        if version >= 20 {
            ob.centre_of_mass_offset = input.read_vec3f()?;
        }

        ob.state = ObjectState::Alive;
        ob.sanitize();
        if version < 19 {
            ob.aabb_ws = ob.approximate_aabb();
        }
        ob.set_transform_and_history(ob.pos, ob.axis, ob.angle, 0.0);
        Ok(ob)
    }

    /// Writes the network form, uid first.
    pub fn write_network(&self, out: &mut OutStream) {
        out.write_u64(self.uid.0);
        self.write_network_body(out);
    }

    /// Writes everything in the network form after the uid.
    pub fn write_network_body(&self, out: &mut OutStream) {
        out.write_u32(self.object_type.as_u32());
        out.write_string(&self.model_url);
        write_materials(out, &self.materials);
        out.write_string(&self.lightmap_url);
        out.write_string(&self.script);
        out.write_string(&self.content);
        out.write_string(&self.target_url);
        out.write_vec3d(self.pos);
        out.write_vec3f(self.axis);
        out.write_f32(self.angle);
        out.write_vec3f(self.scale);
        out.write_u64(self.created_time);
        out.write_u64(self.creator_id.0);
        out.write_u32(self.flags.bits());
        out.write_string(&self.creator_name);
        if self.object_type == ObjectType::VoxelGroup {
            out.write_bytes_len_first(self.compressed_voxels());
        }

        out.write_vec3f(self.translation);
        out.write_string(&self.audio_source_url);
        out.write_f32(self.audio_volume);
        out.write_u64(self.last_modified_time);
        out.write_f32(self.mass);
        out.write_f32(self.friction);
        out.write_f32(self.restitution);
        out.write_i32(self.max_model_lod_level);
        write_aabb(out, &self.aabb_ws);
        out.write_vec3f(self.centre_of_mass_offset);
        out.write_u64(self.physics_owner_id.0);
        out.write_f64(self.last_ownership_change_time);
    }

    /// Copies exactly the fields the network form carries.
    pub fn copy_network_state_from(&mut self, other: &WorldObject) {
        self.object_type = other.object_type;
        self.model_url.clone_from(&other.model_url);
        self.materials.clone_from(&other.materials);
        self.lightmap_url.clone_from(&other.lightmap_url);
        self.script.clone_from(&other.script);
        self.content.clone_from(&other.content);
        self.target_url.clone_from(&other.target_url);
        self.pos = other.pos;
        self.axis = other.axis;
        self.angle = other.angle;
        self.scale = other.scale;
        self.created_time = other.created_time;
        self.creator_id = other.creator_id;
        self.flags = other.flags;
        self.creator_name.clone_from(&other.creator_name);
        if self.compressed_voxels() != other.compressed_voxels() {
            self.set_compressed_voxels(other.compressed_voxels().to_vec());
        }
        self.translation = other.translation;
        self.audio_source_url.clone_from(&other.audio_source_url);
        self.audio_volume = other.audio_volume;
        self.last_modified_time = other.last_modified_time;
        self.mass = other.mass;
        self.friction = other.friction;
        self.restitution = other.restitution;
        self.max_model_lod_level = other.max_model_lod_level;
        self.aabb_ws = other.aabb_ws;
        self.centre_of_mass_offset = other.centre_of_mass_offset;
        self.physics_owner_id = other.physics_owner_id;
        self.last_ownership_change_time = other.last_ownership_change_time;
    }

    /// Applies a network form (everything after the uid) to this object.
    ///
    /// Decoding happens into a scratch copy, so a failed read leaves `self`
    /// untouched. Returns the changed flags raised by this update; they are
    /// also accumulated into `changed_flags`.
    pub fn read_network_given_uid(&mut self, input: &mut InStream<'_>) -> Result<ChangedFlags, ProtocolError> {
        let mut incoming = WorldObject::new(self.object_type);
        incoming.uid = self.uid;
        incoming.copy_network_state_from(self);
        read_network_fields(&mut incoming, input)?;
        incoming.sanitize();

        let mut changed = ChangedFlags::empty();
        let mut dirty = DirtyFlags::empty();
        if incoming.script != self.script {
            changed |= ChangedFlags::SCRIPT;
        }
        if incoming.audio_source_url != self.audio_source_url || incoming.audio_volume != self.audio_volume {
            changed |= ChangedFlags::AUDIO_SOURCE;
        }
        if incoming.pos != self.pos || incoming.axis != self.axis || incoming.angle != self.angle {
            dirty |= DirtyFlags::TRANSFORM;
        }
        if incoming.model_url != self.model_url {
            dirty |= DirtyFlags::MODEL_URL;
        }
        if incoming.lightmap_url != self.lightmap_url {
            dirty |= DirtyFlags::LIGHTMAP_URL;
        }
        if incoming.flags != self.flags {
            dirty |= DirtyFlags::FLAGS;
        }
        if incoming.content != self.content {
            dirty |= DirtyFlags::CONTENT;
        }
        if incoming.object_type != self.object_type
            || incoming.materials != self.materials
            || incoming.script != self.script
            || incoming.target_url != self.target_url
            || incoming.scale != self.scale
            || incoming.translation != self.translation
            || incoming.compressed_voxels() != self.compressed_voxels()
            || incoming.audio_source_url != self.audio_source_url
            || incoming.audio_volume != self.audio_volume
            || incoming.mass != self.mass
            || incoming.friction != self.friction
            || incoming.restitution != self.restitution
            || incoming.max_model_lod_level != self.max_model_lod_level
            || incoming.centre_of_mass_offset != self.centre_of_mass_offset
        {
            dirty |= DirtyFlags::OTHER;
        }

        let offered_owner = incoming.physics_owner_id;
        let offered_time = incoming.last_ownership_change_time;
        incoming.physics_owner_id = self.physics_owner_id;
        incoming.last_ownership_change_time = self.last_ownership_change_time;

        self.copy_network_state_from(&incoming);
        let owner_before = self.physics_owner_id;
        if self.apply_ownership_change(offered_owner, offered_time) == OwnershipDecision::Adopted
            && self.physics_owner_id != owner_before
        {
            changed |= ChangedFlags::PHYSICS_OWNER;
        }

        self.changed_flags |= changed;
        self.from_remote_dirty |= dirty;
        Ok(changed)
    }

    /// Decodes a complete network form (uid included) into a new object.
    pub fn from_network(input: &mut InStream<'_>) -> Result<WorldObject, ProtocolError> {
        let uid = Uid(input.read_u64()?);
        Self::from_network_given_uid(uid, input)
    }

    /// Decodes a network form whose uid was carried by the envelope.
    pub fn from_network_given_uid(uid: Uid, input: &mut InStream<'_>) -> Result<WorldObject, ProtocolError> {
        let mut ob = WorldObject::default();
        ob.uid = uid;
        read_network_fields(&mut ob, input)?;
        ob.sanitize();
        ob.state = ObjectState::Alive;
        ob.set_transform_and_history(ob.pos, ob.axis, ob.angle, 0.0);
        Ok(ob)
    }
}

fn read_network_fields(ob: &mut WorldObject, input: &mut InStream<'_>) -> Result<(), ProtocolError> {
    ob.object_type = ObjectType::try_from(input.read_u32()?)?;
    ob.model_url = input.read_string("model_url", MAX_STRING_LEN)?;
    ob.materials = read_materials(input)?;
    ob.lightmap_url = input.read_string("lightmap_url", MAX_STRING_LEN)?;
    ob.script = input.read_string("script", MAX_CONTENT_LEN)?;
    ob.content = input.read_string("content", MAX_CONTENT_LEN)?;
    ob.target_url = input.read_string("target_url", MAX_STRING_LEN)?;
    ob.pos = input.read_vec3d()?;
    ob.axis = input.read_vec3f()?;
    ob.angle = input.read_f32()?;
    ob.scale = input.read_vec3f()?;
    ob.created_time = input.read_u64()?;
    ob.creator_id = ClientId(input.read_u64()?);
    ob.flags = ObjectFlags::from_bits_retain(input.read_u32()?);
    ob.creator_name = input.read_string("creator_name", MAX_STRING_LEN)?;
    if ob.object_type == ObjectType::VoxelGroup {
        let bytes = input.read_bytes_len_first("compressed_voxels", MAX_COMPRESSED_VOXEL_BYTES)?;
        if bytes != ob.compressed_voxels() {
            ob.set_compressed_voxels(bytes.to_vec());
        }
    } else if !ob.compressed_voxels().is_empty() {
        ob.set_compressed_voxels(Vec::new());
    }

    let Some(translation) = trailing(input, |s| s.read_vec3f())? else {
        return Ok(());
    };
    ob.translation = translation;

    let Some((audio_source_url, audio_volume)) = trailing(input, |s| {
        Ok((s.read_string("audio_source_url", MAX_STRING_LEN)?, s.read_f32()?))
    })?
    else {
        return Ok(());
    };
    ob.audio_source_url = audio_source_url;
    ob.audio_volume = audio_volume;

    let Some(last_modified_time) = trailing(input, |s| s.read_u64())? else {
        return Ok(());
    };
    ob.last_modified_time = last_modified_time;

    let Some((mass, friction, restitution)) =
        trailing(input, |s| Ok((s.read_f32()?, s.read_f32()?, s.read_f32()?)))?
    else {
        return Ok(());
    };
    ob.mass = mass;
    ob.friction = friction;
    ob.restitution = restitution;

    let Some(lod) = trailing(input, |s| s.read_i32())? else {
        return Ok(());
    };
    ob.max_model_lod_level = lod;

    let Some(aabb) = trailing(input, read_aabb)? else {
        return Ok(());
    };
    ob.aabb_ws = aabb;

    let Some(com) = trailing(input, |s| s.read_vec3f())? else {
        return Ok(());
    };
    ob.centre_of_mass_offset = com;

    let Some((owner, change_time)) =
        trailing(input, |s| Ok((ClientId(s.read_u64()?), s.read_f64()?)))?
    else {
        return Ok(());
    };
    ob.physics_owner_id = owner;
    ob.last_ownership_change_time = change_time;
    Ok(())
}
