use super::avatar::Avatar;
use super::object::WorldObject;
use super::ownership::OwnershipDecision;
use super::snapshot::{Pose, TransformSnapshot};
use super::{ClientId, DirtyFlags, ObjectState, TransformUpdate, Uid};
use crate::voxel::{VoxelCodec, VoxelGroup, VoxelLimits};
use crate::wire::{InStream, OutStream, ProtocolError};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// `WSYN` little-endian.
pub const WORLD_STATE_MAGIC: u32 = 0x5753_594E;
pub const WORLD_STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("world state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("world state decode error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("not a world state file (magic {0:#010x})")]
    BadMagic(u32),
    #[error("unsupported world state file version {0}")]
    UnsupportedFileVersion(u32),
    #[error("no entity with uid {0}")]
    UnknownObject(Uid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformUpdateOutcome {
    Applied,
    RejectedNotOwner,
    /// Older than the newest sample already recorded; the pose is unchanged.
    Stale,
    UnknownObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Object,
    Avatar,
}

/// One entity whose local dirty bits were consumed by a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyEntry {
    pub uid: Uid,
    pub kind: EntityKind,
    pub flags: DirtyFlags,
    pub state: ObjectState,
}

/// Every entity of one world, guarded by [`WorldStateStore`].
#[derive(Debug, Default)]
pub struct WorldState {
    objects: BTreeMap<Uid, WorldObject>,
    avatars: BTreeMap<Uid, Avatar>,
    next_uid: u64,
    changed: bool,
}

impl WorldState {
    pub fn objects(&self) -> &BTreeMap<Uid, WorldObject> {
        &self.objects
    }

    pub fn avatars(&self) -> &BTreeMap<Uid, Avatar> {
        &self.avatars
    }

    pub fn object(&self, uid: Uid) -> Option<&WorldObject> {
        self.objects.get(&uid)
    }

    pub fn object_mut(&mut self, uid: Uid) -> Option<&mut WorldObject> {
        self.objects.get_mut(&uid)
    }

    pub fn avatar(&self, uid: Uid) -> Option<&Avatar> {
        self.avatars.get(&uid)
    }

    pub fn avatar_mut(&mut self, uid: Uid) -> Option<&mut Avatar> {
        self.avatars.get_mut(&uid)
    }

    pub fn allocate_uid(&mut self) -> Uid {
        let uid = Uid(self.next_uid);
        self.next_uid += 1;
        uid
    }

    pub fn peek_next_uid(&self) -> Uid {
        Uid(self.next_uid)
    }

    fn reserve_uid(&mut self, uid: Uid) {
        if uid.is_valid() && uid.0 >= self.next_uid {
            self.next_uid = uid.0 + 1;
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub fn insert_object(&mut self, mut ob: WorldObject) -> Uid {
        if !ob.uid.is_valid() {
            ob.uid = self.allocate_uid();
        } else {
            self.reserve_uid(ob.uid);
        }
        let uid = ob.uid;
        self.objects.insert(uid, ob);
        uid
    }

    pub fn insert_avatar(&mut self, mut avatar: Avatar) -> Uid {
        if !avatar.uid.is_valid() {
            avatar.uid = self.allocate_uid();
        } else {
            self.reserve_uid(avatar.uid);
        }
        let uid = avatar.uid;
        self.avatars.insert(uid, avatar);
        uid
    }

    pub fn remove_object(&mut self, uid: Uid) -> Option<WorldObject> {
        self.objects.remove(&uid)
    }

    pub fn remove_avatar(&mut self, uid: Uid) -> Option<Avatar> {
        self.avatars.remove(&uid)
    }

    /// Consumes the local dirty bits of every entity that has any.
    pub fn drain_dirty_flags(&mut self) -> Vec<DirtyEntry> {
        let mut entries = Vec::new();
        for ob in self.objects.values_mut() {
            if !ob.from_local_dirty.is_empty() {
                entries.push(DirtyEntry {
                    uid: ob.uid,
                    kind: EntityKind::Object,
                    flags: std::mem::take(&mut ob.from_local_dirty),
                    state: ob.state,
                });
            }
        }
        for avatar in self.avatars.values_mut() {
            if !avatar.from_local_dirty.is_empty() {
                entries.push(DirtyEntry {
                    uid: avatar.uid,
                    kind: EntityKind::Avatar,
                    flags: std::mem::take(&mut avatar.from_local_dirty),
                    state: avatar.state,
                });
            }
        }
        entries
    }

    /// Advances lifecycles after `entries` were broadcast. Returns the
    /// number of entities that became alive and the number removed.
    pub fn finish_broadcast(&mut self, entries: &[DirtyEntry]) -> (usize, usize) {
        let mut created = 0;
        let mut removed = 0;
        for entry in entries {
            match (entry.kind, entry.state) {
                (EntityKind::Object, ObjectState::JustCreated) => {
                    if let Some(ob) = self.objects.get_mut(&entry.uid) {
                        if ob.state == ObjectState::JustCreated {
                            ob.state = ObjectState::Alive;
                            created += 1;
                        }
                    }
                }
                (EntityKind::Object, ObjectState::Dead) => {
                    if self.objects.remove(&entry.uid).is_some() {
                        removed += 1;
                    }
                }
                (EntityKind::Avatar, ObjectState::JustCreated) => {
                    if let Some(avatar) = self.avatars.get_mut(&entry.uid) {
                        if avatar.state == ObjectState::JustCreated {
                            avatar.state = ObjectState::Alive;
                            created += 1;
                        }
                    }
                }
                (EntityKind::Avatar, ObjectState::Dead) => {
                    if self.avatars.remove(&entry.uid).is_some() {
                        removed += 1;
                    }
                }
                (_, ObjectState::Alive) => {}
            }
        }
        if !entries.is_empty() {
            self.changed = true;
        }
        (created, removed)
    }

    /// Builds the persistence file image. Dead objects and avatars are skipped.
    pub fn serialise_bytes(&self) -> Vec<u8> {
        let mut out = OutStream::new();
        out.write_u32(WORLD_STATE_MAGIC);
        out.write_u32(WORLD_STATE_FILE_VERSION);
        out.write_u64(self.next_uid);
        let live: Vec<&WorldObject> = self.objects.values().filter(|ob| !ob.is_dead()).collect();
        out.write_u32(live.len() as u32);
        for ob in live {
            let at = out.len();
            out.write_u32(0);
            ob.write_to_stream(&mut out);
            let record_len = out.len() - at - 4;
            out.patch_u32(at, record_len as u32);
        }
        out.into_bytes()
    }

    pub fn deserialise_bytes(bytes: &[u8]) -> Result<WorldState, StoreError> {
        Self::deserialise_bytes_with_codec(bytes, &VoxelCodec::default())
    }

    pub fn deserialise_bytes_with_codec(bytes: &[u8], codec: &VoxelCodec) -> Result<WorldState, StoreError> {
        let mut input = InStream::new(bytes);
        let magic = input.read_u32()?;
        if magic != WORLD_STATE_MAGIC {
            return Err(StoreError::BadMagic(magic));
        }
        let version = input.read_u32()?;
        if version != WORLD_STATE_FILE_VERSION {
            return Err(StoreError::UnsupportedFileVersion(version));
        }
        let saved_next_uid = input.read_u64()?;
        let count = input.read_u32()?;

        let mut state = WorldState {
            next_uid: saved_next_uid,
            ..WorldState::default()
        };
        for _ in 0..count {
            let len = input.read_u32()? as usize;
            let record = input.read_data(len)?;
            let ob = WorldObject::read_from_stream_with_codec(&mut InStream::new(record), codec)?;
            state.reserve_uid(ob.uid);
            state.objects.insert(ob.uid, ob);
        }
        Ok(state)
    }
}

/// Mutex-guarded world state shared by the network threads and the sync loop.
#[derive(Debug, Default)]
pub struct WorldStateStore {
    state: Mutex<WorldState>,
    codec: VoxelCodec,
}

impl WorldStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: WorldState) -> Self {
        Self {
            state: Mutex::new(state),
            codec: VoxelCodec::default(),
        }
    }

    pub fn with_voxel_limits(mut self, limits: VoxelLimits) -> Self {
        self.codec = VoxelCodec::new(limits);
        self
    }

    pub fn voxel_codec(&self) -> &VoxelCodec {
        &self.codec
    }

    /// Decompressed voxels of `uid`, checked against this store's limits.
    pub fn voxel_group(&self, uid: Uid) -> Option<VoxelGroup> {
        self.lock()
            .object(uid)
            .map(|ob| ob.voxel_group_with(&self.codec).clone())
    }

    pub fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_uid(&self) -> Uid {
        self.lock().allocate_uid()
    }

    /// Adds a new object. Assigns a uid and queues its creation for broadcast.
    pub fn create_object(&self, mut ob: WorldObject) -> Uid {
        let mut state = self.lock();
        ob.uid = state.allocate_uid();
        ob.state = ObjectState::JustCreated;
        ob.sanitize();
        ob.set_transform_and_history(ob.pos, ob.axis, ob.angle, 0.0);
        ob.from_local_dirty = DirtyFlags::all();
        let uid = state.insert_object(ob);
        state.mark_changed();
        log::debug!("[store] created object {uid}");
        uid
    }

    /// Inserts an object that already has a uid, as received from a server.
    pub fn insert_remote_object(&self, mut ob: WorldObject) -> Uid {
        ob.state = ObjectState::Alive;
        ob.from_local_dirty = DirtyFlags::empty();
        self.lock().insert_object(ob)
    }

    pub fn mark_object_dead(&self, uid: Uid) -> Result<(), StoreError> {
        let mut state = self.lock();
        let ob = state.object_mut(uid).ok_or(StoreError::UnknownObject(uid))?;
        ob.state = ObjectState::Dead;
        ob.from_local_dirty |= DirtyFlags::OTHER;
        state.mark_changed();
        Ok(())
    }

    pub fn with_object<R>(&self, uid: Uid, f: impl FnOnce(&mut WorldObject) -> R) -> Option<R> {
        self.lock().object_mut(uid).map(f)
    }

    pub fn with_avatar<R>(&self, uid: Uid, f: impl FnOnce(&mut Avatar) -> R) -> Option<R> {
        self.lock().avatar_mut(uid).map(f)
    }

    /// Applies a transform sent by `sender`. Once an owner is known, only the
    /// owner may move the object.
    pub fn update_object_transform(
        &self,
        uid: Uid,
        sender: ClientId,
        update: &TransformUpdate,
        local_time: f64,
    ) -> TransformUpdateOutcome {
        let mut state = self.lock();
        let Some(ob) = state.object_mut(uid) else {
            return TransformUpdateOutcome::UnknownObject;
        };
        if !ob.may_author_transform(sender) {
            log::debug!(
                "[store] dropped transform for {uid} from {sender}, owner is {}",
                ob.physics_owner_id
            );
            return TransformUpdateOutcome::RejectedNotOwner;
        }
        if !ob.apply_transform_update(update, local_time) {
            return TransformUpdateOutcome::Stale;
        }
        ob.from_local_dirty |= DirtyFlags::TRANSFORM;
        state.mark_changed();
        TransformUpdateOutcome::Applied
    }

    pub fn claim_physics_ownership(&self, uid: Uid, client: ClientId, now: f64) -> Result<(), StoreError> {
        let mut state = self.lock();
        let ob = state.object_mut(uid).ok_or(StoreError::UnknownObject(uid))?;
        ob.claim_physics_ownership(client, now);
        Ok(())
    }

    pub fn apply_ownership_change(
        &self,
        uid: Uid,
        owner: ClientId,
        change_time: f64,
    ) -> Result<OwnershipDecision, StoreError> {
        let mut state = self.lock();
        let ob = state.object_mut(uid).ok_or(StoreError::UnknownObject(uid))?;
        Ok(ob.apply_ownership_change(owner, change_time))
    }

    pub fn create_avatar(&self, mut avatar: Avatar) -> Uid {
        let mut state = self.lock();
        avatar.uid = state.allocate_uid();
        avatar.state = ObjectState::JustCreated;
        avatar.sanitize();
        avatar.from_local_dirty = DirtyFlags::all();
        let uid = state.insert_avatar(avatar);
        log::debug!("[store] created avatar {uid}");
        uid
    }

    pub fn mark_avatar_dead(&self, uid: Uid) -> Result<(), StoreError> {
        let mut state = self.lock();
        let avatar = state.avatar_mut(uid).ok_or(StoreError::UnknownObject(uid))?;
        avatar.state = ObjectState::Dead;
        avatar.from_local_dirty |= DirtyFlags::OTHER;
        Ok(())
    }

    pub fn update_avatar_transform(&self, uid: Uid, pose: Pose, local_time: f64) -> Result<(), StoreError> {
        let mut state = self.lock();
        let avatar = state.avatar_mut(uid).ok_or(StoreError::UnknownObject(uid))?;
        avatar.pose = pose;
        avatar.sanitize();
        avatar.snapshots.push(TransformSnapshot::at_rest(
            avatar.pose.pos,
            avatar.pose.axis,
            avatar.pose.angle,
            local_time,
        ));
        avatar.from_local_dirty |= DirtyFlags::TRANSFORM;
        Ok(())
    }

    pub fn drain_dirty_flags(&self) -> Vec<DirtyEntry> {
        self.lock().drain_dirty_flags()
    }

    /// Uids of every entity with pending local changes. Each change is
    /// reported exactly once. Lifecycles advance as in a broadcast tick, so
    /// drained dead entities are removed.
    pub fn drain_dirty_entities(&self) -> Vec<Uid> {
        let mut state = self.lock();
        let entries = state.drain_dirty_flags();
        state.finish_broadcast(&entries);
        entries.into_iter().map(|entry| entry.uid).collect()
    }

    /// Consumes the bits set by network reads.
    pub fn drain_remote_changes(&self) -> Vec<(Uid, DirtyFlags)> {
        let mut state = self.lock();
        let mut changes = Vec::new();
        for ob in state.objects.values_mut() {
            if !ob.from_remote_dirty.is_empty() {
                changes.push((ob.uid, std::mem::take(&mut ob.from_remote_dirty)));
            }
        }
        for avatar in state.avatars.values_mut() {
            if !avatar.from_remote_dirty.is_empty() {
                changes.push((avatar.uid, std::mem::take(&mut avatar.from_remote_dirty)));
            }
        }
        changes
    }

    /// Fills `creator_name` from a client id to name lookup.
    pub fn denormalise_creator_names(&self, names: &HashMap<ClientId, String>) {
        let mut state = self.lock();
        for ob in state.objects.values_mut() {
            if let Some(name) = names.get(&ob.creator_id) {
                if ob.creator_name != *name {
                    ob.creator_name.clone_from(name);
                }
            }
        }
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn avatar_count(&self) -> usize {
        self.lock().avatars.len()
    }

    /// Writes the world to `path` via a temporary file and a rename. The file
    /// image is built under the lock; the write happens after it is released.
    pub fn serialise_to_disk(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = {
            let mut state = self.lock();
            let bytes = state.serialise_bytes();
            state.clear_changed();
            bytes
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        log::info!("[store] saved {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    pub fn read_from_disk(path: &Path) -> Result<WorldStateStore, StoreError> {
        Self::read_from_disk_with_limits(path, VoxelLimits::default())
    }

    /// Loads `path`, keeping `limits` for every voxel decode of the store.
    pub fn read_from_disk_with_limits(path: &Path, limits: VoxelLimits) -> Result<WorldStateStore, StoreError> {
        let codec = VoxelCodec::new(limits);
        let bytes = fs::read(path)?;
        let state = WorldState::deserialise_bytes_with_codec(&bytes, &codec)?;
        log::info!(
            "[store] loaded {} objects from {}",
            state.objects.len(),
            path.display()
        );
        Ok(Self::from_state(state).with_voxel_limits(limits))
    }
}
