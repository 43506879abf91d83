use super::{WireMessage, encode_all};
use crate::world::{
    Avatar, ChangedFlags, ClientId, DirtyFlags, ObjectState, TransformSnapshot, WorldState,
    WorldStateStore,
};
use crate::wire::{InStream, ProtocolError};
use std::sync::Arc;

const DEFAULT_CHUNK_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WorldSnapshotChunk {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub messages: Vec<WireMessage>,
}

impl WorldSnapshotChunk {
    pub fn encode(&self) -> Vec<u8> {
        encode_all(&self.messages)
    }
}

/// Initial state for a newly connected client, split into chunks.
#[derive(Debug, Default, Clone)]
pub struct WorldSnapshot {
    chunks: Vec<WorldSnapshotChunk>,
}

impl WorldSnapshot {
    pub fn empty() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn chunks(&self) -> &[WorldSnapshotChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_messages(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.messages.len()).sum()
    }
}

pub struct WorldSnapshotBuilder {
    max_chunk_bytes: usize,
}

impl WorldSnapshotBuilder {
    pub fn new() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_CHUNK_LIMIT,
        }
    }

    pub fn with_chunk_limit(mut self, max_bytes: usize) -> Self {
        self.max_chunk_bytes = max_bytes.max(1);
        self
    }

    /// One `ObjectCreated` per live object and one `AvatarCreated` per live avatar.
    pub fn build(&self, world: &WorldState) -> WorldSnapshot {
        let mut messages = Vec::new();
        for ob in world.objects().values().filter(|ob| !ob.is_dead()) {
            messages.push(WireMessage::object_created(ob));
        }
        for avatar in world
            .avatars()
            .values()
            .filter(|avatar| avatar.state != ObjectState::Dead)
        {
            messages.push(WireMessage::AvatarCreated {
                uid: avatar.uid,
                name: avatar.name.clone(),
                model_url: avatar.model_url.clone(),
                pose: avatar.pose,
            });
        }

        if messages.is_empty() {
            return WorldSnapshot::empty();
        }

        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut current_size = 0usize;
        let limit = self.max_chunk_bytes;

        for message in messages {
            let size = message.encoded_len();
            if !current.is_empty() && current_size + size > limit {
                chunks.push(WorldSnapshotChunk {
                    chunk_index: chunks.len() as u32,
                    total_chunks: 0,
                    messages: current,
                });
                current = Vec::new();
                current_size = 0;
            }
            current_size += size;
            current.push(message);
        }

        if !current.is_empty() {
            chunks.push(WorldSnapshotChunk {
                chunk_index: chunks.len() as u32,
                total_chunks: 0,
                messages: current,
            });
        }

        let total = chunks.len() as u32;
        for chunk in &mut chunks {
            chunk.total_chunks = total;
        }

        WorldSnapshot { chunks }
    }
}

impl Default for WorldSnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated { changed: ChangedFlags },
    TransformApplied,
    /// Transform from a client that does not own the object.
    Rejected,
    Removed,
    /// Nothing to do: unknown entity, stale ownership, a transform older than
    /// the history, or our own transform echoed back.
    Ignored,
}

/// Applies received messages to a client-side store.
pub struct RemoteApplier {
    store: Arc<WorldStateStore>,
    local_client: ClientId,
}

impl RemoteApplier {
    pub fn new(store: Arc<WorldStateStore>, local_client: ClientId) -> Self {
        Self {
            store,
            local_client,
        }
    }

    pub fn store(&self) -> &Arc<WorldStateStore> {
        &self.store
    }

    fn owned_locally(&self, owner: ClientId) -> bool {
        !self.local_client.is_none() && owner == self.local_client
    }

    pub fn apply(&self, message: &WireMessage, local_time: f64) -> Result<ApplyOutcome, ProtocolError> {
        let mut state = self.store.lock();
        match message {
            WireMessage::ObjectCreated(payload) | WireMessage::ObjectFullUpdate(payload) => {
                let Some(ob) = state.object_mut(payload.uid) else {
                    let mut ob = payload.to_object()?;
                    ob.set_transform_and_history(ob.pos, ob.axis, ob.angle, local_time);
                    ob.from_remote_dirty = DirtyFlags::all();
                    state.insert_object(ob);
                    return Ok(ApplyOutcome::Created);
                };
                let kept_pose = self
                    .owned_locally(ob.physics_owner_id)
                    .then_some((ob.pos, ob.axis, ob.angle));
                let changed = payload.apply_to(ob)?;
                match kept_pose {
                    Some((pos, axis, angle)) => {
                        ob.pos = pos;
                        ob.axis = axis;
                        ob.angle = angle;
                        ob.from_remote_dirty.remove(DirtyFlags::TRANSFORM);
                    }
                    None if ob.from_remote_dirty.contains(DirtyFlags::TRANSFORM) => {
                        ob.push_transform_snapshot(TransformSnapshot::at_rest(
                            ob.pos, ob.axis, ob.angle, local_time,
                        ));
                    }
                    None => {}
                }
                Ok(ApplyOutcome::Updated { changed })
            }
            WireMessage::ObjectTransformUpdate {
                uid,
                author,
                update,
            } => {
                let Some(ob) = state.object_mut(*uid) else {
                    return Ok(ApplyOutcome::Ignored);
                };
                if self.owned_locally(ob.physics_owner_id) {
                    return Ok(ApplyOutcome::Ignored);
                }
                if !ob.may_author_transform(*author) {
                    log::debug!(
                        "[replication] dropped transform for {uid} from {author}, owner is {}",
                        ob.physics_owner_id
                    );
                    return Ok(ApplyOutcome::Rejected);
                }
                if !ob.apply_transform_update(update, local_time) {
                    return Ok(ApplyOutcome::Ignored);
                }
                ob.from_remote_dirty |= DirtyFlags::TRANSFORM;
                Ok(ApplyOutcome::TransformApplied)
            }
            WireMessage::ObjectDestroyed { uid } => Ok(match state.remove_object(*uid) {
                Some(_) => ApplyOutcome::Removed,
                None => ApplyOutcome::Ignored,
            }),
            WireMessage::ObjectPhysicsOwnershipTaken {
                uid,
                owner,
                change_time,
            } => {
                let Some(ob) = state.object_mut(*uid) else {
                    return Ok(ApplyOutcome::Ignored);
                };
                let before = ob.physics_owner_id;
                ob.apply_ownership_change(*owner, *change_time);
                if ob.physics_owner_id == before {
                    return Ok(ApplyOutcome::Ignored);
                }
                Ok(ApplyOutcome::Updated {
                    changed: ChangedFlags::PHYSICS_OWNER,
                })
            }
            WireMessage::AvatarCreated {
                uid,
                name,
                model_url,
                pose,
            } => {
                if let Some(avatar) = state.avatar_mut(*uid) {
                    avatar.name.clone_from(name);
                    avatar.model_url.clone_from(model_url);
                    avatar.apply_remote_pose(*pose, local_time);
                    avatar.from_remote_dirty |= DirtyFlags::OTHER;
                    return Ok(ApplyOutcome::Updated {
                        changed: ChangedFlags::empty(),
                    });
                }
                let mut avatar = Avatar::new(name.clone(), model_url.clone(), *pose);
                avatar.uid = *uid;
                avatar.state = ObjectState::Alive;
                avatar.sanitize();
                avatar.set_pose_and_history(avatar.pose, local_time);
                avatar.from_remote_dirty = DirtyFlags::all();
                state.insert_avatar(avatar);
                Ok(ApplyOutcome::Created)
            }
            WireMessage::AvatarTransformUpdate { uid, pose } => {
                let Some(avatar) = state.avatar_mut(*uid) else {
                    return Ok(ApplyOutcome::Ignored);
                };
                avatar.apply_remote_pose(*pose, local_time);
                Ok(ApplyOutcome::TransformApplied)
            }
            WireMessage::AvatarDestroyed { uid } => Ok(match state.remove_avatar(*uid) {
                Some(_) => ApplyOutcome::Removed,
                None => ApplyOutcome::Ignored,
            }),
        }
    }

    /// Applies every message in a received buffer. A message that fails to
    /// decode or apply is dropped with a warning; framing errors end the buffer.
    pub fn apply_buffer(&self, bytes: &[u8], local_time: f64) -> Result<Vec<ApplyOutcome>, ProtocolError> {
        let mut input = InStream::new(bytes);
        let mut outcomes = Vec::new();
        while !input.end_of_stream() {
            let message = match WireMessage::decode(&mut input) {
                Ok(message) => message,
                Err(ProtocolError::UnknownMessageType(id)) => {
                    log::warn!("[replication] skipping unknown message type {id}");
                    continue;
                }
                Err(err) => {
                    log::warn!("[replication] dropping rest of buffer: {err}");
                    return Err(err);
                }
            };
            match self.apply(&message, local_time) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    log::warn!("[replication] dropped message for {}: {err}", message.uid());
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{Pose, WorldObject};

    fn populated_store(objects: usize) -> WorldStateStore {
        let store = WorldStateStore::new();
        for i in 0..objects {
            let mut ob = WorldObject::default().with_model(format!("models/crate_{i}.glb"));
            ob.content = "x".repeat(200);
            store.create_object(ob);
        }
        store
    }

    #[test]
    fn empty_world_produces_empty_snapshot() {
        let store = WorldStateStore::new();
        let snapshot = WorldSnapshotBuilder::new().build(&store.lock());
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.total_messages(), 0);
    }

    #[test]
    fn snapshot_chunking_respects_limit() {
        let store = populated_store(5);
        let snapshot = WorldSnapshotBuilder::new()
            .with_chunk_limit(600)
            .build(&store.lock());
        assert_eq!(snapshot.total_messages(), 5);
        assert!(snapshot.chunks().len() >= 2);
        for (index, chunk) in snapshot.chunks().iter().enumerate() {
            assert_eq!(chunk.chunk_index, index as u32);
            assert_eq!(chunk.total_chunks, snapshot.chunks().len() as u32);
            assert!(chunk.messages.len() == 1 || chunk.encode().len() <= 600);
        }
    }

    #[test]
    fn chunking_keeps_at_least_one_message_per_chunk() {
        let store = populated_store(2);
        let snapshot = WorldSnapshotBuilder::new()
            .with_chunk_limit(1)
            .build(&store.lock());
        assert_eq!(snapshot.chunks().len(), 2);
        assert!(snapshot.chunks().iter().all(|chunk| chunk.messages.len() == 1));
    }

    #[test]
    fn snapshot_includes_avatars_and_skips_dead() {
        let store = populated_store(2);
        let dead = store.create_object(WorldObject::default());
        store.mark_object_dead(dead).unwrap();
        store.create_avatar(Avatar::new("kim", "avatars/kim.glb", Pose::default()));
        let snapshot = WorldSnapshotBuilder::new().build(&store.lock());
        let messages: Vec<&WireMessage> =
            snapshot.chunks().iter().flat_map(|c| c.messages.iter()).collect();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.uid() != dead));
        assert!(matches!(messages[2], WireMessage::AvatarCreated { .. }));
    }

    #[test]
    fn local_owner_ignores_echoed_transform() {
        let client_store = Arc::new(WorldStateStore::new());
        let applier = RemoteApplier::new(Arc::clone(&client_store), ClientId(1));
        let mut ob = WorldObject::default();
        ob.uid = crate::world::Uid(10);
        applier
            .apply(&WireMessage::object_created(&ob), 0.0)
            .unwrap();
        client_store
            .claim_physics_ownership(ob.uid, ClientId(1), 1.0)
            .unwrap();

        let echoed = WireMessage::ObjectTransformUpdate {
            uid: ob.uid,
            author: ClientId(1),
            update: crate::world::TransformUpdate::at_rest(
                cgmath::Vector3::new(5.0, 0.0, 0.0),
                crate::math::DEFAULT_AXIS,
                0.0,
                1.0,
            ),
        };
        assert_eq!(applier.apply(&echoed, 1.0).unwrap(), ApplyOutcome::Ignored);
    }

    #[test]
    fn out_of_order_transform_is_ignored_and_keeps_pose() {
        let client_store = Arc::new(WorldStateStore::new());
        let applier = RemoteApplier::new(Arc::clone(&client_store), ClientId(1));
        let mut ob = WorldObject::default();
        ob.uid = crate::world::Uid(11);
        applier
            .apply(&WireMessage::object_created(&ob), 0.0)
            .unwrap();

        let transform = |x: f64| WireMessage::ObjectTransformUpdate {
            uid: ob.uid,
            author: ClientId(3),
            update: crate::world::TransformUpdate::at_rest(
                cgmath::Vector3::new(x, 0.0, 0.0),
                crate::math::DEFAULT_AXIS,
                0.0,
                x,
            ),
        };
        assert_eq!(
            applier.apply(&transform(6.0), 2.0).unwrap(),
            ApplyOutcome::TransformApplied
        );
        client_store.drain_remote_changes();
        assert_eq!(
            applier.apply(&transform(4.0), 1.5).unwrap(),
            ApplyOutcome::Ignored
        );
        assert_eq!(client_store.with_object(ob.uid, |ob| ob.pos.x), Some(6.0));
        assert!(client_store.drain_remote_changes().is_empty());
    }
}
