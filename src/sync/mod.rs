pub mod telemetry;

use self::telemetry::{SyncTelemetry, TickReport};
use crate::config::SyncConfig;
use crate::network::WireMessage;
use crate::network::replication::{WorldSnapshot, WorldSnapshotBuilder};
use crate::network::transport::{Broadcaster, OutboundUpdate};
use crate::world::store::{DirtyEntry, EntityKind};
use crate::world::{DirtyFlags, ObjectState, TransformUpdate, WorldState, WorldStateStore};
use crate::wire::OutStream;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Periodically turns dirty entities into broadcast messages and saves the world.
pub struct SyncLoop {
    store: Arc<WorldStateStore>,
    broadcaster: Box<dyn Broadcaster>,
    config: SyncConfig,
    telemetry: SyncTelemetry,
    tick: u64,
    last_save: Option<f64>,
}

impl SyncLoop {
    pub fn new(store: Arc<WorldStateStore>, broadcaster: Box<dyn Broadcaster>, config: SyncConfig) -> Self {
        Self {
            store,
            broadcaster,
            config,
            telemetry: SyncTelemetry::default(),
            tick: 0,
            last_save: None,
        }
    }

    pub fn store(&self) -> &Arc<WorldStateStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &SyncTelemetry {
        &self.telemetry
    }

    /// Everything a newly connected client needs, chunked to `max_chunk_bytes`.
    pub fn initial_snapshot(&self) -> WorldSnapshot {
        let state = self.store.lock();
        WorldSnapshotBuilder::new()
            .with_chunk_limit(self.config.max_chunk_bytes)
            .build(&state)
    }

    /// Runs one tick at `now` seconds.
    pub fn tick(&mut self, now: f64) -> TickReport {
        let started = Instant::now();
        self.tick += 1;

        let (entries, updates, (objects_created, objects_removed)) = {
            let mut state = self.store.lock();
            let entries = state.drain_dirty_flags();
            let world: &WorldState = &state;
            let updates: Vec<(OutboundUpdate, usize)> = entries
                .par_iter()
                .filter_map(|entry| build_update(world, entry))
                .collect();
            let lifecycle = state.finish_broadcast(&entries);
            (entries, updates, lifecycle)
        };

        let messages_sent: usize = updates.iter().map(|(_, count)| count).sum();
        let updates: Vec<OutboundUpdate> = updates.into_iter().map(|(update, _)| update).collect();
        let bytes_sent: usize = updates.iter().map(|update| update.bytes.len()).sum();
        if !updates.is_empty() {
            self.broadcaster.broadcast(&updates);
        }

        let saved = self.maybe_save(now);
        let report = TickReport {
            tick: self.tick,
            dirty_entities: entries.len(),
            messages_sent,
            bytes_sent,
            objects_created,
            objects_removed,
            elapsed_ms: started.elapsed().as_secs_f32() * 1000.0,
            saved,
        };
        if report.dirty_entities > 0 {
            log::debug!(
                "[sync] tick {} sent {} messages ({} bytes) for {} entities",
                report.tick,
                report.messages_sent,
                report.bytes_sent,
                report.dirty_entities
            );
        }
        self.telemetry.record(report.clone());
        report
    }

    fn maybe_save(&mut self, now: f64) -> bool {
        let Some(path) = self.config.state_path.clone() else {
            return false;
        };
        let last = *self.last_save.get_or_insert(now);
        if now - last < self.config.save_interval_secs || !self.store.lock().changed() {
            return false;
        }
        self.last_save = Some(now);
        match self.store.serialise_to_disk(&path) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("[sync] failed to save world to {}: {err}", path.display());
                false
            }
        }
    }

    /// Ticks until `max_ticks` is reached, sleeping `tick_period` between ticks.
    /// Returns the number of ticks run.
    pub fn run(&mut self) -> u64 {
        let start = Instant::now();
        let mut ticks = 0u64;
        loop {
            if self.config.max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            self.tick(start.elapsed().as_secs_f64());
            ticks += 1;
            std::thread::sleep(self.config.tick_period());
        }
        log::info!("[sync] stopped after {ticks} ticks");
        ticks
    }
}

/// Encodes the messages owed for one drained entity. Returns the update and
/// the number of messages in it.
fn build_update(world: &WorldState, entry: &DirtyEntry) -> Option<(OutboundUpdate, usize)> {
    let messages = match entry.kind {
        EntityKind::Object => object_messages(world, entry)?,
        EntityKind::Avatar => avatar_messages(world, entry)?,
    };
    if messages.is_empty() {
        return None;
    }
    let mut out = OutStream::new();
    for message in &messages {
        message.encode(&mut out);
    }
    Some((
        OutboundUpdate {
            uid: entry.uid,
            bytes: out.into_bytes(),
        },
        messages.len(),
    ))
}

fn object_messages(world: &WorldState, entry: &DirtyEntry) -> Option<Vec<WireMessage>> {
    let ob = world.object(entry.uid)?;
    let messages = match entry.state {
        ObjectState::Dead => vec![WireMessage::ObjectDestroyed { uid: ob.uid }],
        ObjectState::JustCreated => vec![WireMessage::object_created(ob)],
        ObjectState::Alive => {
            if entry.flags.needs_full_update() {
                return Some(vec![WireMessage::object_full_update(ob)]);
            }
            let mut messages = Vec::new();
            // Receivers check the author against the owner they know, so the
            // new owner has to land before its first transform.
            if entry.flags.contains(DirtyFlags::PHYSICS_OWNERSHIP) {
                messages.push(WireMessage::ObjectPhysicsOwnershipTaken {
                    uid: ob.uid,
                    owner: ob.physics_owner_id,
                    change_time: ob.last_ownership_change_time,
                });
            }
            if entry.flags.contains(DirtyFlags::TRANSFORM) {
                let latest = ob.snapshots.latest();
                messages.push(WireMessage::ObjectTransformUpdate {
                    uid: ob.uid,
                    author: ob.physics_owner_id,
                    update: TransformUpdate {
                        pos: ob.pos,
                        axis: ob.axis,
                        angle: ob.angle,
                        linear_velocity: latest.linear_velocity,
                        angular_velocity: latest.angular_velocity,
                        send_time: latest.source_send_time,
                    },
                });
            }
            messages
        }
    };
    Some(messages)
}

fn avatar_messages(world: &WorldState, entry: &DirtyEntry) -> Option<Vec<WireMessage>> {
    let avatar = world.avatar(entry.uid)?;
    let created = WireMessage::AvatarCreated {
        uid: avatar.uid,
        name: avatar.name.clone(),
        model_url: avatar.model_url.clone(),
        pose: avatar.pose,
    };
    let messages = match entry.state {
        ObjectState::Dead => vec![WireMessage::AvatarDestroyed { uid: avatar.uid }],
        ObjectState::JustCreated => vec![created],
        ObjectState::Alive if entry.flags.needs_full_update() => vec![created],
        ObjectState::Alive if entry.flags.contains(DirtyFlags::TRANSFORM) => {
            vec![WireMessage::AvatarTransformUpdate {
                uid: avatar.uid,
                pose: avatar.pose,
            }]
        }
        ObjectState::Alive => Vec::new(),
    };
    Some(messages)
}
