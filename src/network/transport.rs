//! Seam between the sync loop and whatever delivers bytes to clients.

use crate::world::Uid;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

/// Encoded messages for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundUpdate {
    pub uid: Uid,
    pub bytes: Vec<u8>,
}

pub trait Broadcaster: Send {
    fn broadcast(&mut self, updates: &[OutboundUpdate]);
}

/// Forwards each batch over a std channel.
pub struct ChannelBroadcaster {
    sender: Sender<Vec<OutboundUpdate>>,
}

impl ChannelBroadcaster {
    pub fn pair() -> (Self, Receiver<Vec<OutboundUpdate>>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&mut self, updates: &[OutboundUpdate]) {
        if self.sender.send(updates.to_vec()).is_err() {
            log::warn!("[transport] receiver dropped, discarding {} updates", updates.len());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub batches: u64,
    pub updates: u64,
    pub bytes: u64,
}

/// Keeps every batch in memory. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingBroadcaster {
    batches: Arc<Mutex<Vec<Vec<OutboundUpdate>>>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<OutboundUpdate>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<Vec<OutboundUpdate>> {
        std::mem::take(&mut *self.batches.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn stats(&self) -> BroadcastStats {
        let guard = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = BroadcastStats::default();
        for batch in guard.iter() {
            stats.batches += 1;
            stats.updates += batch.len() as u64;
            stats.bytes += batch.iter().map(|u| u.bytes.len() as u64).sum::<u64>();
        }
        stats
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&mut self, updates: &[OutboundUpdate]) {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(updates.to_vec());
    }
}
