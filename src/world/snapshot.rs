//! Transform history and delayed interpolation.
//!
//! Network updates arrive at irregular intervals. Each one is stamped with the
//! local receive time and pushed into a fixed ring. Rendering samples the ring
//! `RENDER_DELAY` seconds in the past so there is almost always a bracketing
//! pair of samples to blend between.

use crate::math::{
    self, DEFAULT_AXIS, Vec3d, Vec3f, ZERO_VEC3F, euclid_mod, interpolate_rotation,
};
use std::sync::{Arc, PoisonError, RwLock};

pub const HISTORY_BUF_SIZE: usize = 16;
/// Nominal interval between transform sends, seconds.
pub const SEND_PERIOD: f64 = 0.1;
/// How far behind the newest sample rendering runs, seconds.
pub const RENDER_DELAY: f64 = SEND_PERIOD * 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformSnapshot {
    pub pos: Vec3d,
    pub axis: Vec3f,
    pub angle: f32,
    pub linear_velocity: Vec3f,
    pub angular_velocity: Vec3f,
    /// Sender clock when the update left the sender.
    pub source_send_time: f64,
    /// Receiver clock when the update arrived.
    pub local_time: f64,
}

impl TransformSnapshot {
    pub fn at_rest(pos: Vec3d, axis: Vec3f, angle: f32, local_time: f64) -> Self {
        Self {
            pos,
            axis,
            angle,
            linear_velocity: ZERO_VEC3F,
            angular_velocity: ZERO_VEC3F,
            source_send_time: local_time,
            local_time,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose {
            pos: self.pos,
            axis: self.axis,
            angle: self.angle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub pos: Vec3d,
    pub axis: Vec3f,
    pub angle: f32,
}

impl Pose {
    pub fn new(pos: Vec3d, axis: Vec3f, angle: f32) -> Self {
        Self { pos, axis, angle }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            pos: math::ZERO_VEC3D,
            axis: DEFAULT_AXIS,
            angle: 0.0,
        }
    }
}

/// Ring of the most recent `HISTORY_BUF_SIZE` samples.
///
/// Every slot always holds a valid sample: construction and [`reset`](Self::reset)
/// fill the whole ring.
#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    samples: [TransformSnapshot; HISTORY_BUF_SIZE],
    next_index: u64,
}

impl SnapshotBuffer {
    pub fn new(initial: TransformSnapshot) -> Self {
        Self {
            samples: [initial; HISTORY_BUF_SIZE],
            next_index: HISTORY_BUF_SIZE as u64,
        }
    }

    /// Teleport: forget the history and fill every slot with `sample`.
    pub fn reset(&mut self, sample: TransformSnapshot) {
        self.samples = [sample; HISTORY_BUF_SIZE];
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn push_snapshot(&mut self, sample: TransformSnapshot) {
        let slot = euclid_mod(self.next_index as i64, HISTORY_BUF_SIZE);
        self.samples[slot] = sample;
        self.next_index += 1;
    }

    /// Pushes only if the sample is not older than the newest one.
    pub fn push_if_not_older(&mut self, sample: TransformSnapshot) -> bool {
        if sample.local_time < self.latest().local_time {
            return false;
        }
        self.push_snapshot(sample);
        true
    }

    fn logical(&self, index: i64) -> &TransformSnapshot {
        &self.samples[euclid_mod(index, HISTORY_BUF_SIZE)]
    }

    pub fn latest(&self) -> &TransformSnapshot {
        self.logical(self.next_index as i64 - 1)
    }

    pub fn len(&self) -> usize {
        HISTORY_BUF_SIZE
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Samples oldest first.
    pub fn samples(&self) -> Vec<TransformSnapshot> {
        let next = self.next_index as i64;
        (next - HISTORY_BUF_SIZE as i64..next)
            .map(|index| *self.logical(index))
            .collect()
    }

    /// Pose `RENDER_DELAY` seconds before `query_time`.
    pub fn interpolated_pose(&self, query_time: f64) -> Pose {
        let delayed = query_time - RENDER_DELAY;
        let next = self.next_index as i64;
        let oldest = next - HISTORY_BUF_SIZE as i64;

        let mut bracket = None;
        for index in oldest..next {
            if self.logical(index).local_time > delayed {
                bracket = Some(index);
                break;
            }
        }

        let (begin, end) = match bracket {
            Some(index) if index == oldest => (self.logical(index), self.logical(index)),
            Some(index) => (self.logical(index - 1), self.logical(index)),
            None => (self.latest(), self.latest()),
        };

        let span = end.local_time - begin.local_time;
        let t = if span > 0.0 {
            ((delayed - begin.local_time) / span).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };
        let t = if t.is_finite() { t } else { 0.0 };

        let pos = math::lerp_vec3d(begin.pos, end.pos, t);
        let (axis, angle) = interpolate_rotation(begin.axis, begin.angle, end.axis, end.angle, t);
        Pose { pos, axis, angle }
    }
}

/// Snapshot ring shared between one writer and many readers.
///
/// `clone()` produces an independent copy. [`share`](Self::share) hands out
/// another handle to the same ring.
#[derive(Debug)]
pub struct SharedSnapshots {
    inner: Arc<RwLock<SnapshotBuffer>>,
}

impl SharedSnapshots {
    pub fn new(initial: TransformSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SnapshotBuffer::new(initial))),
        }
    }

    pub fn share(&self) -> SharedSnapshots {
        SharedSnapshots {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns `false` when the sample is older than the newest one and was dropped.
    pub fn push(&self, sample: TransformSnapshot) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.push_if_not_older(sample)
    }

    pub fn reset(&self, sample: TransformSnapshot) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.reset(sample);
    }

    pub fn latest(&self) -> TransformSnapshot {
        *self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
    }

    pub fn interpolated_pose(&self, query_time: f64) -> Pose {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .interpolated_pose(query_time)
    }

    pub fn read<R>(&self, f: impl FnOnce(&SnapshotBuffer) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

impl Clone for SharedSnapshots {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::new(RwLock::new(self.read(SnapshotBuffer::clone))),
        }
    }
}

impl Default for SharedSnapshots {
    fn default() -> Self {
        let pose = Pose::default();
        Self::new(TransformSnapshot::at_rest(pose.pos, pose.axis, pose.angle, 0.0))
    }
}
