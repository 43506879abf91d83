use super::snapshot::{Pose, SharedSnapshots, TransformSnapshot};
use super::{DirtyFlags, ObjectState, Uid};
use crate::math;

/// A connected user's presence in the world. Avatars are broadcast but never
/// persisted.
#[derive(Debug, Clone)]
pub struct Avatar {
    pub uid: Uid,
    pub name: String,
    pub model_url: String,
    pub pose: Pose,
    pub state: ObjectState,
    pub from_local_dirty: DirtyFlags,
    pub from_remote_dirty: DirtyFlags,
    pub snapshots: SharedSnapshots,
}

impl Avatar {
    pub fn new(name: impl Into<String>, model_url: impl Into<String>, pose: Pose) -> Self {
        Self {
            uid: Uid::INVALID,
            name: name.into(),
            model_url: model_url.into(),
            pose,
            state: ObjectState::JustCreated,
            from_local_dirty: DirtyFlags::empty(),
            from_remote_dirty: DirtyFlags::empty(),
            snapshots: SharedSnapshots::new(TransformSnapshot::at_rest(
                pose.pos, pose.axis, pose.angle, 0.0,
            )),
        }
    }

    pub fn sanitize(&mut self) -> bool {
        let clean = math::sanitize_transform(
            self.pose.pos,
            self.pose.axis,
            self.pose.angle,
            math::UNIT_SCALE,
            math::ZERO_VEC3F,
        );
        if clean.replaced {
            log::warn!("[world] avatar {} had non-finite pose, replaced", self.uid);
            self.pose = Pose::new(clean.pos, clean.axis, clean.angle);
        }
        clean.replaced
    }

    /// Teleports: sets the pose and fills the history with it.
    pub fn set_pose_and_history(&mut self, pose: Pose, local_time: f64) {
        self.pose = pose;
        self.snapshots
            .reset(TransformSnapshot::at_rest(pose.pos, pose.axis, pose.angle, local_time));
    }

    /// Records a pose received from the network.
    pub fn apply_remote_pose(&mut self, pose: Pose, local_time: f64) -> bool {
        self.pose = pose;
        self.sanitize();
        self.from_remote_dirty |= DirtyFlags::TRANSFORM;
        self.snapshots.push(TransformSnapshot::at_rest(
            self.pose.pos,
            self.pose.axis,
            self.pose.angle,
            local_time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    #[test]
    fn remote_pose_is_sanitized_and_recorded() {
        let mut avatar = Avatar::new("bob", "avatars/bob.glb", Pose::default());
        let pushed = avatar.apply_remote_pose(
            Pose::new(Vector3::new(f64::INFINITY, 0.0, 0.0), math::DEFAULT_AXIS, 0.0),
            1.0,
        );
        assert!(pushed);
        assert_eq!(avatar.pose.pos.x, 0.0);
        assert!(avatar.from_remote_dirty.contains(DirtyFlags::TRANSFORM));
        assert_eq!(avatar.snapshots.latest().local_time, 1.0);
    }
}
