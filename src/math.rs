//! Vector aliases and the rotation helpers shared by records and snapshot interpolation.
//!
//! Rotations travel as axis + angle. Interpolation converts both endpoints to
//! unit quaternions, blends them with `nlerp`, and converts back.

use cgmath::{InnerSpace, Quaternion, Rad, Rotation3, Vector3};

pub type Vec3d = Vector3<f64>;
pub type Vec3f = Vector3<f32>;
pub type Vec3i = Vector3<i32>;

/// Axis used whenever a rotation axis is missing or degenerate.
pub const DEFAULT_AXIS: Vec3f = Vector3 {
    x: 0.0,
    y: 0.0,
    z: 1.0,
};

pub const ZERO_VEC3F: Vec3f = Vector3 {
    x: 0.0,
    y: 0.0,
    z: 0.0,
};

pub const ZERO_VEC3D: Vec3d = Vector3 {
    x: 0.0,
    y: 0.0,
    z: 0.0,
};

pub const UNIT_SCALE: Vec3f = Vector3 {
    x: 1.0,
    y: 1.0,
    z: 1.0,
};

const DEGENERATE_AXIS_LEN2: f32 = 1.0e-10;

pub fn is_finite_vec3f(v: Vec3f) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

pub fn is_finite_vec3d(v: Vec3d) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

/// Euclidean modulo: the result is always in `0..modulus` even for negative `value`.
pub fn euclid_mod(value: i64, modulus: usize) -> usize {
    value.rem_euclid(modulus as i64) as usize
}

pub fn lerp_vec3d(a: Vec3d, b: Vec3d, t: f32) -> Vec3d {
    a + (b - a) * t as f64
}

pub fn lerp_vec3f(a: Vec3f, b: Vec3f, t: f32) -> Vec3f {
    a + (b - a) * t
}

/// Unit quaternion for an axis/angle pair. A degenerate axis yields the identity.
pub fn axis_angle_to_quat(axis: Vec3f, angle: f32) -> Quaternion<f32> {
    if axis.magnitude2() < DEGENERATE_AXIS_LEN2 || !angle.is_finite() {
        return Quaternion::new(1.0, 0.0, 0.0, 0.0);
    }
    Quaternion::from_axis_angle(axis.normalize(), Rad(angle))
}

/// Axis/angle pair for a quaternion. Near-identity rotations map to
/// `(DEFAULT_AXIS, 0.0)` instead of producing a NaN axis.
pub fn quat_to_axis_angle(q: Quaternion<f32>) -> (Vec3f, f32) {
    if q.magnitude2() < DEGENERATE_AXIS_LEN2 {
        return (DEFAULT_AXIS, 0.0);
    }
    let q = q.normalize();
    let w = q.s.clamp(-1.0, 1.0);
    let sin_half = (1.0 - w * w).max(0.0).sqrt();
    if q.v.magnitude2() < DEGENERATE_AXIS_LEN2 || sin_half < 1.0e-6 {
        return (DEFAULT_AXIS, 0.0);
    }
    (q.v / sin_half, 2.0 * w.acos())
}

/// Normalised linear interpolation along the shorter arc.
pub fn nlerp(a: Quaternion<f32>, b: Quaternion<f32>, t: f32) -> Quaternion<f32> {
    let b = if a.dot(b) < 0.0 { -b } else { b };
    let blended = a * (1.0 - t) + b * t;
    if blended.magnitude2() < DEGENERATE_AXIS_LEN2 {
        return a;
    }
    blended.normalize()
}

/// Blends two axis/angle rotations. Never lerps the axis directly.
pub fn interpolate_rotation(
    axis_a: Vec3f,
    angle_a: f32,
    axis_b: Vec3f,
    angle_b: f32,
    t: f32,
) -> (Vec3f, f32) {
    let qa = axis_angle_to_quat(axis_a, angle_a);
    let qb = axis_angle_to_quat(axis_b, angle_b);
    let (axis, angle) = quat_to_axis_angle(nlerp(qa, qb, t));
    if !is_finite_vec3f(axis) || !angle.is_finite() {
        return (DEFAULT_AXIS, 0.0);
    }
    (axis, angle)
}

/// Finite transform substitute values, returned with a flag telling whether
/// anything had to be replaced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SanitizedTransform {
    pub pos: Vec3d,
    pub axis: Vec3f,
    pub angle: f32,
    pub scale: Vec3f,
    pub translation: Vec3f,
    pub replaced: bool,
}

pub fn sanitize_transform(
    pos: Vec3d,
    axis: Vec3f,
    angle: f32,
    scale: Vec3f,
    translation: Vec3f,
) -> SanitizedTransform {
    let mut replaced = false;

    let pos = if is_finite_vec3d(pos) {
        pos
    } else {
        replaced = true;
        ZERO_VEC3D
    };

    let (axis, angle) = if is_finite_vec3f(axis) && angle.is_finite() {
        (axis, angle)
    } else {
        replaced = true;
        (DEFAULT_AXIS, 0.0)
    };

    let scale = if is_finite_vec3f(scale) {
        scale
    } else {
        replaced = true;
        UNIT_SCALE
    };

    let translation = if is_finite_vec3f(translation) {
        translation
    } else {
        replaced = true;
        ZERO_VEC3F
    };

    SanitizedTransform {
        pos,
        axis,
        angle,
        scale,
        translation,
        replaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1.0e-4
    }

    #[test]
    fn euclid_mod_is_never_negative() {
        assert_eq!(euclid_mod(-1, 16), 15);
        assert_eq!(euclid_mod(-16, 16), 0);
        assert_eq!(euclid_mod(-17, 16), 15);
        assert_eq!(euclid_mod(33, 16), 1);
    }

    #[test]
    fn axis_angle_survives_quaternion_conversion() {
        let axis = Vector3::new(0.0f32, 1.0, 0.0);
        let (out_axis, out_angle) = quat_to_axis_angle(axis_angle_to_quat(axis, 1.2));
        assert!(approx(out_axis.y, 1.0));
        assert!(approx(out_angle, 1.2));
    }

    #[test]
    fn interpolating_opposite_identity_falls_back_to_default_axis() {
        let (axis, angle) =
            interpolate_rotation(Vector3::new(0.0, 0.0, 0.0), 0.0, DEFAULT_AXIS, 0.0, 0.5);
        assert_eq!(axis, DEFAULT_AXIS);
        assert_eq!(angle, 0.0);
    }

    #[test]
    fn nlerp_midpoint_about_shared_axis() {
        let (axis, angle) = interpolate_rotation(DEFAULT_AXIS, 0.0, DEFAULT_AXIS, 1.0, 0.5);
        assert!(approx(axis.z, 1.0));
        assert!((angle - 0.5).abs() < 1.0e-2);
    }

    #[test]
    fn sanitize_replaces_non_finite_fields() {
        let result = sanitize_transform(
            Vector3::new(f64::NAN, 0.0, 0.0),
            Vector3::new(0.0, f32::INFINITY, 0.0),
            0.3,
            Vector3::new(1.0, f32::NAN, 1.0),
            ZERO_VEC3F,
        );
        assert!(result.replaced);
        assert_eq!(result.pos, ZERO_VEC3D);
        assert_eq!(result.axis, DEFAULT_AXIS);
        assert_eq!(result.angle, 0.0);
        assert_eq!(result.scale, UNIT_SCALE);
    }

    #[test]
    fn sanitize_keeps_finite_fields() {
        let result = sanitize_transform(
            Vector3::new(1.0, 2.0, 3.0),
            DEFAULT_AXIS,
            0.5,
            UNIT_SCALE,
            ZERO_VEC3F,
        );
        assert!(!result.replaced);
        assert_eq!(result.angle, 0.5);
    }
}
