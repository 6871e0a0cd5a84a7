//! 骨骼拓扑与刚体姿态

mod rig;

pub use rig::{bone_hash, RigBone, RigDefinition, RigDefinitionBuilder};

use glam::{Mat4, Quat, Vec3};
use std::ops::Mul;

const SCALE_EPSILON: f32 = 1e-8;

/// 骨骼变换数据（平移 + 旋转 + 均匀缩放）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneTransform {
    pub pos: Vec3,
    pub rot: Quat,
    pub scale: f32,
}

impl Default for BoneTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl BoneTransform {
    pub const IDENTITY: Self = Self {
        pos: Vec3::ZERO,
        rot: Quat::IDENTITY,
        scale: 1.0,
    };

    pub fn new(pos: Vec3, rot: Quat, scale: f32) -> Self {
        Self {
            pos,
            rot: safe_normalize(rot),
            scale,
        }
    }

    pub fn from_translation(pos: Vec3) -> Self {
        Self { pos, ..Self::IDENTITY }
    }

    pub fn from_rotation(rot: Quat) -> Self {
        Self {
            rot: safe_normalize(rot),
            ..Self::IDENTITY
        }
    }

    /// 组合变换：先应用 `child`，再应用 `self`
    ///
    /// `world[b] = world[parent(b)].multiply(local[b])`
    pub fn multiply(&self, child: &BoneTransform) -> BoneTransform {
        BoneTransform {
            pos: self.pos + self.rot * (child.pos * self.scale),
            rot: safe_normalize(self.rot * child.rot),
            scale: self.scale * child.scale,
        }
    }

    /// 逆变换，缩放为 0 时结果缩放也为 0（不产生无穷大）
    pub fn inverse(&self) -> BoneTransform {
        let inv_rot = safe_normalize(self.rot).conjugate();
        let inv_scale = if self.scale.abs() > SCALE_EPSILON {
            1.0 / self.scale
        } else {
            0.0
        };
        BoneTransform {
            pos: inv_rot * (-self.pos) * inv_scale,
            rot: inv_rot,
            scale: inv_scale,
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.pos + self.rot * (point * self.scale)
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(Vec3::splat(self.scale), self.rot, self.pos)
    }

    /// 从仿射矩阵还原，缩放取三个轴的平均值
    pub fn from_matrix(m: &Mat4) -> BoneTransform {
        let (scale, rot, pos) = m.to_scale_rotation_translation();
        BoneTransform {
            pos,
            rot: safe_normalize(rot),
            scale: (scale.x + scale.y + scale.z) / 3.0,
        }
    }

    pub fn abs_diff_eq(&self, other: &BoneTransform, max_abs_diff: f32) -> bool {
        self.pos.abs_diff_eq(other.pos, max_abs_diff)
            && quat_eq(self.rot, other.rot, max_abs_diff)
            && (self.scale - other.scale).abs() <= max_abs_diff
    }
}

impl Mul for BoneTransform {
    type Output = BoneTransform;

    fn mul(self, rhs: BoneTransform) -> BoneTransform {
        self.multiply(&rhs)
    }
}

/// 归一化四元数，零长度或非有限值返回单位旋转
pub fn safe_normalize(q: Quat) -> Quat {
    let len = q.length();
    if len.is_finite() && len > 1e-12 {
        q * (1.0 / len)
    } else {
        Quat::IDENTITY
    }
}

/// q 与 -q 表示同一旋转
fn quat_eq(a: Quat, b: Quat, max_abs_diff: f32) -> bool {
    a.abs_diff_eq(b, max_abs_diff) || a.abs_diff_eq(-b, max_abs_diff)
}
