//! 多实例姿态存储与 PoseStream

mod dirty;
mod range;
mod storage;
mod stream;

pub use storage::PoseStorage;
pub use stream::PoseStream;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::skeleton::{BoneTransform, RigDefinition};

bitflags::bitflags! {
    /// 骨骼本帧被写入过的变换通道
    pub struct BoneTransformFlags: u8 {
        const TRANSLATION = 0b001;
        const ROTATION = 0b010;
        const SCALE = 0b100;
    }
}

/// 动画实例标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// 生成进程内唯一的实例 ID
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 实例在共享缓冲区中的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceOffsets {
    pub pose_offset: usize,
    pub flags_offset: usize,
    pub bone_count: usize,
}

/// 按拓扑顺序完整计算世界姿态
pub(crate) fn compose_world_poses(
    rig: &RigDefinition,
    local: &[BoneTransform],
    world: &mut [BoneTransform],
) {
    for (i, bone) in rig.bones().iter().enumerate() {
        world[i] = match bone.parent() {
            Some(p) => world[p] * local[i],
            None => local[i],
        };
    }
}
