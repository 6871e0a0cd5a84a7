//! Pose Engine - 骨骼动画运行时核心
//!
//! 提供：
//! - 刚体姿态代数（平移 / 旋转 / 均匀缩放）
//! - 不可变、共享的骨骼拓扑（RigDefinition）
//! - 多实例共享姿态存储（本地空间 / 世界空间）
//! - 按需惰性重建世界姿态的 PoseStream
//! - 网格骨骼重映射缓存与蒙皮矩阵生成

pub mod application;
pub mod config;
pub mod pose;
pub mod skeleton;
pub mod skinning;

pub use application::{AnimationApplication, BoneAttachment, FrameStats, PoseModifier};
pub use config::AnimationConfig;
pub use pose::{BoneTransformFlags, InstanceId, InstanceOffsets, PoseStorage, PoseStream};
pub use skeleton::{BoneTransform, RigBone, RigDefinition, RigDefinitionBuilder};
pub use skinning::{
    BoneRemapTable, RemapKey, SkinMatrix, SkinRemapCache, SkinnedMeshBone, SkinnedMeshInfo,
    SkinnedMeshInstance,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoseError {
    #[error("bone {bone} has parent {parent}, parents must precede their children")]
    ParentOrder { bone: usize, parent: i32 },

    #[error("bone '{bone}' references unknown parent '{parent}'")]
    UnknownParent { bone: String, parent: String },

    #[error("duplicate bone name '{0}'")]
    DuplicateBone(String),

    #[error("bone hierarchy contains a cycle through '{0}'")]
    HierarchyCycle(String),

    #[error("instance {0} is already registered")]
    DuplicateInstance(InstanceId),

    #[error("instance {0} is not registered")]
    UnknownInstance(InstanceId),

    #[error("expected {expected} local poses, got {actual}")]
    PoseCountMismatch { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, PoseError>;
