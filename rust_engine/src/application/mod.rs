//! 每帧动画应用流程
//!
//! 1. 重建生产者改写过的世界姿态，并行执行姿态修改器（IK / 覆盖）
//! 2. 并行：填充重映射表缓存 ‖ 骨骼变换传播到场景物体
//! 3. 并行计算蒙皮矩阵
//!
//! 第 3 步依赖第 2 步的两个分支全部完成。

mod propagate;

pub use propagate::{propagate_bone_transforms, BoneAttachment};

use crate::config::{self, AnimationConfig};
use crate::pose::{InstanceId, PoseStorage, PoseStream};
use crate::skinning::{apply_skinning, SkinRemapCache, SkinnedMeshInstance};

/// 读取世界姿态并写回修正的消费者（IK、程序化覆盖等）
///
/// 不同实例的 `modify` 会被并行调用，同一实例内是串行的。
pub trait PoseModifier: Send + Sync {
    fn modify(&self, instance: InstanceId, stream: &mut PoseStream<'_>);
}

/// 单帧统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub modified_instances: usize,
    pub remap_tables_built: usize,
    pub propagated: usize,
    pub propagation_skipped: usize,
    pub skinned_meshes: usize,
    pub skinning_skipped: usize,
}

pub struct AnimationApplication {
    remap_cache: SkinRemapCache,
    modifiers: Vec<Box<dyn PoseModifier>>,
    default_root_bone_index: usize,
    parallel_min_items: usize,
    debug_log: bool,
    frame: u64,
}

impl AnimationApplication {
    /// 使用全局配置创建
    pub fn new() -> Self {
        Self::with_config(&config::get_config())
    }

    pub fn with_config(config: &AnimationConfig) -> Self {
        Self {
            remap_cache: SkinRemapCache::with_logging(config.log_remap_tables),
            modifiers: Vec::new(),
            default_root_bone_index: config.default_root_bone_index,
            parallel_min_items: config.parallel_min_items.max(1),
            debug_log: config.debug_log,
            frame: 0,
        }
    }

    pub fn add_modifier<M: PoseModifier + 'static>(&mut self, modifier: M) {
        self.modifiers.push(Box::new(modifier));
    }

    pub fn modifier_count(&self) -> usize {
        self.modifiers.len()
    }

    pub fn remap_cache(&self) -> &SkinRemapCache {
        &self.remap_cache
    }

    pub fn remap_cache_mut(&mut self) -> &mut SkinRemapCache {
        &mut self.remap_cache
    }

    /// 执行一帧
    ///
    /// 调用前生产者应已写入本帧所有实例的本地姿态。
    pub fn update(
        &mut self,
        storage: &mut PoseStorage,
        attachments: &mut [BoneAttachment],
        meshes: &mut [SkinnedMeshInstance],
    ) -> FrameStats {
        let mut stats = FrameStats::default();

        storage.clear_transform_flags();
        storage.rebuild_world_poses();

        if !self.modifiers.is_empty() {
            let modifiers = &self.modifiers;
            stats.modified_instances = storage.par_for_each_stream(|id, stream| {
                for modifier in modifiers {
                    modifier.modify(id, stream);
                }
            });
        }

        let storage: &PoseStorage = storage;
        let cache = &mut self.remap_cache;
        let parallel_min_items = self.parallel_min_items;
        let (built, (propagated, propagation_skipped)) = rayon::join(
            || cache.fill(meshes, storage),
            || propagate_bone_transforms(attachments, storage, parallel_min_items),
        );
        stats.remap_tables_built = built;
        stats.propagated = propagated;
        stats.propagation_skipped = propagation_skipped;

        let skinning = apply_skinning(
            meshes,
            storage,
            &self.remap_cache,
            self.default_root_bone_index,
            parallel_min_items,
        );
        stats.skinned_meshes = skinning.skinned;
        stats.skinning_skipped = skinning.skipped;

        self.frame += 1;
        if self.debug_log {
            log::debug!("动画帧 {}: {:?}", self.frame, stats);
        }
        stats
    }
}

impl Default for AnimationApplication {
    fn default() -> Self {
        Self::new()
    }
}
