//! 多实例共享姿态存储
//!
//! 所有活动实例的本地姿态、世界姿态和变换标志位拼接在三块连续缓冲区中，
//! 通过实例 ID 查找各自的偏移。缓冲区扩容只能在 `&mut self` 下发生，
//! 因此不存在读者观察到一半重映射状态的情况；并行阶段通过
//! `par_for_each_stream` 拿到互不重叠的切片。

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use super::range::RangeAllocator;
use super::{compose_world_poses, BoneTransformFlags, InstanceId, InstanceOffsets, PoseStream};
use crate::config::{self, AnimationConfig};
use crate::skeleton::{BoneTransform, RigDefinition};
use crate::{PoseError, Result};

struct InstanceSlot {
    offsets: InstanceOffsets,
    rig: Arc<RigDefinition>,
    /// 本地姿态被生产者改写后，世界姿态缓存整体过期
    world_stale: bool,
}

impl InstanceSlot {
    fn pose_range(&self) -> Range<usize> {
        self.offsets.pose_offset..self.offsets.pose_offset + self.offsets.bone_count
    }

    fn flags_range(&self) -> Range<usize> {
        self.offsets.flags_offset..self.offsets.flags_offset + self.offsets.bone_count
    }
}

/// 单个实例在共享缓冲区中的可变视图
pub(crate) struct InstanceView<'a> {
    pub id: InstanceId,
    pub rig: &'a RigDefinition,
    pub local: &'a mut [BoneTransform],
    pub world: &'a mut [BoneTransform],
    pub flags: &'a mut [BoneTransformFlags],
    pub world_stale: &'a mut bool,
}

/// 多实例姿态存储
pub struct PoseStorage {
    local_poses: Vec<BoneTransform>,
    world_poses: Vec<BoneTransform>,
    transform_flags: Vec<BoneTransformFlags>,
    pose_ranges: RangeAllocator,
    flag_ranges: RangeAllocator,
    instances: HashMap<InstanceId, InstanceSlot>,
    flags_chunk_bones: usize,
    parallel_min_items: usize,
}

impl PoseStorage {
    /// 使用全局配置创建
    pub fn new() -> Self {
        Self::with_config(&config::get_config())
    }

    pub fn with_config(config: &AnimationConfig) -> Self {
        Self {
            local_poses: Vec::with_capacity(config.initial_bone_capacity),
            world_poses: Vec::with_capacity(config.initial_bone_capacity),
            transform_flags: Vec::with_capacity(config.initial_bone_capacity),
            pose_ranges: RangeAllocator::new(),
            flag_ranges: RangeAllocator::new(),
            instances: HashMap::new(),
            flags_chunk_bones: config.flags_chunk_bones.max(1),
            parallel_min_items: config.parallel_min_items,
        }
    }

    /// 注册实例并分配姿态区间，本地姿态初始化为参考姿态
    pub fn allocate(&mut self, id: InstanceId, rig: Arc<RigDefinition>) -> Result<InstanceOffsets> {
        if self.instances.contains_key(&id) {
            return Err(PoseError::DuplicateInstance(id));
        }

        let bone_count = rig.bone_count();
        let flags_len = bone_count.div_ceil(self.flags_chunk_bones) * self.flags_chunk_bones;
        let offsets = InstanceOffsets {
            pose_offset: self.pose_ranges.allocate(bone_count),
            flags_offset: self.flag_ranges.allocate(flags_len),
            bone_count,
        };
        self.ensure_capacity();

        let pose_range = offsets.pose_offset..offsets.pose_offset + bone_count;
        let local = &mut self.local_poses[pose_range.clone()];
        for (dst, src) in local.iter_mut().zip(rig.ref_poses()) {
            *dst = src;
        }
        compose_world_poses(&rig, local, &mut self.world_poses[pose_range]);
        self.transform_flags[offsets.flags_offset..offsets.flags_offset + flags_len]
            .fill(BoneTransformFlags::empty());

        log::debug!(
            "注册实例 {}: rig='{}', 骨骼数={}, pose_offset={}, flags_offset={}",
            id,
            rig.name(),
            bone_count,
            offsets.pose_offset,
            offsets.flags_offset
        );

        self.instances.insert(
            id,
            InstanceSlot {
                offsets,
                rig,
                world_stale: false,
            },
        );
        Ok(offsets)
    }

    /// 移除实例，其区间留给后续实例复用
    pub fn release(&mut self, id: InstanceId) -> bool {
        let Some(slot) = self.instances.remove(&id) else {
            return false;
        };
        let flags_len = slot.offsets.bone_count.div_ceil(self.flags_chunk_bones) * self.flags_chunk_bones;
        self.pose_ranges.release(slot.pose_range());
        self.flag_ranges
            .release(slot.offsets.flags_offset..slot.offsets.flags_offset + flags_len);
        log::debug!("释放实例 {} (rig='{}')", id, slot.rig.name());
        true
    }

    fn ensure_capacity(&mut self) {
        let pose_end = self.pose_ranges.end();
        if self.local_poses.len() < pose_end {
            let old_capacity = self.local_poses.capacity();
            self.local_poses.resize(pose_end, BoneTransform::IDENTITY);
            self.world_poses.resize(pose_end, BoneTransform::IDENTITY);
            if self.local_poses.capacity() != old_capacity {
                log::debug!(
                    "姿态缓冲区扩容: {} -> {} 个骨骼槽位",
                    old_capacity,
                    self.local_poses.capacity()
                );
            }
        }
        let flags_end = self.flag_ranges.end();
        if self.transform_flags.len() < flags_end {
            self.transform_flags.resize(flags_end, BoneTransformFlags::empty());
        }
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn live_instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.instances.keys().copied()
    }

    /// 当前已分配的骨骼槽位数（包括空闲区间）
    pub fn pose_capacity(&self) -> usize {
        self.local_poses.len()
    }

    /// 已释放、等待复用的骨骼槽位数
    pub fn free_pose_slots(&self) -> usize {
        self.pose_ranges.free_len()
    }

    pub fn offsets(&self, id: InstanceId) -> Option<InstanceOffsets> {
        self.instances.get(&id).map(|slot| slot.offsets)
    }

    pub fn rig(&self, id: InstanceId) -> Option<&Arc<RigDefinition>> {
        self.instances.get(&id).map(|slot| &slot.rig)
    }

    /// 实例的（本地姿态, 世界姿态）切片
    ///
    /// 生产者改写本地姿态后，世界姿态要等到 `rebuild_world_poses`
    /// 或下一个 PoseStream 关闭时才会更新。
    pub fn slice_for(&self, id: InstanceId) -> Option<(&[BoneTransform], &[BoneTransform])> {
        let slot = self.instances.get(&id)?;
        let range = slot.pose_range();
        Some((&self.local_poses[range.clone()], &self.world_poses[range]))
    }

    pub fn is_world_stale(&self, id: InstanceId) -> Option<bool> {
        self.instances.get(&id).map(|slot| slot.world_stale)
    }

    pub fn transform_flags(&self, id: InstanceId) -> Option<&[BoneTransformFlags]> {
        let slot = self.instances.get(&id)?;
        Some(&self.transform_flags[slot.flags_range()])
    }

    /// 清除所有实例的变换标志位（每帧开始时调用）
    pub fn clear_transform_flags(&mut self) {
        self.transform_flags.fill(BoneTransformFlags::empty());
    }

    /// 生产者写入完整的本地姿态
    pub fn write_local_poses(&mut self, id: InstanceId, poses: &[BoneTransform]) -> Result<()> {
        let slot = self
            .instances
            .get_mut(&id)
            .ok_or(PoseError::UnknownInstance(id))?;
        if poses.len() != slot.offsets.bone_count {
            return Err(PoseError::PoseCountMismatch {
                expected: slot.offsets.bone_count,
                actual: poses.len(),
            });
        }
        self.local_poses[slot.pose_range()].copy_from_slice(poses);
        slot.world_stale = true;
        Ok(())
    }

    /// 生产者直接改写本地姿态，世界姿态随之标记为过期
    pub fn local_poses_mut(&mut self, id: InstanceId) -> Option<&mut [BoneTransform]> {
        let slot = self.instances.get_mut(&id)?;
        slot.world_stale = true;
        Some(&mut self.local_poses[slot.pose_range()])
    }

    pub fn reset_to_ref_pose(&mut self, id: InstanceId) -> Result<()> {
        let slot = self
            .instances
            .get_mut(&id)
            .ok_or(PoseError::UnknownInstance(id))?;
        let local = &mut self.local_poses[slot.pose_range()];
        for (dst, src) in local.iter_mut().zip(slot.rig.ref_poses()) {
            *dst = src;
        }
        slot.world_stale = true;
        Ok(())
    }

    /// 为单个实例打开 PoseStream
    pub fn open_stream(&mut self, id: InstanceId) -> Option<PoseStream<'_>> {
        let slot = self.instances.get_mut(&id)?;
        let pose_range = slot.pose_range();
        let flags_range = slot.flags_range();
        let InstanceSlot {
            rig, world_stale, ..
        } = slot;
        Some(PoseStream::open(InstanceView {
            id,
            rig,
            local: &mut self.local_poses[pose_range.clone()],
            world: &mut self.world_poses[pose_range],
            flags: &mut self.transform_flags[flags_range],
            world_stale,
        }))
    }

    /// 将缓冲区切分为每个实例互不重叠的视图
    fn instance_views(&mut self) -> Vec<InstanceView<'_>> {
        let slots: Vec<(&InstanceId, &mut InstanceSlot)> = self.instances.iter_mut().collect();
        let pose_ranges: Vec<Range<usize>> = slots.iter().map(|(_, slot)| slot.pose_range()).collect();
        let flag_ranges: Vec<Range<usize>> = slots.iter().map(|(_, slot)| slot.flags_range()).collect();

        let locals = split_disjoint_mut(&mut self.local_poses, &pose_ranges);
        let worlds = split_disjoint_mut(&mut self.world_poses, &pose_ranges);
        let flags = split_disjoint_mut(&mut self.transform_flags, &flag_ranges);

        slots
            .into_iter()
            .zip(locals.into_iter().zip(worlds).zip(flags))
            .map(|((&id, slot), ((local, world), flags))| {
                let InstanceSlot {
                    rig, world_stale, ..
                } = slot;
                InstanceView {
                    id,
                    rig,
                    local,
                    world,
                    flags,
                    world_stale,
                }
            })
            .collect()
    }

    /// 为每个活动实例打开 PoseStream 并并行执行 `f`，返回处理的实例数
    ///
    /// 每个流在 `f` 返回后立即关闭（完整重建世界姿态）。
    pub fn par_for_each_stream<F>(&mut self, f: F) -> usize
    where
        F: Fn(InstanceId, &mut PoseStream<'_>) + Send + Sync,
    {
        let parallel = self.instances.len() >= self.parallel_min_items;
        let views = self.instance_views();
        let count = views.len();
        let run = |view: InstanceView<'_>| {
            let id = view.id;
            let mut stream = PoseStream::open(view);
            f(id, &mut stream);
        };
        if parallel {
            views.into_par_iter().for_each(run);
        } else {
            views.into_iter().for_each(run);
        }
        count
    }

    /// 重建所有世界姿态过期的实例，返回重建的实例数
    pub fn rebuild_world_poses(&mut self) -> usize {
        let parallel = self.instances.len() >= self.parallel_min_items;
        let stale: Vec<InstanceView<'_>> = self
            .instance_views()
            .into_iter()
            .filter(|view| *view.world_stale)
            .collect();
        let count = stale.len();
        let rebuild = |view: InstanceView<'_>| {
            compose_world_poses(view.rig, view.local, view.world);
            *view.world_stale = false;
        };
        if parallel {
            stale.into_par_iter().for_each(rebuild);
        } else {
            stale.into_iter().for_each(rebuild);
        }
        count
    }
}

impl Default for PoseStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// 按互不重叠的区间切分缓冲区，返回顺序与 `ranges` 一致
fn split_disjoint_mut<'a, T>(buf: &'a mut [T], ranges: &[Range<usize>]) -> Vec<&'a mut [T]> {
    let mut order: Vec<usize> = (0..ranges.len()).filter(|&i| !ranges[i].is_empty()).collect();
    order.sort_by_key(|&i| ranges[i].start);

    let mut out: Vec<&'a mut [T]> = (0..ranges.len()).map(|_| Default::default()).collect();
    let mut rest = buf;
    let mut consumed = 0;
    for i in order {
        let range = &ranges[i];
        debug_assert!(range.start >= consumed, "overlapping pose ranges");
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(range.start - consumed);
        let (head, tail) = tail.split_at_mut(range.len());
        out[i] = head;
        rest = tail;
        consumed = range.end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::RigBone;
    use glam::{Quat, Vec3};

    fn test_config() -> AnimationConfig {
        AnimationConfig {
            initial_bone_capacity: 4,
            flags_chunk_bones: 8,
            parallel_min_items: 2,
            ..AnimationConfig::default()
        }
    }

    fn rig(bones: usize) -> Arc<RigDefinition> {
        let bones = (0..bones)
            .map(|i| {
                RigBone::new(
                    format!("bone{}", i),
                    i as i32 - 1,
                    BoneTransform::from_translation(Vec3::Y),
                )
            })
            .collect();
        Arc::new(RigDefinition::new("line", bones).unwrap())
    }

    #[test]
    fn test_allocate_initializes_ref_and_world_pose() {
        let mut storage = PoseStorage::with_config(&test_config());
        let id = InstanceId::next();
        let offsets = storage.allocate(id, rig(3)).unwrap();
        assert_eq!(offsets.bone_count, 3);

        let (local, world) = storage.slice_for(id).unwrap();
        assert_eq!(local.len(), 3);
        assert_eq!(world.len(), 3);
        assert!(world[2].pos.abs_diff_eq(Vec3::new(0.0, 3.0, 0.0), 1e-6));
        assert_eq!(storage.is_world_stale(id), Some(false));
        assert_eq!(storage.transform_flags(id).map(|f| f.len()), Some(3));
    }

    #[test]
    fn test_duplicate_and_unknown_instances() {
        let mut storage = PoseStorage::with_config(&test_config());
        let id = InstanceId::next();
        storage.allocate(id, rig(2)).unwrap();
        assert_eq!(storage.allocate(id, rig(2)), Err(PoseError::DuplicateInstance(id)));

        let ghost = InstanceId::next();
        assert!(storage.slice_for(ghost).is_none());
        assert!(storage.open_stream(ghost).is_none());
        assert!(!storage.release(ghost));
        assert_eq!(
            storage.write_local_poses(ghost, &[]),
            Err(PoseError::UnknownInstance(ghost))
        );
    }

    #[test]
    fn test_offsets_never_overlap_and_are_reused() {
        let mut storage = PoseStorage::with_config(&test_config());
        let ids: Vec<InstanceId> = (0..4).map(|_| InstanceId::next()).collect();
        for (i, &id) in ids.iter().enumerate() {
            storage.allocate(id, rig(i + 2)).unwrap();
        }

        let mut ranges: Vec<(usize, usize)> = ids
            .iter()
            .map(|&id| {
                let o = storage.offsets(id).unwrap();
                (o.pose_offset, o.pose_offset + o.bone_count)
            })
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }

        let released = storage.offsets(ids[1]).unwrap();
        let stable = storage.offsets(ids[2]).unwrap();
        assert!(storage.release(ids[1]));
        assert_eq!(storage.free_pose_slots(), 3);
        let reused = InstanceId::next();
        let offsets = storage.allocate(reused, rig(3)).unwrap();
        assert_eq!(offsets.pose_offset, released.pose_offset);
        assert_eq!(storage.free_pose_slots(), 0);
        assert_eq!(storage.offsets(ids[2]), Some(stable));
    }

    #[test]
    fn test_flags_offsets_are_chunked() {
        let mut storage = PoseStorage::with_config(&test_config());
        let a = InstanceId::next();
        let b = InstanceId::next();
        storage.allocate(a, rig(3)).unwrap();
        let offsets = storage.allocate(b, rig(3)).unwrap();
        assert_eq!(offsets.pose_offset, 3);
        assert_eq!(offsets.flags_offset, 8);
    }

    #[test]
    fn test_growth_keeps_existing_data() {
        let mut storage = PoseStorage::with_config(&test_config());
        let first = InstanceId::next();
        storage.allocate(first, rig(2)).unwrap();
        let marker = BoneTransform::from_rotation(Quat::from_rotation_z(0.5));
        storage
            .write_local_poses(first, &[marker, BoneTransform::IDENTITY])
            .unwrap();

        for _ in 0..16 {
            storage.allocate(InstanceId::next(), rig(8)).unwrap();
        }
        assert!(storage.pose_capacity() >= 2 + 16 * 8);
        let (local, _) = storage.slice_for(first).unwrap();
        assert_eq!(local[0], marker);
    }

    #[test]
    fn test_write_local_poses_marks_world_stale() {
        let mut storage = PoseStorage::with_config(&test_config());
        let id = InstanceId::next();
        storage.allocate(id, rig(2)).unwrap();

        let poses = [BoneTransform::from_translation(Vec3::X); 2];
        assert_eq!(
            storage.write_local_poses(id, &poses[..1]),
            Err(PoseError::PoseCountMismatch { expected: 2, actual: 1 })
        );
        storage.write_local_poses(id, &poses).unwrap();
        assert_eq!(storage.is_world_stale(id), Some(true));

        assert_eq!(storage.rebuild_world_poses(), 1);
        assert_eq!(storage.is_world_stale(id), Some(false));
        let (_, world) = storage.slice_for(id).unwrap();
        assert!(world[1].pos.abs_diff_eq(Vec3::new(2.0, 0.0, 0.0), 1e-6));
        assert_eq!(storage.rebuild_world_poses(), 0);
    }

    #[test]
    fn test_reset_to_ref_pose() {
        let mut storage = PoseStorage::with_config(&test_config());
        let id = InstanceId::next();
        storage.allocate(id, rig(2)).unwrap();
        if let Some(local) = storage.local_poses_mut(id) {
            local[0] = BoneTransform::from_translation(Vec3::Z);
        }
        storage.reset_to_ref_pose(id).unwrap();
        let (local, _) = storage.slice_for(id).unwrap();
        assert_eq!(local[0], BoneTransform::from_translation(Vec3::Y));
    }

    #[test]
    fn test_par_for_each_stream_isolates_instances() {
        let mut storage = PoseStorage::with_config(&test_config());
        let ids: Vec<InstanceId> = (0..6).map(|_| InstanceId::next()).collect();
        for (i, &id) in ids.iter().enumerate() {
            storage.allocate(id, rig(i % 3 + 2)).unwrap();
        }

        let visited = storage.par_for_each_stream(|id, stream| {
            let shift = Vec3::new(id.0 as f32, 0.0, 0.0);
            stream.set_local_pose(0, BoneTransform::from_translation(shift));
        });
        assert_eq!(visited, ids.len());

        for &id in &ids {
            let (local, world) = storage.slice_for(id).unwrap();
            let expected_root = Vec3::new(id.0 as f32, 0.0, 0.0);
            assert_eq!(local[0].pos, expected_root);
            let last = world.len() - 1;
            let expected_tip = expected_root + Vec3::Y * last as f32;
            assert!(world[last].pos.abs_diff_eq(expected_tip, 1e-5));
            assert_eq!(storage.is_world_stale(id), Some(false));
        }
    }

    #[test]
    fn test_clear_transform_flags() {
        let mut storage = PoseStorage::with_config(&test_config());
        let id = InstanceId::next();
        storage.allocate(id, rig(2)).unwrap();
        if let Some(mut stream) = storage.open_stream(id) {
            stream.set_local_rotation(1, Quat::from_rotation_x(0.2));
        }
        assert_eq!(
            storage.transform_flags(id).map(|f| f[1]),
            Some(BoneTransformFlags::ROTATION)
        );
        storage.clear_transform_flags();
        assert!(storage.transform_flags(id).unwrap().iter().all(|f| f.is_empty()));
    }
}
