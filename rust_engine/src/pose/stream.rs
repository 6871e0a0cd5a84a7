//! PoseStream - 单个实例的本地 / 世界姿态读写视图
//!
//! 本地姿态总是权威数据；世界姿态按需惰性重建。每个骨骼一位脏标记，
//! 置位表示该骨骼缓存的世界姿态相对其本地姿态或父骨骼世界姿态已过期。
//! 流关闭（drop）时强制完整重建，保证共享存储中的世界姿态对绕过流的
//! 消费者（批量蒙皮）保持一致。

use glam::{Quat, Vec3};

use super::dirty::DirtyFlags;
use super::storage::InstanceView;
use super::{BoneTransformFlags, InstanceId};
use crate::skeleton::{safe_normalize, BoneTransform, RigDefinition};

pub struct PoseStream<'a> {
    id: InstanceId,
    rig: &'a RigDefinition,
    local: &'a mut [BoneTransform],
    world: &'a mut [BoneTransform],
    flags: &'a mut [BoneTransformFlags],
    world_stale: &'a mut bool,
    dirty: DirtyFlags,
    rebuilt_bones: usize,
}

impl<'a> PoseStream<'a> {
    pub(crate) fn open(view: InstanceView<'a>) -> Self {
        let bone_count = view.local.len();
        // 生产者刚写过本地姿态时世界缓存整体无效
        let dirty = if *view.world_stale {
            DirtyFlags::new_all_set(bone_count)
        } else {
            DirtyFlags::new(bone_count)
        };
        // 流存活期间存储中的世界姿态不保证一致，关闭时再清除
        *view.world_stale = true;

        Self {
            id: view.id,
            rig: view.rig,
            local: view.local,
            world: view.world,
            flags: view.flags,
            world_stale: view.world_stale,
            dirty,
            rebuilt_bones: 0,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.id
    }

    pub fn rig(&self) -> &RigDefinition {
        self.rig
    }

    pub fn bone_count(&self) -> usize {
        self.local.len()
    }

    /// 已重新计算世界姿态的骨骼次数
    pub fn rebuilt_bones(&self) -> usize {
        self.rebuilt_bones
    }

    pub fn is_world_pose_dirty(&self, bone: usize) -> bool {
        self.check_bone(bone);
        self.dirty.is_set(bone)
    }

    pub fn dirty_bone_count(&self) -> usize {
        self.dirty.count()
    }

    #[inline]
    fn check_bone(&self, bone: usize) {
        assert!(
            bone < self.local.len(),
            "bone index {} out of range: rig '{}' has {} bones",
            bone,
            self.rig.name(),
            self.local.len()
        );
    }

    // ========== 本地空间 ==========

    pub fn local_pose(&self, bone: usize) -> BoneTransform {
        self.check_bone(bone);
        self.local[bone]
    }

    pub fn local_position(&self, bone: usize) -> Vec3 {
        self.local_pose(bone).pos
    }

    pub fn local_rotation(&self, bone: usize) -> Quat {
        self.local_pose(bone).rot
    }

    pub fn set_local_pose(&mut self, bone: usize, pose: BoneTransform) {
        self.check_bone(bone);
        self.local[bone] = pose;
        self.flags[bone] |= BoneTransformFlags::all();
        self.invalidate_world(bone);
    }

    pub fn set_local_position(&mut self, bone: usize, pos: Vec3) {
        self.check_bone(bone);
        self.local[bone].pos = pos;
        self.flags[bone] |= BoneTransformFlags::TRANSLATION;
        self.invalidate_world(bone);
    }

    pub fn set_local_rotation(&mut self, bone: usize, rot: Quat) {
        self.check_bone(bone);
        self.local[bone].rot = safe_normalize(rot);
        self.flags[bone] |= BoneTransformFlags::ROTATION;
        self.invalidate_world(bone);
    }

    fn invalidate_world(&mut self, bone: usize) {
        self.dirty.set(bone);
        self.mark_descendants_dirty(bone);
    }

    // ========== 世界空间 ==========

    pub fn world_pose(&mut self, bone: usize) -> BoneTransform {
        self.check_bone(bone);
        if self.dirty.is_set(bone) {
            self.rebuild_up_to(Some(bone));
        }
        self.world[bone]
    }

    pub fn world_position(&mut self, bone: usize) -> Vec3 {
        self.world_pose(bone).pos
    }

    pub fn world_rotation(&mut self, bone: usize) -> Quat {
        self.world_pose(bone).rot
    }

    /// 设置世界姿态并反推本地姿态：`local = inverse(parent_world) * world`
    pub fn set_world_pose(&mut self, bone: usize, pose: BoneTransform) {
        self.check_bone(bone);
        let parent_world = self.parent_world_pose(bone);
        self.local[bone] = parent_world.inverse() * pose;
        self.world[bone] = pose;
        self.dirty.clear(bone);
        self.flags[bone] |= BoneTransformFlags::all();
        self.mark_descendants_dirty(bone);
    }

    /// 只修改世界空间平移，旋转和缩放保持不变
    pub fn set_world_position(&mut self, bone: usize, pos: Vec3) {
        self.world_pose(bone);
        let parent_world = self.parent_world_pose(bone);
        self.local[bone].pos = parent_world.inverse().transform_point(pos);
        self.world[bone].pos = pos;
        self.flags[bone] |= BoneTransformFlags::TRANSLATION;
        self.mark_descendants_dirty(bone);
    }

    /// 只修改世界空间旋转，平移和缩放保持不变
    pub fn set_world_rotation(&mut self, bone: usize, rot: Quat) {
        self.world_pose(bone);
        let rot = safe_normalize(rot);
        let parent_world = self.parent_world_pose(bone);
        self.local[bone].rot = safe_normalize(parent_world.rot.conjugate() * rot);
        self.world[bone].rot = rot;
        self.flags[bone] |= BoneTransformFlags::ROTATION;
        self.mark_descendants_dirty(bone);
    }

    fn parent_world_pose(&mut self, bone: usize) -> BoneTransform {
        match self.rig.parent_index(bone) {
            Some(parent) => {
                if self.dirty.is_set(parent) {
                    self.rebuild_up_to(Some(parent));
                }
                self.world[parent]
            }
            None => BoneTransform::IDENTITY,
        }
    }

    // ========== 标志位 ==========

    pub fn transform_flags(&self) -> &[BoneTransformFlags] {
        &*self.flags
    }

    pub fn transform_flags_mut(&mut self) -> &mut [BoneTransformFlags] {
        &mut *self.flags
    }

    // ========== 层级维护 ==========

    /// 标记 `root` 的所有后代为脏
    ///
    /// 父骨骼索引总小于子骨骼索引，所以一次正向扫描即可找到整棵子树。
    fn mark_descendants_dirty(&mut self, root: usize) {
        let bones = self.rig.bones();
        let mut subtree = DirtyFlags::new(bones.len());
        subtree.set(root);
        for (i, bone) in bones.iter().enumerate().skip(root + 1) {
            if let Some(parent) = bone.parent() {
                if parent >= root && subtree.is_set(parent) {
                    subtree.set(i);
                    self.dirty.set(i);
                }
            }
        }
    }

    /// 按索引顺序重建 `[0, end]` 内的脏骨骼，`None` 表示全部
    fn rebuild_up_to(&mut self, end: Option<usize>) {
        if !self.dirty.any() {
            return;
        }
        let end = end.map_or(self.dirty.len(), |bone| bone + 1);

        let bones = self.rig.bones();
        let mut rebuilt = 0;
        for i in self.dirty.iter_set_before(end) {
            self.world[i] = match bones[i].parent() {
                Some(parent) => self.world[parent] * self.local[i],
                None => self.local[i],
            };
            rebuilt += 1;
        }
        self.dirty.clear_prefix(end);
        self.rebuilt_bones += rebuilt;
    }

    /// 立即重建所有脏骨骼
    pub fn flush(&mut self) {
        self.rebuild_up_to(None);
    }

    /// 关闭流，返回整个生命周期内重建的骨骼次数
    pub fn close(mut self) -> usize {
        self.flush();
        self.rebuilt_bones
    }
}

impl Drop for PoseStream<'_> {
    fn drop(&mut self) {
        self.flush();
        *self.world_stale = false;
    }
}
