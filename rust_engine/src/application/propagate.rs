//! 骨骼变换 -> 场景物体变换

use rayon::prelude::*;

use crate::pose::{InstanceId, PoseStorage};
use crate::skeleton::BoneTransform;

/// 跟随某个骨骼运动的场景物体
#[derive(Clone, Debug)]
pub struct BoneAttachment {
    pub rig_instance: InstanceId,
    pub bone_index: usize,
    /// 物体在场景中有父节点时拷贝本地姿态，否则拷贝世界姿态
    pub has_parent: bool,
    /// 输出
    pub transform: BoneTransform,
}

impl BoneAttachment {
    pub fn new(rig_instance: InstanceId, bone_index: usize, has_parent: bool) -> Self {
        Self {
            rig_instance,
            bone_index,
            has_parent,
            transform: BoneTransform::IDENTITY,
        }
    }
}

fn propagate_one(attachment: &mut BoneAttachment, storage: &PoseStorage) -> bool {
    let Some((local, world)) = storage.slice_for(attachment.rig_instance) else {
        return false;
    };
    // 本地姿态始终有效，世界姿态需要已经重建
    if !attachment.has_parent && storage.is_world_stale(attachment.rig_instance) == Some(true) {
        log::warn!(
            "挂点: 实例 {} 的世界姿态尚未重建，跳过",
            attachment.rig_instance
        );
        return false;
    }
    let source = if attachment.has_parent { local } else { world };
    match source.get(attachment.bone_index) {
        Some(pose) => {
            attachment.transform = *pose;
            true
        }
        None => {
            log::warn!(
                "挂点骨骼 {} 超出实例 {} 的骨骼数 {}",
                attachment.bone_index,
                attachment.rig_instance,
                source.len()
            );
            false
        }
    }
}

/// 拷贝所有挂点的骨骼姿态，返回（成功数, 跳过数）
///
/// 读取世界姿态的挂点要求实例已经过 `rebuild_world_poses`，否则计入跳过。
pub fn propagate_bone_transforms(
    attachments: &mut [BoneAttachment],
    storage: &PoseStorage,
    parallel_min_items: usize,
) -> (usize, usize) {
    let propagated = if attachments.len() >= parallel_min_items {
        attachments
            .par_iter_mut()
            .map(|a| propagate_one(a, storage))
            .filter(|done| *done)
            .count()
    } else {
        attachments
            .iter_mut()
            .map(|a| propagate_one(a, storage))
            .filter(|done| *done)
            .count()
    };
    (propagated, attachments.len() - propagated)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use glam::{Quat, Vec3};

    use super::*;
    use crate::config::AnimationConfig;
    use crate::skeleton::{RigBone, RigDefinition};

    #[test]
    fn test_local_or_world_by_parent() {
        let rig = RigDefinition::new(
            "pair",
            vec![
                RigBone::new("root", -1, BoneTransform::from_translation(Vec3::X)),
                RigBone::new("hand", 0, BoneTransform::from_rotation(Quat::from_rotation_y(0.3))),
            ],
        )
        .unwrap();
        let mut storage = PoseStorage::with_config(&AnimationConfig::default());
        let id = InstanceId::next();
        storage.allocate(id, Arc::new(rig)).unwrap();

        let mut attachments = vec![
            BoneAttachment::new(id, 1, true),
            BoneAttachment::new(id, 1, false),
            BoneAttachment::new(id, 5, false),
            BoneAttachment::new(InstanceId(u64::MAX), 0, false),
        ];
        let (propagated, skipped) = propagate_bone_transforms(&mut attachments, &storage, 2);
        assert_eq!((propagated, skipped), (2, 2));

        assert_eq!(attachments[0].transform.pos, Vec3::ZERO);
        assert!(attachments[1].transform.pos.abs_diff_eq(Vec3::X, 1e-6));
        assert!(attachments[1]
            .transform
            .rot
            .abs_diff_eq(attachments[0].transform.rot, 1e-6));
        assert_eq!(attachments[2].transform, BoneTransform::IDENTITY);
    }

    #[test]
    fn test_stale_world_pose_is_not_propagated() {
        let rig = RigDefinition::new(
            "pair",
            vec![
                RigBone::new("root", -1, BoneTransform::IDENTITY),
                RigBone::new("arm", 0, BoneTransform::IDENTITY),
            ],
        )
        .unwrap();
        let mut storage = PoseStorage::with_config(&AnimationConfig::default());
        let id = InstanceId::next();
        storage.allocate(id, Arc::new(rig)).unwrap();
        let moved = [BoneTransform::IDENTITY, BoneTransform::from_translation(Vec3::X)];
        storage.write_local_poses(id, &moved).unwrap();

        let mut attachments = vec![BoneAttachment::new(id, 1, false), BoneAttachment::new(id, 1, true)];
        let (propagated, skipped) = propagate_bone_transforms(&mut attachments, &storage, 4);
        assert_eq!((propagated, skipped), (1, 1));
        assert_eq!(attachments[0].transform, BoneTransform::IDENTITY);
        assert_eq!(attachments[1].transform.pos, Vec3::X);

        storage.rebuild_world_poses();
        let (propagated, skipped) = propagate_bone_transforms(&mut attachments, &storage, 4);
        assert_eq!((propagated, skipped), (2, 0));
        assert!(attachments[0].transform.pos.abs_diff_eq(Vec3::X, 1e-6));
    }
}
