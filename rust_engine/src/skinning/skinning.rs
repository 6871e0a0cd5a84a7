//! 蒙皮矩阵计算

use glam::Mat4;
use rayon::prelude::*;

use super::remap::{cache_key, SkinRemapCache};
use super::{SkinMatrix, SkinnedMeshBone, SkinnedMeshInstance};
use crate::pose::PoseStorage;
use crate::skeleton::BoneTransform;

/// 一次批量蒙皮的结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkinningStats {
    pub skinned: usize,
    pub skipped: usize,
}

/// `entity_to_root * bone_world * bind_pose`，截断为 3x4
pub fn make_skin_matrix(
    bone: &SkinnedMeshBone,
    bone_world: &BoneTransform,
    entity_to_root: &Mat4,
) -> SkinMatrix {
    let m = *entity_to_root * bone_world.to_matrix() * bone.bind_pose;
    SkinMatrix::from_mat4(&m)
}

/// 计算单个网格实例的蒙皮矩阵
///
/// 骨架实例未注册、世界姿态过期、重映射表缺失或根骨骼越界时整项跳过，返回 false。
/// 网格中没有骨架对应的骨骼保留上一次写入的值。
pub fn skin_mesh_instance(
    instance: &mut SkinnedMeshInstance,
    storage: &PoseStorage,
    cache: &SkinRemapCache,
    default_root_bone: usize,
) -> bool {
    let Some(rig) = storage.rig(instance.rig_instance) else {
        log::debug!("网格 '{}': 实例 {} 不存在", instance.mesh.name(), instance.rig_instance);
        return false;
    };
    let Some(table) = cache.get(&cache_key(instance.mesh.hash(), rig.hash())) else {
        log::warn!(
            "网格 '{}' 与骨架 '{}' 没有重映射表，跳过蒙皮",
            instance.mesh.name(),
            rig.name()
        );
        return false;
    };
    if storage.is_world_stale(instance.rig_instance) == Some(true) {
        log::warn!(
            "网格 '{}': 实例 {} 的世界姿态尚未重建，跳过蒙皮",
            instance.mesh.name(),
            instance.rig_instance
        );
        return false;
    }
    let Some((_, world)) = storage.slice_for(instance.rig_instance) else {
        return false;
    };

    let root_index = instance.root_bone_index.unwrap_or(default_root_bone);
    let Some(root_world) = world.get(root_index) else {
        log::warn!(
            "网格 '{}' 的根骨骼 {} 超出骨架 '{}' 范围",
            instance.mesh.name(),
            root_index,
            rig.name()
        );
        return false;
    };
    let entity_to_root = root_world.to_matrix().inverse();

    if instance.skin_matrices.len() != instance.mesh.bone_count() {
        instance
            .skin_matrices
            .resize(instance.mesh.bone_count(), SkinMatrix::IDENTITY);
    }

    let mesh_bones = instance.mesh.bones();
    for (rig_bone, mesh_bone) in table.iter() {
        instance.skin_matrices[mesh_bone] =
            make_skin_matrix(&mesh_bones[mesh_bone], &world[rig_bone], &entity_to_root);
    }
    true
}

/// 批量计算蒙皮矩阵，网格数量达到 `parallel_min_items` 时使用 rayon 并行
///
/// 调用前所有世界姿态写入者必须已经结束，且重映射表已经填充完毕。
/// 世界姿态仍过期的实例（未经 `rebuild_world_poses`）计入跳过。
pub fn apply_skinning(
    meshes: &mut [SkinnedMeshInstance],
    storage: &PoseStorage,
    cache: &SkinRemapCache,
    default_root_bone: usize,
    parallel_min_items: usize,
) -> SkinningStats {
    let skin = |mesh: &mut SkinnedMeshInstance| {
        skin_mesh_instance(mesh, storage, cache, default_root_bone)
    };
    let skinned = if meshes.len() >= parallel_min_items {
        meshes.par_iter_mut().map(skin).filter(|done| *done).count()
    } else {
        meshes.iter_mut().map(skin).filter(|done| *done).count()
    };

    SkinningStats {
        skinned,
        skipped: meshes.len() - skinned,
    }
}
