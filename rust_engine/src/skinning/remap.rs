//! 骨架骨骼 -> 网格骨骼重映射表缓存

use std::collections::HashMap;
use std::sync::Arc;

use super::{SkinnedMeshInfo, SkinnedMeshInstance};
use crate::pose::PoseStorage;
use crate::skeleton::RigDefinition;

/// 缓存键：两个拓扑哈希原样拼接成 128 位，不同配对不会碰撞
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RemapKey {
    pub mesh_hash: u64,
    pub rig_hash: u64,
}

pub fn cache_key(mesh_hash: u64, rig_hash: u64) -> RemapKey {
    RemapKey { mesh_hash, rig_hash }
}

/// 按骨架骨骼索引排列，`None` 表示网格中没有对应骨骼
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoneRemapTable {
    rig_to_mesh: Vec<Option<u32>>,
}

impl BoneRemapTable {
    /// 对每个骨架骨骼线性扫描网格骨骼，取第一个哈希相同的
    pub fn build(mesh: &SkinnedMeshInfo, rig: &RigDefinition) -> Self {
        let rig_to_mesh = rig
            .bones()
            .iter()
            .map(|rig_bone| {
                mesh.bones()
                    .iter()
                    .position(|mesh_bone| mesh_bone.hash == rig_bone.hash)
                    .map(|i| i as u32)
            })
            .collect();
        Self { rig_to_mesh }
    }

    pub fn mesh_bone(&self, rig_bone: usize) -> Option<usize> {
        self.rig_to_mesh.get(rig_bone).copied().flatten().map(|i| i as usize)
    }

    pub fn len(&self) -> usize {
        self.rig_to_mesh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rig_to_mesh.is_empty()
    }

    pub fn mapped_count(&self) -> usize {
        self.rig_to_mesh.iter().filter(|m| m.is_some()).count()
    }

    /// (骨架骨骼, 网格骨骼) 配对
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rig_to_mesh
            .iter()
            .enumerate()
            .filter_map(|(rig, mesh)| mesh.map(|m| (rig, m as usize)))
    }
}

/// 重映射表缓存
///
/// 只在单写者阶段（`fill` / `get_or_build`，需要 `&mut self`）插入，
/// 之后的并行蒙皮阶段只读。
#[derive(Debug, Default)]
pub struct SkinRemapCache {
    tables: HashMap<RemapKey, Arc<BoneRemapTable>>,
    built_tables: usize,
    log_tables: bool,
}

impl SkinRemapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建新表时逐骨骼输出配对日志
    pub fn with_logging(log_tables: bool) -> Self {
        Self {
            log_tables,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &RemapKey) -> Option<&Arc<BoneRemapTable>> {
        self.tables.get(key)
    }

    pub fn get_or_build(
        &mut self,
        mesh: &SkinnedMeshInfo,
        rig: &RigDefinition,
    ) -> Arc<BoneRemapTable> {
        let key = cache_key(mesh.hash(), rig.hash());
        if let Some(table) = self.tables.get(&key) {
            return Arc::clone(table);
        }

        let table = Arc::new(BoneRemapTable::build(mesh, rig));
        self.built_tables += 1;

        if self.log_tables {
            log::info!(
                "创建重映射表: rig '{}' -> mesh '{}' ({}/{} 个骨骼配对)",
                rig.name(),
                mesh.name(),
                table.mapped_count(),
                table.len()
            );
            for (rig_bone, mesh_bone) in table.iter() {
                log::debug!(
                    "  {} -> {} : {} -> {}",
                    rig.bones()[rig_bone].name,
                    mesh.bones()[mesh_bone].name,
                    rig_bone,
                    mesh_bone
                );
            }
        }

        self.tables.insert(key, Arc::clone(&table));
        table
    }

    /// 为本帧要蒙皮的所有网格准备重映射表，返回新建的表数量
    ///
    /// 骨架实例未注册的网格跳过，蒙皮阶段同样会跳过它。
    pub fn fill(&mut self, meshes: &[SkinnedMeshInstance], storage: &PoseStorage) -> usize {
        let before = self.built_tables;
        for mesh in meshes {
            let Some(rig) = storage.rig(mesh.rig_instance) else {
                log::debug!("网格 '{}' 绑定的实例 {} 不存在，跳过", mesh.mesh.name(), mesh.rig_instance);
                continue;
            };
            self.get_or_build(&mesh.mesh, rig);
        }
        self.built_tables - before
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// 进程生命周期内新建的表数量
    pub fn built_tables(&self) -> usize {
        self.built_tables
    }

    pub fn invalidate_all(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{BoneTransform, RigBone};
    use crate::skinning::SkinnedMeshBone;
    use glam::Mat4;

    fn rig() -> RigDefinition {
        RigDefinition::new(
            "creature",
            vec![
                RigBone::new("root", -1, BoneTransform::IDENTITY),
                RigBone::new("spine", 0, BoneTransform::IDENTITY),
                RigBone::new("tail", 0, BoneTransform::IDENTITY),
            ],
        )
        .unwrap()
    }

    fn mesh(names: &[&str]) -> SkinnedMeshInfo {
        SkinnedMeshInfo::new(
            "body",
            names.iter().map(|n| SkinnedMeshBone::new(*n, Mat4::IDENTITY)).collect(),
        )
    }

    #[test]
    fn test_missing_bone_maps_to_sentinel() {
        let table = BoneRemapTable::build(&mesh(&["spine", "root"]), &rig());
        assert_eq!(table.len(), 3);
        assert_eq!(table.mesh_bone(0), Some(1));
        assert_eq!(table.mesh_bone(1), Some(0));
        assert_eq!(table.mesh_bone(2), None);
        assert_eq!(table.mapped_count(), 2);
        assert_eq!(table.mesh_bone(10), None);
    }

    #[test]
    fn test_first_match_wins() {
        let table = BoneRemapTable::build(&mesh(&["spine", "spine", "root"]), &rig());
        assert_eq!(table.mesh_bone(1), Some(0));
    }

    #[test]
    fn test_build_is_deterministic() {
        let rig = rig();
        let mesh = mesh(&["tail", "root", "spine"]);
        assert_eq!(BoneRemapTable::build(&mesh, &rig), BoneRemapTable::build(&mesh, &rig));
    }

    #[test]
    fn test_cache_hit_does_not_rebuild() {
        let rig = rig();
        let mesh = mesh(&["root", "spine"]);
        let mut cache = SkinRemapCache::new();

        let first = cache.get_or_build(&mesh, &rig);
        let second = cache.get_or_build(&mesh, &rig);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.built_tables(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&cache_key(mesh.hash(), rig.hash())).is_some());
    }

    #[test]
    fn test_distinct_pairs_get_distinct_keys() {
        let rig = rig();
        let mut cache = SkinRemapCache::new();
        cache.get_or_build(&mesh(&["root"]), &rig);
        cache.get_or_build(&mesh(&["root", "tail"]), &rig);
        assert_eq!(cache.len(), 2);
        assert_ne!(cache_key(1, 2), cache_key(2, 1));

        cache.invalidate_all();
        assert!(cache.is_empty());
        cache.get_or_build(&mesh(&["root"]), &rig);
        assert_eq!(cache.built_tables(), 3);
    }
}
