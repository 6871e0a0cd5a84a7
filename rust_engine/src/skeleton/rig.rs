//! 骨骼拓扑定义
//!
//! 骨骼按索引排列并保证父骨骼索引总是小于子骨骼索引，
//! 这样层级遍历（脏标记传播、世界姿态重建）只需一次正向扫描。

use std::collections::HashMap;

use xxhash_rust::xxh3::{xxh3_64_with_seed, Xxh3};

use super::BoneTransform;
use crate::{PoseError, Result};

const BONE_HASH_SEED: u64 = 0x5f1d_2c3b_a7e4_9081;
const RIG_HASH_SEED: u64 = 0x2b7e_1516_28ae_d2a6;

/// 由骨骼名称计算稳定的身份哈希
pub fn bone_hash(name: &str) -> u64 {
    xxh3_64_with_seed(name.as_bytes(), BONE_HASH_SEED)
}

/// 骨骼节点
#[derive(Clone, Debug)]
pub struct RigBone {
    /// 名称（仅用于诊断和按名查找）
    pub name: String,
    pub hash: u64,
    /// 父骨骼索引，-1 表示根骨骼
    pub parent_index: i32,
    /// 参考姿态（本地空间）
    pub ref_pose: BoneTransform,
}

impl RigBone {
    pub fn new(name: impl Into<String>, parent_index: i32, ref_pose: BoneTransform) -> Self {
        let name = name.into();
        Self {
            hash: bone_hash(&name),
            name,
            parent_index,
            ref_pose,
        }
    }

    pub fn parent(&self) -> Option<usize> {
        usize::try_from(self.parent_index).ok()
    }
}

/// 不可变骨骼拓扑，创建后通过 `Arc` 在所有实例间共享
#[derive(Debug)]
pub struct RigDefinition {
    name: String,
    hash: u64,
    bones: Vec<RigBone>,
    name_to_index: HashMap<String, usize>,
}

impl RigDefinition {
    /// 从已排序的骨骼列表创建，要求 `-1 <= parent < index`
    pub fn new(name: impl Into<String>, bones: Vec<RigBone>) -> Result<Self> {
        let mut name_to_index = HashMap::with_capacity(bones.len());
        let mut hasher = Xxh3::with_seed(RIG_HASH_SEED);
        hasher.update(&(bones.len() as u64).to_le_bytes());

        for (index, bone) in bones.iter().enumerate() {
            if bone.parent_index < -1 || bone.parent_index >= index as i32 {
                return Err(PoseError::ParentOrder {
                    bone: index,
                    parent: bone.parent_index,
                });
            }
            if name_to_index.insert(bone.name.clone(), index).is_some() {
                return Err(PoseError::DuplicateBone(bone.name.clone()));
            }
            hasher.update(&bone.hash.to_le_bytes());
            hasher.update(&bone.parent_index.to_le_bytes());
        }

        Ok(Self {
            name: name.into(),
            hash: hasher.digest(),
            bones,
            name_to_index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 拓扑内容哈希（骨骼身份哈希 + 父子关系）
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// 获取骨骼数量
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    pub fn bones(&self) -> &[RigBone] {
        &self.bones
    }

    /// 获取骨骼
    pub fn bone(&self, index: usize) -> Option<&RigBone> {
        self.bones.get(index)
    }

    pub fn parent_index(&self, index: usize) -> Option<usize> {
        self.bones[index].parent()
    }

    /// 通过名称查找骨骼
    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn ref_poses(&self) -> impl ExactSizeIterator<Item = BoneTransform> + '_ {
        self.bones.iter().map(|b| b.ref_pose)
    }
}

struct PendingBone {
    name: String,
    parent: Option<String>,
    ref_pose: BoneTransform,
}

/// 以任意顺序收集骨骼，构建时按层级深度排序（父骨骼在前）
pub struct RigDefinitionBuilder {
    name: String,
    bones: Vec<PendingBone>,
}

impl RigDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bones: Vec::new(),
        }
    }

    /// 添加骨骼
    pub fn add_bone(
        &mut self,
        name: impl Into<String>,
        parent: Option<&str>,
        ref_pose: BoneTransform,
    ) -> &mut Self {
        self.bones.push(PendingBone {
            name: name.into(),
            parent: parent.map(str::to_owned),
            ref_pose,
        });
        self
    }

    pub fn build(self) -> Result<RigDefinition> {
        let count = self.bones.len();

        let mut index_of = HashMap::with_capacity(count);
        for (i, bone) in self.bones.iter().enumerate() {
            if index_of.insert(bone.name.as_str(), i).is_some() {
                return Err(PoseError::DuplicateBone(bone.name.clone()));
            }
        }

        let mut parent_of = Vec::with_capacity(count);
        for bone in &self.bones {
            let parent = match &bone.parent {
                None => None,
                Some(parent_name) => match index_of.get(parent_name.as_str()) {
                    Some(&p) => Some(p),
                    None => {
                        return Err(PoseError::UnknownParent {
                            bone: bone.name.clone(),
                            parent: parent_name.clone(),
                        })
                    }
                },
            };
            parent_of.push(parent);
        }

        // 沿父链向上求深度，链上重复出现即为环
        let mut depth: Vec<Option<usize>> = vec![None; count];
        let mut on_chain = vec![false; count];
        let mut chain = Vec::new();
        for start in 0..count {
            chain.clear();
            let mut current = Some(start);
            let base = loop {
                let Some(i) = current else { break 0 };
                if let Some(d) = depth[i] {
                    break d + 1;
                }
                if on_chain[i] {
                    return Err(PoseError::HierarchyCycle(self.bones[i].name.clone()));
                }
                on_chain[i] = true;
                chain.push(i);
                current = parent_of[i];
            };
            for (k, &i) in chain.iter().rev().enumerate() {
                depth[i] = Some(base + k);
                on_chain[i] = false;
            }
        }

        // 稳定排序：同一深度保持插入顺序
        let mut order: Vec<usize> = (0..count).collect();
        order.sort_by_key(|&i| depth[i]);

        let mut new_index = vec![0usize; count];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }

        let mut pending: Vec<Option<PendingBone>> = self.bones.into_iter().map(Some).collect();
        let mut bones = Vec::with_capacity(count);
        for &old in &order {
            let parent_index = parent_of[old].map_or(-1, |p| new_index[p] as i32);
            if let Some(bone) = pending[old].take() {
                bones.push(RigBone::new(bone.name, parent_index, bone.ref_pose));
            }
        }

        log::debug!("构建骨骼拓扑 '{}': {} 个骨骼", self.name, bones.len());
        RigDefinition::new(self.name, bones)
    }
}
