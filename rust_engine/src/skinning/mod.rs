//! 蒙皮矩阵生成
//!
//! 网格骨骼与骨架骨骼按名称哈希配对，配对结果按（网格, 骨架）缓存。
//! 顶点变形在 GPU 上完成，这里只产出每个网格骨骼的 3x4 蒙皮矩阵。

mod remap;
mod skinning;

pub use remap::{cache_key, BoneRemapTable, RemapKey, SkinRemapCache};
pub use skinning::{apply_skinning, make_skin_matrix, skin_mesh_instance, SkinningStats};

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use xxhash_rust::xxh3::Xxh3;

use crate::pose::InstanceId;
use crate::skeleton::bone_hash;

/// 网格拓扑哈希的种子
const MESH_HASH_SEED: u64 = 0x534b_494e_4d45_5348;

/// 网格中的一个骨骼
#[derive(Clone, Debug)]
pub struct SkinnedMeshBone {
    pub name: String,
    /// 与骨架骨骼哈希同源，用于配对
    pub hash: u64,
    /// 逆绑定矩阵（网格空间 -> 骨骼空间）
    pub bind_pose: Mat4,
}

impl SkinnedMeshBone {
    pub fn new(name: impl Into<String>, bind_pose: Mat4) -> Self {
        let name = name.into();
        let hash = bone_hash(&name);
        Self { name, hash, bind_pose }
    }
}

/// 网格的骨骼拓扑（不可变，多个实例共享）
#[derive(Clone, Debug)]
pub struct SkinnedMeshInfo {
    name: String,
    hash: u64,
    bones: Vec<SkinnedMeshBone>,
}

impl SkinnedMeshInfo {
    pub fn new(name: impl Into<String>, bones: Vec<SkinnedMeshBone>) -> Self {
        let mut hasher = Xxh3::with_seed(MESH_HASH_SEED);
        hasher.update(&(bones.len() as u64).to_le_bytes());
        for bone in &bones {
            hasher.update(&bone.hash.to_le_bytes());
        }
        Self {
            name: name.into(),
            hash: hasher.digest(),
            bones,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn bones(&self) -> &[SkinnedMeshBone] {
        &self.bones
    }

    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }
}

/// 3x4 仿射蒙皮矩阵，列主序（平移在第四列）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkinMatrix {
    pub cols: [Vec3; 4],
}

impl SkinMatrix {
    pub const IDENTITY: SkinMatrix = SkinMatrix {
        cols: [Vec3::X, Vec3::Y, Vec3::Z, Vec3::ZERO],
    };

    /// 丢弃投影行
    pub fn from_mat4(m: &Mat4) -> Self {
        Self {
            cols: [
                m.x_axis.truncate(),
                m.y_axis.truncate(),
                m.z_axis.truncate(),
                m.w_axis.truncate(),
            ],
        }
    }

    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols(
            self.cols[0].extend(0.0),
            self.cols[1].extend(0.0),
            self.cols[2].extend(0.0),
            Vec4::new(self.cols[3].x, self.cols[3].y, self.cols[3].z, 1.0),
        )
    }

    pub fn abs_diff_eq(&self, other: &SkinMatrix, max_abs_diff: f32) -> bool {
        self.cols
            .iter()
            .zip(other.cols.iter())
            .all(|(a, b)| a.abs_diff_eq(*b, max_abs_diff))
    }
}

impl Default for SkinMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// 绑定到某个骨架实例的网格实例
#[derive(Clone, Debug)]
pub struct SkinnedMeshInstance {
    pub mesh: Arc<SkinnedMeshInfo>,
    pub rig_instance: InstanceId,
    /// 作为网格原点的骨架骨骼，`None` 时使用配置中的默认值
    pub root_bone_index: Option<usize>,
    /// 与网格骨骼一一对应
    pub skin_matrices: Vec<SkinMatrix>,
}

impl SkinnedMeshInstance {
    pub fn new(mesh: Arc<SkinnedMeshInfo>, rig_instance: InstanceId) -> Self {
        let skin_matrices = vec![SkinMatrix::IDENTITY; mesh.bone_count()];
        Self {
            mesh,
            rig_instance,
            root_bone_index: None,
            skin_matrices,
        }
    }

    pub fn with_root_bone(mut self, index: usize) -> Self {
        self.root_bone_index = Some(index);
        self
    }
}
