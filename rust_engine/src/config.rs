//! 动画运行时配置
//!
//! 所有参数扁平化，运行时可通过 `set_config` 调整。

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// 动画运行时配置（扁平化，不嵌套）
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationConfig {
    // ========== 存储 ==========
    /// 姿态缓冲区预留的骨骼槽位数，默认 1024
    pub initial_bone_capacity: usize,
    /// 标志位区域的分配粒度（骨骼数），默认 8
    /// 每个实例的标志位区域都向上取整到该值的整数倍
    pub flags_chunk_bones: usize,

    // ========== 蒙皮 ==========
    /// 网格未指定根骨骼时使用的骨骼索引，默认 0
    pub default_root_bone_index: usize,

    // ========== 并行 ==========
    /// 少于该数量的条目时各阶段串行执行，默认 4
    pub parallel_min_items: usize,

    // ========== 调试 ==========
    /// 创建重映射表时逐骨骼输出日志，默认 false
    pub log_remap_tables: bool,
    /// 是否输出每帧调试日志，默认 false
    pub debug_log: bool,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            initial_bone_capacity: 1024,
            flags_chunk_bones: 8,

            default_root_bone_index: 0,

            parallel_min_items: 4,

            log_remap_tables: false,
            debug_log: false,
        }
    }
}

/// 全局配置实例
static ANIMATION_CONFIG: Lazy<RwLock<AnimationConfig>> =
    Lazy::new(|| RwLock::new(AnimationConfig::default()));

/// 获取当前配置（只读）
pub fn get_config() -> AnimationConfig {
    ANIMATION_CONFIG.read().clone()
}

/// 手动设置配置（用于运行时调试）
pub fn set_config(config: AnimationConfig) {
    *ANIMATION_CONFIG.write() = config;
}

/// 重置为默认配置
pub fn reset_config() {
    *ANIMATION_CONFIG.write() = AnimationConfig::default();
}
