#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 从表格清单组装 3D 医学影像 subject, 为评估提供随机访问数据集,
//! 为训练提供后台预取的 patch 采样队列.
//!
//! 该 crate 只提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 清单本身 (数据划分) 由外部工具生成, 这里只负责按列索引读取.
//! 2. 单个 subject 的错误 (文件缺失、几何信息不一致等) 不会中断整个清单的处理,
//!   而是汇总成报告返回给调用者; 只有配置错误会立即失败.
//! 3. 体数据统一按 (z, H, W) 组织, 而 `patch_size` 等配置沿用 \[x, y, z\] 顺序.
//!
//! # 开发计划
//!
//! ### 影像读写 ✅
//!
//! `.nii`, `.nii.gz` 和 `.npy`. 强度影像与标签影像在类型上区分.
//!
//! 实现位于 `patch-berry/src/image`.
//!
//! ### 重采样与对称填充 ✅
//!
//! 1. 强度影像三线性插值, 标签影像最近邻插值. 标签不可能被线性插值. ✅
//! 2. numpy 语义的 5 种填充模式. ✅
//! 3. 节省内存模式下把 resize 结果缓存到磁盘, 已存在时不重写. ✅
//!
//! 实现位于 `patch-berry/src/image/resample.rs`, `patch-berry/src/assemble/resize.rs`.
//!
//! ### subject 组装流水线 ✅
//!
//! build -> resize -> validate -> pad -> load, 每一步都是 `Subject -> Subject`.
//! 一致性检查可以通过 `SubjectCheck` 替换.
//!
//! 实现位于 `patch-berry/src/assemble`, `patch-berry/src/check.rs`.
//!
//! ### 变换链 ✅
//!
//! 预处理在前, 数据增强 (仅训练) 在后. 构造器登记在静态表中.
//!
//! 实现位于 `patch-berry/src/transform`.
//!
//! ### patch 采样与后台队列 ✅
//!
//! 均匀、标签和加权三种采样器; 多线程预取, 有界通道背压.
//!
//! 实现位于 `patch-berry/src/sampler.rs`, `patch-berry/src/queue.rs`.
//!
//! ### 更多数据增强 ⌛️
//!
//! 仿射、弹性形变和各向异性降采样.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

pub mod consts;

pub mod config;
pub mod error;
pub mod image;
pub mod manifest;
pub mod subject;

pub mod assemble;
pub mod check;

pub mod transform;

pub mod dataset;
pub mod queue;
pub mod sampler;

pub mod loader;
pub mod prelude;

pub use error::{Error, Result};
pub use loader::{images_from_manifest, Loader};
