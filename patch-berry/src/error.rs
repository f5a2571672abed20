//! 运行时错误.
//!
//! 错误分为两类:
//!
//! 1. 配置级错误 ([`ConfigError`]), 在构造数据集或队列时立即返回给调用者;
//! 2. 单个 subject 的错误 ([`SubjectError`]), 只会被收集进组装报告,
//!   不会中断整个清单的处理.

use std::path::PathBuf;

/// crate 级结果类型.
pub type Result<T> = std::result::Result<T, Error>;

/// 配置错误. 一旦出现即为致命错误.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 未知的 patch 采样器类型.
    #[error("未知的 patch 采样器类型 `{0}`")]
    UnknownSampler(String),

    /// patch 大小格式错误. 仅接受 2 或 3 个正整数.
    #[error("patch 大小格式错误: {0:?}")]
    MalformedPatchSize(Vec<usize>),

    /// resize 指令格式错误.
    #[error("resize 指令格式错误: {0}")]
    MalformedResize(String),

    /// 未知的填充模式.
    #[error("未知的填充模式 `{0}`")]
    UnknownPaddingMode(String),

    /// 模型维度只能是 2 或 3.
    #[error("模型维度只能是 2 或 3, 但发现了 {0}")]
    BadDimension(u8),

    /// 变换参数块格式错误. 第一个参数为变换名.
    #[error("变换 `{0}` 参数错误: {1}")]
    BadTransformParams(String, String),

    /// 没有配置任何通道列.
    #[error("至少需要一个通道列")]
    NoChannels,

    /// 采样器需要标签影像, 但没有配置标签列.
    #[error("采样器 `{0}` 需要标签列")]
    LabelRequired(String),

    /// 清单的列索引越界.
    #[error("清单只有 {len} 列, 但 headers 引用了第 {index} 列")]
    ColumnOutOfRange {
        /// 被引用的列.
        index: usize,
        /// 清单的列数.
        len: usize,
    },

    /// 参数 JSON 解析错误.
    #[error("参数解析错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// 影像读写错误.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// nifti 读写错误.
    #[error("nifti 错误: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// npy 读取错误.
    #[error("npy 读取错误: {0}")]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),

    /// npy 写入错误.
    #[error("npy 写入错误: {0}")]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),

    /// 体数据维度不是 2 或 3.
    #[error("不支持的体数据维度: {0:?}")]
    BadShape(Vec<usize>),

    /// 不支持的文件扩展名.
    #[error("不支持的文件扩展名: `{0}`")]
    UnsupportedExtension(String),

    /// 其他底层 I/O 错误.
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// subject 内各影像几何信息不一致.
///
/// 每个变体的第一个字段是与第一幅影像相比较的那幅影像的键 (通道 id 或 `label`).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InconsistencyError {
    /// 维度不同.
    #[error("影像 `{0}` 的维度不一致")]
    Dimension(String),

    /// 体素网格大小不同.
    #[error("影像 `{0}` 的大小不一致: {1:?} != {2:?}")]
    Size(String, [usize; 3], [usize; 3]),

    /// 体素分辨率不同.
    #[error("影像 `{0}` 的分辨率不一致: {1:?} != {2:?}")]
    Spacing(String, [f64; 3], [f64; 3]),

    /// 原点不同.
    #[error("影像 `{0}` 的原点不一致: {1:?} != {2:?}")]
    Origin(String, [f64; 3], [f64; 3]),

    /// 方向矩阵不同.
    #[error("影像 `{0}` 的方向不一致")]
    Direction(String),
}

/// 单个清单行在组装过程中产生的可恢复错误.
#[derive(Debug, thiserror::Error)]
pub enum SubjectError {
    /// 引用的文件不存在. 收集了该行所有缺失的 `(列键, 路径)`.
    #[error("文件不存在: {}", format_missing(.0))]
    MissingFiles(Vec<(String, PathBuf)>),

    /// subject id 与前面的行重复.
    #[error("subject id 重复")]
    DuplicateId,

    /// 影像无法读取.
    #[error("影像 `{0}` 读取失败: {1}")]
    Load(String, LoadError),

    /// 预测目标无法解析为数值. 第一个字段是 `value_k` 键.
    #[error("预测目标 `{0}` 无法解析: `{1}`")]
    BadValue(String, String),

    /// 影像几何信息不一致.
    #[error("一致性检查失败: {0}")]
    Inconsistent(#[from] InconsistencyError),

    /// subject 没有任何强度通道, 无法采样.
    #[error("subject 没有强度通道")]
    NoChannels,

    /// patch 比体数据大. 两个字段均为 (z, H, W).
    #[error("patch 大小 {0:?} 超出了体数据大小 {1:?}")]
    PatchTooLarge([usize; 3], [usize; 3]),
}

fn format_missing(v: &[(String, PathBuf)]) -> String {
    use itertools::Itertools;
    v.iter()
        .map(|(k, p)| format!("{k} -> {}", p.display()))
        .join(", ")
}

/// crate 级错误.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 配置错误.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 影像读写错误.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// 清单读取错误.
    #[error("清单读取错误: {0}")]
    Csv(#[from] csv::Error),

    /// subject 级错误, 附带 subject id.
    #[error("subject `{0}`: {1}")]
    Subject(String, SubjectError),

    /// 底层 I/O 错误.
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 数据集索引越界.
    #[error("索引 {index} 越界, 数据集长度为 {len}")]
    IndexOutOfRange {
        /// 访问的索引.
        index: usize,
        /// 数据集长度.
        len: usize,
    },

    /// 某个 subject 没有产出任何 patch.
    #[error("subject `{0}` 没有产出任何 patch")]
    EmptyBundle(String),

    /// 后台队列已经关闭.
    #[error("patch 队列已关闭")]
    QueueClosed,
}
