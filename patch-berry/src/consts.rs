//! 通用常量.

/// 预处理配置中, 表示 resize 指令的所有同义键.
pub const RESIZE_KEYS: [&str; 3] = ["resize", "resize_image", "resize_images"];

/// 均匀采样器的所有别名.
pub const UNIFORM_SAMPLER_NAMES: [&str; 3] = ["uniform", "uniformsampler", "uniformsample"];

/// 标签采样器的所有别名.
pub const LABEL_SAMPLER_NAMES: [&str; 3] = ["label", "labelsampler", "labelsample"];

/// 加权采样器的所有别名.
pub const WEIGHTED_SAMPLER_NAMES: [&str; 3] = ["weighted", "weightedsampler", "weightedsample"];

/// 标签影像在 subject 中使用的键. 也用于 resize 缓存文件名.
pub const LABEL_KEY: &str = "label";

/// 未配置标签列时, 标签字段的字面值.
pub const NOT_APPLICABLE: &str = "NA";

/// 逐行进度日志的文件名. 位于 `{output_dir}/logs` 下.
pub const DATA_LOOP_LOG: &str = "data_loop.log";

/// resize 缓存目录的后缀. 完整目录名为 `{phase}_resized_images`.
pub const RESIZED_DIR_SUFFIX: &str = "_resized_images";

/// 默认队列长度.
pub const DEFAULT_Q_MAX_LENGTH: usize = 100;

/// 默认每个体数据采样的 patch 个数.
pub const DEFAULT_Q_SAMPLES_PER_VOLUME: usize = 10;

/// 几何信息比较的容差.
pub const GEOMETRY_TOLERANCE: f64 = 1e-5;
