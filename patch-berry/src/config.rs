//! 数据加载参数.
//!
//! 参数以 JSON 描述, 字段名与训练配置文件保持一致. 例如:
//!
//! ```json
//! {
//!     "patch_size": [64, 64, 32],
//!     "headers": {"subjectIDHeader": 0, "channelHeaders": [1, 2], "labelHeader": 3},
//!     "patch_sampler": {"type": "label", "enable_padding": true},
//!     "data_augmentation": {"flip": {"axis": [0, 1]}, "noise": {"std": 0.1}},
//!     "data_preprocessing": {"normalize": null, "resize": [128, 128, 64]}
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::consts::{DEFAULT_Q_MAX_LENGTH, DEFAULT_Q_SAMPLES_PER_VOLUME};
use crate::error::ConfigError;
use crate::image::PaddingMode;
use crate::Idx3d;

/// patch 大小. 按 \[x, y, z\] (即 \[W, H, z\]) 给出, 与训练配置一致.
/// 二维 patch 可以只写两个分量, 此时 z 为 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(try_from = "Vec<usize>")]
pub struct PatchSize([usize; 3]);

impl PatchSize {
    /// 从 2 或 3 个正整数构建. 否则返回 `Err`.
    pub fn new(v: &[usize]) -> Result<Self, ConfigError> {
        let arr = match *v {
            [x, y] => [x, y, 1],
            [x, y, z] => [x, y, z],
            _ => return Err(ConfigError::MalformedPatchSize(v.to_vec())),
        };
        if arr.contains(&0) {
            return Err(ConfigError::MalformedPatchSize(v.to_vec()));
        }
        Ok(Self(arr))
    }

    /// \[x, y, z\] 形式.
    #[inline]
    pub fn xyz(&self) -> [usize; 3] {
        self.0
    }

    /// (z, H, W) 形式, 与体数据的组织方式一致.
    #[inline]
    pub fn zhw(&self) -> Idx3d {
        let [x, y, z] = self.0;
        (z, y, x)
    }

    /// patch 体素个数.
    #[inline]
    pub fn voxels(&self) -> usize {
        self.0.iter().product()
    }
}

impl TryFrom<Vec<usize>> for PatchSize {
    type Error = ConfigError;

    fn try_from(value: Vec<usize>) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

/// 清单中各列的角色. 所有值都是列索引.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Headers {
    /// subject id 列.
    #[serde(alias = "subjectIDHeader")]
    pub subject_id_header: usize,

    /// 影像通道列, 至少一个.
    #[serde(alias = "channelHeaders")]
    pub channel_headers: Vec<usize>,

    /// 标签列. 可选.
    #[serde(default, alias = "labelHeader")]
    pub label_header: Option<usize>,

    /// 预测目标 (标量) 列, 按顺序映射为 `value_0`, `value_1`, ...
    #[serde(default, alias = "predictionHeaders")]
    pub prediction_headers: Vec<usize>,
}

impl Headers {
    /// 从清单的列名推断各列角色. 列名大小写不敏感:
    ///
    /// - 含 `subject` 或 `patient`, 或等于 `id`: subject id 列 (取第一个);
    /// - 含 `channel`, `modality` 或 `image`: 通道列;
    /// - 含 `label`, `mask` 或 `segmentation`: 标签列 (取第一个);
    /// - 含 `value` 或 `predict`: 预测目标列.
    ///
    /// 找不到 subject id 列时以第 0 列代替. 没有通道列时返回 `None`.
    pub fn infer<S: AsRef<str>>(columns: &[S]) -> Option<Self> {
        let mut ans = Self::default();
        let mut id = None;
        for (i, col) in columns.iter().enumerate() {
            let c = col.as_ref().to_ascii_lowercase();
            if c.contains("subject") || c.contains("patient") || c == "id" {
                id.get_or_insert(i);
            } else if c.contains("channel") || c.contains("modality") || c.contains("image") {
                ans.channel_headers.push(i);
            } else if c.contains("label") || c.contains("mask") || c.contains("segmentation") {
                ans.label_header.get_or_insert(i);
            } else if c.contains("value") || c.contains("predict") {
                ans.prediction_headers.push(i);
            }
        }
        ans.subject_id_header = id.unwrap_or(0);
        (!ans.channel_headers.is_empty()).then_some(ans)
    }

    /// 所有被引用的列索引.
    pub fn columns(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.subject_id_header)
            .chain(self.channel_headers.iter().copied())
            .chain(self.label_header)
            .chain(self.prediction_headers.iter().copied())
    }
}

/// patch 采样器配置.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "PatchSamplerRepr")]
pub struct PatchSamplerParams {
    /// 采样器类型名. 构造队列时才被解析, 见 [`crate::sampler::SamplerConfig`].
    pub kind: String,

    /// 是否对 subject 做对称填充.
    pub enable_padding: bool,

    /// 填充模式.
    pub padding_mode: PaddingMode,

    /// 是否按类别概率进行有偏的标签采样.
    pub biased_sampling: bool,
}

impl Default for PatchSamplerParams {
    fn default() -> Self {
        Self::named("uniform".to_owned())
    }
}

impl PatchSamplerParams {
    fn named(kind: String) -> Self {
        Self {
            kind,
            enable_padding: false,
            padding_mode: PaddingMode::default(),
            biased_sampling: false,
        }
    }
}

/// `patch_sampler` 既可以写成字符串, 也可以写成完整的映射.
#[derive(Deserialize)]
#[serde(untagged)]
enum PatchSamplerRepr {
    Name(String),
    Full {
        #[serde(rename = "type", default = "default_sampler")]
        kind: String,
        #[serde(default)]
        enable_padding: bool,
        #[serde(default)]
        padding_mode: PaddingMode,
        #[serde(default)]
        biased_sampling: bool,
    },
}

fn default_sampler() -> String {
    "uniform".to_owned()
}

impl From<PatchSamplerRepr> for PatchSamplerParams {
    fn from(value: PatchSamplerRepr) -> Self {
        match value {
            PatchSamplerRepr::Name(kind) => Self::named(kind),
            PatchSamplerRepr::Full {
                kind,
                enable_padding,
                padding_mode,
                biased_sampling,
            } => Self {
                kind,
                enable_padding,
                padding_mode,
                biased_sampling,
            },
        }
    }
}

/// 模型相关参数. 这里只关心空间维度.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelParams {
    /// 2 或 3.
    #[serde(default = "default_dimension")]
    pub dimension: u8,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
        }
    }
}

fn default_dimension() -> u8 {
    3
}

/// 数据加载参数块.
#[derive(Clone, Debug, Deserialize)]
pub struct Parameters {
    /// patch 大小.
    pub patch_size: PatchSize,

    /// 清单各列角色.
    pub headers: Headers,

    /// 队列中最多同时存在的 patch 个数.
    #[serde(default = "default_q_max_length")]
    pub q_max_length: usize,

    /// 每个 subject 采样的 patch 个数.
    #[serde(default = "default_q_samples_per_volume")]
    pub q_samples_per_volume: usize,

    /// 后台加载线程个数. 为 0 时在消费者线程上同步加载.
    #[serde(default = "cpus")]
    pub q_num_workers: usize,

    /// 是否输出队列的详细日志.
    #[serde(default)]
    pub q_verbose: bool,

    /// 数据增强, 增强名 -> 参数块. 顺序即应用顺序.
    #[serde(default)]
    pub data_augmentation: Option<Map<String, Value>>,

    /// 预处理, 预处理名 -> 参数块. 可包含 resize 指令.
    #[serde(default)]
    pub data_preprocessing: Option<Map<String, Value>>,

    /// 是否在组装阶段就把所有影像读入内存.
    #[serde(default)]
    pub in_memory: bool,

    /// patch 采样器.
    #[serde(default)]
    pub patch_sampler: PatchSamplerParams,

    /// 模型参数.
    #[serde(default)]
    pub model: ModelParams,

    /// 节省内存模式: resize 结果写入磁盘而不保存在内存中.
    #[serde(default)]
    pub memory_save_mode: bool,

    /// 输出目录. 日志和 resize 缓存都在其下.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// 有偏标签采样时各类别的概率.
    #[serde(default)]
    pub sampling_weights: Option<BTreeMap<u8, f64>>,

    /// 随机种子. 未给出时从系统熵源获取.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_q_max_length() -> usize {
    DEFAULT_Q_MAX_LENGTH
}

fn default_q_samples_per_volume() -> usize {
    DEFAULT_Q_SAMPLES_PER_VOLUME
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 获取 `{用户主目录}/patch-berry` 目录. 无法获取主目录时使用当前目录.
fn default_output_dir() -> PathBuf {
    let mut ans = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    ans.push("patch-berry");
    ans
}

impl Parameters {
    /// 从 JSON 字符串解析参数.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let ans: Self = serde_json::from_str(s)?;
        ans.validate()?;
        Ok(ans)
    }

    /// 从 JSON 值解析参数.
    pub fn from_json_value(v: Value) -> Result<Self, ConfigError> {
        let ans: Self = serde_json::from_value(v)?;
        ans.validate()?;
        Ok(ans)
    }

    /// 从 JSON 文件解析参数.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&s)?)
    }

    /// 检查与数据无关的参数合法性.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.model.dimension, 2 | 3) {
            return Err(ConfigError::BadDimension(self.model.dimension));
        }
        if self.headers.channel_headers.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        Ok(())
    }

    /// 随机种子. 未设置时从系统熵源生成一个.
    pub fn seed_or_random(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_size() {
        assert_eq!(PatchSize::new(&[4, 5, 6]).unwrap().zhw(), (6, 5, 4));
        assert_eq!(PatchSize::new(&[4, 5]).unwrap().xyz(), [4, 5, 1]);
        assert!(PatchSize::new(&[4]).is_err());
        assert!(PatchSize::new(&[4, 0, 3]).is_err());
        assert!(PatchSize::new(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_parameters_defaults() {
        let p = Parameters::from_json_value(json!({
            "patch_size": [8, 8, 8],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1]},
        }))
        .unwrap();
        assert_eq!(p.q_max_length, 100);
        assert_eq!(p.q_samples_per_volume, 10);
        assert!(p.q_num_workers >= 1);
        assert_eq!(p.patch_sampler.kind, "uniform");
        assert!(!p.patch_sampler.enable_padding);
        assert_eq!(p.model.dimension, 3);
        assert!(p.headers.label_header.is_none());
        assert!(p.data_augmentation.is_none());
    }

    #[test]
    fn test_patch_sampler_forms() {
        let p = Parameters::from_json_value(json!({
            "patch_size": [8, 8],
            "headers": {"subject_id_header": 0, "channel_headers": [1], "label_header": 2},
            "patch_sampler": "label",
            "model": {"dimension": 2},
        }))
        .unwrap();
        assert_eq!(p.patch_sampler.kind, "label");

        let p = Parameters::from_json_value(json!({
            "patch_size": [8, 8, 8],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1]},
            "patch_sampler": {"type": "weighted", "enable_padding": true, "padding_mode": "edge"},
            "sampling_weights": {"0": 0.1, "1": 0.9},
        }))
        .unwrap();
        assert_eq!(p.patch_sampler.kind, "weighted");
        assert!(p.patch_sampler.enable_padding);
        assert_eq!(p.patch_sampler.padding_mode, PaddingMode::Edge);
        assert_eq!(p.sampling_weights.unwrap()[&1], 0.9);
    }

    #[test]
    fn test_parameters_invalid() {
        let bad_patch = json!({
            "patch_size": [8, 8, 8, 8],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1]},
        });
        assert!(Parameters::from_json_value(bad_patch).is_err());

        let bad_dim = json!({
            "patch_size": [8, 8, 8],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1]},
            "model": {"dimension": 4},
        });
        assert!(matches!(
            Parameters::from_json_value(bad_dim),
            Err(ConfigError::BadDimension(4))
        ));

        let no_channels = json!({
            "patch_size": [8, 8, 8],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [], "labelHeader": 1},
        });
        assert!(matches!(
            Parameters::from_json_value(no_channels),
            Err(ConfigError::NoChannels)
        ));
    }

    #[test]
    fn test_augmentation_order_preserved() {
        let p = Parameters::from_json_value(json!({
            "patch_size": [8, 8, 8],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1]},
            "data_augmentation": {"noise": {}, "flip": {}, "gamma": {}},
        }))
        .unwrap();
        let names: Vec<_> = p.data_augmentation.unwrap().keys().cloned().collect();
        assert_eq!(names, ["noise", "flip", "gamma"]);
    }

    #[test]
    fn test_headers_infer() {
        let h = Headers::infer(&["SubjectID", "Channel_0", "Channel_1", "Label", "ValueToPredict"])
            .unwrap();
        assert_eq!(h.subject_id_header, 0);
        assert_eq!(h.channel_headers, vec![1, 2]);
        assert_eq!(h.label_header, Some(3));
        assert_eq!(h.prediction_headers, vec![4]);
        assert_eq!(h.columns().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        assert!(Headers::infer(&["SubjectID", "Label"]).is_none());
    }
}
