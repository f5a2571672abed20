//! 变换链. 预处理 (确定性) 在前, 数据增强 (随机) 在后.
//!
//! 变换在数据集每次访问时作用于 subject 的副本, 不会修改组装好的 subject 列表.
//! 预处理和增强的构造器各自登记在一张静态表中, 以小写名称为键.

use std::collections::HashMap;
use std::fmt::Debug;

use log::{debug, warn};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Parameters;
use crate::consts::RESIZE_KEYS;
use crate::error::{ConfigError, SubjectError};
use crate::subject::Subject;

mod augment;
mod preprocess;

pub use augment::{RandomFlip, RandomGamma, RandomNoise};
pub use preprocess::{Clip, CropZeroPlanes, Rescale, Threshold, ZNormalize};

/// 作用于单个 subject 的变换.
///
/// 实现者可以假设传入的 subject 已经全部加载到内存中 (见 [`Compose::apply`]).
pub trait Transform: Send + Sync + Debug {
    /// 变换名, 用于日志.
    fn name(&self) -> &'static str;

    /// 对 `subject` 施加变换, 返回新的 subject. 随机变换从 `rng` 取随机数.
    fn apply(&self, subject: Subject, rng: &mut StdRng) -> Result<Subject, SubjectError>;
}

/// 变换构造器. 参数为该变换的参数块 (可能为 `null`).
type Factory = fn(&Value) -> Result<Box<dyn Transform>, ConfigError>;

static PREPROCESSING: Lazy<HashMap<&'static str, Factory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Factory> = HashMap::new();
    m.insert("normalize", ZNormalize::boxed);
    m.insert("normalize_standardize", ZNormalize::boxed);
    m.insert("normalize_nonzero", ZNormalize::boxed_nonzero);
    m.insert("threshold", Threshold::boxed);
    m.insert("clip", Clip::boxed);
    m.insert("rescale", Rescale::boxed);
    m
});

static AUGMENTATION: Lazy<HashMap<&'static str, Factory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Factory> = HashMap::new();
    m.insert("flip", RandomFlip::boxed);
    m.insert("noise", RandomNoise::boxed);
    m.insert("gamma", RandomGamma::boxed);
    m
});

/// 按参数块反序列化变换参数. `null` 对应默认参数.
pub(crate) fn parse_params<T>(name: &str, v: &Value) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    if v.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(v.clone())
        .map_err(|e| ConfigError::BadTransformParams(name.to_owned(), e.to_string()))
}

/// 检查概率参数在 \[0, 1\] 内.
pub(crate) fn check_probability(name: &str, p: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(ConfigError::BadTransformParams(
            name.to_owned(),
            format!("probability {p} 不在 [0, 1] 内"),
        ))
    }
}

/// 有序变换链.
#[derive(Debug, Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    /// 由给定变换序列创建.
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    /// 根据参数构建变换链.
    ///
    /// - 预处理总是包含, 其中的 resize 指令已在组装阶段处理, 这里跳过;
    /// - `apply_zero_crop` 时在预处理末尾追加 [`CropZeroPlanes`];
    /// - 仅当 `train` 时追加数据增强.
    ///
    /// 未知的变换名会被跳过并给出警告; 参数块格式错误时返回 `Err`.
    pub fn from_parameters(
        parameters: &Parameters,
        train: bool,
        apply_zero_crop: bool,
    ) -> Result<Self, ConfigError> {
        let mut transforms = Vec::new();

        if let Some(pre) = &parameters.data_preprocessing {
            for (name, v) in pre.iter() {
                let key = name.to_ascii_lowercase();
                if RESIZE_KEYS.contains(&key.as_str()) {
                    continue;
                }
                match PREPROCESSING.get(key.as_str()) {
                    Some(factory) => transforms.push(factory(v)?),
                    None => warn!("未知的预处理 `{name}`, 已跳过"),
                }
            }
        }
        if apply_zero_crop {
            transforms.push(Box::new(CropZeroPlanes::new(parameters.patch_size.zhw())) as _);
        }

        if train {
            if let Some(aug) = &parameters.data_augmentation {
                for (name, v) in aug.iter() {
                    match AUGMENTATION.get(name.to_ascii_lowercase().as_str()) {
                        Some(factory) => transforms.push(factory(v)?),
                        None => warn!("未知的数据增强 `{name}`, 已跳过"),
                    }
                }
            }
        }

        let ans = Self { transforms };
        debug!("变换链: {:?}", ans.names());
        Ok(ans)
    }

    /// 各变换名, 按应用顺序.
    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// 变换个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// 是否为空变换链.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// 依次施加所有变换. 未加载的 subject 会先被读入内存.
    pub fn apply(&self, subject: &Subject, rng: &mut StdRng) -> Result<Subject, SubjectError> {
        let mut ans = subject.materialize()?;
        for t in self.transforms.iter() {
            ans = t.apply(ans, rng)?;
        }
        Ok(ans)
    }
}
