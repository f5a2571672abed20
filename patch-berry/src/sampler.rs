//! patch 采样.
//!
//! 采样器决定从体数据的哪个位置截取 patch:
//!
//! - 均匀采样: 所有合法位置等概率;
//! - 标签采样: 偏向前景体素; 给出类别概率时, 每个类别按其概率分配总体质量,
//!   再在该类别的体素之间均分;
//! - 加权采样: 以标签影像的体素值作为概率密度.
//!
//! "合法位置" 指 patch 完全落在体数据内部的中心点. 概率图在合法区域内全为 0 时,
//! 退化为均匀采样并给出警告.

use std::collections::BTreeMap;

use log::warn;
use ndarray::{s, Array3};
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{Parameters, PatchSize};
use crate::consts::{LABEL_SAMPLER_NAMES, UNIFORM_SAMPLER_NAMES, WEIGHTED_SAMPLER_NAMES};
use crate::error::{ConfigError, SubjectError};
use crate::image::LabelMap;
use crate::subject::{ChannelId, Subject};
use crate::Idx3d;

/// 采样器配置.
#[derive(Clone, Debug, PartialEq)]
pub enum SamplerConfig {
    /// 均匀采样.
    Uniform,

    /// 标签采样. `label_probabilities` 为 `None` 时所有非零标签等权.
    Label {
        /// 类别 -> 概率.
        label_probabilities: Option<BTreeMap<u8, f64>>,
    },

    /// 以标签影像为概率图的加权采样.
    Weighted,
}

impl SamplerConfig {
    /// 按名称解析采样器 (大小写不敏感). 未知名称返回 `Err`.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        let lower = name.to_ascii_lowercase();
        let n = lower.as_str();
        if UNIFORM_SAMPLER_NAMES.contains(&n) {
            Ok(Self::Uniform)
        } else if LABEL_SAMPLER_NAMES.contains(&n) {
            Ok(Self::Label {
                label_probabilities: None,
            })
        } else if WEIGHTED_SAMPLER_NAMES.contains(&n) {
            Ok(Self::Weighted)
        } else {
            Err(ConfigError::UnknownSampler(name.to_owned()))
        }
    }

    /// 从参数解析采样器.
    ///
    /// 类别概率只在 `train && biased_sampling` 时从 `sampling_weights` 读取.
    /// 标签和加权采样都需要标签列, 否则返回 `Err`.
    pub fn from_parameters(parameters: &Parameters, train: bool) -> Result<Self, ConfigError> {
        let sampler = &parameters.patch_sampler;
        let mut ans = Self::from_name(&sampler.kind)?;
        if let Self::Label {
            label_probabilities,
        } = &mut ans
        {
            if train && sampler.biased_sampling {
                *label_probabilities = Some(parameters.sampling_weights.clone().unwrap_or_default());
            }
        }
        if ans != Self::Uniform && parameters.headers.label_header.is_none() {
            return Err(ConfigError::LabelRequired(sampler.kind.clone()));
        }
        Ok(ans)
    }

    /// 采样器名.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => UNIFORM_SAMPLER_NAMES[0],
            Self::Label { .. } => LABEL_SAMPLER_NAMES[0],
            Self::Weighted => WEIGHTED_SAMPLER_NAMES[0],
        }
    }
}

/// 从 subject 中截取出的一个 patch.
#[derive(Clone, Debug)]
pub struct Patch {
    /// 来源 subject.
    pub subject_id: String,

    /// patch 在体数据中的起点, (z, H, W).
    pub location: Idx3d,

    /// 各通道的 patch 数据, 形状均为 patch 大小 (z, H, W).
    pub channels: Vec<(ChannelId, Array3<f32>)>,

    /// 标签 patch.
    pub label: Option<Array3<u8>>,

    /// 标量预测目标.
    pub values: Vec<f64>,

    /// 体素分辨率, \[z, H, W\].
    pub spacing: [f64; 3],
}

impl Patch {
    /// patch 形状, (z, H, W).
    pub fn shape(&self) -> Idx3d {
        self.channels.first().map_or((0, 0, 0), |(_, a)| a.dim())
    }
}

/// patch 采样器.
#[derive(Clone, Debug)]
pub struct PatchSampler {
    config: SamplerConfig,
    patch: Idx3d,
}

impl PatchSampler {
    /// 创建采样器.
    pub fn new(config: SamplerConfig, patch_size: &PatchSize) -> Self {
        Self {
            config,
            patch: patch_size.zhw(),
        }
    }

    /// 采样器配置.
    #[inline]
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// patch 大小, (z, H, W).
    #[inline]
    pub fn patch_shape(&self) -> Idx3d {
        self.patch
    }

    /// 从已加载的 `subject` 中采样 `n` 个 patch.
    ///
    /// 未加载的 subject 会先被读入内存. 没有强度通道或 patch 比体数据大时返回 `Err`.
    pub fn sample(
        &self,
        subject: &Subject,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<Patch>, SubjectError> {
        let loaded;
        let subject = if subject.is_loaded() {
            subject
        } else {
            loaded = subject.materialize()?;
            &loaded
        };
        let Some(first) = subject.loaded_channels().and_then(|c| c.first().copied()) else {
            return Err(SubjectError::NoChannels);
        };

        let shape = first.shape();
        let (pz, ph, pw) = self.patch;
        if pz > shape.0 || ph > shape.1 || pw > shape.2 {
            return Err(SubjectError::PatchTooLarge(
                [pz, ph, pw],
                [shape.0, shape.1, shape.2],
            ));
        }

        let starts = self.draw_starts(subject.loaded_label(), shape, n, rng);
        Ok(starts
            .into_iter()
            .map(|start| self.extract(subject, start))
            .collect())
    }

    /// 抽取 `n` 个 patch 起点.
    fn draw_starts(
        &self,
        label: Option<&LabelMap>,
        shape: Idx3d,
        n: usize,
        rng: &mut StdRng,
    ) -> Vec<Idx3d> {
        let (pz, ph, pw) = self.patch;
        // 合法起点范围 [0, S - p].
        let (rz, rh, rw) = (shape.0 - pz + 1, shape.1 - ph + 1, shape.2 - pw + 1);

        let weights = match (&self.config, label) {
            (SamplerConfig::Uniform, _) => None,
            (_, None) => {
                warn!("{} 采样器缺少标签影像, 退化为均匀采样", self.config.name());
                None
            }
            (SamplerConfig::Label { label_probabilities }, Some(l)) => {
                Some(label_weights(l, label_probabilities.as_ref()))
            }
            (SamplerConfig::Weighted, Some(l)) => Some(l.data().mapv(f64::from)),
        };

        // 中心点 = 起点 + p / 2. 只保留合法中心处的权重, 按起点编号.
        let table = weights.and_then(|w| {
            let valid = w.slice(s![
                pz / 2..pz / 2 + rz,
                ph / 2..ph / 2 + rh,
                pw / 2..pw / 2 + rw
            ]);
            match WeightedIndex::new(valid.iter().copied()) {
                Ok(t) => Some(t),
                Err(_) => {
                    warn!("概率图在合法区域内全为 0, 退化为均匀采样");
                    None
                }
            }
        });

        (0..n)
            .map(|_| match &table {
                Some(t) => {
                    let i = rng.sample(t);
                    (i / (rh * rw), (i / rw) % rh, i % rw)
                }
                None => (
                    rng.gen_range(0..rz),
                    rng.gen_range(0..rh),
                    rng.gen_range(0..rw),
                ),
            })
            .collect()
    }

    fn extract(&self, subject: &Subject, start: Idx3d) -> Patch {
        let (z, h, w) = start;
        let (pz, ph, pw) = self.patch;
        let region = s![z..z + pz, h..h + ph, w..w + pw];
        let channels = subject
            .channels
            .iter()
            .filter_map(|c| Some((c.id, c.image.as_image()?.data().slice(&region).to_owned())))
            .collect();
        let label = subject
            .loaded_label()
            .map(|l| l.data().slice(&region).to_owned());
        Patch {
            subject_id: subject.subject_id.clone(),
            location: start,
            channels,
            label,
            values: subject.values.clone(),
            spacing: subject.spacing,
        }
    }
}

/// 标签采样的权重图.
fn label_weights(label: &LabelMap, probabilities: Option<&BTreeMap<u8, f64>>) -> Array3<f64> {
    match probabilities {
        None => label.data().mapv(|v| if v > 0 { 1.0 } else { 0.0 }),
        Some(p) => {
            let mut per_voxel = [0.0f64; 256];
            for (&class, &prob) in p.iter() {
                let count = label.count(class);
                if count > 0 && prob > 0.0 {
                    per_voxel[class as usize] = prob / count as f64;
                }
            }
            label.data().mapv(|v| per_voxel[v as usize])
        }
    }
}
