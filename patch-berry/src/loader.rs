//! 数据加载入口: 清单 + 参数 -> 评估数据集或训练 patch 队列.

use log::{info, warn};

use crate::assemble::SubjectAssembler;
use crate::config::Parameters;
use crate::dataset::SubjectsDataset;
use crate::error::{Result, SubjectError};
use crate::manifest::Manifest;
use crate::queue::{PatchQueue, QueueOptions};
use crate::sampler::{PatchSampler, SamplerConfig};
use crate::transform::Compose;

/// 加载器.
pub enum Loader {
    /// 评估/测试: 随机访问的 subject 数据集, 不做 patch 采样.
    Dataset(SubjectsDataset),

    /// 训练: patch 队列.
    Queue(PatchQueue),
}

impl Loader {
    /// 取出数据集. 训练加载器返回 `None`.
    pub fn into_dataset(self) -> Option<SubjectsDataset> {
        match self {
            Self::Dataset(ds) => Some(ds),
            Self::Queue(_) => None,
        }
    }

    /// 取出 patch 队列. 评估加载器返回 `None`.
    pub fn into_queue(self) -> Option<PatchQueue> {
        match self {
            Self::Queue(q) => Some(q),
            Self::Dataset(_) => None,
        }
    }
}

/// 组装清单中的所有 subject, 并构建加载器.
///
/// - `train` 为假时返回 [`Loader::Dataset`], 为真时返回 [`Loader::Queue`];
/// - `apply_zero_crop` 时在预处理末尾裁去外侧全零平面;
/// - `phase` 为加载器阶段名, 决定进度日志内容和 resize 缓存目录.
///
/// 所有配置错误 (未知采样器、列越界、变换参数错误等) 都在读取任何影像之前返回.
/// 单个 subject 的错误不会导致失败, 而是随加载器一起返回, 这些 subject
/// 不会出现在加载器中.
pub fn images_from_manifest(
    manifest: &Manifest,
    parameters: &Parameters,
    train: bool,
    apply_zero_crop: bool,
    phase: &str,
) -> Result<(Loader, Vec<(String, SubjectError)>)> {
    parameters.validate()?;
    let sampler = if train {
        Some(SamplerConfig::from_parameters(parameters, train)?)
    } else {
        None
    };
    manifest.check_headers(&parameters.headers)?;
    let transform = Compose::from_parameters(parameters, train, apply_zero_crop)?;
    let assembler = SubjectAssembler::new(parameters, phase)?;

    let report = assembler.assemble(manifest)?;
    if !report.is_clean() {
        warn!(
            "以下 subject 无法加载, 请检查或移除后重试: {:?}",
            report.error_ids().collect::<Vec<_>>()
        );
    }

    let seed = parameters.seed_or_random();
    let dataset = SubjectsDataset::new(report.subjects, transform, seed);
    let loader = match sampler {
        None => Loader::Dataset(dataset),
        Some(config) => {
            info!("{phase} 使用 {} 采样器", config.name());
            let sampler = PatchSampler::new(config, &parameters.patch_size);
            let options = QueueOptions {
                seed,
                ..QueueOptions::from_parameters(parameters)
            };
            Loader::Queue(PatchQueue::new(dataset, sampler, options)?)
        }
    };
    Ok((loader, report.errors))
}
