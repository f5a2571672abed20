//! 确定性的预处理变换. 只作用于强度通道, 标签保持不变 ([`CropZeroPlanes`] 除外).

use rand::rngs::StdRng;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_params, Transform};
use crate::error::{ConfigError, SubjectError};
use crate::subject::Subject;
use crate::Idx3d;

/// z-score 标准化: `(v - mean) / std`.
///
/// `nonzero` 时只统计并修改非零体素, 零体素 (背景) 保持为 0.
/// 标准差为 0 时只做平移.
#[derive(Copy, Clone, Debug, Default)]
pub struct ZNormalize {
    nonzero: bool,
}

impl ZNormalize {
    /// 对全部体素做标准化.
    pub fn new() -> Self {
        Self { nonzero: false }
    }

    /// 只对非零体素做标准化.
    pub fn nonzero() -> Self {
        Self { nonzero: true }
    }

    pub(super) fn boxed(_: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        Ok(Box::new(Self::new()))
    }

    pub(super) fn boxed_nonzero(_: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        Ok(Box::new(Self::nonzero()))
    }
}

impl Transform for ZNormalize {
    fn name(&self) -> &'static str {
        if self.nonzero {
            "normalize_nonzero"
        } else {
            "normalize"
        }
    }

    fn apply(&self, mut subject: Subject, _: &mut StdRng) -> Result<Subject, SubjectError> {
        let nonzero = self.nonzero;
        let keep = |v: f32| !nonzero || v != 0.0;
        for img in subject.loaded_channels_mut() {
            let (mut n, mut sum, mut sq) = (0usize, 0.0f64, 0.0f64);
            for v in img.iter().filter(|v| keep(*v)) {
                n += 1;
                sum += v as f64;
                sq += (v as f64) * (v as f64);
            }
            if n == 0 {
                continue;
            }
            let mean = sum / n as f64;
            let std = (sq / n as f64 - mean * mean).max(0.0).sqrt();
            let (mean, scale) = (mean as f32, if std > 0.0 { 1.0 / std as f32 } else { 1.0 });
            img.data_mut()
                .iter_mut()
                .filter(|v| keep(**v))
                .for_each(|v| *v = (*v - mean) * scale);
        }
        Ok(subject)
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
struct Range {
    min: f32,
    max: f32,
}

impl Default for Range {
    fn default() -> Self {
        Self {
            min: f32::MIN,
            max: f32::MAX,
        }
    }
}

fn parse_range(name: &str, v: &Value) -> Result<Range, ConfigError> {
    let r: Range = parse_params(name, v)?;
    if r.min > r.max {
        return Err(ConfigError::BadTransformParams(
            name.to_owned(),
            format!("min {} 大于 max {}", r.min, r.max),
        ));
    }
    Ok(r)
}

/// 阈值化: 区间 \[min, max\] 之外的体素置为 0.
#[derive(Copy, Clone, Debug)]
pub struct Threshold {
    range: Range,
}

impl Threshold {
    /// 创建阈值变换.
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            range: Range { min, max },
        }
    }

    pub(super) fn boxed(v: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        Ok(Box::new(Self {
            range: parse_range("threshold", v)?,
        }))
    }
}

impl Transform for Threshold {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn apply(&self, mut subject: Subject, _: &mut StdRng) -> Result<Subject, SubjectError> {
        let Range { min, max } = self.range;
        for img in subject.loaded_channels_mut() {
            img.data_mut()
                .iter_mut()
                .filter(|v| **v < min || **v > max)
                .for_each(|v| *v = 0.0);
        }
        Ok(subject)
    }
}

/// 截断: 把体素值限制在 \[min, max\] 内.
#[derive(Copy, Clone, Debug)]
pub struct Clip {
    range: Range,
}

impl Clip {
    /// 创建截断变换.
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            range: Range { min, max },
        }
    }

    pub(super) fn boxed(v: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        Ok(Box::new(Self {
            range: parse_range("clip", v)?,
        }))
    }
}

impl Transform for Clip {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn apply(&self, mut subject: Subject, _: &mut StdRng) -> Result<Subject, SubjectError> {
        let Range { min, max } = self.range;
        for img in subject.loaded_channels_mut() {
            img.data_mut().mapv_inplace(|v| num::clamp(v, min, max));
        }
        Ok(subject)
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
struct RescaleParams {
    out_min_max: [f32; 2],
}

impl Default for RescaleParams {
    fn default() -> Self {
        Self {
            out_min_max: [0.0, 1.0],
        }
    }
}

/// 线性缩放: 把每个通道的 \[最小值, 最大值\] 映射到 `out_min_max`.
/// 常数通道被映射为输出区间下界.
#[derive(Copy, Clone, Debug)]
pub struct Rescale {
    out_min: f32,
    out_max: f32,
}

impl Rescale {
    /// 创建线性缩放变换.
    pub fn new(out_min: f32, out_max: f32) -> Self {
        Self { out_min, out_max }
    }

    pub(super) fn boxed(v: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        let RescaleParams {
            out_min_max: [lo, hi],
        } = parse_params("rescale", v)?;
        Ok(Box::new(Self::new(lo, hi)))
    }
}

impl Transform for Rescale {
    fn name(&self) -> &'static str {
        "rescale"
    }

    fn apply(&self, mut subject: Subject, _: &mut StdRng) -> Result<Subject, SubjectError> {
        let (lo, hi) = (self.out_min, self.out_max);
        for img in subject.loaded_channels_mut() {
            let (min, max) = img
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), v| (a.min(v), b.max(v)));
            let range = max - min;
            img.data_mut().mapv_inplace(|v| {
                if range > 0.0 {
                    lo + (v - min) / range * (hi - lo)
                } else {
                    lo
                }
            });
        }
        Ok(subject)
    }
}

/// 裁去所有通道在外侧全为 0 的平面.
///
/// 保留区域是所有通道非零体素的包围盒, 每个轴至少保留 `min_size`
/// (即 patch 大小) 个体素, 不足时向两侧扩展. 标签随通道一起裁剪.
/// 所有通道全为 0 时不做任何处理.
#[derive(Copy, Clone, Debug)]
pub struct CropZeroPlanes {
    min_size: Idx3d,
}

impl CropZeroPlanes {
    /// 创建裁剪变换. `min_size` 为 (z, H, W).
    pub fn new(min_size: Idx3d) -> Self {
        Self { min_size }
    }

    /// 计算保留区域的起点和大小.
    fn bbox(&self, subject: &Subject) -> Option<(Idx3d, Idx3d)> {
        let channels = subject.loaded_channels()?;
        let shape = channels.first()?.shape();
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        for img in channels.iter() {
            for ((z, h, w), v) in img.data().indexed_iter() {
                if *v != 0.0 {
                    for (a, i) in [z, h, w].into_iter().enumerate() {
                        lo[a] = lo[a].min(i);
                        hi[a] = hi[a].max(i + 1);
                    }
                }
            }
        }
        if lo[0] == usize::MAX {
            return None;
        }

        let dims = [shape.0, shape.1, shape.2];
        let min = [self.min_size.0, self.min_size.1, self.min_size.2];
        let mut start = [0usize; 3];
        let mut len = [0usize; 3];
        for a in 0..3 {
            let want = (hi[a] - lo[a]).max(min[a]).min(dims[a]);
            let extra = want - (hi[a] - lo[a]);
            let s = lo[a].saturating_sub(extra / 2);
            start[a] = s.min(dims[a] - want);
            len[a] = want;
        }
        Some(((start[0], start[1], start[2]), (len[0], len[1], len[2])))
    }
}

impl Transform for CropZeroPlanes {
    fn name(&self) -> &'static str {
        "crop_external_zero_planes"
    }

    fn apply(&self, subject: Subject, _: &mut StdRng) -> Result<Subject, SubjectError> {
        let Some((start, shape)) = self.bbox(&subject) else {
            return Ok(subject);
        };
        subject.map_images(
            |_, img| img.crop(start, shape),
            |label| label.crop(start, shape),
        )
    }
}
