//! 随机数据增强. 每个增强都带有 `probability` 参数 (默认 1), 表示被施加的概率.

use ndarray::Axis;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use serde_json::Value;

use super::{check_probability, parse_params, Transform};
use crate::error::{ConfigError, SubjectError};
use crate::subject::Subject;

fn default_probability() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct FlipParams {
    axis: Vec<usize>,
    probability: f64,
}

impl Default for FlipParams {
    fn default() -> Self {
        Self {
            axis: vec![0, 1, 2],
            probability: default_probability(),
        }
    }
}

/// 随机翻转. `axis` 按 \[x, y, z\] 编号, 每个轴独立地以 1/2 的概率翻转.
/// 通道和标签一起翻转.
#[derive(Clone, Debug)]
pub struct RandomFlip {
    /// 体数据轴 (z, H, W 中的索引).
    axes: Vec<Axis>,
    probability: f64,
}

impl RandomFlip {
    pub(super) fn boxed(v: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        let p: FlipParams = parse_params("flip", v)?;
        let axes = p
            .axis
            .iter()
            .map(|a| match a {
                0 => Ok(Axis(2)),
                1 => Ok(Axis(1)),
                2 => Ok(Axis(0)),
                _ => Err(ConfigError::BadTransformParams(
                    "flip".to_owned(),
                    format!("轴 {a} 不存在"),
                )),
            })
            .collect::<Result<_, _>>()?;
        Ok(Box::new(Self {
            axes,
            probability: check_probability("flip", p.probability)?,
        }))
    }
}

impl Transform for RandomFlip {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn apply(&self, subject: Subject, rng: &mut StdRng) -> Result<Subject, SubjectError> {
        if !rng.gen_bool(self.probability) {
            return Ok(subject);
        }
        let axes: Vec<Axis> = self
            .axes
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(0.5))
            .collect();
        if axes.is_empty() {
            return Ok(subject);
        }
        subject.map_images(
            |_, img| {
                let mut v = img.data();
                axes.iter().for_each(|a| v.invert_axis(*a));
                img.with_data(v.as_standard_layout().into_owned())
            },
            |label| {
                let mut v = label.data();
                axes.iter().for_each(|a| v.invert_axis(*a));
                label.with_data(v.as_standard_layout().into_owned())
            },
        )
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
struct NoiseParams {
    mean: f32,
    std: f32,
    probability: f64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
            probability: default_probability(),
        }
    }
}

/// 随机高斯噪声. 只作用于强度通道.
#[derive(Copy, Clone, Debug)]
pub struct RandomNoise {
    normal: Normal<f32>,
    probability: f64,
}

impl RandomNoise {
    pub(super) fn boxed(v: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        let p: NoiseParams = parse_params("noise", v)?;
        if p.std < 0.0 {
            return Err(ConfigError::BadTransformParams(
                "noise".to_owned(),
                format!("std 不能为负: {}", p.std),
            ));
        }
        let normal = Normal::new(p.mean, p.std)
            .map_err(|e| ConfigError::BadTransformParams("noise".to_owned(), e.to_string()))?;
        Ok(Box::new(Self {
            normal,
            probability: check_probability("noise", p.probability)?,
        }))
    }
}

impl Transform for RandomNoise {
    fn name(&self) -> &'static str {
        "noise"
    }

    fn apply(&self, mut subject: Subject, rng: &mut StdRng) -> Result<Subject, SubjectError> {
        if !rng.gen_bool(self.probability) {
            return Ok(subject);
        }
        for img in subject.loaded_channels_mut() {
            img.data_mut()
                .iter_mut()
                .for_each(|v| *v += self.normal.sample(rng));
        }
        Ok(subject)
    }
}

#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
struct GammaParams {
    log_gamma: [f64; 2],
    probability: f64,
}

impl Default for GammaParams {
    fn default() -> Self {
        Self {
            log_gamma: [-0.3, 0.3],
            probability: default_probability(),
        }
    }
}

/// 随机 gamma 变换: `sign(v) * |v| ^ gamma`, 其中 `ln(gamma)` 在 `log_gamma`
/// 区间内均匀取值. 只作用于强度通道.
#[derive(Copy, Clone, Debug)]
pub struct RandomGamma {
    log_gamma: (f64, f64),
    probability: f64,
}

impl RandomGamma {
    pub(super) fn boxed(v: &Value) -> Result<Box<dyn Transform>, ConfigError> {
        let p: GammaParams = parse_params("gamma", v)?;
        let [lo, hi] = p.log_gamma;
        if !(lo <= hi) {
            return Err(ConfigError::BadTransformParams(
                "gamma".to_owned(),
                format!("log_gamma 区间 [{lo}, {hi}] 非法"),
            ));
        }
        Ok(Box::new(Self {
            log_gamma: (lo, hi),
            probability: check_probability("gamma", p.probability)?,
        }))
    }
}

impl Transform for RandomGamma {
    fn name(&self) -> &'static str {
        "gamma"
    }

    fn apply(&self, mut subject: Subject, rng: &mut StdRng) -> Result<Subject, SubjectError> {
        if !rng.gen_bool(self.probability) {
            return Ok(subject);
        }
        let (lo, hi) = self.log_gamma;
        let gamma = if lo < hi { rng.gen_range(lo..hi) } else { lo }.exp() as f32;
        for img in subject.loaded_channels_mut() {
            img.data_mut()
                .mapv_inplace(|v| v.signum() * v.abs().powf(gamma));
        }
        Ok(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageRef, LabelMap, ScalarImage};
    use crate::subject::{Channel, ChannelId};
    use ndarray::Array3;
    use rand::SeedableRng;
    use serde_json::json;

    fn subject() -> Subject {
        let data = Array3::from_shape_fn((2, 3, 4), |(z, h, w)| (z * 12 + h * 4 + w) as f32);
        let label = Array3::from_shape_fn((2, 3, 4), |(z, h, w)| (z * 12 + h * 4 + w) as u8);
        let mut s = Subject::new("s");
        s.channels.push(Channel {
            id: ChannelId(1),
            image: ImageRef::InMemory(ScalarImage::from_array(data, [1.0; 3])),
        });
        s.label = Some(ImageRef::InMemory(LabelMap::from_array(label, [1.0; 3])));
        s
    }

    #[test]
    fn test_flip_keeps_channel_and_label_aligned() {
        let t = RandomFlip::boxed(&json!({"axis": [0, 1, 2]})).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..8 {
            let out = t.apply(subject(), &mut rng).unwrap();
            let c = out.loaded_channels().unwrap()[0];
            let l = out.loaded_label().unwrap();
            assert_eq!(c.shape(), (2, 3, 4));
            for (a, b) in c.iter().zip(l.iter()) {
                assert_eq!(a, b as f32);
            }
        }
    }

    #[test]
    fn test_probability_zero_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        for t in [
            RandomFlip::boxed(&json!({"probability": 0.0})).unwrap(),
            RandomNoise::boxed(&json!({"std": 5.0, "probability": 0.0})).unwrap(),
            RandomGamma::boxed(&json!({"probability": 0.0})).unwrap(),
        ] {
            let out = t.apply(subject(), &mut rng).unwrap();
            assert_eq!(
                out.loaded_channels().unwrap()[0].data(),
                subject().loaded_channels().unwrap()[0].data()
            );
        }
    }

    #[test]
    fn test_noise_does_not_touch_label() {
        let t = RandomNoise::boxed(&json!({"std": 0.5})).unwrap();
        let out = t.apply(subject(), &mut StdRng::seed_from_u64(5)).unwrap();
        assert_ne!(
            out.loaded_channels().unwrap()[0].data(),
            subject().loaded_channels().unwrap()[0].data()
        );
        assert_eq!(
            out.loaded_label().unwrap().data(),
            subject().loaded_label().unwrap().data()
        );
    }

    #[test]
    fn test_invalid_params() {
        assert!(RandomFlip::boxed(&json!({"axis": [3]})).is_err());
        assert!(RandomNoise::boxed(&json!({"std": -1.0})).is_err());
        assert!(RandomNoise::boxed(&json!({"std": 0.0})).is_ok());
        assert!(RandomGamma::boxed(&json!({"log_gamma": [1.0, -1.0]})).is_err());
        assert!(RandomGamma::boxed(&json!({"probability": -0.1})).is_err());
    }
}
