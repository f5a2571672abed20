//! 对称填充.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use ndarray::Array3;
use serde::Deserialize;

use super::Image;
use crate::config::PatchSize;
use crate::error::ConfigError;
use crate::Idx3d;

/// 填充模式. 语义与 numpy 的 `pad` 一致.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub enum PaddingMode {
    /// 以 0 填充. 别名 `zero`.
    Constant,

    /// 复制边缘体素. 别名 `replicate`.
    Edge,

    /// 以边缘为轴镜像, 不重复边缘体素.
    Reflect,

    /// 以边缘外侧为轴镜像, 重复边缘体素.
    #[default]
    Symmetric,

    /// 周期延拓.
    Wrap,
}

impl FromStr for PaddingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" | "zero" | "zeros" => Ok(Self::Constant),
            "edge" | "replicate" => Ok(Self::Edge),
            "reflect" => Ok(Self::Reflect),
            "symmetric" => Ok(Self::Symmetric),
            "wrap" | "circular" => Ok(Self::Wrap),
            _ => Err(ConfigError::UnknownPaddingMode(s.to_owned())),
        }
    }
}

impl TryFrom<String> for PaddingMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for PaddingMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Constant => "constant",
            Self::Edge => "edge",
            Self::Reflect => "reflect",
            Self::Symmetric => "symmetric",
            Self::Wrap => "wrap",
        };
        f.write_str(s)
    }
}

impl PaddingMode {
    /// 将填充后坐标 `j` (其中前 `pad` 个为填充区) 映射回长度为 `n` 的源轴索引.
    /// `Constant` 模式下填充区返回 `None`.
    fn source_index(self, j: usize, pad: usize, n: usize) -> Option<usize> {
        let i = j as isize - pad as isize;
        let n_i = n as isize;
        if (0..n_i).contains(&i) {
            return Some(i as usize);
        }
        let idx = match self {
            Self::Constant => return None,
            Self::Edge => i.clamp(0, n_i - 1),
            Self::Reflect => {
                if n == 1 {
                    0
                } else {
                    let period = 2 * (n_i - 1);
                    let m = i.rem_euclid(period);
                    if m >= n_i {
                        period - m
                    } else {
                        m
                    }
                }
            }
            Self::Symmetric => {
                let period = 2 * n_i;
                let m = i.rem_euclid(period);
                if m >= n_i {
                    period - 1 - m
                } else {
                    m
                }
            }
            Self::Wrap => i.rem_euclid(n_i),
        };
        Some(idx as usize)
    }
}

/// 根据 patch 大小和模型维度计算每个轴两侧的填充宽度, (z, H, W).
///
/// 每个轴为 `ceil(patch / 2)`. 二维模型下, 若 z 方向的宽度为 1 则置为 0,
/// 以免把单层切片填充成三层.
pub fn pad_width(patch: &PatchSize, dimension: u8) -> Idx3d {
    let (z, h, w) = patch.zhw();
    let half = |v: usize| (v + 1) / 2;
    let mut pz = half(z);
    if dimension == 2 && pz == 1 {
        pz = 0;
    }
    (pz, half(h), half(w))
}

impl<T: Copy + Default> Image<T> {
    /// 在每个轴的两侧各填充 `width` 个体素, 返回新影像. 原点会相应平移,
    /// 分辨率和方向不变.
    pub fn pad(&self, width: Idx3d, mode: PaddingMode) -> Self {
        let (pz, ph, pw) = width;
        let (z, h, w) = self.shape();
        let shape = (z + 2 * pz, h + 2 * ph, w + 2 * pw);

        let (mz, mh, mw): (Vec<_>, Vec<_>, Vec<_>) = (
            (0..shape.0).map(|j| mode.source_index(j, pz, z)).collect(),
            (0..shape.1).map(|j| mode.source_index(j, ph, h)).collect(),
            (0..shape.2).map(|j| mode.source_index(j, pw, w)).collect(),
        );
        let src = self.data();
        let data = Array3::from_shape_fn(shape, |(a, b, c)| match (mz[a], mh[b], mw[c]) {
            (Some(a), Some(b), Some(c)) => src[(a, b, c)],
            _ => T::default(),
        });

        let mut ans = self.with_data(data);
        ans.shift_origin((-(pz as f64), -(ph as f64), -(pw as f64)));
        ans
    }
}
