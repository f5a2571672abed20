//! 体数据重采样.
//!
//! 输出网格与输入网格共用原点和方向, 仅改变体素个数; 新分辨率满足
//! `new_spacing * new_size == old_spacing * old_size`. 输出体素 `i`
//! 对应输入连续索引 `i * old_size / new_size`.
//!
//! 强度影像只能使用三线性插值 ([`resize_scalar`]), 标签影像只能使用最近邻插值
//! ([`resize_label`]), 从而保证标签重采样后不会出现新的类别.

use ndarray::{Array3, ArrayViewMut2, Axis};

use super::{LabelMap, ScalarImage};
use crate::Idx3d;

/// 线性插值时单个输出索引在输入轴上的两个邻居及权重.
#[derive(Copy, Clone, Debug)]
struct Lerp {
    lo: usize,
    hi: usize,
    t: f32,
}

#[inline]
fn source_coord(i: usize, n_in: usize, n_out: usize) -> f64 {
    i as f64 * n_in as f64 / n_out as f64
}

fn linear_axis(n_in: usize, n_out: usize) -> Vec<Lerp> {
    (0..n_out)
        .map(|i| {
            let c = num::clamp(source_coord(i, n_in, n_out), 0.0, (n_in - 1) as f64);
            let lo = c.floor() as usize;
            let hi = (lo + 1).min(n_in - 1);
            Lerp {
                lo,
                hi,
                t: (c - lo as f64) as f32,
            }
        })
        .collect()
}

fn nearest_axis(n_in: usize, n_out: usize) -> Vec<usize> {
    (0..n_out)
        .map(|i| (source_coord(i, n_in, n_out).round() as usize).min(n_in - 1))
        .collect()
}

/// 计算重采样后的分辨率, \[z, H, W\].
pub fn resized_spacing(spacing: [f64; 3], from: Idx3d, to: Idx3d) -> [f64; 3] {
    let from = [from.0, from.1, from.2];
    let to = [to.0, to.1, to.2];
    [0, 1, 2].map(|a| spacing[a] * from[a] as f64 / to[a] as f64)
}

/// 对每个输出水平切片调用 `op`. 启用 `rayon` 时并行执行.
fn for_each_out_slice<T, F>(out: &mut Array3<T>, op: F)
where
    T: Send + Sync,
    F: Fn(usize, ArrayViewMut2<T>) + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
            out.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(z, s)| op(z, s));
        } else {
            out.axis_iter_mut(Axis(0))
                .enumerate()
                .for_each(|(z, s)| op(z, s));
        }
    }
}

/// 使用三线性插值将强度影像重采样到 `shape` (z, H, W).
///
/// # 注意
///
/// `shape` 各分量必须为正, 否则程序 panic.
pub fn resize_scalar(img: &ScalarImage, shape: Idx3d) -> ScalarImage {
    let (oz, oh, ow) = shape;
    assert!(oz > 0 && oh > 0 && ow > 0, "重采样目标大小必须为正");
    let (iz, ih, iw) = img.shape();
    let (mz, mh, mw) = (
        linear_axis(iz, oz),
        linear_axis(ih, oh),
        linear_axis(iw, ow),
    );
    let src = img.data();

    let mut out = Array3::<f32>::zeros(shape);
    for_each_out_slice(&mut out, |z, mut sli| {
        let lz = mz[z];
        for ((h, w), v) in sli.indexed_iter_mut() {
            let (lh, lw) = (mh[h], mw[w]);
            let at = |z: usize, h: usize| {
                let a = src[(z, h, lw.lo)];
                let b = src[(z, h, lw.hi)];
                a + (b - a) * lw.t
            };
            let plane = |z: usize| {
                let a = at(z, lh.lo);
                let b = at(z, lh.hi);
                a + (b - a) * lh.t
            };
            let a = plane(lz.lo);
            let b = plane(lz.hi);
            *v = a + (b - a) * lz.t;
        }
    });

    let mut ans = img.with_data(out);
    ans.set_spacing(resized_spacing(img.spacing(), img.shape(), shape));
    ans
}

/// 使用最近邻插值将标签影像重采样到 `shape` (z, H, W).
/// 输出的取值集合一定是输入取值集合的子集.
///
/// # 注意
///
/// `shape` 各分量必须为正, 否则程序 panic.
pub fn resize_label(img: &LabelMap, shape: Idx3d) -> LabelMap {
    let (oz, oh, ow) = shape;
    assert!(oz > 0 && oh > 0 && ow > 0, "重采样目标大小必须为正");
    let (iz, ih, iw) = img.shape();
    let (mz, mh, mw) = (
        nearest_axis(iz, oz),
        nearest_axis(ih, oh),
        nearest_axis(iw, ow),
    );
    let src = img.data();

    let mut out = Array3::<u8>::zeros(shape);
    for_each_out_slice(&mut out, |z, mut sli| {
        for ((h, w), v) in sli.indexed_iter_mut() {
            *v = src[(mz[z], mh[h], mw[w])];
        }
    });

    let mut ans = img.with_data(out);
    ans.set_spacing(resized_spacing(img.spacing(), img.shape(), shape));
    ans
}
