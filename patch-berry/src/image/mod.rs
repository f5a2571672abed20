//! 单通道 3D 影像, 包括连续强度影像和类别标签影像.
//!
//! 体数据统一按照 (z, H, W) 组织, 与 nifti 原生的 \[W, H, z\] 相反.
//! 二维影像按 `z == 1` 的体数据处理.

use std::path::{Path, PathBuf};

use ndarray::{s, Array3, ArrayView, ArrayViewMut, Ix3};
use nifti::NiftiHeader;

use crate::Idx3d;

mod io;
pub mod pad;
pub mod resample;

pub use io::{get_filename_extension_sanitized, ImageFormat};
pub use pad::{pad_width, PaddingMode};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 影像在物理空间中的几何信息.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// 原始维度 (nifti `dim[0]`), 2 或 3.
    pub ndim: usize,

    /// 体素网格形状, (z, H, W).
    pub shape: Idx3d,

    /// 体素分辨率, 以毫米为单位, 按 \[z, H, W\] 排列.
    pub spacing: [f64; 3],

    /// 第一个体素中心的物理坐标 (x, y, z).
    pub origin: [f64; 3],

    /// 方向余弦矩阵, 行优先. 第 `j` 列是体素索引第 `j` 轴 (W, H, z) 的方向.
    pub direction: [f64; 9],
}

impl Geometry {
    /// 仅从 nifti header 解出几何信息, 不读取体数据.
    pub fn from_header(h: &NiftiHeader) -> Self {
        let d = |i: usize| h.dim[i].max(1) as usize;
        Self::with_shape(h, (d(3), d(2), d(1)))
    }

    fn with_shape(h: &NiftiHeader, shape: Idx3d) -> Self {
        let [_, w, hh, z, ..] = h.pixdim;
        Self {
            ndim: h.dim[0].clamp(2, 3) as usize,
            shape,
            spacing: [positive_or_one(z), positive_or_one(hh), positive_or_one(w)],
            origin: origin_of(h),
            direction: direction_of(h),
        }
    }
}

/// 带 nifti header 的单通道 3D 影像.
///
/// `T = f32` 时为强度影像 ([`ScalarImage`]), `T = u8` 时为类别标签 ([`LabelMap`]).
/// 两者的重采样接口不同, 因此标签影像在类型层面就不可能被线性插值.
#[derive(Debug, Clone)]
pub struct Image<T> {
    header: BoxedHeader,
    data: Array3<T>,
}

/// 连续强度影像, 如 CT HU 值或 MR 信号.
pub type ScalarImage = Image<f32>;

/// 类别标签影像.
pub type LabelMap = Image<u8>;

impl<T> Image<T> {
    /// 由 (z, H, W) 排列的体数据和 \[z, H, W\] 分辨率直接创建影像.
    /// 原点为 0, 方向为单位阵.
    pub fn from_array(data: Array3<T>, spacing: [f64; 3]) -> Self {
        let (z, h, w) = data.dim();
        let mut header = Box::<NiftiHeader>::default();
        header.dim = [3, dim_u16(w), dim_u16(h), dim_u16(z), 1, 1, 1, 1];
        header.pixdim = [
            1.0,
            spacing[2] as f32,
            spacing[1] as f32,
            spacing[0] as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ];
        header.qform_code = 0;
        header.sform_code = 0;
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        Self { header, data }
    }

    /// 使用已有 header 创建影像. header 中的维度信息会与 `data` 同步.
    pub(crate) fn with_header(mut header: BoxedHeader, data: Array3<T>) -> Self {
        sync_dim(&mut header, data.dim());
        Self { header, data }
    }

    /// 获取 header 部分.
    #[inline]
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// 获取数据形状大小, (z, H, W).
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 按 \[z, H, W\] 排列.
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.geometry().spacing
    }

    /// 获取完整几何信息.
    #[inline]
    pub fn geometry(&self) -> Geometry {
        Geometry::with_shape(&self.header, self.shape())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, T, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, T, Ix3> {
        self.data.view_mut()
    }

    /// 取出底层数据.
    #[inline]
    pub fn into_data(self) -> Array3<T> {
        self.data
    }

    /// 以新的体数据替换原数据, 保留原 header 的分辨率、原点和方向.
    pub fn with_data<U>(&self, data: Array3<U>) -> Image<U> {
        Image::with_header(self.header.clone(), data)
    }

    /// 设置体素分辨率, \[z, H, W\].
    pub(crate) fn set_spacing(&mut self, spacing: [f64; 3]) {
        let direction = direction_of(&self.header);
        let [sz, sh, sw] = spacing;
        self.header.pixdim[1] = sw as f32;
        self.header.pixdim[2] = sh as f32;
        self.header.pixdim[3] = sz as f32;
        // sform 中的分辨率与方向是耦合的, 需要一起更新.
        if self.header.sform_code > 0 {
            let scale = [sw, sh, sz];
            let header = &mut *self.header;
            for (row, srow) in [
                &mut header.srow_x,
                &mut header.srow_y,
                &mut header.srow_z,
            ]
            .into_iter()
            .enumerate()
            {
                for (col, s) in scale.iter().enumerate() {
                    srow[col] = (direction[row * 3 + col] * s) as f32;
                }
            }
        }
    }

    /// 设置第一个体素中心的物理坐标.
    pub(crate) fn set_origin(&mut self, origin: [f64; 3]) {
        let [x, y, z] = origin;
        self.header.quatern_x = x as f32;
        self.header.quatern_y = y as f32;
        self.header.quatern_z = z as f32;
        self.header.srow_x[3] = x as f32;
        self.header.srow_y[3] = y as f32;
        self.header.srow_z[3] = z as f32;
    }

    /// 将原点沿体素轴平移 (dz, dH, dW) 个体素, 可以为负.
    pub(crate) fn shift_origin(&mut self, (dz, dh, dw): (f64, f64, f64)) {
        let g = self.geometry();
        let [sz, sh, sw] = g.spacing;
        let offset = [dw * sw, dh * sh, dz * sz];
        let mut origin = g.origin;
        for (row, o) in origin.iter_mut().enumerate() {
            *o += (0..3)
                .map(|col| g.direction[row * 3 + col] * offset[col])
                .sum::<f64>();
        }
        self.set_origin(origin);
    }

    /// 获取数据体素个数.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl<T: Copy> Image<T> {
    /// 体素值迭代器, 按行优先序.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.data.iter().copied()
    }

    /// 截取以 `start` 为起点、大小为 `shape` 的子体积, 原点相应平移.
    ///
    /// # 注意
    ///
    /// 越界时程序 panic.
    pub fn crop(&self, start: Idx3d, shape: Idx3d) -> Self {
        let (z, h, w) = start;
        let (dz, dh, dw) = shape;
        let data = self
            .data
            .slice(s![z..z + dz, h..h + dh, w..w + dw])
            .to_owned();
        let mut ans = self.with_data(data);
        ans.shift_origin((z as f64, h as f64, w as f64));
        ans
    }
}

impl LabelMap {
    /// 获取 3D 标注中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 获取标签中出现的所有不同取值, 升序.
    pub fn distinct(&self) -> Vec<u8> {
        let mut seen = [false; 256];
        self.data.iter().for_each(|p| seen[*p as usize] = true);
        (0..=u8::MAX).filter(|v| seen[*v as usize]).collect()
    }
}

#[inline]
fn positive_or_one(v: f32) -> f64 {
    if v > 0.0 && v.is_finite() {
        v as f64
    } else {
        1.0
    }
}

/// nifti header 的维度字段只有 16 位. 超长的轴在保存时报错, 这里只做饱和.
#[inline]
fn dim_u16(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

/// 将 header 的维度信息与 (z, H, W) 形状同步.
fn sync_dim(header: &mut NiftiHeader, (z, h, w): Idx3d) {
    let ndim = if header.dim[0] == 2 && z == 1 { 2 } else { 3 };
    header.dim[0] = ndim;
    header.dim[1] = dim_u16(w);
    header.dim[2] = dim_u16(h);
    header.dim[3] = dim_u16(z);
    for d in header.dim.iter_mut().skip(4) {
        *d = 1;
    }
}

fn origin_of(h: &NiftiHeader) -> [f64; 3] {
    if h.sform_code > 0 {
        [h.srow_x[3] as f64, h.srow_y[3] as f64, h.srow_z[3] as f64]
    } else {
        [h.quatern_x as f64, h.quatern_y as f64, h.quatern_z as f64]
    }
}

/// 从 header 中解出方向余弦矩阵. sform 优先, 其次 qform, 否则为单位阵.
fn direction_of(h: &NiftiHeader) -> [f64; 9] {
    if h.sform_code > 0 {
        let mut m = [0.0; 9];
        for (row, srow) in [h.srow_x, h.srow_y, h.srow_z].iter().enumerate() {
            for col in 0..3 {
                let s = positive_or_one(h.pixdim[col + 1]);
                m[row * 3 + col] = srow[col] as f64 / s;
            }
        }
        m
    } else if h.qform_code > 0 {
        let (b, c, d) = (h.quatern_b as f64, h.quatern_c as f64, h.quatern_d as f64);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            qfac * 2.0 * (b * d + a * c),
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            qfac * 2.0 * (c * d - a * b),
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            qfac * (a * a + d * d - c * c - b * b),
        ]
    } else {
        [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
    }
}

/// 影像引用. 要么指向磁盘上尚未加载的文件, 要么持有内存中的影像.
#[derive(Debug, Clone)]
pub enum ImageRef<T> {
    /// 磁盘文件, 访问时才读取.
    OnDisk(PathBuf),

    /// 已加载的影像.
    InMemory(Image<T>),
}

impl<T> ImageRef<T> {
    /// 是否已加载到内存.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }

    /// 若已加载, 获取内存中的影像.
    #[inline]
    pub fn as_image(&self) -> Option<&Image<T>> {
        match self {
            Self::InMemory(img) => Some(img),
            Self::OnDisk(_) => None,
        }
    }

    /// 若已加载, 获取内存中影像的可变引用.
    #[inline]
    pub fn as_image_mut(&mut self) -> Option<&mut Image<T>> {
        match self {
            Self::InMemory(img) => Some(img),
            Self::OnDisk(_) => None,
        }
    }

    /// 磁盘路径. 内存影像返回 `None`.
    #[inline]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::OnDisk(p) => Some(p),
            Self::InMemory(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_from_array_geometry() {
        let img = ScalarImage::from_array(Array3::zeros((4, 5, 6)), [2.5, 1.0, 0.5]);
        let g = img.geometry();
        assert_eq!(g.shape, (4, 5, 6));
        assert_eq!(g.spacing, [2.5, 1.0, 0.5]);
        assert_eq!(g.origin, [0.0; 3]);
        assert_eq!(g.direction, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(img.header().dim[1..4], [6, 5, 4]);
    }

    #[test]
    fn test_qform_identity_quaternion() {
        let mut img = LabelMap::from_array(Array3::zeros((2, 2, 2)), [1.0; 3]);
        img.header.qform_code = 1;
        let d = img.geometry().direction;
        for (i, v) in d.iter().enumerate() {
            let expected = if i % 4 == 0 { 1.0 } else { 0.0 };
            assert!((v - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_label_distinct() {
        let mut data = Array3::<u8>::zeros((2, 3, 3));
        data[(0, 1, 1)] = 2;
        data[(1, 2, 0)] = 7;
        let label = LabelMap::from_array(data, [1.0; 3]);
        assert_eq!(label.distinct(), vec![0, 2, 7]);
        assert_eq!(label.count(0), 16);
    }

    #[test]
    fn test_set_spacing_keeps_sform_direction() {
        let mut img = ScalarImage::from_array(Array3::zeros((2, 2, 2)), [1.0; 3]);
        img.header.sform_code = 1;
        img.header.srow_x = [-1.0, 0.0, 0.0, 10.0];
        img.header.srow_y = [0.0, 1.0, 0.0, 0.0];
        img.header.srow_z = [0.0, 0.0, 1.0, 0.0];
        img.set_spacing([3.0, 2.0, 2.0]);
        let g = img.geometry();
        assert_eq!(g.spacing, [3.0, 2.0, 2.0]);
        assert_eq!(g.direction[0], -1.0);
        assert_eq!(img.header().srow_x[0], -2.0);
        assert_eq!(g.origin, [10.0, 0.0, 0.0]);
    }

    #[test]
    fn test_qform_origin_shift() {
        let mut img = ScalarImage::from_array(Array3::zeros((2, 2, 2)), [2.0, 1.0, 0.5]);
        img.header.qform_code = 1;
        img.set_origin([1.0, 2.0, 3.0]);
        assert_eq!(img.header().quatern_x, 1.0);
        assert_eq!(img.geometry().origin, [1.0, 2.0, 3.0]);

        img.shift_origin((1.0, -2.0, 4.0));
        assert_eq!(img.geometry().origin, [3.0, 0.0, 5.0]);
    }

    #[test]
    fn test_long_axis_saturates_header() {
        let img = LabelMap::from_array(Array3::zeros((1, 1, 70_000)), [1.0; 3]);
        assert_eq!(img.header().dim[1], u16::MAX);
        assert_eq!(img.shape(), (1, 1, 70_000));
    }
}
