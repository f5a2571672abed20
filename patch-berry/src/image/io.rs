//! 影像的读取与持久化存储.
//!
//! 支持 `.nii`, `.nii.gz` (经由 `nifti`) 和 `.npy` (经由 `ndarray-npy`).
//! npy 文件不携带几何信息, 读取时分辨率视为 1 毫米各向同性.

use std::path::Path;

use ndarray::{Array3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use super::{Geometry, Image, ImageRef};
use crate::error::LoadError;

/// 影像文件格式.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageFormat {
    /// `.nii` 或 `.nii.gz`.
    Nifti,

    /// `.npy`.
    Npy,
}

impl ImageFormat {
    /// 根据文件扩展名判断格式.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        match get_filename_extension_sanitized(path).as_str() {
            ".nii" | ".nii.gz" => Ok(Self::Nifti),
            ".npy" => Ok(Self::Npy),
            other => Err(LoadError::UnsupportedExtension(other.to_owned())),
        }
    }
}

/// 获取文件扩展名 (包括前导 `.`). `.nii.gz` 这类压缩双扩展名会被完整保留.
///
/// 没有扩展名时返回空字符串.
pub fn get_filename_extension_sanitized<P: AsRef<Path>>(path: P) -> String {
    let Some(name) = path.as_ref().file_name().and_then(|n| n.to_str()) else {
        return String::new();
    };
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".gz") {
        let stem = &lower[..lower.len() - 3];
        return match stem.rfind('.') {
            Some(i) => lower[i..].to_owned(),
            None => ".gz".to_owned(),
        };
    }
    match lower.rfind('.') {
        Some(i) if i > 0 => lower[i..].to_owned(),
        _ => String::new(),
    }
}

macro_rules! impl_image_io {
    ($($elem: ty),+) => {
        $(
            impl Image<$elem> {
                /// 打开影像文件. `path` 为本地路径.
                /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
                pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
                    let path = path.as_ref();
                    match ImageFormat::from_path(path)? {
                        ImageFormat::Nifti => {
                            let obj = ReaderOptions::new().read_file(path)?;
                            let header = Box::new(obj.header().clone());

                            // [W, H, z] -> [z, H, W].
                            // hint: 原第一维向下增长, 原第二维向右增长.
                            let data = obj.into_volume().into_ndarray::<$elem>()?;
                            let data = match data.ndim() {
                                2 => data.permuted_axes([1, 0].as_slice()).insert_axis(Axis(0)),
                                3 => data.permuted_axes([2, 1, 0].as_slice()),
                                _ => return Err(LoadError::BadShape(data.shape().to_vec())),
                            };
                            let data = data
                                .as_standard_layout()
                                .into_owned()
                                .into_dimensionality::<Ix3>()
                                .map_err(|_| LoadError::BadShape(header.dim[1..4].iter().map(|d| *d as usize).collect()))?;
                            debug_assert!(data.is_standard_layout());

                            let mut header = header;
                            // 读取时已经应用了线性缩放.
                            header.scl_slope = 1.0;
                            header.scl_inter = 0.0;
                            Ok(Self::with_header(header, data))
                        }
                        ImageFormat::Npy => {
                            let data: Array3<$elem> = ndarray_npy::read_npy(path)?;
                            Ok(Self::from_array(data, [1.0; 3]))
                        }
                    }
                }

                /// 按原样将影像保存到 `path` 路径. 格式由扩展名决定.
                pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LoadError> {
                    let path = path.as_ref();
                    match ImageFormat::from_path(path)? {
                        ImageFormat::Nifti => {
                            let (z, h, w) = self.data.dim();
                            if [z, h, w].iter().any(|n| *n > u16::MAX as usize) {
                                return Err(LoadError::BadShape(vec![z, h, w]));
                            }
                            // [z, H, W] -> [W, H, z]
                            let data = self.data.view().permuted_axes([2, 1, 0]);
                            WriterOptions::new(path)
                                .reference_header(&self.header)
                                .write_nifti(&data)?;
                        }
                        ImageFormat::Npy => ndarray_npy::write_npy(path, &self.data)?,
                    }
                    Ok(())
                }
            }

            impl ImageRef<$elem> {
                /// 获取一份自有的影像. 磁盘文件会被读取, 内存影像会被复制.
                /// 该操作不会修改引用本身.
                pub fn load(&self) -> Result<Image<$elem>, LoadError> {
                    match self {
                        Self::OnDisk(p) => Image::<$elem>::open(p),
                        Self::InMemory(img) => Ok(img.clone()),
                    }
                }

                /// 获取几何信息. 磁盘上的 nifti 文件只读取 header.
                pub fn geometry(&self) -> Result<Geometry, LoadError> {
                    match self {
                        Self::InMemory(img) => Ok(img.geometry()),
                        Self::OnDisk(p) => match ImageFormat::from_path(p)? {
                            ImageFormat::Nifti => Ok(Geometry::from_header(&NiftiHeader::from_file(p)?)),
                            ImageFormat::Npy => Ok(self.load()?.geometry()),
                        },
                    }
                }
            }
        )+
    };
}

impl_image_io!(f32, u8);
