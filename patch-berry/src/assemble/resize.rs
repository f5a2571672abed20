//! resize 阶段.
//!
//! 强度通道使用三线性插值, 标签只能使用最近邻插值 (见 [`crate::image::resample`]).

use std::path::{Path, PathBuf};

use log::debug;
use serde_json::{Map, Value};

use crate::config::PatchSize;
use crate::consts::{LABEL_KEY, RESIZED_DIR_SUFFIX, RESIZE_KEYS};
use crate::error::{ConfigError, LoadError, SubjectError};
use crate::image::resample::{resize_label, resize_scalar};
use crate::image::{get_filename_extension_sanitized, ImageRef};
use crate::subject::{load_label, Subject};
use crate::Idx3d;

/// resize 结果的去向.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResizeMode {
    /// 用 resize 结果替换内存中的影像, 并刷新 subject 的分辨率.
    Replace,

    /// 节省内存模式: 把结果写入给定的缓存目录, subject 仍指向原始影像.
    /// 目标文件已存在时不会重写.
    SaveTo(PathBuf),
}

/// 在预处理配置中查找 resize 指令, 按 `resize`, `resize_image`, `resize_images`
/// 的顺序取第一个非 null 的值. 值为 \[x, y\] 或 \[x, y, z\] 形式的目标大小.
///
/// 返回 (z, H, W) 形式的目标形状; 没有指令时返回 `Ok(None)`.
pub fn resize_directive(
    preprocessing: Option<&Map<String, Value>>,
) -> Result<Option<Idx3d>, ConfigError> {
    let Some(v) = preprocessing.and_then(|p| {
        RESIZE_KEYS
            .iter()
            .filter_map(|k| p.get(*k))
            .find(|v| !v.is_null())
    }) else {
        return Ok(None);
    };
    let bad = || ConfigError::MalformedResize(v.to_string());
    let size: Vec<usize> = serde_json::from_value(v.clone()).map_err(|_| bad())?;
    let size = PatchSize::new(&size).map_err(|_| bad())?;
    Ok(Some(size.zhw()))
}

/// 缓存目录 `{output_dir}/{phase}_resized_images`.
pub fn resized_cache_dir<P: AsRef<Path>>(output_dir: P, phase: &str) -> PathBuf {
    output_dir
        .as_ref()
        .join(format!("{phase}{RESIZED_DIR_SUFFIX}"))
}

/// 缓存文件路径 `{dir}/{subject_id}_{key}_resized{ext}`.
/// `ext` 取自原始文件, 原始影像不在磁盘上时使用 `.nii.gz`.
pub fn resized_cache_path<T>(dir: &Path, subject_id: &str, key: &str, src: &ImageRef<T>) -> PathBuf {
    let ext = match src.path().map(get_filename_extension_sanitized) {
        Some(ext) if !ext.is_empty() => ext,
        _ => ".nii.gz".to_owned(),
    };
    dir.join(format!("{subject_id}_{key}_resized{ext}"))
}

/// 将 subject 的每幅影像 resize 到 `shape` (z, H, W).
pub fn resize_stage(subject: Subject, shape: Idx3d, mode: &ResizeMode) -> Result<Subject, SubjectError> {
    match mode {
        ResizeMode::Replace => {
            let mut ans = subject.map_images(
                |_, img| resize_scalar(&img, shape),
                |label| resize_label(&label, shape),
            )?;
            if let Some(first) = ans.loaded_channels().and_then(|v| v.first().map(|c| c.spacing())) {
                ans.spacing = first;
            }
            Ok(ans)
        }
        ResizeMode::SaveTo(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| SubjectError::Load(dir.display().to_string(), LoadError::Io(e)))?;
            for c in subject.channels.iter() {
                let key = c.id.to_string();
                let dst = resized_cache_path(dir, &subject.subject_id, &key, &c.image);
                if dst.exists() {
                    debug!("resize 缓存已存在, 跳过: {}", dst.display());
                    continue;
                }
                resize_scalar(&c.load()?, shape)
                    .save(&dst)
                    .map_err(|e| SubjectError::Load(key, e))?;
            }
            if let Some(label) = &subject.label {
                let dst = resized_cache_path(dir, &subject.subject_id, LABEL_KEY, label);
                if dst.exists() {
                    debug!("resize 缓存已存在, 跳过: {}", dst.display());
                } else {
                    resize_label(&load_label(label)?, shape)
                        .save(&dst)
                        .map_err(|e| SubjectError::Load(LABEL_KEY.to_owned(), e))?;
                }
            }
            Ok(subject)
        }
    }
}
