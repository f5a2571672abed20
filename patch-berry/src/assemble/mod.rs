//! subject 组装流水线.
//!
//! 每一行清单依次经过以下阶段, 每个阶段接受一个 subject 并返回一个新的 subject:
//!
//! 1. [`build_subject`]: 检查文件, 建立磁盘引用, 读取分辨率和预测目标;
//! 2. [`resize_stage`]: 存在 resize 指令时执行;
//! 3. [`validate_stage`]: 一致性检查;
//! 4. [`pad_stage`]: 采样器要求填充时执行;
//! 5. [`load_stage`]: `in_memory` 时把所有影像读入内存.
//!
//! 任何一行的失败都只会记入 [`AssemblyReport::errors`], 不影响其他行.
//! 组装是单线程顺序进行的, 输出保持清单顺序.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::check::{GeometryCheck, SubjectCheck};
use crate::config::Parameters;
use crate::consts::DATA_LOOP_LOG;
use crate::error::{ConfigError, Result, SubjectError};
use crate::image::pad_width;
use crate::manifest::{Manifest, Row};
use crate::subject::Subject;
use crate::Idx3d;

mod build;
mod resize;

pub use build::build_subject;
pub use resize::{
    resize_directive, resize_stage, resized_cache_dir, resized_cache_path, ResizeMode,
};

/// 一致性检查阶段. 检查失败的 subject 不会进入后续阶段.
pub fn validate_stage(
    subject: Subject,
    parameters: &Parameters,
    check: &dyn SubjectCheck,
) -> std::result::Result<Subject, SubjectError> {
    debug!("检查 subject `{}` 的影像一致性", subject.subject_id);
    check.check(&subject, parameters)?;
    Ok(subject)
}

/// 填充阶段. 仅当 `patch_sampler.enable_padding` 为真时生效, 否则原样返回.
///
/// 所有通道和标签在每个轴两侧各填充 [`pad_width`] 个体素, 分辨率不变.
pub fn pad_stage(
    subject: Subject,
    parameters: &Parameters,
) -> std::result::Result<Subject, SubjectError> {
    let sampler = &parameters.patch_sampler;
    if !sampler.enable_padding {
        return Ok(subject);
    }
    let width = pad_width(&parameters.patch_size, parameters.model.dimension);
    let mode = sampler.padding_mode;
    subject.map_images(|_, img| img.pad(width, mode), |label| label.pad(width, mode))
}

/// 加载阶段. 返回所有影像都在内存中的 subject.
#[inline]
pub fn load_stage(subject: Subject) -> std::result::Result<Subject, SubjectError> {
    subject.materialize()
}

/// 组装结果.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    /// 可用的 subject, 保持清单顺序.
    pub subjects: Vec<Subject>,

    /// 出错的行: `(subject id, 原因)`. 这些 id 一定不在 `subjects` 中.
    pub errors: Vec<(String, SubjectError)>,
}

impl AssemblyReport {
    /// 出错的 subject id.
    pub fn error_ids(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|(id, _)| id.as_str())
    }

    /// 是否没有任何错误.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// subject 组装器.
pub struct SubjectAssembler<'a> {
    parameters: &'a Parameters,
    phase: String,
    resize: Option<(Idx3d, ResizeMode)>,
    check: Box<dyn SubjectCheck>,
}

impl<'a> SubjectAssembler<'a> {
    /// 创建组装器. `phase` 为加载器阶段名 (如 `train`, `validation`),
    /// 用于进度日志和 resize 缓存目录.
    ///
    /// resize 指令格式错误时返回 `Err`.
    pub fn new(parameters: &'a Parameters, phase: &str) -> std::result::Result<Self, ConfigError> {
        let resize = resize_directive(parameters.data_preprocessing.as_ref())?.map(|shape| {
            let mode = if parameters.memory_save_mode {
                ResizeMode::SaveTo(resized_cache_dir(&parameters.output_dir, phase))
            } else {
                ResizeMode::Replace
            };
            (shape, mode)
        });
        Ok(Self {
            parameters,
            phase: phase.to_owned(),
            resize,
            check: Box::new(GeometryCheck::default()),
        })
    }

    /// 替换一致性检查器.
    pub fn with_check<C: SubjectCheck + 'static>(mut self, check: C) -> Self {
        self.check = Box::new(check);
        self
    }

    /// 进度日志路径 `{output_dir}/logs/data_loop.log`.
    pub fn log_path(&self) -> PathBuf {
        self.parameters.output_dir.join("logs").join(DATA_LOOP_LOG)
    }

    /// 对一行清单执行完整的组装流水线.
    pub fn assemble_row(&self, row: Row<'_>) -> std::result::Result<Subject, SubjectError> {
        let p = self.parameters;
        let mut subject = build_subject(row, &p.headers)?;
        if let Some((shape, mode)) = &self.resize {
            subject = resize_stage(subject, *shape, mode)?;
        }
        let subject = validate_stage(subject, p, self.check.as_ref())?;
        let subject = pad_stage(subject, p)?;
        if p.in_memory {
            load_stage(subject)
        } else {
            Ok(subject)
        }
    }

    /// 组装整个清单.
    ///
    /// 只有清单列越界和进度日志无法写入会导致 `Err`; 单行的失败都记入报告.
    /// 重复出现的 subject id, 其所有行都视为出错.
    pub fn assemble(&self, manifest: &Manifest) -> Result<AssemblyReport> {
        manifest.check_headers(&self.parameters.headers)?;

        let log_path = self.log_path();
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut log = ProgressLog::open(&log_path, &self.phase, manifest.len())?;

        let mut report = AssemblyReport::default();
        let mut seen = HashSet::new();
        for (i, row) in manifest.rows().enumerate() {
            let id = row.get(self.parameters.headers.subject_id_header).to_owned();
            let result = if seen.insert(id.clone()) {
                self.assemble_row(row)
            } else {
                Err(SubjectError::DuplicateId)
            };
            match result {
                Ok(subject) => {
                    log.row(i, &id, None)?;
                    report.subjects.push(subject);
                }
                Err(e) => {
                    warn!("subject `{id}` 无法加载: {e}");
                    log.row(i, &id, Some(&e))?;
                    report.errors.push((id, e));
                }
            }
        }
        log.finish()?;

        let bad: HashSet<String> = report.error_ids().map(str::to_owned).collect();
        report.subjects.retain(|s| !bad.contains(&s.subject_id));
        info!(
            "{} 数据组装完成: {} 个可用 subject, {} 个出错",
            self.phase,
            report.subjects.len(),
            bad.len()
        );
        Ok(report)
    }
}

/// 追加写入的逐行进度日志.
struct ProgressLog<'p> {
    out: BufWriter<File>,
    phase: &'p str,
    total: usize,
}

impl<'p> ProgressLog<'p> {
    fn open(path: &std::path::Path, phase: &'p str, total: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            phase,
            total,
        })
    }

    fn row(&mut self, i: usize, id: &str, err: Option<&SubjectError>) -> std::io::Result<()> {
        write!(
            self.out,
            "Constructing queue for {} data: {}/{} [{id}]",
            self.phase,
            i + 1,
            self.total
        )?;
        match err {
            None => writeln!(self.out, " ok"),
            Some(e) => writeln!(self.out, " error: {e}"),
        }
    }

    fn finish(mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageRef, LabelMap, ScalarImage};
    use crate::subject::{Channel, ChannelId};
    use ndarray::Array3;
    use serde_json::json;
    use std::path::Path;

    fn params(out: &Path, extra: serde_json::Value) -> Parameters {
        let mut v = json!({
            "patch_size": [4, 4, 2],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1], "labelHeader": 2},
            "output_dir": out,
        });
        if let (Some(v), Some(extra)) = (v.as_object_mut(), extra.as_object()) {
            v.extend(extra.clone());
        }
        Parameters::from_json_value(v).unwrap()
    }

    /// 写入 `n` 个一致的 subject, 返回清单.
    fn fixtures(dir: &Path, n: usize) -> Manifest {
        let rows: Vec<Vec<String>> = (0..n)
            .map(|i| {
                let c = dir.join(format!("img{i}.nii.gz"));
                let l = dir.join(format!("seg{i}.nii.gz"));
                ScalarImage::from_array(Array3::from_elem((4, 6, 6), i as f32), [2.0, 1.0, 1.0])
                    .save(&c)
                    .unwrap();
                LabelMap::from_array(Array3::from_elem((4, 6, 6), 1), [2.0, 1.0, 1.0])
                    .save(&l)
                    .unwrap();
                vec![
                    format!("s{i}"),
                    c.display().to_string(),
                    l.display().to_string(),
                ]
            })
            .collect();
        Manifest::new(
            ["SubjectID".to_owned(), "Channel".to_owned(), "Label".to_owned()],
            rows,
        )
    }

    #[test]
    fn test_all_consistent_rows_assembled() {
        let dir = tempfile::tempdir().unwrap();
        let m = fixtures(dir.path(), 3);
        let p = params(&dir.path().join("out"), json!({}));
        let report = SubjectAssembler::new(&p, "train").unwrap().assemble(&m).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.subjects.len(), m.len());
        let ids: Vec<_> = report.subjects.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(ids, ["s0", "s1", "s2"]);

        let log = std::fs::read_to_string(dir.path().join("out/logs/data_loop.log")).unwrap();
        assert_eq!(log.lines().count(), 3);
        assert!(log.contains("Constructing queue for train data: 3/3"));
    }

    #[test]
    fn test_missing_file_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows: Vec<Vec<String>> = fixtures(dir.path(), 3)
            .rows()
            .map(|r| (0..3).map(|c| r.get(c).to_owned()).collect())
            .collect();
        rows[1][2] = "/not/a/label.nii.gz".to_owned();
        let m = Manifest::new(["id".to_owned(), "c".to_owned(), "l".to_owned()], rows);

        let p = params(&dir.path().join("out"), json!({}));
        let report = SubjectAssembler::new(&p, "").unwrap().assemble(&m).unwrap();
        assert_eq!(report.error_ids().collect::<Vec<_>>(), ["s1"]);
        assert!(matches!(report.errors[0].1, SubjectError::MissingFiles(_)));
        assert_eq!(report.subjects.len(), 2);
        assert!(report.subjects.iter().all(|s| s.subject_id != "s1"));
    }

    #[test]
    fn test_duplicate_ids_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows: Vec<Vec<String>> = fixtures(dir.path(), 3)
            .rows()
            .map(|r| (0..3).map(|c| r.get(c).to_owned()).collect())
            .collect();
        rows[2][0] = "s0".to_owned();
        let m = Manifest::new(["id".to_owned(), "c".to_owned(), "l".to_owned()], rows);

        let p = params(&dir.path().join("out"), json!({}));
        let report = SubjectAssembler::new(&p, "").unwrap().assemble(&m).unwrap();
        assert_eq!(report.error_ids().collect::<Vec<_>>(), ["s0"]);
        let ids: Vec<_> = report.subjects.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(ids, ["s1"]);
    }

    #[test]
    fn test_padding_stage() {
        let dir = tempfile::tempdir().unwrap();
        let m = fixtures(dir.path(), 1);

        let p = params(&dir.path().join("out"), json!({}));
        let report = SubjectAssembler::new(&p, "").unwrap().assemble(&m).unwrap();
        let s = &report.subjects[0];
        assert!(!s.is_loaded());
        assert_eq!(s.channels[0].image.geometry().unwrap().shape, (4, 6, 6));
        assert_eq!(s.label.as_ref().unwrap().geometry().unwrap().shape, (4, 6, 6));
        // 不填充时已加载的影像同样保持原大小.
        let loaded = pad_stage(s.materialize().unwrap(), &p).unwrap();
        assert_eq!(loaded.loaded_channels().unwrap()[0].shape(), (4, 6, 6));
        assert_eq!(loaded.loaded_label().unwrap().shape(), (4, 6, 6));

        let p = params(
            &dir.path().join("out"),
            json!({"patch_sampler": {"type": "label", "enable_padding": true, "padding_mode": "edge"}}),
        );
        let report = SubjectAssembler::new(&p, "").unwrap().assemble(&m).unwrap();
        let s = &report.subjects[0];
        // patch [4, 4, 2] -> (z, H, W) 两侧各 (1, 2, 2)
        assert_eq!(s.loaded_channels().unwrap()[0].shape(), (4 + 2, 6 + 4, 6 + 4));
        assert_eq!(s.loaded_label().unwrap().shape(), (6, 10, 10));
        assert_eq!(s.spacing, [2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_in_memory_and_resize() {
        let dir = tempfile::tempdir().unwrap();
        let m = fixtures(dir.path(), 2);
        let p = params(
            &dir.path().join("out"),
            json!({"in_memory": true, "data_preprocessing": {"resize": [3, 3, 2]}}),
        );
        let report = SubjectAssembler::new(&p, "").unwrap().assemble(&m).unwrap();
        for s in report.subjects.iter() {
            assert!(s.is_loaded());
            assert_eq!(s.loaded_channels().unwrap()[0].shape(), (2, 3, 3));
            assert_eq!(s.spacing, [4.0, 2.0, 2.0]);
        }
    }

    struct RejectAll;

    impl SubjectCheck for RejectAll {
        fn check(
            &self,
            _: &Subject,
            _: &Parameters,
        ) -> std::result::Result<(), SubjectError> {
            Err(crate::error::InconsistencyError::Dimension("1".to_owned()).into())
        }
    }

    #[test]
    fn test_custom_check() {
        let dir = tempfile::tempdir().unwrap();
        let m = fixtures(dir.path(), 2);
        let p = params(&dir.path().join("out"), json!({}));
        let report = SubjectAssembler::new(&p, "")
            .unwrap()
            .with_check(RejectAll)
            .assemble(&m)
            .unwrap();
        assert!(report.subjects.is_empty());
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_validate_stage_direct() {
        let mut s = Subject::new("x");
        s.channels.push(Channel {
            id: ChannelId(1),
            image: ImageRef::InMemory(ScalarImage::from_array(Array3::zeros((2, 2, 2)), [1.0; 3])),
        });
        s.label = Some(ImageRef::InMemory(LabelMap::from_array(
            Array3::zeros((2, 2, 3)),
            [1.0; 3],
        )));
        let p = params(Path::new("."), json!({}));
        assert!(validate_stage(s, &p, &GeometryCheck::default()).is_err());
    }
}
