//! subject 内各影像的一致性检查.

use crate::config::Parameters;
use crate::consts::{GEOMETRY_TOLERANCE, LABEL_KEY};
use crate::error::{InconsistencyError, SubjectError};
use crate::image::Geometry;
use crate::subject::Subject;

/// 一致性检查器. 检查失败时返回 `Err`, 由组装流程记录并剔除该 subject.
pub trait SubjectCheck: Send + Sync {
    /// 检查 `subject`.
    fn check(&self, subject: &Subject, parameters: &Parameters) -> Result<(), SubjectError>;
}

/// 默认检查器: 所有通道及标签与第一个通道的几何信息一致.
///
/// 维度必须严格相同; 大小、分辨率、原点和方向在容差内近似相同即可.
/// 磁盘上的 nifti 影像只读取 header.
#[derive(Copy, Clone, Debug)]
pub struct GeometryCheck {
    tolerance: f64,
}

impl Default for GeometryCheck {
    fn default() -> Self {
        Self {
            tolerance: GEOMETRY_TOLERANCE,
        }
    }
}

impl GeometryCheck {
    /// 使用自定义容差创建.
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self { tolerance }
    }

    #[inline]
    fn close(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.tolerance * a.abs().max(b.abs()).max(1.0)
    }

    fn all_close(&self, a: &[f64], b: &[f64]) -> bool {
        a.iter().zip(b).all(|(x, y)| self.close(*x, *y))
    }

    /// 比较 `key` 对应的几何信息 `cur` 与基准 `base`.
    pub fn compare(
        &self,
        key: &str,
        base: &Geometry,
        cur: &Geometry,
    ) -> Result<(), InconsistencyError> {
        if base.ndim != cur.ndim {
            return Err(InconsistencyError::Dimension(key.to_owned()));
        }
        let sz = |g: &Geometry| [g.shape.0, g.shape.1, g.shape.2];
        if base.shape != cur.shape {
            return Err(InconsistencyError::Size(key.to_owned(), sz(base), sz(cur)));
        }
        if !self.all_close(&base.spacing, &cur.spacing) {
            return Err(InconsistencyError::Spacing(
                key.to_owned(),
                base.spacing,
                cur.spacing,
            ));
        }
        if !self.all_close(&base.origin, &cur.origin) {
            return Err(InconsistencyError::Origin(
                key.to_owned(),
                base.origin,
                cur.origin,
            ));
        }
        if !self.all_close(&base.direction, &cur.direction) {
            return Err(InconsistencyError::Direction(key.to_owned()));
        }
        Ok(())
    }
}

impl SubjectCheck for GeometryCheck {
    fn check(&self, subject: &Subject, _parameters: &Parameters) -> Result<(), SubjectError> {
        let mut geometries = Vec::with_capacity(subject.channels.len() + 1);
        for c in subject.channels.iter() {
            let g = c
                .image
                .geometry()
                .map_err(|e| SubjectError::Load(c.id.to_string(), e))?;
            geometries.push((c.id.to_string(), g));
        }
        if let Some(label) = &subject.label {
            let g = label
                .geometry()
                .map_err(|e| SubjectError::Load(LABEL_KEY.to_owned(), e))?;
            geometries.push((LABEL_KEY.to_owned(), g));
        }

        let Some(((_, base), rest)) = geometries.split_first() else {
            return Ok(());
        };
        for (key, g) in rest {
            self.compare(key, base, g)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageRef, LabelMap, ScalarImage};
    use crate::subject::{Channel, ChannelId};
    use ndarray::Array3;
    use serde_json::json;

    fn params() -> Parameters {
        Parameters::from_json_value(json!({
            "patch_size": [2, 2, 2],
            "headers": {"subjectIDHeader": 0, "channelHeaders": [1, 2], "labelHeader": 3},
        }))
        .unwrap()
    }

    fn subject(second: ScalarImage, label: LabelMap) -> Subject {
        let first = ScalarImage::from_array(Array3::zeros((4, 4, 4)), [1.0; 3]);
        let mut s = Subject::new("s");
        s.channels = vec![
            Channel {
                id: ChannelId(1),
                image: ImageRef::InMemory(first),
            },
            Channel {
                id: ChannelId(2),
                image: ImageRef::InMemory(second),
            },
        ];
        s.label = Some(ImageRef::InMemory(label));
        s
    }

    #[test]
    fn test_consistent_subject_passes() {
        let s = subject(
            ScalarImage::from_array(Array3::ones((4, 4, 4)), [1.0; 3]),
            LabelMap::from_array(Array3::zeros((4, 4, 4)), [1.0 + 1e-9, 1.0, 1.0]),
        );
        assert!(GeometryCheck::default().check(&s, &params()).is_ok());
    }

    #[test]
    fn test_size_mismatch() {
        let s = subject(
            ScalarImage::from_array(Array3::ones((4, 4, 4)), [1.0; 3]),
            LabelMap::from_array(Array3::zeros((4, 4, 5)), [1.0; 3]),
        );
        match GeometryCheck::default().check(&s, &params()) {
            Err(SubjectError::Inconsistent(InconsistencyError::Size(key, _, _))) => {
                assert_eq!(key, "label")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_spacing_mismatch() {
        let s = subject(
            ScalarImage::from_array(Array3::ones((4, 4, 4)), [2.0, 1.0, 1.0]),
            LabelMap::from_array(Array3::zeros((4, 4, 4)), [1.0; 3]),
        );
        match GeometryCheck::default().check(&s, &params()) {
            Err(SubjectError::Inconsistent(InconsistencyError::Spacing(key, _, _))) => {
                assert_eq!(key, "2")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_on_disk_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.nii.gz");
        let b = dir.path().join("b.nii.gz");
        ScalarImage::from_array(Array3::zeros((3, 4, 5)), [1.0; 3])
            .save(&a)
            .unwrap();
        ScalarImage::from_array(Array3::zeros((3, 4, 5)), [1.0; 3])
            .pad((0, 0, 1), crate::image::PaddingMode::Constant)
            .save(&b)
            .unwrap();

        let mut s = Subject::new("s");
        s.channels = vec![
            Channel {
                id: ChannelId(1),
                image: ImageRef::OnDisk(a),
            },
            Channel {
                id: ChannelId(2),
                image: ImageRef::OnDisk(b),
            },
        ];
        assert!(matches!(
            GeometryCheck::default().check(&s, &params()),
            Err(SubjectError::Inconsistent(InconsistencyError::Size(..)))
        ));
    }
}
