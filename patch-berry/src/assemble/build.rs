//! 由清单行构建 subject.

use std::path::PathBuf;

use crate::config::Headers;
use crate::consts::LABEL_KEY;
use crate::error::SubjectError;
use crate::image::ImageRef;
use crate::manifest::Row;
use crate::subject::{Channel, ChannelId, Subject};

/// 由一行清单构建 subject. 影像此时只是磁盘引用, 不会被读取.
///
/// 所有通道和标签的存在性都会被检查, 缺失的文件全部收集进
/// [`SubjectError::MissingFiles`], 而不是在第一个缺失处返回.
/// 分辨率取自第一个通道的 header.
pub fn build_subject(row: Row<'_>, headers: &Headers) -> Result<Subject, SubjectError> {
    let mut subject = Subject::new(row.get(headers.subject_id_header));
    let mut missing = Vec::new();

    for &col in headers.channel_headers.iter() {
        let id = ChannelId(col);
        match existing(row.get(col)) {
            Some(path) => subject.channels.push(Channel {
                id,
                image: ImageRef::OnDisk(path),
            }),
            None => missing.push((id.to_string(), PathBuf::from(row.get(col)))),
        }
    }

    let mut label_path = None;
    if let Some(col) = headers.label_header {
        match existing(row.get(col)) {
            Some(path) => label_path = Some(path),
            None => missing.push((LABEL_KEY.to_owned(), PathBuf::from(row.get(col)))),
        }
    }

    if !missing.is_empty() {
        return Err(SubjectError::MissingFiles(missing));
    }

    if let Some(first) = subject.channels.first() {
        subject.spacing = first
            .image
            .geometry()
            .map_err(|e| SubjectError::Load(first.id.to_string(), e))?
            .spacing;
    }

    subject.path_to_metadata = match &label_path {
        Some(p) => p.clone(),
        None => subject
            .channels
            .last()
            .and_then(|c| c.image.path())
            .map(PathBuf::from)
            .unwrap_or_default(),
    };
    subject.label = label_path.map(ImageRef::OnDisk);

    subject.values = headers
        .prediction_headers
        .iter()
        .enumerate()
        .map(|(k, &col)| {
            let cell = row.get(col);
            cell.parse::<f64>()
                .map_err(|_| SubjectError::BadValue(format!("value_{k}"), cell.to_owned()))
        })
        .collect::<Result<_, _>>()?;

    Ok(subject)
}

#[inline]
fn existing(cell: &str) -> Option<PathBuf> {
    let path = PathBuf::from(cell);
    (!cell.is_empty() && path.is_file()).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{LabelMap, ScalarImage};
    use crate::manifest::Manifest;
    use ndarray::Array3;

    fn headers(label: Option<usize>) -> Headers {
        Headers {
            subject_id_header: 0,
            channel_headers: vec![1, 2],
            label_header: label,
            prediction_headers: vec![4],
        }
    }

    #[test]
    fn test_build_subject() {
        let dir = tempfile::tempdir().unwrap();
        let (c1, c2, l) = (
            dir.path().join("t1.nii.gz"),
            dir.path().join("t2.nii.gz"),
            dir.path().join("seg.nii.gz"),
        );
        for p in [&c1, &c2] {
            ScalarImage::from_array(Array3::zeros((2, 3, 4)), [3.0, 1.0, 0.5])
                .save(p)
                .unwrap();
        }
        LabelMap::from_array(Array3::zeros((2, 3, 4)), [3.0, 1.0, 0.5])
            .save(&l)
            .unwrap();
        let (s1, s2, sl) = (
            c1.display().to_string(),
            c2.display().to_string(),
            l.display().to_string(),
        );
        let m = Manifest::new(
            ["id", "t1", "t2", "seg", "v"],
            [["p1", s1.as_str(), s2.as_str(), sl.as_str(), "1.5"]],
        );
        let row = m.rows().next().unwrap();

        let subject = build_subject(row, &headers(Some(3))).unwrap();
        assert_eq!(subject.subject_id, "p1");
        assert_eq!(subject.channels.len(), 2);
        assert_eq!(subject.channels[1].id, ChannelId(2));
        assert_eq!(subject.spacing, [3.0, 1.0, 0.5]);
        assert_eq!(subject.path_to_metadata(), l.as_path());
        assert_eq!(subject.values, vec![1.5]);
        assert!(!subject.is_loaded());

        let subject = build_subject(row, &headers(None)).unwrap();
        assert_eq!(subject.label_display(), "NA");
        assert_eq!(subject.path_to_metadata(), c2.as_path());
    }

    #[test]
    fn test_missing_files_all_reported() {
        let m = Manifest::new(
            ["id", "t1", "t2", "seg", "v"],
            [["p1", "/nope/a.nii", "", "/nope/seg.nii", "0"]],
        );
        let row = m.rows().next().unwrap();
        match build_subject(row, &headers(Some(3))) {
            Err(SubjectError::MissingFiles(v)) => {
                let keys: Vec<_> = v.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, ["1", "2", "label"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_bad_value() {
        let dir = tempfile::tempdir().unwrap();
        let c = dir.path().join("t1.npy");
        ScalarImage::from_array(Array3::zeros((1, 2, 2)), [1.0; 3])
            .save(&c)
            .unwrap();
        let c = c.display().to_string();
        let m = Manifest::new(
            ["id", "t1", "t2", "seg", "v"],
            [["p1", c.as_str(), c.as_str(), "", "abc"]],
        );
        let row = m.rows().next().unwrap();
        assert!(matches!(
            build_subject(row, &headers(None)),
            Err(SubjectError::BadValue(k, v)) if k == "value_0" && v == "abc"
        ));
    }
}
