//! 随机访问数据集. 用于评估和测试, 也是 patch 队列的数据来源.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::subject::Subject;
use crate::transform::Compose;

/// subject 数据集. 每次访问都在 subject 的副本上施加变换链,
/// 组装好的 subject 本身保持不变. 数据集内部不做 patch 采样和打乱.
#[derive(Debug)]
pub struct SubjectsDataset {
    subjects: Vec<Subject>,
    transform: Compose,
    seed: u64,
    accesses: AtomicU64,
}

impl SubjectsDataset {
    /// 创建数据集. 随机变换使用的随机数由 `seed` 和访问次数决定.
    pub fn new(subjects: Vec<Subject>, transform: Compose, seed: u64) -> Self {
        Self {
            subjects,
            transform,
            seed,
            accesses: AtomicU64::new(0),
        }
    }

    /// subject 个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// 数据集是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// 未经变换的 subject 列表.
    #[inline]
    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    /// 变换链.
    #[inline]
    pub fn transform(&self) -> &Compose {
        &self.transform
    }

    /// 获取第 `index` 个 subject 经变换后的副本. 所有影像都已加载.
    pub fn get(&self, index: usize) -> Result<Subject> {
        let n = self.accesses.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(n));
        self.get_with(index, &mut rng)
    }

    /// 同 [`Self::get`], 但使用调用者提供的随机数发生器.
    pub fn get_with(&self, index: usize, rng: &mut StdRng) -> Result<Subject> {
        let subject = self.subjects.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.len(),
        })?;
        self.transform
            .apply(subject, rng)
            .map_err(|e| Error::Subject(subject.subject_id.clone(), e))
    }

    /// 按顺序迭代所有经变换的 subject.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Result<Subject>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageRef, ScalarImage};
    use crate::subject::{Channel, ChannelId};
    use crate::transform::{Transform, ZNormalize};
    use ndarray::Array3;

    fn dataset() -> (tempfile::TempDir, SubjectsDataset) {
        let dir = tempfile::tempdir().unwrap();
        let subjects = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("{i}.nii"));
                ScalarImage::from_array(
                    Array3::from_shape_fn((2, 2, 2), |(z, _, _)| (i + z) as f32),
                    [1.0; 3],
                )
                .save(&path)
                .unwrap();
                let mut s = Subject::new(format!("s{i}"));
                s.channels.push(Channel {
                    id: ChannelId(1),
                    image: ImageRef::OnDisk(path),
                });
                s
            })
            .collect();
        let chain = Compose::new(vec![Box::new(ZNormalize::new()) as Box<dyn Transform>]);
        (dir, SubjectsDataset::new(subjects, chain, 42))
    }

    #[test]
    fn test_random_access() {
        let (_dir, ds) = dataset();
        assert_eq!(ds.len(), 3);

        let s = ds.get(2).unwrap();
        assert_eq!(s.subject_id, "s2");
        assert!(s.is_loaded());
        let v: Vec<f32> = s.loaded_channels().unwrap()[0].iter().collect();
        assert_eq!(v, [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0]);

        // 存储的 subject 不受影响.
        assert!(!ds.subjects()[2].is_loaded());
        assert!(matches!(
            ds.get(3),
            Err(Error::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_iter_in_order() {
        let (_dir, ds) = dataset();
        let ids: Vec<_> = ds.iter().map(|s| s.unwrap().subject_id).collect();
        assert_eq!(ids, ["s0", "s1", "s2"]);
    }
}
