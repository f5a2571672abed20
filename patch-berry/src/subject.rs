//! Subject: 流水线产出的数据单元.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use crate::consts::{LABEL_KEY, NOT_APPLICABLE};
use crate::error::{LoadError, SubjectError};
use crate::image::{ImageRef, LabelMap, ScalarImage};

/// 通道标识. 即该通道在清单中的列索引, 在整个会话中保持稳定.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub usize);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一个影像通道.
#[derive(Clone, Debug)]
pub struct Channel {
    /// 通道标识.
    pub id: ChannelId,

    /// 影像引用.
    pub image: ImageRef<f32>,
}

/// 一个 subject (通常即一位患者) 的全部数据.
///
/// 组装阶段的每一步都接受一个 subject 并返回一个新的 subject;
/// 组装完成后 subject 列表只读, 数据集和队列的每次访问都在副本上进行变换.
#[derive(Clone, Debug)]
pub struct Subject {
    /// subject id.
    pub subject_id: String,

    /// 影像通道, 按 `channel_headers` 顺序排列.
    pub channels: Vec<Channel>,

    /// 类别标签. `None` 表示没有配置标签列 ("NA").
    pub label: Option<ImageRef<u8>>,

    /// 体素分辨率, \[z, H, W\]. 来自第一个通道, 或 resize 之后的结果.
    pub spacing: [f64; 3],

    /// 标量预测目标, 第 `k` 个即 `value_k`.
    pub values: Vec<f64>,

    /// 元信息来源路径: 标签路径, 没有标签时为最后一个通道的路径.
    pub path_to_metadata: PathBuf,
}

impl Subject {
    /// 创建只有 id 的空 subject.
    pub fn new<S: Into<String>>(subject_id: S) -> Self {
        Self {
            subject_id: subject_id.into(),
            channels: Vec::new(),
            label: None,
            spacing: [1.0; 3],
            values: Vec::new(),
            path_to_metadata: PathBuf::new(),
        }
    }

    /// 按通道标识查找通道.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// 获取 `value_k`.
    #[inline]
    pub fn value(&self, k: usize) -> Option<f64> {
        self.values.get(k).copied()
    }

    /// 预测目标的键, `value_0`, `value_1`, ...
    pub fn value_keys(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.values.len()).map(|k| format!("value_{k}"))
    }

    /// 标签字段的显示值. 没有标签时为 `"NA"`.
    pub fn label_display(&self) -> String {
        match &self.label {
            None => NOT_APPLICABLE.to_owned(),
            Some(ImageRef::OnDisk(p)) => p.display().to_string(),
            Some(ImageRef::InMemory(_)) => LABEL_KEY.to_owned(),
        }
    }

    /// 元信息来源路径.
    #[inline]
    pub fn path_to_metadata(&self) -> &Path {
        &self.path_to_metadata
    }

    /// 所有影像是否都已在内存中.
    pub fn is_loaded(&self) -> bool {
        self.channels.iter().all(|c| c.image.is_loaded())
            && self.label.as_ref().map_or(true, ImageRef::is_loaded)
    }

    /// 返回一个所有影像都已读入内存的新 subject. 原 subject 不变.
    pub fn materialize(&self) -> Result<Self, SubjectError> {
        self.map_images(|_, img| img, |label| label)
    }

    /// 读取每一幅影像, 通道经 `f`、标签经 `g` 变换后, 组成新的内存 subject.
    /// 原 subject 不变.
    pub fn map_images<F, G>(&self, mut f: F, mut g: G) -> Result<Self, SubjectError>
    where
        F: FnMut(ChannelId, ScalarImage) -> ScalarImage,
        G: FnMut(LabelMap) -> LabelMap,
    {
        let channels = self
            .channels
            .iter()
            .map(|c| {
                Ok(Channel {
                    id: c.id,
                    image: ImageRef::InMemory(f(c.id, c.load()?)),
                })
            })
            .collect::<Result<Vec<_>, SubjectError>>()?;
        let label = match &self.label {
            Some(l) => Some(ImageRef::InMemory(g(load_label(l)?))),
            None => None,
        };
        Ok(Self {
            channels,
            label,
            ..self.clone_meta()
        })
    }

    /// 已加载的通道影像. 存在未加载的通道时返回 `None`.
    pub fn loaded_channels(&self) -> Option<Vec<&ScalarImage>> {
        self.channels.iter().map(|c| c.image.as_image()).collect()
    }

    /// 已加载的标签影像.
    pub fn loaded_label(&self) -> Option<&LabelMap> {
        self.label.as_ref().and_then(ImageRef::as_image)
    }

    /// 已加载通道影像的可变迭代器. 未加载的通道被跳过.
    pub fn loaded_channels_mut(&mut self) -> impl Iterator<Item = &mut ScalarImage> {
        self.channels
            .iter_mut()
            .filter_map(|c| c.image.as_image_mut())
    }

    /// 已加载标签影像的可变引用.
    pub fn loaded_label_mut(&mut self) -> Option<&mut LabelMap> {
        self.label.as_mut().and_then(ImageRef::as_image_mut)
    }

    /// 复制除影像之外的所有字段.
    pub(crate) fn clone_meta(&self) -> Self {
        Self {
            subject_id: self.subject_id.clone(),
            channels: Vec::new(),
            label: None,
            spacing: self.spacing,
            values: self.values.clone(),
            path_to_metadata: self.path_to_metadata.clone(),
        }
    }
}

impl Channel {
    /// 读取 (或复制) 该通道的影像.
    pub fn load(&self) -> Result<ScalarImage, SubjectError> {
        self.image
            .load()
            .map_err(|e| SubjectError::Load(self.id.to_string(), e))
    }
}

/// 读取 (或复制) 标签影像.
pub(crate) fn load_label(label: &ImageRef<u8>) -> Result<LabelMap, SubjectError> {
    label
        .load()
        .map_err(|e: LoadError| SubjectError::Load(LABEL_KEY.to_owned(), e))
}
