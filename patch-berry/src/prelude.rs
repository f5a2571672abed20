//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::config::{Headers, Parameters, PatchSize};
pub use crate::error::{ConfigError, Error, Result, SubjectError};
pub use crate::image::{ImageRef, LabelMap, PaddingMode, ScalarImage};
pub use crate::manifest::Manifest;
pub use crate::subject::{Channel, ChannelId, Subject};

pub use crate::assemble::{AssemblyReport, SubjectAssembler};
pub use crate::check::{GeometryCheck, SubjectCheck};
pub use crate::transform::{Compose, Transform};

pub use crate::dataset::SubjectsDataset;
pub use crate::queue::{PatchQueue, QueueOptions};
pub use crate::sampler::{Patch, PatchSampler, SamplerConfig};

pub use crate::loader::{images_from_manifest, Loader};
