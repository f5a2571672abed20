//! 训练用 patch 队列.
//!
//! `num_workers` 个后台线程从一个共享的访问计划中领取 subject 索引, 对 subject
//! 施加变换链, 采样 `samples_per_volume` 个 patch, 打乱后作为一个整体送入有界通道.
//! 消费者每次取出一整组, 全部消费完才取下一组. 访问计划每个 epoch 重新打乱一次.
//!
//! 工作线程在生产一组 patch 之前必须先领取一个名额, 消费者取下一组时才归还
//! 上一组的名额. 因此正在生产、排队等待和正在消费的组加起来不超过
//! [`QueueOptions::capacity`]. 名额耗尽时工作线程阻塞, 通道空时消费者阻塞.
//! 队列被 drop 时通道关闭, 所有工作线程退出并被 join.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::Parameters;
use crate::dataset::SubjectsDataset;
use crate::error::{Error, Result};
use crate::sampler::{Patch, PatchSampler};

/// 队列参数.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueOptions {
    /// 队列中最多等待的 patch 个数.
    pub max_length: usize,

    /// 每个 subject 采样的 patch 个数.
    pub samples_per_volume: usize,

    /// 后台线程数. 为 0 时在消费者线程上同步生产.
    pub num_workers: usize,

    /// 是否以 `info` 级别记录每组 patch.
    pub verbose: bool,

    /// 随机种子.
    pub seed: u64,
}

impl QueueOptions {
    /// 从参数中读取队列设置.
    pub fn from_parameters(parameters: &Parameters) -> Self {
        Self {
            max_length: parameters.q_max_length,
            samples_per_volume: parameters.q_samples_per_volume.max(1),
            num_workers: parameters.q_num_workers,
            verbose: parameters.q_verbose,
            seed: parameters.seed_or_random(),
        }
    }

    /// 同时存在的 patch 组数上限, 包括正在生产和正在消费的组. 至少为 1.
    ///
    /// 同时存在的 patch 数因此不超过 `max(max_length, samples_per_volume)`.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.max_length / self.samples_per_volume.max(1)).max(1)
    }
}

/// subject 访问计划. 每轮遍历完所有 subject 后重新打乱.
struct Plan {
    order: Vec<usize>,
    next: usize,
    epoch: u64,
    dispatched: u64,
    rng: StdRng,
}

impl Plan {
    fn new(len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut rng);
        Self {
            order,
            next: 0,
            epoch: 0,
            dispatched: 0,
            rng,
        }
    }

    fn next_index(&mut self) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        if self.next == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.next = 0;
            self.epoch += 1;
            debug!("patch 队列进入第 {} 轮", self.epoch);
        }
        let ans = self.order[self.next];
        self.next += 1;
        self.dispatched += 1;
        Some(ans)
    }
}

/// 生产一组 patch 所需的全部共享状态.
#[derive(Clone)]
struct Producer {
    dataset: Arc<SubjectsDataset>,
    sampler: Arc<PatchSampler>,
    plan: Arc<Mutex<Plan>>,
    samples_per_volume: usize,
    verbose: bool,
}

impl Producer {
    /// 生产下一组 patch. 数据集为空时返回 `None`.
    fn next_bundle(&self, rng: &mut StdRng) -> Option<Result<Vec<Patch>>> {
        let index = self
            .plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_index()?;
        let bundle = self.dataset.get_with(index, rng).and_then(|subject| {
            match self.sampler.sample(&subject, self.samples_per_volume, rng) {
                Ok(v) if v.is_empty() => Err(Error::EmptyBundle(subject.subject_id)),
                Ok(v) => Ok(v),
                Err(e) => Err(Error::Subject(subject.subject_id, e)),
            }
        });
        Some(bundle.map(|mut patches| {
            patches.shuffle(rng);
            if let Some(p) = patches.first() {
                if self.verbose {
                    info!("subject `{}`: {} 个 patch 入队", p.subject_id, patches.len());
                } else {
                    debug!("subject `{}`: {} 个 patch 入队", p.subject_id, patches.len());
                }
            }
            patches
        }))
    }

    fn run(
        self,
        tx: Sender<Result<Vec<Patch>>>,
        slots: Receiver<()>,
        stop: Arc<AtomicBool>,
        mut rng: StdRng,
    ) {
        while !stop.load(Ordering::Relaxed) {
            if slots.recv().is_err() {
                // 队列已经关闭.
                break;
            }
            let Some(bundle) = self.next_bundle(&mut rng) else {
                break;
            };
            if tx.send(bundle).is_err() {
                // 消费者已经离开.
                break;
            }
        }
    }
}

enum Source {
    Workers {
        rx: Option<Receiver<Result<Vec<Patch>>>>,
        slots: Option<Sender<()>>,
        holding: bool,
        handles: Vec<JoinHandle<()>>,
        stop: Arc<AtomicBool>,
    },
    Inline {
        producer: Producer,
        rng: StdRng,
    },
}

/// patch 队列. 作为迭代器无限地产出 patch, 直到被 drop.
///
/// 单个 subject 的失败 (读取或采样出错) 以 `Err` 项的形式交给消费者, 不会中断队列.
pub struct PatchQueue {
    source: Source,
    current: std::vec::IntoIter<Patch>,
    dataset: Arc<SubjectsDataset>,
    plan: Arc<Mutex<Plan>>,
    options: QueueOptions,
}

impl PatchQueue {
    /// 创建队列并启动后台线程.
    pub fn new(dataset: SubjectsDataset, sampler: PatchSampler, options: QueueOptions) -> Result<Self> {
        let dataset = Arc::new(dataset);
        let plan = Arc::new(Mutex::new(Plan::new(dataset.len(), options.seed)));
        let producer = Producer {
            dataset: Arc::clone(&dataset),
            sampler: Arc::new(sampler),
            plan: Arc::clone(&plan),
            samples_per_volume: options.samples_per_volume.max(1),
            verbose: options.verbose,
        };

        let source = if options.num_workers == 0 {
            Source::Inline {
                producer,
                rng: StdRng::seed_from_u64(options.seed.wrapping_add(1)),
            }
        } else {
            let capacity = options.capacity();
            let (tx, rx) = channel::bounded(capacity);
            let (slot_tx, slot_rx) = channel::bounded(capacity);
            for _ in 0..capacity {
                slot_tx.send(()).map_err(|_| Error::QueueClosed)?;
            }
            let stop = Arc::new(AtomicBool::new(false));
            let mut handles = Vec::with_capacity(options.num_workers);
            for i in 0..options.num_workers {
                let (producer, tx, slots, stop) = (
                    producer.clone(),
                    tx.clone(),
                    slot_rx.clone(),
                    Arc::clone(&stop),
                );
                let rng = StdRng::seed_from_u64(options.seed.wrapping_add(1 + i as u64));
                let handle = thread::Builder::new()
                    .name(format!("patch-queue-{i}"))
                    .spawn(move || producer.run(tx, slots, stop, rng))?;
                handles.push(handle);
            }
            Source::Workers {
                rx: Some(rx),
                slots: Some(slot_tx),
                holding: false,
                handles,
                stop,
            }
        };
        debug!(
            "patch 队列已启动: {} 个 subject, 每个 {} 个 patch, {} 个后台线程, 容量 {} 组",
            dataset.len(),
            options.samples_per_volume,
            options.num_workers,
            options.capacity()
        );

        Ok(Self {
            source,
            current: Vec::new().into_iter(),
            dataset,
            plan,
            options,
        })
    }

    /// 一轮 (每个 subject 访问一次) 产出的 patch 个数.
    #[inline]
    pub fn epoch_len(&self) -> usize {
        self.dataset.len() * self.options.samples_per_volume
    }

    /// 底层数据集.
    #[inline]
    pub fn dataset(&self) -> &SubjectsDataset {
        &self.dataset
    }

    /// 队列参数.
    #[inline]
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// 已经分发给生产者的 subject 次数.
    fn dispatched(&self) -> u64 {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatched
    }

    fn next_bundle(&mut self) -> Option<Result<Vec<Patch>>> {
        match &mut self.source {
            Source::Workers {
                rx: Some(rx),
                slots: Some(slots),
                holding,
                ..
            } => {
                // 上一组已经消费完, 归还它的名额.
                if std::mem::take(holding) {
                    slots.try_send(()).ok()?;
                }
                let bundle = rx.recv().ok()?;
                *holding = true;
                Some(bundle)
            }
            Source::Workers { .. } => None,
            Source::Inline { producer, rng } => producer.next_bundle(rng),
        }
    }
}

impl Iterator for PatchQueue {
    type Item = Result<Patch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(p) = self.current.next() {
                return Some(Ok(p));
            }
            match self.next_bundle()? {
                Ok(bundle) => self.current = bundle.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Drop for PatchQueue {
    fn drop(&mut self) {
        if let Source::Workers {
            rx,
            slots,
            handles,
            stop,
            ..
        } = &mut self.source
        {
            stop.store(true, Ordering::Relaxed);
            // 关闭通道, 唤醒阻塞在发送或领取名额上的线程.
            drop(rx.take());
            drop(slots.take());
            for h in handles.drain(..) {
                if h.join().is_err() {
                    error!("patch 队列后台线程异常退出");
                }
            }
        }
        debug!("patch 队列关闭, 共分发 {} 次 subject", self.dispatched());
    }
}
