//! 每个可调度实体持有的阶段调度器。

use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::continuation::{
    Continuation, ExternalOperation, FrameClock, OperationRef, StepSource, WaitCondition, WaitKind,
};
use super::driver::DriverShared;
use super::phase::Phase;
use super::queue::{ContinuationQueue, PollOutcome};
use super::registry::{PhaseTarget, RegistrySlot};
use super::wait::Wait;
use crate::config::QueueCapacities;

/// 调度器的唯一 ID。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerId(Uuid);

impl SchedulerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// 前 8 个十六进制字符，用于日志。
    pub fn short(self) -> String {
        let s = self.0.simple().to_string();
        s.chars().take(8).collect()
    }
}

impl Default for SchedulerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const UPDATE_KINDS: [WaitKind; 6] = [
    WaitKind::Frame,
    WaitKind::Time,
    WaitKind::UnscaledTime,
    WaitKind::Predicate,
    WaitKind::Custom,
    WaitKind::Operation,
];

pub(crate) struct SchedulerInner {
    id: SchedulerId,
    label: String,
    driver: Weak<DriverShared>,
    update: [ContinuationQueue; 6],
    late_update: [ContinuationQueue; 1],
    fixed_update: [ContinuationQueue; 1],
    slots: [RegistrySlot; 3],
    pending: [AtomicBool; 3],
    active: AtomicBool,
    torn_down: AtomicBool,
}

impl SchedulerInner {
    pub(crate) fn new(driver: Weak<DriverShared>, name: &str, capacities: &QueueCapacities) -> Self {
        let id = SchedulerId::new();
        let update = UPDATE_KINDS.map(|kind| {
            ContinuationQueue::new(kind, Phase::Update, capacities.update_capacity(kind))
        });

        Self {
            id,
            label: format!("{name}#{}", id.short()),
            driver,
            update,
            late_update: [ContinuationQueue::new(
                WaitKind::Frame,
                Phase::LateUpdate,
                capacities.late_frame,
            )],
            fixed_update: [ContinuationQueue::new(
                WaitKind::FixedStep,
                Phase::FixedUpdate,
                capacities.fixed_step,
            )],
            slots: Default::default(),
            pending: Default::default(),
            active: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
        }
    }

    fn queues(&self, phase: Phase) -> &[ContinuationQueue] {
        match phase {
            Phase::Update => &self.update,
            Phase::LateUpdate => &self.late_update,
            Phase::FixedUpdate => &self.fixed_update,
        }
    }

    fn queue(&self, phase: Phase, kind: WaitKind) -> Option<&ContinuationQueue> {
        self.queues(phase).iter().find(|queue| queue.kind() == kind)
    }

    /// 当前驱动器的计数/时间；驱动器已不存在时返回零值。
    fn now(&self) -> FrameClock {
        self.driver
            .upgrade()
            .map(|driver| driver.clock())
            .unwrap_or_default()
    }

    fn late_target(&self, frames: u64) -> u64 {
        self.driver
            .upgrade()
            .map_or(frames, |driver| driver.late_target(frames))
    }

    fn live_driver(&self) -> Option<Arc<DriverShared>> {
        self.driver.upgrade().filter(|driver| !driver.is_shut_down())
    }

    /// 入队并在需要时惰性注册到驱动器。
    ///
    /// 先入队、后在注册表锁内置位 pending 并注册：驱动器移除空闲目标时也持有同一把锁，
    /// 因此新入队的延续不会因为并发移除而丢失驱动。
    pub(crate) fn enqueue(self: &Arc<Self>, phase: Phase, continuation: Continuation) {
        let kind = continuation.kind();
        if self.torn_down.load(Ordering::Acquire) {
            debug!(
                target: "tickwork-core",
                scheduler = %self.label,
                phase = phase.label(),
                kind = kind.label(),
                "scheduler torn down, dropping continuation"
            );
            return;
        }

        let Some(driver) = self.live_driver() else {
            debug!(
                target: "tickwork-core",
                scheduler = %self.label,
                phase = phase.label(),
                kind = kind.label(),
                "driver shut down, dropping continuation"
            );
            return;
        };

        let Some(queue) = self.queue(phase, kind) else {
            warn!(
                target: "tickwork-core",
                scheduler = %self.label,
                phase = phase.label(),
                kind = kind.label(),
                "no queue for this wait kind in this phase"
            );
            return;
        };
        if !queue.push(continuation) {
            debug!(
                target: "tickwork-core",
                scheduler = %self.label,
                phase = phase.label(),
                kind = kind.label(),
                "queue closed, dropping continuation"
            );
            return;
        }

        let mut registry = driver.registry(phase).lock();
        // 销毁会关闭全部队列，刚入队的延续随之丢弃。
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        if driver.is_shut_down() {
            drop(registry);
            self.clear_queues();
            return;
        }

        self.pending[phase.index()].store(true, Ordering::Release);
        if !self.active.load(Ordering::Acquire) || registry.index_of(&**self).is_some() {
            return;
        }

        let target: Arc<dyn PhaseTarget> = Arc::clone(self) as Arc<dyn PhaseTarget>;
        match registry.insert(target) {
            Ok(index) => trace!(
                target: "tickwork-core",
                scheduler = %self.label,
                phase = phase.label(),
                index,
                "scheduler registered"
            ),
            Err(err) => warn!(
                target: "tickwork-core",
                scheduler = %self.label,
                error = %err,
                "scheduler registration failed"
            ),
        }
    }

    fn activate(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(driver) = self.live_driver() else {
            return;
        };

        for phase in Phase::ALL {
            let mut registry = driver.registry(phase).lock();
            if !self.pending[phase.index()].load(Ordering::Acquire)
                || registry.index_of(&**self).is_some()
            {
                continue;
            }
            let target: Arc<dyn PhaseTarget> = Arc::clone(self) as Arc<dyn PhaseTarget>;
            if let Err(err) = registry.insert(target) {
                warn!(
                    target: "tickwork-core",
                    scheduler = %self.label,
                    error = %err,
                    "scheduler re-registration failed"
                );
            }
        }
        debug!(target: "tickwork-core", scheduler = %self.label, "scheduler activated");
    }

    fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.unregister_all();
        debug!(target: "tickwork-core", scheduler = %self.label, "scheduler deactivated");
    }

    fn unregister_all(&self) {
        let Some(driver) = self.driver.upgrade() else {
            return;
        };
        for phase in Phase::ALL {
            // 移除出的 Arc 可能是最后一个强引用，在锁外释放。
            let removed = {
                let mut registry = driver.registry(phase).lock();
                registry.remove(self).ok()
            };
            drop(removed);
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.active.store(false, Ordering::Release);
        self.unregister_all();

        let dropped = self.clear_queues();
        debug!(
            target: "tickwork-core",
            scheduler = %self.label,
            dropped,
            "scheduler torn down"
        );
    }

    fn clear_queues(&self) -> usize {
        let dropped = Phase::ALL
            .iter()
            .flat_map(|&phase| self.queues(phase))
            .map(ContinuationQueue::close)
            .sum();
        for flag in &self.pending {
            flag.store(false, Ordering::Release);
        }
        dropped
    }

    fn pending_count(&self, phase: Phase) -> usize {
        self.queues(phase).iter().map(ContinuationQueue::len).sum()
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}

impl PhaseTarget for SchedulerInner {
    fn slot(&self, phase: Phase) -> &RegistrySlot {
        &self.slots[phase.index()]
    }

    fn drive(&self, phase: Phase, clock: &FrameClock) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        for queue in self.queues(phase) {
            if !queue.is_empty() {
                outcome += queue.poll(clock, &self.label);
            }
        }
        outcome
    }

    fn release_if_idle(&self, phase: Phase) -> bool {
        if self.queues(phase).iter().all(ContinuationQueue::is_empty) {
            self.pending[phase.index()].store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn shutdown(&self) {
        let dropped = self.clear_queues();
        if dropped > 0 {
            debug!(
                target: "tickwork-core",
                scheduler = %self.label,
                dropped,
                "driver shut down, pending continuations dropped"
            );
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// 可克隆的调度器句柄：只能发起等待，不控制生命周期。
///
/// 恢复动作里通常捕获一个句柄来继续链式等待。所属的 [`Scheduler`] 被销毁后，
/// 通过句柄发起的等待会立即被丢弃（`.await` 得到 [`WaitAbandoned`](super::WaitAbandoned)）。
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<SchedulerInner>,
}

impl SchedulerHandle {
    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn wait(&self, phase: Phase, condition: WaitCondition) -> Wait {
        Wait::new(Arc::clone(&self.inner), phase, condition)
    }

    /// 下一次 update。
    pub fn next_update(&self) -> Wait {
        self.updates(1)
    }

    /// `frames` 次 update 之后。
    pub fn updates(&self, frames: u64) -> Wait {
        let target = self.inner.now().frame.saturating_add(frames);
        self.wait(Phase::Update, WaitCondition::Frame(target))
    }

    pub fn next_late_update(&self) -> Wait {
        self.late_updates(1)
    }

    /// 第 `frames` 次 late-update。
    ///
    /// 在 update 的恢复动作中发起时，本帧即将执行的 late-update 算作第一次。
    pub fn late_updates(&self, frames: u64) -> Wait {
        let target = self.inner.late_target(frames);
        self.wait(Phase::LateUpdate, WaitCondition::Frame(target))
    }

    pub fn next_fixed_update(&self) -> Wait {
        self.fixed_updates(1)
    }

    pub fn fixed_updates(&self, steps: u64) -> Wait {
        let target = self.inner.now().fixed_step.saturating_add(steps);
        self.wait(Phase::FixedUpdate, WaitCondition::FixedStep(target))
    }

    /// 缩放时间流逝 `duration` 之后。
    pub fn seconds(&self, duration: Duration) -> Wait {
        let target = self.inner.now().time.saturating_add(duration);
        self.wait(Phase::Update, WaitCondition::Time(target))
    }

    /// 真实时间流逝 `duration` 之后（不受时间倍率影响）。
    pub fn seconds_unscaled(&self, duration: Duration) -> Wait {
        let target = self.inner.now().unscaled_time.saturating_add(duration);
        self.wait(Phase::Update, WaitCondition::UnscaledTime(target))
    }

    /// 每次 update 求值一次谓词，返回 `true` 时完成。
    pub fn until<P>(&self, predicate: P) -> Wait
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.wait(Phase::Update, WaitCondition::Predicate(Box::new(predicate)))
    }

    /// 谓词返回 `false` 时完成。
    pub fn while_true<P>(&self, mut predicate: P) -> Wait
    where
        P: FnMut() -> bool + Send + 'static,
    {
        self.until(move || !predicate())
    }

    /// 每次 update 推进一次步进源，步进源耗尽时完成。
    pub fn custom<S>(&self, step: S) -> Wait
    where
        S: StepSource + 'static,
    {
        self.wait(Phase::Update, WaitCondition::Custom(Box::new(step)))
    }

    pub fn operation<O>(&self, operation: Arc<O>) -> Wait
    where
        O: ExternalOperation + 'static,
    {
        self.operation_ref(OperationRef::new(operation))
    }

    /// 引用缺失（[`OperationRef::Absent`] 或弱引用已失效）时首次 poll 即完成。
    pub fn operation_ref(&self, operation: OperationRef) -> Wait {
        self.wait(Phase::Update, WaitCondition::Operation(operation))
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("label", &self.inner.label)
            .finish()
    }
}

/// 实体持有的调度器。
///
/// 通过 `Deref` 提供 [`SchedulerHandle`] 的全部等待工厂；额外负责生命周期：
/// 激活/停用以及销毁。`drop` 时从驱动器注销并丢弃全部未完成的延续。
pub struct Scheduler {
    handle: SchedulerHandle,
}

impl Scheduler {
    pub(crate) fn new(driver: Weak<DriverShared>, name: &str, capacities: &QueueCapacities) -> Self {
        Self {
            handle: SchedulerHandle {
                inner: Arc::new(SchedulerInner::new(driver, name, capacities)),
            },
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// 重新注册仍有待处理工作的阶段。已激活时无操作。
    pub fn activate(&self) {
        self.handle.inner.activate();
    }

    /// 从所有阶段注销；队列保留，重新激活后继续投递。
    pub fn deactivate(&self) {
        self.handle.inner.deactivate();
    }

    pub fn is_active(&self) -> bool {
        self.handle.inner.active.load(Ordering::Acquire)
    }

    /// 该阶段队列中尚未完成的延续数。
    pub fn pending(&self, phase: Phase) -> usize {
        self.handle.inner.pending_count(phase)
    }

    /// 该阶段的 pending 标记：有延续入队后置位，驱动器确认空闲并移除时复位。
    pub fn has_pending(&self, phase: Phase) -> bool {
        self.handle.inner.pending[phase.index()].load(Ordering::Acquire)
    }

    /// 在驱动器该阶段注册表中的下标；未注册时为 `None`。
    pub fn registry_index(&self, phase: Phase) -> Option<usize> {
        self.handle.inner.slot(phase).get()
    }
}

impl Deref for Scheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.inner.teardown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("label", &self.handle.inner.label)
            .field("active", &self.is_active())
            .finish()
    }
}
