use std::{
    ptr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};

use super::continuation::FrameClock;
use super::driver::DriverError;
use super::phase::Phase;
use super::queue::PollOutcome;

const UNREGISTERED: usize = usize::MAX;

/// 目标在某个阶段注册表中的下标。
///
/// 只有持有该阶段注册表锁时才会被写入；读取可以在任意时刻进行，
/// 但结果只在持锁期间可靠。
#[derive(Debug)]
pub struct RegistrySlot(AtomicUsize);

impl RegistrySlot {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(UNREGISTERED))
    }

    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            UNREGISTERED => None,
            index => Some(index),
        }
    }

    fn set(&self, index: Option<usize>) {
        self.0.store(index.unwrap_or(UNREGISTERED), Ordering::Release);
    }
}

impl Default for RegistrySlot {
    fn default() -> Self {
        Self::new()
    }
}

/// 可以被驱动器按阶段驱动的对象。
///
/// [`Scheduler`](super::Scheduler) 是主要实现；宿主也可以直接实现该 trait，
/// 把自己的每帧逻辑挂到驱动器上。
pub trait PhaseTarget: Send + Sync {
    /// 该阶段的注册表下标槽位。每个阶段必须返回不同的槽位。
    fn slot(&self, phase: Phase) -> &RegistrySlot;

    /// 执行一次阶段遍历。返回值的 `remaining` 为 0 表示该阶段暂时没有工作。
    fn drive(&self, phase: Phase, clock: &FrameClock) -> PollOutcome;

    /// 驱动器在持有注册表锁时调用，确认目标可以从该阶段移除。
    ///
    /// 实现不得在此获取同一注册表的锁。返回 `false` 时目标保留在注册表中。
    fn release_if_idle(&self, _phase: Phase) -> bool {
        true
    }

    /// 驱动器关闭时对仍在注册表中的目标各调用一次。
    fn shutdown(&self) {}

    fn label(&self) -> &str;
}

/// 一个阶段的扁平注册表。
pub(crate) struct PhaseRegistry {
    phase: Phase,
    entries: Mutex<Vec<Arc<dyn PhaseTarget>>>,
}

impl PhaseRegistry {
    pub(crate) fn new(phase: Phase, capacity: usize) -> Self {
        Self {
            phase,
            entries: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            phase: self.phase,
            entries: self.entries.lock(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<Arc<dyn PhaseTarget>> {
        self.entries.lock().get(index).cloned()
    }

    /// 清空注册表并复位所有槽位，返回被移除的目标（在锁外析构）。
    pub(crate) fn clear(&self) -> Vec<Arc<dyn PhaseTarget>> {
        let mut entries = self.entries.lock();
        for target in entries.iter() {
            target.slot(self.phase).set(None);
        }
        std::mem::take(&mut *entries)
    }
}

pub(crate) struct RegistryGuard<'a> {
    phase: Phase,
    entries: MutexGuard<'a, Vec<Arc<dyn PhaseTarget>>>,
}

impl RegistryGuard<'_> {
    /// 目标记录的下标，且该下标确实指回目标本身。
    pub(crate) fn index_of(&self, target: &dyn PhaseTarget) -> Option<usize> {
        let index = target.slot(self.phase).get()?;
        let entry = self.entries.get(index)?;
        ptr::addr_eq(Arc::as_ptr(entry), target).then_some(index)
    }

    pub(crate) fn insert(&mut self, target: Arc<dyn PhaseTarget>) -> Result<usize, DriverError> {
        if let Some(index) = self.index_of(&*target) {
            return Err(DriverError::AlreadyRegistered {
                phase: self.phase,
                index,
            });
        }

        let index = self.entries.len();
        target.slot(self.phase).set(Some(index));
        self.entries.push(target);
        Ok(index)
    }

    pub(crate) fn remove(&mut self, target: &dyn PhaseTarget) -> Result<Arc<dyn PhaseTarget>, DriverError> {
        let index = self
            .index_of(target)
            .ok_or(DriverError::NotRegistered { phase: self.phase })?;
        Ok(self.remove_at(index))
    }

    /// 与末尾交换后移除，并修正被换入元素的下标。
    pub(crate) fn remove_at(&mut self, index: usize) -> Arc<dyn PhaseTarget> {
        let removed = self.entries.swap_remove(index);
        if let Some(moved) = self.entries.get(index) {
            moved.slot(self.phase).set(Some(index));
        }
        removed.slot(self.phase).set(None);
        removed
    }
}
