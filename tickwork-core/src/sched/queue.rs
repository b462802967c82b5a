use std::{
    mem,
    ops::AddAssign,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::continuation::{Continuation, FrameClock, WaitKind};
use super::phase::Phase;

/// 一次队列轮询的统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// 本次完成并执行了恢复动作的延续数（含执行失败的）。
    pub resumed: usize,
    /// 恢复动作返回错误、panic，或条件判定 panic 的延续数。
    pub failed: usize,
    /// 轮询结束后仍在队列中的延续数。
    pub remaining: usize,
}

impl PollOutcome {
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl AddAssign for PollOutcome {
    fn add_assign(&mut self, other: Self) {
        self.resumed += other.resumed;
        self.failed += other.failed;
        self.remaining += other.remaining;
    }
}

/// 同一种等待的延续集合。
///
/// 移除采用 swap-remove（与末尾交换后弹出），因此队列内顺序在多次轮询之间不稳定：
/// 调用方应把它当作集合而不是序列。
///
/// `push` 可以在任意线程调用，只锁定本队列；`poll` 由驱动器单线程调用，
/// 执行恢复动作时不持有锁，恢复动作因此可以向同一队列追加新的等待。
pub(crate) struct ContinuationQueue {
    kind: WaitKind,
    phase: Phase,
    buffer: Mutex<Vec<Continuation>>,
    /// 只在持有 `buffer` 锁时写入。关闭后不再接收也不再保留延续。
    closed: AtomicBool,
}

impl ContinuationQueue {
    pub(crate) fn new(kind: WaitKind, phase: Phase, capacity: usize) -> Self {
        Self {
            kind,
            phase,
            buffer: Mutex::new(Vec::with_capacity(capacity)),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn kind(&self) -> WaitKind {
        self.kind
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// 入队；队列已关闭时在锁外丢弃并返回 `false`。
    pub(crate) fn push(&self, continuation: Continuation) -> bool {
        debug_assert_eq!(continuation.kind(), self.kind, "continuation pushed into wrong queue");
        let mut buffer = self.buffer.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(buffer);
            drop(continuation);
            return false;
        }
        buffer.push(continuation);
        true
    }

    /// 关闭队列并丢弃所有延续（不执行），返回丢弃的数量。
    ///
    /// 正在进行的 `poll` 结束时会丢弃它取出的剩余延续，而不是放回队列。
    pub(crate) fn close(&self) -> usize {
        let dropped = {
            let mut buffer = self.buffer.lock();
            self.closed.store(true, Ordering::Release);
            mem::take(&mut *buffer)
        };
        // 在锁外析构：恢复动作捕获的值在 drop 时可能回调到调度器。
        dropped.len()
    }

    /// 访问当前每个条目一次：完成的执行恢复动作并移除，其余保持原样。
    ///
    /// 轮询期间新追加的条目从下一次轮询开始参与判定。
    pub(crate) fn poll(&self, clock: &FrameClock, owner: &str) -> PollOutcome {
        let mut live = mem::take(&mut *self.buffer.lock());
        let mut outcome = PollOutcome::default();

        let mut index = 0;
        while index < live.len() {
            match live[index].check(clock) {
                Ok(false) => index += 1,
                Ok(true) => {
                    // 不递增 index：交换过来的末尾元素下一轮就会被访问。
                    let continuation = live.swap_remove(index);
                    outcome.resumed += 1;
                    if let Err(err) = continuation.resume() {
                        outcome.failed += 1;
                        warn!(
                            target: "tickwork-core",
                            scheduler = owner,
                            phase = self.phase.label(),
                            kind = self.kind.label(),
                            error = %err,
                            "continuation resumption failed"
                        );
                    }
                }
                Err(err) => {
                    drop(live.swap_remove(index));
                    outcome.failed += 1;
                    warn!(
                        target: "tickwork-core",
                        scheduler = owner,
                        phase = self.phase.label(),
                        kind = self.kind.label(),
                        error = %err,
                        "wait condition check failed, continuation discarded"
                    );
                }
            }
        }

        let mut buffer = self.buffer.lock();
        if self.closed.load(Ordering::Acquire) {
            // 恢复动作销毁了所属调度器。
            drop(buffer);
            if !live.is_empty() {
                trace!(
                    target: "tickwork-core",
                    scheduler = owner,
                    phase = self.phase.label(),
                    kind = self.kind.label(),
                    dropped = live.len(),
                    "queue closed during poll, leftovers dropped"
                );
            }
            drop(live);
            return outcome;
        }
        live.append(&mut buffer);
        *buffer = live;
        outcome.remaining = buffer.len();
        outcome
    }
}
