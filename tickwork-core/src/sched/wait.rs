//! 等待句柄。
//!
//! 工厂方法只负责算好目标值；延续在绑定恢复动作（[`Wait::then`]）或被 `.await`
//! 时才真正进入队列。

use std::{
    fmt,
    future::{Future, IntoFuture},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

use super::continuation::{Continuation, WaitCondition, WaitKind};
use super::phase::Phase;
use super::scheduler::SchedulerInner;

/// 一个尚未绑定恢复动作的等待。
///
/// 既可以用 [`then`](Wait::then) / [`try_then`](Wait::try_then) 绑定回调，
/// 也可以直接 `.await`。
#[must_use = "a wait does nothing until `then` is called or it is awaited"]
pub struct Wait {
    scheduler: Arc<SchedulerInner>,
    phase: Phase,
    condition: WaitCondition,
}

impl Wait {
    pub(crate) fn new(scheduler: Arc<SchedulerInner>, phase: Phase, condition: WaitCondition) -> Self {
        Self {
            scheduler,
            phase,
            condition,
        }
    }

    pub fn kind(&self) -> WaitKind {
        self.condition.kind()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 绑定恢复动作并入队。
    pub fn then<F>(self, resume: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_then(move || {
            resume();
            Ok(())
        });
    }

    /// 绑定可能失败的恢复动作并入队。返回的错误只会被记录，不会影响其它延续。
    pub fn try_then<F>(self, resume: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let continuation = Continuation::new(self.condition, Box::new(resume));
        self.scheduler.enqueue(self.phase, continuation);
    }
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("scheduler", &self.scheduler.label())
            .field("phase", &self.phase)
            .field("condition", &self.condition)
            .finish()
    }
}

impl IntoFuture for Wait {
    type Output = Result<(), WaitAbandoned>;
    type IntoFuture = WaitFuture;

    fn into_future(self) -> WaitFuture {
        WaitFuture {
            wait: Some(self),
            signal: Arc::new(Signal::new()),
        }
    }
}

/// 等待在完成之前被丢弃（所属调度器被销毁或驱动器已关闭）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitAbandoned;

impl fmt::Display for WaitAbandoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "等待在完成之前被丢弃")
    }
}

impl std::error::Error for WaitAbandoned {}

/// [`Wait`] 对应的 future。首次 poll 时入队。
#[must_use = "futures do nothing unless polled"]
pub struct WaitFuture {
    wait: Option<Wait>,
    signal: Arc<Signal>,
}

impl Future for WaitFuture {
    type Output = Result<(), WaitAbandoned>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.signal.register(cx.waker());

        if let Some(wait) = this.wait.take() {
            let guard = SignalGuard(Arc::clone(&this.signal));
            wait.then(move || guard.fire());
        }

        match this.signal.state() {
            SIGNAL_FIRED => Poll::Ready(Ok(())),
            SIGNAL_ABANDONED => Poll::Ready(Err(WaitAbandoned)),
            _ => Poll::Pending,
        }
    }
}

impl fmt::Debug for WaitFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitFuture")
            .field("armed", &self.wait.is_none())
            .field("state", &self.signal.state())
            .finish()
    }
}

const SIGNAL_PENDING: u8 = 0;
const SIGNAL_FIRED: u8 = 1;
const SIGNAL_ABANDONED: u8 = 2;

struct Signal {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

impl Signal {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SIGNAL_PENDING),
            waker: Mutex::new(None),
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// 只有第一次结算生效。
    fn settle(&self, state: u8) {
        if self
            .state
            .compare_exchange(SIGNAL_PENDING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && let Some(waker) = self.waker.lock().take()
        {
            waker.wake();
        }
    }
}

/// 随恢复动作一起入队；未执行就被丢弃时把等待标记为 abandoned。
struct SignalGuard(Arc<Signal>);

impl SignalGuard {
    fn fire(self) {
        self.0.settle(SIGNAL_FIRED);
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.0.settle(SIGNAL_ABANDONED);
    }
}
