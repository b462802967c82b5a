//! 延续（continuation）：等待条件 + 恢复动作。
//!
//! 等待种类是固定的小集合，因此条件用一个枚举表达，共享同一个完成判定
//! [`WaitCondition::is_met`]。

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// 等待种类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// 等到帧计数达到目标值。
    Frame,
    /// 等到固定步计数达到目标值。
    FixedStep,
    /// 等到缩放时间达到目标值。
    Time,
    /// 等到未缩放时间达到目标值。
    UnscaledTime,
    /// 等到谓词返回 `true`。
    Predicate,
    /// 等到外部步进源不再有下一步。
    Custom,
    /// 等到外部异步操作完成。
    Operation,
}

impl WaitKind {
    pub fn label(self) -> &'static str {
        match self {
            WaitKind::Frame => "frame",
            WaitKind::FixedStep => "fixed_step",
            WaitKind::Time => "time",
            WaitKind::UnscaledTime => "unscaled_time",
            WaitKind::Predicate => "predicate",
            WaitKind::Custom => "custom",
            WaitKind::Operation => "operation",
        }
    }
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 驱动器在一次阶段遍历开始时的计数/时间快照。
///
/// 同一次遍历内的所有完成判定都基于同一份快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameClock {
    pub frame: u64,
    pub fixed_step: u64,
    pub time: Duration,
    pub unscaled_time: Duration,
}

/// 外部步进源：每次轮询被询问一次“是否还有下一步”。
///
/// 返回 `false` 时对应的等待完成。任何 `Iterator` 都是步进源：迭代器耗尽即完成。
pub trait StepSource: Send {
    fn advance(&mut self) -> bool;
}

impl<I> StepSource for I
where
    I: Iterator + Send,
{
    fn advance(&mut self) -> bool {
        self.next().is_some()
    }
}

/// 把闭包包装成 [`StepSource`]。
pub struct StepFn<F>(pub F);

impl<F> StepSource for StepFn<F>
where
    F: FnMut() -> bool + Send,
{
    fn advance(&mut self) -> bool {
        (self.0)()
    }
}

/// 外部异步操作：只需要能报告“是否完成”。
pub trait ExternalOperation: Send + Sync {
    fn is_done(&self) -> bool;
}

impl<T: Send + 'static> ExternalOperation for tokio::task::JoinHandle<T> {
    fn is_done(&self) -> bool {
        self.is_finished()
    }
}

/// 可跨线程置位的完成标记，最简单的 [`ExternalOperation`] 实现。
#[derive(Debug, Clone, Default)]
pub struct OperationFlag(Arc<AtomicBool>);

impl OperationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl ExternalOperation for OperationFlag {
    fn is_done(&self) -> bool {
        self.is_complete()
    }
}

/// 对外部操作的引用。
///
/// 引用缺失（`Absent`，或弱引用的目标已被释放）时视为已完成：
/// 等待不会因为一个已经销毁的外部句柄而永久挂起。
#[derive(Clone, Default)]
pub enum OperationRef {
    #[default]
    Absent,
    Strong(Arc<dyn ExternalOperation>),
    Weak(Weak<dyn ExternalOperation>),
}

impl OperationRef {
    pub fn new<O>(operation: Arc<O>) -> Self
    where
        O: ExternalOperation + 'static,
    {
        Self::Strong(operation)
    }

    /// 只持有弱引用：外部操作被释放后等待立即完成。
    pub fn weak<O>(operation: &Arc<O>) -> Self
    where
        O: ExternalOperation + 'static,
    {
        let weak: Weak<O> = Arc::downgrade(operation);
        Self::Weak(weak)
    }

    pub fn is_done(&self) -> bool {
        match self {
            OperationRef::Absent => true,
            OperationRef::Strong(operation) => operation.is_done(),
            OperationRef::Weak(operation) => operation.upgrade().is_none_or(|op| op.is_done()),
        }
    }
}

impl From<Option<Arc<dyn ExternalOperation>>> for OperationRef {
    fn from(operation: Option<Arc<dyn ExternalOperation>>) -> Self {
        operation.map_or(OperationRef::Absent, OperationRef::Strong)
    }
}

impl fmt::Debug for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationRef::Absent => write!(f, "Absent"),
            OperationRef::Strong(_) => write!(f, "Strong"),
            OperationRef::Weak(operation) => f
                .debug_tuple("Weak")
                .field(&(operation.strong_count() > 0))
                .finish(),
        }
    }
}

pub(crate) type Predicate = Box<dyn FnMut() -> bool + Send>;

/// 等待条件。目标帧/步/时间在创建等待时就已算好。
pub(crate) enum WaitCondition {
    Frame(u64),
    FixedStep(u64),
    Time(Duration),
    UnscaledTime(Duration),
    Predicate(Predicate),
    Custom(Box<dyn StepSource>),
    Operation(OperationRef),
}

impl WaitCondition {
    pub(crate) fn kind(&self) -> WaitKind {
        match self {
            WaitCondition::Frame(_) => WaitKind::Frame,
            WaitCondition::FixedStep(_) => WaitKind::FixedStep,
            WaitCondition::Time(_) => WaitKind::Time,
            WaitCondition::UnscaledTime(_) => WaitKind::UnscaledTime,
            WaitCondition::Predicate(_) => WaitKind::Predicate,
            WaitCondition::Custom(_) => WaitKind::Custom,
            WaitCondition::Operation(_) => WaitKind::Operation,
        }
    }

    /// 谓词与步进源每次调用只求值一次。
    pub(crate) fn is_met(&mut self, clock: &FrameClock) -> bool {
        match self {
            WaitCondition::Frame(target) => clock.frame >= *target,
            WaitCondition::FixedStep(target) => clock.fixed_step >= *target,
            WaitCondition::Time(target) => clock.time >= *target,
            WaitCondition::UnscaledTime(target) => clock.unscaled_time >= *target,
            WaitCondition::Predicate(predicate) => predicate(),
            WaitCondition::Custom(step) => !step.advance(),
            WaitCondition::Operation(operation) => operation.is_done(),
        }
    }
}

impl fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Frame(target) => f.debug_tuple("Frame").field(target).finish(),
            WaitCondition::FixedStep(target) => f.debug_tuple("FixedStep").field(target).finish(),
            WaitCondition::Time(target) => f.debug_tuple("Time").field(target).finish(),
            WaitCondition::UnscaledTime(target) => {
                f.debug_tuple("UnscaledTime").field(target).finish()
            }
            WaitCondition::Predicate(_) => write!(f, "Predicate"),
            WaitCondition::Custom(_) => write!(f, "Custom"),
            WaitCondition::Operation(operation) => {
                f.debug_tuple("Operation").field(operation).finish()
            }
        }
    }
}

pub(crate) type Resumption = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// 一个挂起中的等待：条件 + 恰好执行一次的恢复动作。
pub(crate) struct Continuation {
    condition: WaitCondition,
    resume: Resumption,
}

impl Continuation {
    pub(crate) fn new(condition: WaitCondition, resume: Resumption) -> Self {
        Self { condition, resume }
    }

    pub(crate) fn kind(&self) -> WaitKind {
        self.condition.kind()
    }

    /// 判定是否完成。条件求值中的 panic 被捕获为 `Err`。
    pub(crate) fn check(&mut self, clock: &FrameClock) -> Result<bool, ResumeFailure> {
        panic::catch_unwind(AssertUnwindSafe(|| self.condition.is_met(clock)))
            .map_err(|payload| ResumeFailure::Panicked(panic_message(&*payload)))
    }

    /// 执行恢复动作；返回的错误与 panic 都只影响这一个延续。
    pub(crate) fn resume(self) -> Result<(), ResumeFailure> {
        let resume = self.resume;
        match panic::catch_unwind(AssertUnwindSafe(resume)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ResumeFailure::Failed(err)),
            Err(payload) => Err(ResumeFailure::Panicked(panic_message(&*payload))),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}

/// 单个延续执行失败的原因。
#[derive(Debug)]
pub(crate) enum ResumeFailure {
    Failed(anyhow::Error),
    Panicked(String),
}

impl fmt::Display for ResumeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeFailure::Failed(err) => write!(f, "{err:#}"),
            ResumeFailure::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
