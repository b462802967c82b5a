//! 帧阶段延续调度。
//!
//! - [`Driver`]：持有帧/固定步计数与时间快照，按 update → late-update、fixed-update
//!   的顺序驱动已注册的目标
//! - [`Scheduler`]：每个实体一份，提供等待工厂并持有各阶段的延续队列
//! - [`Wait`]：工厂返回的等待句柄，用 `then` 绑定恢复动作或直接 `.await`

mod continuation;
mod driver;
mod phase;
mod queue;
mod registry;
mod scheduler;
mod wait;

pub use continuation::{ExternalOperation, FrameClock, OperationFlag, OperationRef, StepFn, StepSource, WaitKind};
pub use driver::{Driver, DriverError, PassReport, TickReport};
pub use phase::Phase;
pub use queue::PollOutcome;
pub use registry::{PhaseTarget, RegistrySlot};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerId};
pub use wait::{Wait, WaitAbandoned, WaitFuture};
