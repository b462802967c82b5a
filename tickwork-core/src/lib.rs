//! 帧阶段延续调度器的核心库（`tickwork-core`）。
//!
//! 调用方描述“在 N 帧 / N 个固定步 / N 秒之后”或“当某个条件成立时”继续执行，
//! 宿主循环按阶段驱动 [`Driver`]，到期的延续在阶段遍历中被恢复。
//!
//! 大多数宿主只需要：
//! - 用 [`Driver::new`] 创建驱动器，注入一个 [`clock::HostClock`]
//! - 用 [`Driver::scheduler`] 为每个实体创建 [`Scheduler`]，通过它发起等待
//! - 每个 update tick 调用 [`Driver::tick`]，每个 fixed tick 调用
//!   [`Driver::drive_fixed_update`]；或者直接交给 [`host::HostLoop`]

pub mod clock;
pub mod config;
pub mod host;
pub mod logger;
pub mod sched;

pub use sched::{Driver, Phase, Scheduler, SchedulerHandle, Wait};
