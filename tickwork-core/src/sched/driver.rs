use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::continuation::{FrameClock, panic_message};
use super::phase::Phase;
use super::registry::{PhaseRegistry, PhaseTarget};
use super::scheduler::{Scheduler, SchedulerHandle};
use crate::clock::{HostClock, ScaledClock};
use crate::config::DriverConfig;

#[cfg(test)]
mod tests;

/// 驱动器误用错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// 驱动器已关闭。
    ShutDown,
    /// 目标已在该阶段注册。
    AlreadyRegistered { phase: Phase, index: usize },
    /// 目标不在该阶段的注册表中。
    NotRegistered { phase: Phase },
    /// 同一阶段遍历尚未结束时再次发起遍历（例如在恢复动作中调用 `tick`）。
    PassInProgress { phase: Phase },
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::ShutDown => write!(f, "驱动器已关闭"),
            DriverError::AlreadyRegistered { phase, index } => {
                write!(f, "目标已注册在 {phase} 阶段的第 {index} 位")
            }
            DriverError::NotRegistered { phase } => write!(f, "目标未注册在 {phase} 阶段"),
            DriverError::PassInProgress { phase } => {
                write!(f, "{phase} 阶段遍历进行中，不能重入驱动器")
            }
        }
    }
}

impl std::error::Error for DriverError {}

/// 一次阶段遍历的统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub phase: Phase,
    /// 本次遍历使用的计数/时间快照。
    pub clock: FrameClock,
    /// 被驱动的目标数。
    pub driven: usize,
    /// 完成并执行了恢复动作的延续数。
    pub resumed: usize,
    /// 失败的延续数（恢复动作出错或 panic、条件判定 panic），以及 panic 的目标数。
    pub failed: usize,
    /// 因空闲而被移出注册表的目标数。
    pub released: usize,
    /// 遍历结束后仍在注册表中的目标数。
    pub remaining: usize,
}

impl PassReport {
    fn new(phase: Phase, clock: FrameClock) -> Self {
        Self {
            phase,
            clock,
            driven: 0,
            resumed: 0,
            failed: 0,
            released: 0,
            remaining: 0,
        }
    }
}

/// 一次宿主 tick（update + late-update）的统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub update: PassReport,
    pub late_update: PassReport,
}

impl TickReport {
    pub fn failed(&self) -> usize {
        self.update.failed + self.late_update.failed
    }
}

/// 计数快照以及 late-update 的进度。
#[derive(Clone, Copy)]
struct ClockState {
    now: FrameClock,
    /// 最近一次 late-update 遍历所在的帧。
    late_frame: u64,
}

pub(crate) struct DriverShared {
    config: DriverConfig,
    host_clock: Box<dyn HostClock>,
    clock: RwLock<ClockState>,
    registries: [PhaseRegistry; 3],
    pass: Mutex<()>,
    shut_down: AtomicBool,
}

impl DriverShared {
    pub(crate) fn clock(&self) -> FrameClock {
        self.clock.read().now
    }

    /// `frames` 次 late-update 之后的目标帧。
    ///
    /// 当前帧的 late-update 尚未执行时，它就是第一次。
    pub(crate) fn late_target(&self, frames: u64) -> u64 {
        let state = self.clock.read();
        let target = state.now.frame.saturating_add(frames);
        if state.late_frame < state.now.frame {
            target.saturating_sub(1)
        } else {
            target
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn registry(&self, phase: Phase) -> &PhaseRegistry {
        &self.registries[phase.index()]
    }

    /// 阶段开始时推进对应计数；update 阶段同时刷新时间快照。
    fn begin_pass(&self, phase: Phase) -> FrameClock {
        let sampled = (phase == Phase::Update).then(|| self.host_clock.now());

        let mut state = self.clock.write();
        match phase {
            Phase::Update => state.now.frame += 1,
            Phase::LateUpdate => state.late_frame = state.now.frame,
            Phase::FixedUpdate => state.now.fixed_step += 1,
        }
        if let Some(now) = sampled {
            state.now.time = now.time;
            state.now.unscaled_time = now.unscaled_time;
        }
        state.now
    }
}

/// 全局驱动器：帧计数、固定步计数、时间快照以及三个阶段的注册表。
///
/// 驱动器是显式构造的上下文对象，同一进程内可以存在多个互不相干的驱动器。
/// 克隆得到的是同一个驱动器的另一个句柄。
///
/// 宿主循环的约定：每个 update tick 调用一次 [`tick`](Driver::tick)
/// （update 然后 late-update），每个 fixed tick 调用一次
/// [`drive_fixed_update`](Driver::drive_fixed_update)。所有驱动调用应来自同一条逻辑线程；
/// 等待可以从任意线程发起。
#[derive(Clone)]
pub struct Driver {
    shared: Arc<DriverShared>,
    ambient: Arc<Scheduler>,
}

impl Driver {
    pub fn new<C>(config: DriverConfig, clock: C) -> Self
    where
        C: HostClock + 'static,
    {
        let now = clock.now();
        let shared = Arc::new(DriverShared {
            config,
            host_clock: Box::new(clock),
            clock: RwLock::new(ClockState {
                now: FrameClock {
                    frame: 1,
                    fixed_step: 1,
                    time: now.time,
                    unscaled_time: now.unscaled_time,
                },
                late_frame: 1,
            }),
            registries: Phase::ALL
                .map(|phase| PhaseRegistry::new(phase, config.registry_capacity(phase))),
            pass: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        });

        let ambient = Arc::new(Scheduler::new(
            Arc::downgrade(&shared),
            "ambient",
            &shared.config.queues,
        ));

        debug!(
            target: "tickwork-core",
            time = ?now.time,
            unscaled_time = ?now.unscaled_time,
            "driver created"
        );
        Self { shared, ambient }
    }

    /// 为一个实体创建调度器。调度器在第一次入队时才注册到驱动器。
    pub fn scheduler(&self, name: &str) -> Scheduler {
        Scheduler::new(Arc::downgrade(&self.shared), name, &self.shared.config.queues)
    }

    /// 驱动器自带的调度器，供不属于任何实体的代码发起等待。
    pub fn ambient(&self) -> &SchedulerHandle {
        &self.ambient
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> FrameClock {
        self.shared.clock()
    }

    pub fn frame(&self) -> u64 {
        self.shared.clock().frame
    }

    pub fn fixed_step(&self) -> u64 {
        self.shared.clock().fixed_step
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// 该阶段注册表中的目标数。
    pub fn registered(&self, phase: Phase) -> usize {
        self.shared.registry(phase).len()
    }

    /// 把目标追加到阶段注册表末尾，返回其下标。
    pub fn register(&self, phase: Phase, target: Arc<dyn PhaseTarget>) -> Result<usize, DriverError> {
        if self.is_shut_down() {
            return Err(DriverError::ShutDown);
        }
        self.shared.registry(phase).lock().insert(target)
    }

    /// 以 swap-remove 方式移除目标，并修正被换入目标的下标。
    pub fn unregister(&self, phase: Phase, target: &dyn PhaseTarget) -> Result<(), DriverError> {
        let removed = self.shared.registry(phase).lock().remove(target)?;
        drop(removed);
        Ok(())
    }

    /// 刷新时间快照、推进帧计数，然后驱动 update 注册表。
    pub fn drive_update(&self) -> Result<PassReport, DriverError> {
        self.drive_phase(Phase::Update)
    }

    /// 驱动 late-update 注册表，使用本帧 update 的计数与时间。
    pub fn drive_late_update(&self) -> Result<PassReport, DriverError> {
        self.drive_phase(Phase::LateUpdate)
    }

    /// 推进固定步计数，然后驱动 fixed-update 注册表。
    pub fn drive_fixed_update(&self) -> Result<PassReport, DriverError> {
        self.drive_phase(Phase::FixedUpdate)
    }

    /// 一次宿主 tick：update 然后 late-update。
    pub fn tick(&self) -> Result<TickReport, DriverError> {
        let update = self.drive_update()?;
        let late_update = self.drive_late_update()?;
        Ok(TickReport {
            update,
            late_update,
        })
    }

    /// 关闭驱动器：清空所有注册表并丢弃已注册目标中未完成的延续。
    ///
    /// 之后的驱动调用返回 [`DriverError::ShutDown`]，新发起的等待会被立即丢弃。
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut released = 0;
        for registry in &self.shared.registries {
            let targets = registry.clear();
            for target in &targets {
                target.shutdown();
            }
            released += targets.len();
        }

        let clock = self.clock();
        info!(
            target: "tickwork-core",
            released,
            frame = clock.frame,
            fixed_step = clock.fixed_step,
            "driver shut down"
        );
    }

    fn drive_phase(&self, phase: Phase) -> Result<PassReport, DriverError> {
        let Some(_pass) = self.shared.pass.try_lock() else {
            return Err(DriverError::PassInProgress { phase });
        };
        if self.is_shut_down() {
            return Err(DriverError::ShutDown);
        }

        let clock = self.shared.begin_pass(phase);
        let registry = self.shared.registry(phase);
        let mut report = PassReport::new(phase, clock);

        // 不在持有注册表锁时调用目标：恢复动作可能发起新的等待、注册或注销目标。
        let mut index = 0;
        while let Some(target) = registry.get(index) {
            report.driven += 1;
            let idle = match panic::catch_unwind(AssertUnwindSafe(|| target.drive(phase, &clock))) {
                Ok(outcome) => {
                    report.resumed += outcome.resumed;
                    report.failed += outcome.failed;
                    outcome.is_empty()
                }
                Err(payload) => {
                    report.failed += 1;
                    warn!(
                        target: "tickwork-core",
                        scheduler = target.label(),
                        phase = phase.label(),
                        error = %panic_message(&*payload),
                        "phase target panicked"
                    );
                    false
                }
            };

            let mut entries = registry.lock();
            if entries.index_of(&*target) != Some(index) {
                // 目标在驱动期间被注销或移动，当前位置已换入一个尚未访问的目标。
                continue;
            }
            if idle && target.release_if_idle(phase) {
                let released = entries.remove_at(index);
                drop(entries);
                report.released += 1;
                trace!(
                    target: "tickwork-core",
                    scheduler = released.label(),
                    phase = phase.label(),
                    "idle target released"
                );
            } else {
                index += 1;
            }
        }

        report.remaining = registry.len();
        if report.failed > 0 {
            debug!(
                target: "tickwork-core",
                phase = phase.label(),
                frame = clock.frame,
                failed = report.failed,
                "pass finished with failures"
            );
        }
        Ok(report)
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new(DriverConfig::default(), ScaledClock::new())
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("clock", &self.clock())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
