//! 基于 tokio 定时器的宿主循环。
//!
//! update tick（update 随后 late-update）与 fixed tick 各用一个独立的
//! [`tokio::time::interval`]：update 落后时跳过错过的 tick，fixed 落后时连续补齐。

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::config::HostConfig;
use crate::sched::{Driver, DriverError, PassReport};

/// 宿主循环运行期间的累计统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub fixed_steps: u64,
    pub resumed: u64,
    pub failed: u64,
}

impl LoopStats {
    fn record(&mut self, report: &PassReport) {
        self.resumed += report.resumed as u64;
        self.failed += report.failed as u64;
    }
}

/// 停止宿主循环的句柄，可以跨线程克隆。
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

pub struct HostLoop {
    driver: Driver,
    config: HostConfig,
    stop: StopHandle,
}

impl HostLoop {
    pub fn new(driver: Driver, config: HostConfig) -> Self {
        Self {
            driver,
            config,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// 在当前 tokio 运行时上启动循环。
    pub fn spawn(self) -> JoinHandle<LoopStats> {
        tokio::spawn(self.run())
    }

    /// 运行到被停止或驱动器被关闭为止；退出时关闭驱动器。
    pub async fn run(self) -> LoopStats {
        let mut update = interval(self.config.update_interval());
        update.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fixed = interval(self.config.fixed_interval());
        fixed.set_missed_tick_behavior(MissedTickBehavior::Burst);

        info!(
            target: "tickwork-core",
            update_tick_ms = self.config.update_tick_ms,
            fixed_tick_ms = self.config.fixed_tick_ms,
            "host loop started"
        );

        let mut stats = LoopStats::default();
        while !self.stop.is_stopped() {
            tokio::select! {
                biased;
                _ = self.stop.notify.notified() => break,
                _ = fixed.tick() => match self.driver.drive_fixed_update() {
                    Ok(report) => {
                        stats.fixed_steps += 1;
                        stats.record(&report);
                    }
                    Err(DriverError::ShutDown) => break,
                    Err(err) => warn!(target: "tickwork-core", error = %err, "fixed update failed"),
                },
                _ = update.tick() => match self.driver.tick() {
                    Ok(report) => {
                        stats.ticks += 1;
                        stats.record(&report.update);
                        stats.record(&report.late_update);
                    }
                    Err(DriverError::ShutDown) => break,
                    Err(err) => warn!(target: "tickwork-core", error = %err, "update tick failed"),
                },
            }
        }

        self.driver.shutdown();
        info!(
            target: "tickwork-core",
            ticks = stats.ticks,
            fixed_steps = stats.fixed_steps,
            resumed = stats.resumed,
            failed = stats.failed,
            "host loop stopped"
        );
        stats
    }
}
