use std::time::Duration;

use crate::sched::{Phase, WaitKind};

/// 单个调度器内各延续队列的初始容量。
///
/// 容量只影响预分配，不限制队列长度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacities {
    /// update 阶段的帧等待。
    pub frame: usize,
    pub time: usize,
    pub unscaled_time: usize,
    pub predicate: usize,
    pub custom: usize,
    pub operation: usize,
    /// late-update 阶段的帧等待。
    pub late_frame: usize,
    pub fixed_step: usize,
}

impl QueueCapacities {
    /// update 阶段中指定等待种类的队列容量。
    pub fn update_capacity(&self, kind: WaitKind) -> usize {
        match kind {
            WaitKind::Frame => self.frame,
            WaitKind::Time => self.time,
            WaitKind::UnscaledTime => self.unscaled_time,
            WaitKind::Predicate => self.predicate,
            WaitKind::Custom => self.custom,
            WaitKind::Operation => self.operation,
            WaitKind::FixedStep => self.fixed_step,
        }
    }
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            frame: 128,
            time: 64,
            unscaled_time: 32,
            predicate: 32,
            custom: 16,
            operation: 16,
            late_frame: 32,
            fixed_step: 32,
        }
    }
}

/// 驱动器配置。
///
/// - `queues`：每个调度器创建时使用的队列容量
/// - `update_registry` / `late_update_registry` / `fixed_update_registry`：各阶段注册表的初始容量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub queues: QueueCapacities,
    pub update_registry: usize,
    pub late_update_registry: usize,
    pub fixed_update_registry: usize,
}

impl DriverConfig {
    /// 返回指定阶段注册表的初始容量。
    pub fn registry_capacity(&self, phase: Phase) -> usize {
        match phase {
            Phase::Update => self.update_registry,
            Phase::LateUpdate => self.late_update_registry,
            Phase::FixedUpdate => self.fixed_update_registry,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queues: QueueCapacities::default(),
            update_registry: 128,
            late_update_registry: 32,
            fixed_update_registry: 32,
        }
    }
}

/// 宿主循环配置。
///
/// - `update_tick_ms`：update（随后紧跟 late-update）的 tick 间隔（毫秒）
/// - `fixed_tick_ms`：fixed-update 的 tick 间隔（毫秒），与 update 节奏相互独立
/// - `time_scale`：缩放时间的初始倍率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostConfig {
    pub update_tick_ms: u64,
    pub fixed_tick_ms: u64,
    pub time_scale: f64,
}

impl HostConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_tick_ms.max(1))
    }

    pub fn fixed_interval(&self) -> Duration {
        Duration::from_millis(self.fixed_tick_ms.max(1))
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            update_tick_ms: 16,
            fixed_tick_ms: 20,
            time_scale: 1.0,
        }
    }
}
