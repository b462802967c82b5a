//! 宿主时钟。
//!
//! 调度核心本身不读取系统时间：驱动器在初始化时以及每次 update 阶段开始时，
//! 通过注入的 [`HostClock`] 采样一次 [`TimeSnapshot`]。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::warn;

/// 一次时间采样。
///
/// 两个值都是“自宿主启动以来”的时长：
/// - `time`：缩放时间（受 time scale 影响）
/// - `unscaled_time`：真实流逝的时间
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSnapshot {
    pub time: Duration,
    pub unscaled_time: Duration,
}

impl TimeSnapshot {
    pub fn new(time: Duration, unscaled_time: Duration) -> Self {
        Self {
            time,
            unscaled_time,
        }
    }

    /// 缩放时间与未缩放时间相同的采样。
    pub fn uniform(elapsed: Duration) -> Self {
        Self::new(elapsed, elapsed)
    }
}

/// 由宿主提供的时钟。
pub trait HostClock: Send + Sync {
    fn now(&self) -> TimeSnapshot;
}

impl<C> HostClock for Arc<C>
where
    C: HostClock + ?Sized,
{
    fn now(&self) -> TimeSnapshot {
        (**self).now()
    }
}

/// 基于 [`Instant`] 的单调时钟，支持调整时间倍率。
///
/// 未缩放时间即真实流逝时间；缩放时间按“每次采样间的增量 × 当前倍率”累加，
/// 因此修改倍率只影响之后流逝的时间。
#[derive(Debug)]
pub struct ScaledClock {
    start: Instant,
    state: Mutex<ScaledState>,
}

#[derive(Debug)]
struct ScaledState {
    last_unscaled: Duration,
    scaled: Duration,
    scale: f64,
}

impl ScaledClock {
    pub fn new() -> Self {
        Self::with_scale(1.0)
    }

    /// 使用指定倍率创建时钟；非法倍率（负数、NaN、无穷）会回退为 `1.0`。
    pub fn with_scale(scale: f64) -> Self {
        let scale = if valid_scale(scale) {
            scale
        } else {
            warn!(target: "tickwork-core", scale, "invalid time scale, falling back to 1.0");
            1.0
        };

        Self {
            start: Instant::now(),
            state: Mutex::new(ScaledState {
                last_unscaled: Duration::ZERO,
                scaled: Duration::ZERO,
                scale,
            }),
        }
    }

    pub fn time_scale(&self) -> f64 {
        self.state.lock().scale
    }

    /// 修改时间倍率。非法倍率会被忽略并记录警告。
    pub fn set_time_scale(&self, scale: f64) {
        if !valid_scale(scale) {
            warn!(target: "tickwork-core", scale, "ignoring invalid time scale");
            return;
        }

        let mut state = self.state.lock();
        self.sample(&mut state);
        state.scale = scale;
    }

    fn sample(&self, state: &mut ScaledState) -> TimeSnapshot {
        let unscaled = self.start.elapsed();
        let delta = unscaled.saturating_sub(state.last_unscaled);
        state.last_unscaled = unscaled;
        state.scaled += delta.mul_f64(state.scale);
        TimeSnapshot::new(state.scaled, unscaled)
    }
}

impl Default for ScaledClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for ScaledClock {
    fn now(&self) -> TimeSnapshot {
        let mut state = self.state.lock();
        self.sample(&mut state)
    }
}

fn valid_scale(scale: f64) -> bool {
    scale.is_finite() && scale >= 0.0
}

/// 手动推进的时钟，用于测试以及确定性的宿主（例如回放）。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<TimeSnapshot>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(snapshot: TimeSnapshot) -> Self {
        Self {
            now: Mutex::new(snapshot),
        }
    }

    /// 同时推进缩放与未缩放时间。
    pub fn advance(&self, delta: Duration) {
        self.advance_split(delta, delta);
    }

    pub fn advance_split(&self, scaled: Duration, unscaled: Duration) {
        let mut now = self.now.lock();
        now.time += scaled;
        now.unscaled_time += unscaled;
    }

    pub fn set(&self, snapshot: TimeSnapshot) {
        *self.now.lock() = snapshot;
    }
}

impl HostClock for ManualClock {
    fn now(&self) -> TimeSnapshot {
        *self.now.lock()
    }
}
