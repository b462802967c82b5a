use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, ensure};
use tracing::{debug, info, warn};

use tickwork_core::{
    Driver, Scheduler, SchedulerHandle,
    clock::ScaledClock,
    config::{DriverConfig, HostConfig},
    host::HostLoop,
    logger,
    sched::{OperationFlag, OperationRef, StepFn},
};

/// 演示持续的真实时间。
const DEMO_RUNTIME: Duration = Duration::from_secs(3);

/// 演示自身的 debug 日志需要 `RUST_LOG=tickwork-tpl=debug` 才会输出。
fn main() -> anyhow::Result<()> {
    logger::init()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;
    runtime.block_on(run(HostConfig::default()))
}

async fn run(config: HostConfig) -> anyhow::Result<()> {
    let clock = Arc::new(ScaledClock::with_scale(config.time_scale));
    let driver = Driver::new(DriverConfig::default(), Arc::clone(&clock));

    let host = HostLoop::new(driver.clone(), config);
    let stop = host.stop_handle();
    let host_task = host.spawn();

    let journal = Journal::default();
    let blinks = Arc::new(AtomicU32::new(0));

    let blinker = driver.scheduler("blinker");
    blink(blinker.handle(), Arc::clone(&blinks));

    let body = driver.scheduler("body");
    step_physics(body.handle(), 0);
    follow_camera(body.handle(), 0);

    let loader = driver.scheduler("loader");
    start_loading(&loader, journal.clone(), Arc::clone(&blinks));

    let agent = driver.scheduler("agent");
    let patrol_task = tokio::spawn(patrol(agent.handle()));

    // 1 秒真实时间后进入慢动作：缩放时间的等待随之变慢。
    let slow_clock = Arc::clone(&clock);
    driver
        .ambient()
        .seconds_unscaled(Duration::from_secs(1))
        .then(move || {
            slow_clock.set_time_scale(0.5);
            info!(target: "tickwork-tpl", "time scale set to 0.5");
        });

    driver
        .ambient()
        .seconds_unscaled(DEMO_RUNTIME)
        .then(move || stop.stop());

    let stats = host_task.await.context("宿主循环任务异常退出")?;
    let laps = patrol_task.await.context("巡逻任务异常退出")?;

    info!(
        target: "tickwork-tpl",
        ticks = stats.ticks,
        fixed_steps = stats.fixed_steps,
        resumed = stats.resumed,
        failed = stats.failed,
        blinks = blinks.load(Ordering::Acquire),
        laps,
        "demo finished"
    );
    for entry in journal.entries() {
        info!(target: "tickwork-tpl", "journal: {entry}");
    }

    ensure!(stats.ticks > 0, "宿主循环没有执行任何 update tick");
    drop((blinker, body, loader, agent));
    Ok(())
}

/// 记录演示中的关键事件，结束时统一输出。
#[derive(Clone, Default)]
struct Journal(Arc<StdMutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        match self.0.lock() {
            Ok(mut entries) => entries.push(entry.into()),
            Err(err) => warn!(target: "tickwork-tpl", error = %err, "journal mutex poisoned"),
        }
    }

    fn entries(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// 每 30 帧闪烁一次，无限链式等待。
fn blink(handle: SchedulerHandle, blinks: Arc<AtomicU32>) {
    let next = handle.clone();
    handle.updates(30).then(move || {
        let count = blinks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(target: "tickwork-tpl", scheduler = next.label(), count, "blink");
        blink(next, blinks);
    });
}

fn step_physics(handle: SchedulerHandle, step: u64) {
    let next = handle.clone();
    handle.next_fixed_update().then(move || {
        if step % 50 == 0 {
            debug!(target: "tickwork-tpl", scheduler = next.label(), step, "physics step");
        }
        step_physics(next, step + 1);
    });
}

fn follow_camera(handle: SchedulerHandle, frame: u64) {
    let next = handle.clone();
    handle.next_late_update().then(move || {
        if frame % 60 == 0 {
            debug!(target: "tickwork-tpl", scheduler = next.label(), frame, "camera follows body");
        }
        follow_camera(next, frame + 1);
    });
}

/// 资源加载流程：后台线程完成 → 倒计时 → 等待闪烁次数 → 定时检查。
fn start_loading(loader: &Scheduler, journal: Journal, blinks: Arc<AtomicU32>) {
    let flag = OperationFlag::new();
    let completer = flag.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(400));
        completer.complete();
    });

    let download = Arc::new(tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }));
    let downloaded = journal.clone();
    loader
        .operation(download)
        .then(move || downloaded.push("download task finished"));

    // 外部句柄已经释放的等待立即完成。
    let released = Arc::new(OperationFlag::new());
    let weak = OperationRef::weak(&released);
    drop(released);
    let noted = journal.clone();
    loader
        .operation_ref(weak)
        .then(move || noted.push("released operation resolved immediately"));

    let handle = loader.handle();
    let loaded = Arc::new(AtomicBool::new(false));
    loader.operation(Arc::new(flag)).then(move || {
        journal.push("assets loaded");
        loaded.store(true, Ordering::Release);

        let mut countdown = 5;
        let next = handle.clone();
        handle
            .custom(StepFn(move || {
                countdown -= 1;
                countdown > 0
            }))
            .then(move || {
                journal.push("warm-up countdown finished");
                wait_for_blinks(next, journal, blinks, loaded);
            });
    });
}

fn wait_for_blinks(
    handle: SchedulerHandle,
    journal: Journal,
    blinks: Arc<AtomicU32>,
    loaded: Arc<AtomicBool>,
) {
    let next = handle.clone();
    handle
        .until(move || loaded.load(Ordering::Acquire) && blinks.load(Ordering::Acquire) >= 3)
        .try_then(move || {
            journal.push("three blinks observed after loading");
            let checked = journal.clone();
            next.seconds(Duration::from_millis(500)).try_then(move || {
                checked.push("scaled half-second elapsed");
                Ok(())
            });
            Ok(())
        });
}

/// 异步巡逻：缩放时间 0.4 秒后在下一个固定步结算一圈，直到驱动器关闭。
async fn patrol(handle: SchedulerHandle) -> u32 {
    let mut laps = 0;
    while handle.seconds(Duration::from_millis(400)).await.is_ok()
        && handle.next_fixed_update().await.is_ok()
    {
        laps += 1;
        info!(target: "tickwork-tpl", scheduler = handle.label(), laps, "patrol lap finished");
    }
    debug!(target: "tickwork-tpl", laps, "patrol stopped with the driver");
    laps
}
