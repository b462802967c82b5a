use super::*;
use crate::clock::{ManualClock, TimeSnapshot};
use crate::sched::{OperationFlag, OperationRef, PollOutcome, RegistrySlot};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

fn manual_driver() -> (Driver, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    (Driver::new(DriverConfig::default(), Arc::clone(&clock)), clock)
}

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&hits);
    (hits, move || {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

fn hits(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[test]
fn counters_start_at_one_and_advance_per_pass() {
    let (driver, _clock) = manual_driver();
    assert_eq!(driver.frame(), 1);
    assert_eq!(driver.fixed_step(), 1);

    let report = driver.tick().expect("tick should succeed");
    assert_eq!(report.update.clock.frame, 2);
    assert_eq!(report.late_update.clock.frame, 2, "late-update 与 update 共享同一帧");
    assert_eq!(driver.frame(), 2);
    assert_eq!(driver.fixed_step(), 1, "update tick 不推进固定步");

    driver.drive_fixed_update().expect("fixed update should succeed");
    driver.drive_fixed_update().expect("fixed update should succeed");
    assert_eq!(driver.fixed_step(), 3);
    assert_eq!(driver.frame(), 2);
}

#[test]
fn frame_wait_fires_exactly_k_passes_later() {
    for k in 1..=4u64 {
        let (driver, _clock) = manual_driver();
        let entity = driver.scheduler("frames");
        for _ in 0..3 {
            driver.tick().expect("tick should succeed");
        }

        let issued_at = driver.frame();
        let (fired, resume) = counter();
        entity.updates(k).then(resume);

        for pass in 1..=k {
            let report = driver.drive_update().expect("update should succeed");
            let expected = usize::from(pass == k);
            assert_eq!(hits(&fired), expected, "k = {k}，第 {pass} 次遍历");
            if pass == k {
                assert_eq!(report.clock.frame, issued_at + k);
            }
        }

        driver.drive_update().expect("update should succeed");
        assert_eq!(hits(&fired), 1, "恢复动作只执行一次");
    }
}

#[test]
fn late_wait_fires_in_late_phase_only() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("late");
    let (fired, resume) = counter();
    entity.next_late_update().then(resume);

    assert_eq!(entity.registry_index(Phase::LateUpdate), Some(0));
    assert_eq!(entity.registry_index(Phase::Update), None);

    driver.drive_update().expect("update should succeed");
    assert_eq!(hits(&fired), 0);
    driver.drive_late_update().expect("late update should succeed");
    assert_eq!(hits(&fired), 1);
}

#[test]
fn late_wait_issued_during_update_fires_in_same_tick() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("camera");
    let log: Arc<StdMutex<Vec<(&str, u64)>>> = Arc::new(StdMutex::new(Vec::new()));

    let handle = entity.handle();
    let record = Arc::clone(&log);
    let observer = driver.clone();
    entity.next_update().then(move || {
        let first = Arc::clone(&record);
        let first_observer = observer.clone();
        let chain = handle.clone();
        handle.next_late_update().then(move || {
            first.lock().unwrap().push(("late-1", first_observer.frame()));
            let chained = Arc::clone(&first);
            chain.next_late_update().then(move || {
                chained.lock().unwrap().push(("chained", first_observer.frame()));
            });
        });
        handle.late_updates(2).then(move || {
            record.lock().unwrap().push(("late-2", observer.frame()));
        });
    });

    let report = driver.tick().expect("tick should succeed");
    assert_eq!(report.late_update.resumed, 1);
    assert_eq!(
        *log.lock().unwrap(),
        vec![("late-1", 2)],
        "update 中发起的 late 等待在同一 tick 的 late-update 完成"
    );

    driver.tick().expect("tick should succeed");
    let mut entries = log.lock().unwrap().clone();
    entries.sort();
    assert_eq!(entries, vec![("chained", 3), ("late-1", 2), ("late-2", 3)]);
}

#[test]
fn fixed_wait_follows_fixed_steps() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("fixed");
    let (fired, resume) = counter();
    entity.fixed_updates(2).then(resume);

    for _ in 0..5 {
        driver.tick().expect("tick should succeed");
    }
    assert_eq!(hits(&fired), 0, "update tick 不影响固定步等待");

    driver.drive_fixed_update().expect("fixed update should succeed");
    assert_eq!(hits(&fired), 0);
    driver.drive_fixed_update().expect("fixed update should succeed");
    assert_eq!(hits(&fired), 1);
}

#[test]
fn time_waits_read_snapshot_taken_at_update() {
    let (driver, clock) = manual_driver();
    let entity = driver.scheduler("timed");
    let (scaled, resume_scaled) = counter();
    let (unscaled, resume_unscaled) = counter();
    entity.seconds(Duration::from_secs(2)).then(resume_scaled);
    entity
        .seconds_unscaled(Duration::from_secs(2))
        .then(resume_unscaled);

    // 时间倍率 0.5：真实 2 秒只对应缩放 1 秒。
    clock.advance_split(Duration::from_secs(1), Duration::from_secs(2));
    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&scaled), 0);
    assert_eq!(hits(&unscaled), 1);

    clock.advance_split(Duration::from_secs(1), Duration::from_secs(2));
    assert_eq!(hits(&scaled), 0, "时间只在 update 开始时采样");
    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&scaled), 1);
}

#[test]
fn predicate_fires_on_fifth_tick() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("predicate");

    let ticks = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&ticks);
    let fired_at = Arc::new(StdMutex::new(None));
    let record = Arc::clone(&fired_at);
    let seen = Arc::clone(&ticks);

    entity
        .until(move || observed.load(Ordering::SeqCst) >= 5)
        .then(move || {
            *record.lock().unwrap() = Some(seen.load(Ordering::SeqCst));
        });

    for _ in 0..8 {
        ticks.fetch_add(1, Ordering::SeqCst);
        driver.tick().expect("tick should succeed");
    }
    assert_eq!(*fired_at.lock().unwrap(), Some(5));
}

#[test]
fn while_true_completes_when_predicate_turns_false() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("while");
    let flag = Arc::new(AtomicBool::new(true));
    let held = Arc::clone(&flag);
    let (fired, resume) = counter();
    entity.while_true(move || held.load(Ordering::SeqCst)).then(resume);

    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&fired), 0);
    flag.store(false, Ordering::SeqCst);
    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&fired), 1);
}

#[test]
fn operation_waits() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("operations");

    let (absent, resume_absent) = counter();
    entity.operation_ref(OperationRef::Absent).then(resume_absent);

    let flag = Arc::new(OperationFlag::new());
    let (flagged, resume_flagged) = counter();
    entity.operation(Arc::clone(&flag)).then(resume_flagged);

    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&absent), 1, "缺失的外部操作在首次轮询时完成");
    assert_eq!(hits(&flagged), 0);

    flag.complete();
    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&flagged), 1);
}

#[test]
fn custom_step_source_completes_when_exhausted() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("custom");
    let (fired, resume) = counter();
    entity.custom(0..3).then(resume);

    for _ in 0..3 {
        driver.tick().expect("tick should succeed");
    }
    assert_eq!(hits(&fired), 0);
    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&fired), 1);
}

#[test]
fn idle_scheduler_is_released_and_reregistered_lazily() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("lazy");
    assert_eq!(driver.registered(Phase::Update), 0, "创建调度器时不注册");

    entity.next_update().then(|| {});
    entity.next_update().then(|| {});
    assert_eq!(driver.registered(Phase::Update), 1, "重复入队只注册一次");
    assert!(entity.has_pending(Phase::Update));

    let report = driver.drive_update().expect("update should succeed");
    assert_eq!(report.resumed, 2);
    assert_eq!(report.released, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(entity.registry_index(Phase::Update), None);
    assert!(!entity.has_pending(Phase::Update));

    entity.next_update().then(|| {});
    assert_eq!(entity.registry_index(Phase::Update), Some(0));
}

#[test]
fn deactivate_stops_delivery_and_activate_resumes() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("toggled");
    let (fired, resume) = counter();
    entity.updates(2).then(resume);

    entity.deactivate();
    assert!(!entity.is_active());
    assert_eq!(driver.registered(Phase::Update), 0);

    for _ in 0..4 {
        driver.tick().expect("tick should succeed");
    }
    assert_eq!(hits(&fired), 0, "停用期间不应投递");
    assert_eq!(entity.pending(Phase::Update), 1, "停用不丢弃延续");

    entity.next_late_update().then(|| {});
    assert_eq!(driver.registered(Phase::LateUpdate), 0, "停用期间入队不注册");

    entity.activate();
    assert_eq!(driver.registered(Phase::Update), 1);
    assert_eq!(driver.registered(Phase::LateUpdate), 1);

    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&fired), 1, "目标帧早已过去，激活后的第一次遍历即完成");
}

#[test]
fn dropping_scheduler_discards_pending_work() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("doomed");
    let handle = entity.handle();
    let (fired, resume) = counter();
    entity.next_update().then(resume);
    entity.next_fixed_update().then(|| {});
    assert_eq!(driver.registered(Phase::Update), 1);

    drop(entity);
    assert_eq!(driver.registered(Phase::Update), 0);
    assert_eq!(driver.registered(Phase::FixedUpdate), 0);

    let (late, resume_late) = counter();
    handle.next_update().then(resume_late);
    assert_eq!(driver.registered(Phase::Update), 0, "已销毁的调度器不会再注册");

    driver.tick().expect("tick should succeed");
    assert_eq!(hits(&fired), 0);
    assert_eq!(hits(&late), 0);
}

#[test]
fn resumption_failures_are_counted_not_fatal() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("faulty");
    let (fired, resume) = counter();

    entity
        .next_update()
        .try_then(|| Err(anyhow::anyhow!("resumption failed on purpose")));
    entity
        .next_update()
        .then(|| panic!("resumption panicked on purpose"));
    entity.next_update().then(resume);

    let report = driver.drive_update().expect("update should succeed");
    assert_eq!(report.resumed, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(hits(&fired), 1);
}

#[test]
fn resumptions_may_chain_new_waits() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("chain");
    let log = Arc::new(StdMutex::new(Vec::new()));

    let handle = entity.handle();
    let first = Arc::clone(&log);
    entity.next_update().then(move || {
        first.lock().unwrap().push("first");
        let second = Arc::clone(&first);
        handle.next_update().then(move || {
            second.lock().unwrap().push("second");
        });
    });

    driver.tick().expect("tick should succeed");
    assert_eq!(*log.lock().unwrap(), vec!["first"]);
    assert_eq!(
        entity.registry_index(Phase::Update),
        Some(0),
        "链式等待让调度器留在注册表中"
    );

    driver.tick().expect("tick should succeed");
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn resumption_may_drop_other_schedulers_mid_pass() {
    let (driver, _clock) = manual_driver();
    let victims: Arc<StdMutex<Vec<Scheduler>>> = Arc::new(StdMutex::new(Vec::new()));
    let (fired, _) = counter();

    let killer = driver.scheduler("killer");
    for i in 0..4 {
        let victim = driver.scheduler(&format!("victim-{i}"));
        let victim_hits = Arc::clone(&fired);
        victim.next_update().then(move || {
            victim_hits.fetch_add(1, Ordering::SeqCst);
        });
        victims.lock().unwrap().push(victim);
    }

    let doomed = Arc::clone(&victims);
    killer.next_update().then(move || {
        doomed.lock().unwrap().clear();
    });
    assert_eq!(killer.registry_index(Phase::Update), Some(4));

    // victim-0 释放后 killer 被换到 0 号位，随后销毁其余 victim。
    let report = driver.drive_update().expect("update should succeed");
    assert_eq!(hits(&fired), 1);
    assert_eq!(report.resumed, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(driver.registered(Phase::Update), 0);
    assert_eq!(killer.registry_index(Phase::Update), None);
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn resumption_dropping_its_own_scheduler_releases_pending_waits() {
    let (driver, _clock) = manual_driver();
    let owner: Arc<StdMutex<Option<Scheduler>>> = Arc::new(StdMutex::new(None));
    let entity = driver.scheduler("self-destruct");

    // 未完成的延续捕获自身调度器的句柄：若被放回队列就会形成引用环。
    let released = Arc::new(AtomicBool::new(false));
    let flag = DropFlag(Arc::clone(&released));
    let chained = entity.handle();
    let (fired, resume) = counter();
    entity.updates(100).then(move || {
        let _keep = (&flag, &chained);
        resume();
    });

    let slot = Arc::clone(&owner);
    entity.next_update().then(move || {
        let taken = slot.lock().unwrap().take();
        drop(taken);
    });
    *owner.lock().unwrap() = Some(entity);

    let report = driver.drive_update().expect("update should succeed");
    assert_eq!(report.resumed, 1);
    assert!(owner.lock().unwrap().is_none());
    assert!(released.load(Ordering::SeqCst), "销毁后未完成的延续应被析构");
    assert_eq!(hits(&fired), 0);
    assert_eq!(driver.registered(Phase::Update), 0);

    for _ in 0..3 {
        driver.tick().expect("tick should succeed");
    }
    assert_eq!(hits(&fired), 0);
}

#[test]
fn scheduler_created_mid_pass_keeps_registry_consistent() {
    let (driver, _clock) = manual_driver();
    let spawned: Arc<StdMutex<Vec<Scheduler>>> = Arc::new(StdMutex::new(Vec::new()));
    let (fired, _) = counter();

    let spawner = driver.scheduler("spawner");
    let spawning_driver = driver.clone();
    let sink = Arc::clone(&spawned);
    let child_hits = Arc::clone(&fired);
    spawner.next_update().then(move || {
        let child = spawning_driver.scheduler("child");
        child.updates(1).then(move || {
            child_hits.fetch_add(1, Ordering::SeqCst);
        });
        sink.lock().unwrap().push(child);
    });

    driver.drive_update().expect("update should succeed");
    assert_eq!(hits(&fired), 0, "新调度器的帧等待从下一帧开始计算");
    let children = spawned.lock().unwrap();
    assert_eq!(children[0].registry_index(Phase::Update), Some(0));
    drop(children);

    driver.drive_update().expect("update should succeed");
    assert_eq!(hits(&fired), 1);
}

#[test]
fn reentrant_drive_is_rejected() {
    let (driver, _clock) = manual_driver();
    let outcome = Arc::new(StdMutex::new(None));
    let record = Arc::clone(&outcome);
    let inner = driver.clone();
    driver.ambient().next_update().then(move || {
        *record.lock().unwrap() = Some(inner.tick().map(|_| ()));
    });

    driver.tick().expect("tick should succeed");
    assert_eq!(
        *outcome.lock().unwrap(),
        Some(Err(DriverError::PassInProgress {
            phase: Phase::Update
        }))
    );
}

struct ManualTarget {
    slots: [RegistrySlot; 3],
    remaining: AtomicUsize,
    panics: AtomicBool,
    driven: AtomicUsize,
}

impl ManualTarget {
    fn new(remaining: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Default::default(),
            remaining: AtomicUsize::new(remaining),
            panics: AtomicBool::new(false),
            driven: AtomicUsize::new(0),
        })
    }
}

impl PhaseTarget for ManualTarget {
    fn slot(&self, phase: Phase) -> &RegistrySlot {
        &self.slots[phase.index()]
    }

    fn drive(&self, _phase: Phase, _clock: &FrameClock) -> PollOutcome {
        self.driven.fetch_add(1, Ordering::SeqCst);
        if self.panics.load(Ordering::SeqCst) {
            panic!("manual target exploded");
        }
        let remaining = self
            .remaining
            .load(Ordering::SeqCst)
            .saturating_sub(1);
        self.remaining.store(remaining, Ordering::SeqCst);
        PollOutcome {
            resumed: 1,
            failed: 0,
            remaining,
        }
    }

    fn label(&self) -> &str {
        "manual"
    }
}

#[test]
fn explicit_register_and_unregister() {
    let (driver, _clock) = manual_driver();
    let target = ManualTarget::new(10);

    let index = driver
        .register(Phase::FixedUpdate, target.clone())
        .expect("首次注册应成功");
    assert_eq!(index, 0);
    assert_eq!(
        driver.register(Phase::FixedUpdate, target.clone()),
        Err(DriverError::AlreadyRegistered {
            phase: Phase::FixedUpdate,
            index: 0
        })
    );
    assert_eq!(driver.registered(Phase::FixedUpdate), 1);

    driver
        .unregister(Phase::FixedUpdate, &*target)
        .expect("注销应成功");
    assert_eq!(
        driver.unregister(Phase::FixedUpdate, &*target),
        Err(DriverError::NotRegistered {
            phase: Phase::FixedUpdate
        })
    );
    assert_eq!(driver.registered(Phase::FixedUpdate), 0);
}

#[test]
fn manual_target_is_released_when_idle() {
    let (driver, _clock) = manual_driver();
    let target = ManualTarget::new(2);
    driver
        .register(Phase::Update, target.clone())
        .expect("首次注册应成功");

    let first = driver.drive_update().expect("update should succeed");
    assert_eq!(first.released, 0);
    let second = driver.drive_update().expect("update should succeed");
    assert_eq!(second.released, 1);
    assert_eq!(target.driven.load(Ordering::SeqCst), 2);
    assert_eq!(target.slot(Phase::Update).get(), None);
}

#[test]
fn panicking_target_is_isolated_and_kept() {
    let (driver, _clock) = manual_driver();
    let bad = ManualTarget::new(5);
    bad.panics.store(true, Ordering::SeqCst);
    let good = ManualTarget::new(5);
    driver.register(Phase::Update, bad.clone()).expect("注册应成功");
    driver.register(Phase::Update, good.clone()).expect("注册应成功");

    let report = driver.drive_update().expect("update should succeed");
    assert_eq!(report.driven, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(good.driven.load(Ordering::SeqCst), 1, "其它目标照常驱动");
    assert_eq!(driver.registered(Phase::Update), 2);
}

#[test]
fn shutdown_rejects_further_driving() {
    let (driver, _clock) = manual_driver();
    let entity = driver.scheduler("late");
    let (fired, resume) = counter();
    entity.updates(5).then(resume);

    driver.shutdown();
    assert!(driver.is_shut_down());
    assert_eq!(driver.registered(Phase::Update), 0);
    assert_eq!(entity.pending(Phase::Update), 0, "关闭时丢弃已注册目标的延续");

    assert_eq!(driver.tick().map(|_| ()), Err(DriverError::ShutDown));
    assert_eq!(
        driver.drive_fixed_update().map(|_| ()),
        Err(DriverError::ShutDown)
    );
    assert_eq!(
        driver.register(Phase::Update, ManualTarget::new(1)),
        Err(DriverError::ShutDown)
    );

    entity.next_update().then(|| {});
    assert_eq!(entity.pending(Phase::Update), 0, "关闭后发起的等待被立即丢弃");
    assert_eq!(hits(&fired), 0);

    driver.shutdown();
}

#[test]
fn drivers_are_independent() {
    let (first, _) = manual_driver();
    let (second, _) = manual_driver();
    let a = first.scheduler("a");
    let b = second.scheduler("b");
    let (a_fired, resume_a) = counter();
    let (b_fired, resume_b) = counter();
    a.next_update().then(resume_a);
    b.next_update().then(resume_b);

    first.tick().expect("tick should succeed");
    assert_eq!(hits(&a_fired), 1);
    assert_eq!(hits(&b_fired), 0);
    assert_eq!(second.frame(), 1);

    second.tick().expect("tick should succeed");
    assert_eq!(hits(&b_fired), 1);
}

#[test]
fn driver_samples_clock_at_creation() {
    let clock = ManualClock::starting_at(TimeSnapshot::new(
        Duration::from_secs(7),
        Duration::from_secs(9),
    ));
    let driver = Driver::new(DriverConfig::default(), clock);
    let now = driver.clock();
    assert_eq!(now.time, Duration::from_secs(7));
    assert_eq!(now.unscaled_time, Duration::from_secs(9));
}

#[test]
fn error_messages() {
    assert_eq!(DriverError::ShutDown.to_string(), "驱动器已关闭");
    assert_eq!(
        DriverError::NotRegistered {
            phase: Phase::LateUpdate
        }
        .to_string(),
        "目标未注册在 late_update 阶段"
    );
}
