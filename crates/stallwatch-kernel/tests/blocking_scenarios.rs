//! Timing scenarios against a real alarm thread and a current-thread runtime.

use stallwatch_kernel::{
    ActivityTracker, AlarmSource, BlockingDetector, InterruptPolicy, ThreadAlarm, checkpoint,
};
use stallwatch_types::{AlarmInterrupt, InterruptValue, Interrupted};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_millis(250);

/// Spin on the runtime thread without ever yielding.
fn busysleep(duration: Duration) {
    let target = Instant::now() + duration;
    while Instant::now() < target {
        std::hint::spin_loop();
    }
}

/// Spin for `duration`, stopping at the first interrupt.
fn busy_with_checkpoints(duration: Duration) -> Result<(), Interrupted> {
    let target = Instant::now() + duration;
    while Instant::now() < target {
        checkpoint()?;
    }
    Ok(())
}

fn detector(policy: InterruptPolicy, aggressive: bool) -> BlockingDetector {
    BlockingDetector::builder()
        .timeout(TIMEOUT)
        .interrupt(policy)
        .aggressive(aggressive)
        .build()
        .unwrap()
}

#[tokio::test]
async fn triggered_when_blocking() {
    let wd = detector(InterruptPolicy::None, true);
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    assert_eq!(wd.triggers(), 0);
    busysleep(Duration::from_millis(100));
    assert_eq!(wd.triggers(), 0);
    busysleep(Duration::from_millis(500));
    assert!(wd.triggers() >= 1);

    handle.abort();
}

#[tokio::test]
async fn interrupt_raised_inside_busy_loop() {
    let wd = detector(InterruptPolicy::alarm(), true);
    let tracker = wd.tracker().clone();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    let started = Instant::now();
    let outcome = tracker
        .monitor("busy", async { busy_with_checkpoints(Duration::from_secs(1)) })
        .await;
    let elapsed = started.elapsed();

    let interrupted = outcome.unwrap_err();
    let alarm = interrupted.downcast_ref::<AlarmInterrupt>().unwrap();
    assert_eq!(alarm.message(), "blocking detected after timeout=0.25");
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
    assert_eq!(wd.triggers(), 1);

    handle.abort();
}

#[tokio::test]
async fn not_triggered_when_cooperating() {
    let wd = detector(InterruptPolicy::alarm(), true);
    let tracker = wd.tracker().clone();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    let outcome = tracker
        .monitor("sleeper", tokio::time::sleep(Duration::from_millis(500)))
        .await;
    assert!(outcome.is_ok());
    assert_eq!(wd.triggers(), 0);

    handle.abort();
}

#[tokio::test]
async fn cooperating_task_never_triggers_over_many_cycles() {
    let wd = detector(InterruptPolicy::alarm(), true);
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    for _ in 0..10 {
        busysleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(wd.triggers(), 0);

    handle.abort();
}

#[tokio::test]
async fn aggressive_mode_logs_once_per_window() {
    let wd = detector(InterruptPolicy::None, true);
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    busysleep(Duration::from_secs(1));
    let triggers = wd.triggers();
    assert!((3..=4).contains(&triggers), "{triggers}");

    handle.abort();
}

#[tokio::test]
async fn passive_mode_logs_once_per_block() {
    let wd = BlockingDetector::builder()
        .timeout(Duration::from_millis(200))
        .interrupt(InterruptPolicy::None)
        .aggressive(false)
        .build()
        .unwrap();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    busysleep(Duration::from_millis(800));
    assert_eq!(wd.triggers(), 1);

    // Yielding lets the detector re-arm; the next block is reported again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    busysleep(Duration::from_millis(400));
    assert_eq!(wd.triggers(), 2);

    handle.abort();
}

#[tokio::test]
async fn swallowed_interrupts_still_end_the_task() {
    let wd = detector(InterruptPolicy::alarm(), true);
    let tracker = wd.tracker().clone();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    let swallowed = Arc::new(AtomicUsize::new(0));
    let counter = swallowed.clone();
    let outcome = tracker
        .monitor("stubborn", async move {
            let target = Instant::now() + Duration::from_secs(1);
            while Instant::now() < target {
                if checkpoint().is_err() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
            "ran to the end"
        })
        .await;

    assert!(outcome.is_err());
    assert!(swallowed.load(Ordering::SeqCst) > 0);
    assert!(wd.triggers() >= 3);

    handle.abort();
}

#[tokio::test]
async fn fixed_interrupt_is_delivered_as_is() {
    let value: InterruptValue = Arc::new(AlarmInterrupt::new("operator stop"));
    let wd = detector(InterruptPolicy::Fixed(value.clone()), true);
    let tracker = wd.tracker().clone();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    let interrupted = tracker
        .monitor("busy", async { busy_with_checkpoints(Duration::from_secs(1)) })
        .await
        .unwrap_err();
    assert!(Arc::ptr_eq(interrupted.value(), &value));

    handle.abort();
}

#[tokio::test]
async fn disabled_policy_only_logs() {
    let wd = detector(InterruptPolicy::None, true);
    let tracker = wd.tracker().clone();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    let outcome = tracker
        .monitor("busy", async { busy_with_checkpoints(Duration::from_millis(600)) })
        .await;
    assert!(matches!(outcome, Ok(Ok(()))));
    assert!(wd.triggers() >= 2);

    handle.abort();
}

#[tokio::test]
async fn spinning_without_checkpoints_is_interrupted_at_poll_boundary() {
    let wd = detector(InterruptPolicy::alarm(), false);
    let tracker = wd.tracker().clone();
    let handle = wd.clone().spawn();
    tokio::task::yield_now().await;

    let outcome = tracker
        .monitor("oblivious", async {
            busysleep(Duration::from_millis(400));
            "finished"
        })
        .await;
    assert!(outcome.is_err());
    assert_eq!(wd.triggers(), 1);

    handle.abort();
}

#[tokio::test]
async fn stopping_the_detector_disarms_the_alarm() {
    let alarm = Arc::new(ThreadAlarm::new().unwrap());
    let wd = BlockingDetector::builder()
        .timeout(TIMEOUT)
        .alarm(alarm.clone())
        .tracker(ActivityTracker::new())
        .build()
        .unwrap();
    let handle = wd.spawn();
    tokio::task::yield_now().await;
    assert!(alarm.is_armed());

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert!(!alarm.is_armed());
}
