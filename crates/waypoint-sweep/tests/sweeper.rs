//! Integration tests for the sweep runner.
//!
//! Timer tests run on a paused clock so `sleep` advances instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use waypoint_sweep::{PassError, PassResult, SweepConfig, SweepError, Sweeper};

fn counting_pass(
    counter: Arc<AtomicUsize>,
) -> impl Fn() -> std::future::Ready<PassResult> + Send + Sync + 'static {
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(1))
    }
}

// =========================================================================
// SweepConfig
// =========================================================================

#[test]
fn test_validated_clamps_tiny_interval() {
    let cfg = SweepConfig::every("t", Duration::from_millis(1)).validated();
    assert_eq!(cfg.interval, SweepConfig::MIN_INTERVAL);
}

#[test]
fn test_validated_keeps_normal_interval() {
    let cfg = SweepConfig::every("t", Duration::from_secs(15)).validated();
    assert_eq!(cfg.interval, Duration::from_secs(15));
}

// =========================================================================
// Timer
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_spawn_runs_one_pass_per_interval() {
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = Sweeper::new(SweepConfig::every("t", Duration::from_secs(15)))
        .spawn(counting_pass(counter.clone()));

    tokio::time::sleep(Duration::from_secs(14)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(32)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    let m = handle.metrics();
    assert_eq!(m.passes, 3);
    assert_eq!(m.evicted, 3);
    assert_eq!(m.failures, 0);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_spawn_jitter_delays_first_pass_only_within_bound() {
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = Sweeper::new(
        SweepConfig::every("t", Duration::from_secs(10)).with_jitter(Duration::from_secs(2)),
    )
    .spawn(counting_pass(counter.clone()));

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    handle.stop().await;
}

// =========================================================================
// On-demand passes
// =========================================================================

#[tokio::test]
async fn test_run_now_returns_after_pass_completes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = Sweeper::new(SweepConfig::every("t", Duration::from_secs(3600)))
        .spawn(counting_pass(counter.clone()));

    let evicted = handle.run_now().await.unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(handle.metrics().passes, 1);
    handle.stop().await;
}

#[tokio::test]
async fn test_run_now_failed_pass_does_not_stop_sweeper() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let handle = Sweeper::new(SweepConfig::every("t", Duration::from_secs(3600))).spawn(move || {
        let n = c.fetch_add(1, Ordering::SeqCst);
        async move {
            let result: PassResult = if n == 0 {
                Err("store unavailable".into())
            } else {
                Ok(0)
            };
            result
        }
    });

    let first = handle.run_now().await;
    assert!(matches!(first, Err(SweepError::Failed { .. })));
    assert_eq!(handle.run_now().await.unwrap(), 0);

    let m = handle.metrics();
    assert_eq!(m.failures, 1);
    assert_eq!(m.passes, 1);
    assert!(handle.is_running());
    handle.stop().await;
}

#[tokio::test]
async fn test_run_now_panicking_pass_is_contained() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let handle = Sweeper::new(SweepConfig::every("t", Duration::from_secs(3600))).spawn(move || {
        let n = c.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                panic!("corrupt entry");
            }
            Ok::<usize, PassError>(2)
        }
    });

    assert!(matches!(
        handle.run_now().await,
        Err(SweepError::Panicked { .. })
    ));
    assert_eq!(handle.run_now().await.unwrap(), 2);
    assert_eq!(handle.metrics().failures, 1);
    handle.stop().await;
}

#[tokio::test]
async fn test_stop_ends_task() {
    let counter = Arc::new(AtomicUsize::new(0));
    let handle = Sweeper::new(SweepConfig::every("cache", Duration::from_secs(30)))
        .spawn(counting_pass(counter));
    assert_eq!(handle.name(), "cache");
    assert!(handle.is_running());
    handle.stop().await;
}
