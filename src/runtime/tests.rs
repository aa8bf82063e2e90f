use crate::runtime::{spawn, Runtime};
use crate::task::test_support;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn zero_worker_count_defaults_to_cores() -> Result<()> {
    let runtime = Runtime::new(0)?;
    let cores = thread::available_parallelism().map_or(1, usize::from);
    assert_eq!(runtime.worker_count(), cores.max(1));
    assert!(!runtime.is_running());
    Ok(())
}

#[test]
fn explicit_worker_count_is_respected() -> Result<()> {
    let runtime = Runtime::new(3)?;
    assert_eq!(runtime.worker_count(), 3);
    Ok(())
}

#[test]
fn stop_from_within_returns_promptly() -> Result<()> {
    let _serial = test_support::serial_guard();

    let runtime = Runtime::new(1)?;
    let stopper = runtime.stopper();

    runtime.dispatch(move || {
        let stopper = stopper.clone();
        async move { stopper.stop() }
    });

    let begin = Instant::now();
    runtime.run();

    // One loop-iteration period plus slack.
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert!(!runtime.is_running());
    Ok(())
}

#[test]
fn three_level_await_chain() -> Result<()> {
    let _serial = test_support::serial_guard();

    let runtime = Runtime::new(1)?;
    let stopper = runtime.stopper();
    let ok = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&ok);

    let (allocated_before, released_before) = test_support::frame_counts();

    runtime.dispatch(move || {
        let stopper = stopper.clone();
        let ok = Arc::clone(&ok);
        async move {
            let a = spawn(async {
                let b = spawn(async {
                    let c = spawn(async { 42 });
                    c.await
                });
                b.await
            });

            if a.await == 42 {
                ok.store(true, Relaxed);
            }
            stopper.stop();
        }
    });

    runtime.run();
    assert!(observed.load(Relaxed), "chain result did not arrive");

    // Root + A + B + C, all released: no frame outlives the pool.
    let (allocated, released) = test_support::frame_counts();
    assert_eq!(allocated - allocated_before, 4);
    assert_eq!(released - released_before, 4);
    Ok(())
}

#[test]
fn task_results_flow_through_handles() -> Result<()> {
    let _serial = test_support::serial_guard();

    async fn answer() -> i32 {
        42
    }

    async fn greeting() -> String {
        let value = spawn(answer()).await;
        assert_eq!(value, 42);
        "Hello, world!".to_string()
    }

    let runtime = Runtime::new(1)?;
    let stopper = runtime.stopper();
    let ok = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&ok);

    runtime.dispatch(move || {
        let stopper = stopper.clone();
        let ok = Arc::clone(&ok);
        async move {
            let text = spawn(greeting()).await;
            let value = spawn(answer()).await;
            let again = spawn(greeting()).await;

            if text == "Hello, world!" && value == 42 && again == "Hello, world!" {
                ok.store(true, Relaxed);
            }
            stopper.stop();
        }
    });

    runtime.run();
    assert!(observed.load(Relaxed));
    Ok(())
}

#[test]
fn dispatch_seeds_every_worker() -> Result<()> {
    let _serial = test_support::serial_guard();

    let runtime = Runtime::new(2)?;
    let stopper = runtime.stopper();
    let started = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&started);

    runtime.dispatch(move || {
        let stopper = stopper.clone();
        let started = Arc::clone(&started);
        async move {
            started.fetch_add(1, Relaxed);

            // Hold the pool open until the sibling worker's task ran too;
            // awaiting a fresh task yields one loop iteration at a time.
            while started.load(Relaxed) < 2 {
                spawn(async {}).await;
            }
            stopper.stop();
        }
    });

    runtime.run();
    assert_eq!(observed.load(Relaxed), 2);
    Ok(())
}

#[test]
fn sibling_task_runs_on_the_same_worker() -> Result<()> {
    let _serial = test_support::serial_guard();

    let runtime = Runtime::new(1)?;
    let stopper = runtime.stopper();
    let ok = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&ok);

    runtime.dispatch(move || {
        let stopper = stopper.clone();
        let ok = Arc::clone(&ok);
        async move {
            let scheduled_on = thread::current().id();
            let ran_on = spawn(async { thread::current().id() }).await;

            if ran_on == scheduled_on {
                ok.store(true, Relaxed);
            }
            stopper.stop();
        }
    });

    runtime.run();
    assert!(observed.load(Relaxed), "sibling migrated off its worker");
    Ok(())
}

#[test]
fn worker_thread_ids_surface_while_running() -> Result<()> {
    let _serial = test_support::serial_guard();

    let runtime = Runtime::new(1)?;
    let stopper = runtime.stopper();

    assert!(runtime.worker_thread_ids().iter().all(|&id| id == 0));

    thread::scope(|scope| {
        scope.spawn(|| {
            // Spin until the worker has published its tid, then shut down.
            loop {
                let ids = runtime.worker_thread_ids();
                if !ids.is_empty() && ids.iter().all(|&id| id != 0) {
                    stopper.stop();
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });

        runtime.run();
    });

    assert!(runtime.worker_thread_ids().iter().all(|&id| id == 0));
    Ok(())
}

#[test]
fn pool_can_run_again_after_stopping() -> Result<()> {
    let _serial = test_support::serial_guard();

    let runtime = Runtime::new(1)?;

    for _ in 0..2 {
        let stopper = runtime.stopper();
        runtime.dispatch(move || {
            let stopper = stopper.clone();
            async move { stopper.stop() }
        });
        runtime.run();
        assert!(!runtime.is_running());
    }
    Ok(())
}
