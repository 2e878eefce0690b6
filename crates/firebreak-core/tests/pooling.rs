//! Pool behavior on the mock runner: pool identity, provisioning,
//! exhaustion, fairness, concurrency bounds, recycling, and reaping.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use firebreak_core::codec::Value;
use firebreak_core::error::SandboxError;
use firebreak_core::pool::PoolConfig;
use firebreak_core::profile::{CapabilityProfile, FsMount, NetworkPolicy};
use firebreak_core::runner::mock::MockRunner;

use common::{args, fast_pool_config, manager_with, no_kwargs, plain_profile, test_registry, wait_until};

#[tokio::test]
async fn test_equivalent_profiles_share_one_pool() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let manager = manager_with(runner, fast_pool_config(1, 2));

    let a = CapabilityProfile::builder()
        .mount(FsMount::read("/d"))
        .mount(FsMount::read_write("/e"))
        .net(NetworkPolicy::None)
        .cpu_ms(200)
        .mem_mb(256)
        .dependencies(["b", "A>=1"])
        .build()
        .unwrap();
    let b = CapabilityProfile::builder()
        .mount(FsMount::read_write("/e"))
        .mount(FsMount::read("/d"))
        .net(NetworkPolicy::None)
        .cpu_ms(200)
        .mem_mb(256)
        .dependencies(["a>=1", "b"])
        .build()
        .unwrap();
    assert_eq!(a.pool_key(), b.pool_key());

    let pool_a = manager.pools().get_or_create(&a).await.unwrap();
    let pool_b = manager.pools().get_or_create(&b).await.unwrap();
    assert!(Arc::ptr_eq(&pool_a, &pool_b));
    assert_eq!(manager.pools().pool_count().await, 1);

    let c = CapabilityProfile::builder().cpu_ms(201).build().unwrap();
    let pool_c = manager.pools().get_or_create(&c).await.unwrap();
    assert!(!Arc::ptr_eq(&pool_a, &pool_c));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_provisioning_snapshots_once_and_restores_after() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let manager = manager_with(Arc::clone(&runner), fast_pool_config(3, 4));
    let profile = CapabilityProfile::builder()
        .dependency("requests")
        .build()
        .unwrap();

    let result = manager
        .execute("m:double", args([Value::Int(2)]), no_kwargs(), &profile)
        .await
        .unwrap();
    assert_eq!(result, Value::Int(4));

    assert!(
        wait_until(Duration::from_secs(2), || {
            runner.counters().restore_calls >= 3
        })
        .await,
        "warm-up must restore up to the pool minimum, got {:?}",
        runner.counters()
    );

    let counters = runner.counters();
    assert_eq!(counters.snapshot_calls, 1, "snapshot must be captured exactly once");
    assert_eq!(counters.boot_calls, 1, "only the provisioner boots from the base image");
    assert_eq!(
        counters.restores_before_snapshot, 0,
        "no restore may happen before the snapshot exists"
    );

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || pool.counts().ready == 3).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_install_failure_poisons_the_pool() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    runner.set_install_failure(true);
    let manager = manager_with(Arc::clone(&runner), fast_pool_config(2, 3));
    let profile = CapabilityProfile::builder()
        .dependency("requests")
        .build()
        .unwrap();

    let err = manager
        .execute("m:double", args([Value::Int(2)]), no_kwargs(), &profile)
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ProvisioningError { .. }), "got {err:?}");

    // Poisoned pools fail fast and never boot workers.
    let err = manager
        .execute("m:double", args([Value::Int(2)]), no_kwargs(), &profile)
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ProvisioningError { .. }), "got {err:?}");

    let counters = runner.counters();
    assert_eq!(counters.boot_calls, 1);
    assert_eq!(counters.snapshot_calls, 0);
    assert_eq!(counters.restore_calls, 0);

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(pool.is_poisoned());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_two_concurrent_calls_on_one_vm_run_sequentially() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let manager = Arc::new(manager_with(runner, fast_pool_config(1, 1)));
    let profile = plain_profile(500);

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.counts().ready == 1).await);

    let started = Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let manager = Arc::clone(&manager);
        let profile = profile.clone();
        tasks.push(tokio::spawn(async move {
            let result = manager
                .execute("m:sleep_ms", args([Value::Int(50)]), no_kwargs(), &profile)
                .await;
            (result, started.elapsed())
        }));
    }

    let mut durations = Vec::new();
    for task in tasks {
        let (result, duration) = task.await.unwrap();
        result.unwrap();
        durations.push(duration);
    }
    durations.sort();

    // The second call waited for the first to release the only VM.
    assert!(
        durations[1] >= Duration::from_millis(100),
        "second call finished too early: {durations:?}"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_third_concurrent_call_exhausts_the_pool() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let config = PoolConfig {
        pool_wait_slack: Duration::from_millis(10),
        ..fast_pool_config(1, 1)
    };
    let manager = Arc::new(manager_with(runner, config));
    // Acquisition deadline: 110ms budget + 10ms slack = 120ms.
    let profile = plain_profile(110);

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.counts().ready == 1).await);

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let manager = Arc::clone(&manager);
        let profile = profile.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .execute("m:sleep_ms", args([Value::Int(100)]), no_kwargs(), &profile)
                .await
        }));
    }

    let mut ok = 0;
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(SandboxError::PoolExhausted) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(exhausted, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_waiters_are_served_in_fifo_order() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let manager = Arc::new(manager_with(runner, fast_pool_config(1, 1)));
    let profile = plain_profile(5_000);

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || pool.counts().ready == 1).await);

    let completions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for index in 0..4usize {
        let manager = Arc::clone(&manager);
        let profile = profile.clone();
        let completions = Arc::clone(&completions);
        tasks.push(tokio::spawn(async move {
            manager
                .execute("m:sleep_ms", args([Value::Int(30)]), no_kwargs(), &profile)
                .await
                .unwrap();
            completions.lock().push(index);
        }));
        // Stagger submissions so queue order is unambiguous.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*completions.lock(), vec![0, 1, 2, 3]);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_never_exceed_max_size() {
    let registry = test_registry();
    let active = Arc::new(AtomicUsize::new(0));
    let observed_max = Arc::new(AtomicUsize::new(0));
    {
        let active = Arc::clone(&active);
        let observed_max = Arc::clone(&observed_max);
        registry.register("m:probe", move |_args, _kwargs| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            observed_max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
    }

    let runner = Arc::new(MockRunner::new(registry));
    let manager = Arc::new(manager_with(runner, fast_pool_config(1, 2)));
    let profile = plain_profile(5_000);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        let profile = profile.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .execute("m:probe", args([]), no_kwargs(), &profile)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(
        observed_max.load(Ordering::SeqCst) <= 2,
        "no more than max_size VMs may serve concurrently"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_call_cap_recycles_the_vm() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let config = PoolConfig {
        max_calls_per_vm: 2,
        ..fast_pool_config(1, 1)
    };
    let manager = manager_with(Arc::clone(&runner), config);
    let profile = plain_profile(1_000);

    for _ in 0..3 {
        manager
            .execute("m:double", args([Value::Int(1)]), no_kwargs(), &profile)
            .await
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(1), || runner.counters().hard_kills >= 1).await,
        "a vm at its call cap must be recycled"
    );
    assert!(runner.counters().boot_calls >= 2);

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        pool.ready_call_counts().iter().all(|&c| c < 2) && pool.counts().ready == 1
    })
    .await);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_idle_surplus_vms_are_reaped_to_min_size() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    let config = PoolConfig {
        max_idle: Duration::from_millis(50),
        ..fast_pool_config(1, 3)
    };
    let manager = Arc::new(manager_with(Arc::clone(&runner), config));
    let profile = plain_profile(5_000);

    // Grow the pool with concurrent load.
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let manager = Arc::clone(&manager);
        let profile = profile.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .execute("m:sleep_ms", args([Value::Int(30)]), no_kwargs(), &profile)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let pool = manager.pools().get_or_create(&profile).await.unwrap();
    assert!(pool.counts().total() >= 2, "load should have grown the pool");

    assert!(
        wait_until(Duration::from_secs(2), || pool.counts().total() == 1).await,
        "idle surplus VMs must be reaped down to min_size, have {:?}",
        pool.counts()
    );
    assert!(runner.counters().shutdowns >= 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pool_recovers_from_a_failed_boot() {
    let runner = Arc::new(MockRunner::new(test_registry()));
    runner.fail_next_boots(1);
    let manager = manager_with(Arc::clone(&runner), fast_pool_config(1, 2));
    let profile = plain_profile(1_000);

    // The warm-up boot fails; a later boot fills the gap and the call
    // goes through on that VM.
    let result = manager
        .execute("m:double", args([Value::Int(5)]), no_kwargs(), &profile)
        .await
        .unwrap();
    assert_eq!(result, Value::Int(10));
    assert!(runner.counters().boot_calls >= 2);

    manager.shutdown().await;
}
