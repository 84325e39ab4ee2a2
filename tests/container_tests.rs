//! Tests for the per-container state machine.
//!
//! Exercises lifecycle transitions, limit operations with the OOM
//! notifier, network rules, process supervision with re-attach, tar
//! streams, and snapshot/restore, all against the scripted fakes.

use boxpool::container::{Container, ContainerSnapshot, NetInRule, NetOutRule, ProcessSnapshot};
use boxpool::testing::{
    CommandPattern, FakeBandwidthManager, FakeCgroupsManager, FakeCommandRunner, FakePortPool,
    FakeQuotaManager, SetValue,
};
use boxpool::{
    BandwidthLimits, BandwidthStat, CpuLimits, DiskLimits, DiskStat, EnvironmentVariable, Error,
    ExitStatus, MemoryLimits, Network, ProcessSpec, Properties, ResourceLimits, Resources, Signal,
    State, StreamSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    container: Arc<Container>,
    runner: Arc<FakeCommandRunner>,
    cgroups: Arc<FakeCgroupsManager>,
    quota: Arc<FakeQuotaManager>,
    bandwidth: Arc<FakeBandwidthManager>,
    port_pool: Arc<FakePortPool>,
}

fn fixture() -> Fixture {
    let runner = FakeCommandRunner::new();
    let cgroups = FakeCgroupsManager::new("/cgroups", "some-id");
    let quota = FakeQuotaManager::new();
    let bandwidth = FakeBandwidthManager::new();
    let port_pool = FakePortPool::new(1000);

    let network: Network = "10.254.0.0/30".parse().unwrap();

    let mut properties = Properties::new();
    properties.insert("property-name".to_string(), "property-value".to_string());

    let container = Container::new(
        "some-id",
        "some-handle",
        "/depot/some-id",
        properties,
        Duration::from_secs(1),
        Resources::new(1234, network, Vec::new()),
        port_pool.clone(),
        runner.clone(),
        cgroups.clone(),
        quota.clone(),
        bandwidth.clone(),
    );

    Fixture {
        container,
        runner,
        cgroups,
        quota,
        bandwidth,
        port_pool,
    }
}

fn setup_successful_spawn(runner: &FakeCommandRunner) {
    runner.when_spawning(CommandPattern::path("bin/iomux-spawn"), |mut p| async move {
        let _ = p.stdout.write_all(b"ready\nactive\n").await;
    });
}

/// Keeps stream relays alive until interrupted, as a real relay would be.
fn block_links(runner: &FakeCommandRunner) {
    runner.when_spawning(CommandPattern::path("bin/iomux-link"), |mut p| async move {
        let _ = p.next_signal().await;
        p.exit(ExitStatus::from_signal());
    });
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not met in time");
}

fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn script_error() -> Error {
    Error::ScriptFailed {
        path: "fake".into(),
        status: 1,
    }
}

// =============================================================================
// Starting and Stopping
// =============================================================================

#[tokio::test]
async fn test_start_executes_start_script_with_environment() {
    let f = fixture();
    f.container.start().await.unwrap();

    let ran = f.runner.ran_matching("start.sh");
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].path.to_string_lossy(), "/depot/some-id/start.sh");
    assert_eq!(
        ran[0].env,
        env(&[
            ("id", "some-id"),
            ("container_iface_mtu", "1500"),
            (
                "PATH",
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
            ),
        ])
    );
}

#[tokio::test]
async fn test_start_transitions_born_to_active() {
    let f = fixture();
    assert_eq!(f.container.state(), State::Born);

    f.container.start().await.unwrap();
    assert_eq!(f.container.state(), State::Active);
}

#[tokio::test]
async fn test_failed_start_leaves_state_born() {
    let f = fixture();
    f.runner.fail_when_running(CommandPattern::path("start.sh"));

    assert!(f.container.start().await.is_err());
    assert_eq!(f.container.state(), State::Born);
}

#[tokio::test]
async fn test_stop_executes_stop_script() {
    let f = fixture();
    f.container.stop(false).await.unwrap();

    let ran = f.runner.ran_matching("stop.sh");
    assert_eq!(ran.len(), 1);
    assert!(ran[0].args.is_empty());
    assert_eq!(f.container.state(), State::Stopped);
}

#[tokio::test]
async fn test_stop_with_kill_passes_no_wait() {
    let f = fixture();
    f.container.stop(true).await.unwrap();

    let ran = f.runner.ran_matching("stop.sh");
    assert_eq!(ran[0].args, vec!["-w", "0"]);
}

#[tokio::test]
async fn test_failed_stop_leaves_state_unchanged() {
    let f = fixture();
    f.runner.fail_when_running(CommandPattern::path("stop.sh"));

    assert!(f.container.stop(false).await.is_err());
    assert_eq!(f.container.state(), State::Born);
}

#[tokio::test]
async fn test_stop_kills_a_running_oom_notifier() {
    let f = fixture();
    f.runner
        .when_spawning(CommandPattern::path("bin/oom"), |mut p| async move {
            let _ = p.next_signal().await;
            p.exit(ExitStatus::from_signal());
        });

    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 42,
        })
        .await
        .unwrap();

    f.container.stop(false).await.unwrap();
    assert_eq!(f.runner.signalled_matching("bin/oom"), vec![Signal::Kill]);
}

// =============================================================================
// Cleanup
// =============================================================================

#[tokio::test]
async fn test_cleanup_kills_the_oom_notifier() {
    let f = fixture();
    f.runner
        .when_spawning(CommandPattern::path("bin/oom"), |mut p| async move {
            let _ = p.next_signal().await;
            p.exit(ExitStatus::from_signal());
        });

    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 42,
        })
        .await
        .unwrap();

    f.container.cleanup().await;
    assert_eq!(f.runner.signalled_matching("bin/oom"), vec![Signal::Kill]);
}

#[tokio::test]
async fn test_cleanup_interrupts_active_stream_relays() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container.run(ProcessSpec::default()).await.unwrap();
    f.container.run(ProcessSpec::default()).await.unwrap();

    let runner = f.runner.clone();
    eventually(move || runner.spawned_matching("bin/iomux-link").len() == 2).await;

    f.container.cleanup().await;

    assert_eq!(
        f.runner.signalled_matching("bin/iomux-link"),
        vec![Signal::Interrupt, Signal::Interrupt]
    );
}

// =============================================================================
// Memory Limits
// =============================================================================

#[tokio::test]
async fn test_limit_memory_starts_the_oom_notifier() {
    let f = fixture();
    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .unwrap();

    let spawned = f.runner.spawned_matching("bin/oom");
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].path.to_string_lossy(), "/depot/some-id/bin/oom");
    assert_eq!(spawned[0].args, vec!["/cgroups/memory/instance-some-id"]);
}

#[tokio::test]
async fn test_limit_memory_writes_memory_then_memsw_then_memory() {
    let f = fixture();
    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .unwrap();

    assert_eq!(
        f.cgroups.set_values(),
        vec![
            SetValue::new("memory", "memory.limit_in_bytes", "102400"),
            SetValue::new("memory", "memory.memsw.limit_in_bytes", "102400"),
            SetValue::new("memory", "memory.limit_in_bytes", "102400"),
        ]
    );
}

#[tokio::test]
async fn test_limit_memory_does_not_start_a_second_notifier() {
    let f = fixture();
    f.runner
        .when_spawning(CommandPattern::path("bin/oom"), |mut p| async move {
            let _ = p.next_signal().await;
            p.exit(ExitStatus::from_signal());
        });

    let limits = MemoryLimits {
        limit_in_bytes: 102400,
    };
    f.container.limit_memory(limits).await.unwrap();
    f.container.limit_memory(limits).await.unwrap();

    assert_eq!(f.runner.spawned_matching("bin/oom").len(), 1);
}

#[tokio::test]
async fn test_oom_exit_registers_event_and_stops_the_container() {
    let f = fixture();

    // The unscripted notifier exits 0 immediately, as if OOM fired.
    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .unwrap();

    let container = f.container.clone();
    eventually(move || container.events().contains(&"out of memory".to_string())).await;

    let runner = f.runner.clone();
    eventually(move || !runner.ran_matching("stop.sh").is_empty()).await;
    assert_eq!(f.container.state(), State::Stopped);
}

#[tokio::test]
async fn test_limit_memory_tolerates_memsw_failure() {
    let f = fixture();
    f.cgroups
        .when_setting("memory", "memory.memsw.limit_in_bytes", || {
            Err(script_error())
        });

    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_limit_memory_tolerates_first_memory_write_failure() {
    let f = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    f.cgroups
        .when_setting("memory", "memory.limit_in_bytes", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(script_error())
            } else {
                Ok(())
            }
        });

    f.container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_limit_memory_fails_when_second_memory_write_fails() {
    let f = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    f.cgroups
        .when_setting("memory", "memory.limit_in_bytes", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                Err(script_error())
            } else {
                Ok(())
            }
        });

    assert!(f
        .container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .is_err());
}

#[tokio::test]
async fn test_limit_memory_fails_when_the_notifier_cannot_start() {
    let f = fixture();
    f.runner.fail_when_spawning(CommandPattern::path("bin/oom"));

    assert!(f
        .container
        .limit_memory(MemoryLimits {
            limit_in_bytes: 102400,
        })
        .await
        .is_err());
}

#[tokio::test]
async fn test_current_memory_limits_reads_the_cgroup() {
    let f = fixture();
    f.cgroups.when_getting("memory", "memory.limit_in_bytes", || {
        Ok("18446744073709551615".to_string())
    });

    let limits = f.container.current_memory_limits().await.unwrap();
    assert_eq!(limits.limit_in_bytes, u64::MAX);
}

#[tokio::test]
async fn test_current_memory_limits_propagates_read_failure() {
    let f = fixture();
    f.cgroups
        .when_getting("memory", "memory.limit_in_bytes", || Err(script_error()));

    assert!(f.container.current_memory_limits().await.is_err());
}

// =============================================================================
// CPU, Disk, and Bandwidth Limits
// =============================================================================

#[tokio::test]
async fn test_limit_cpu_sets_shares() {
    let f = fixture();
    f.container
        .limit_cpu(CpuLimits {
            limit_in_shares: 512,
        })
        .await
        .unwrap();

    assert_eq!(
        f.cgroups.set_values(),
        vec![SetValue::new("cpu", "cpu.shares", "512")]
    );
}

#[tokio::test]
async fn test_current_cpu_limits_reads_the_cgroup() {
    let f = fixture();
    f.cgroups
        .when_getting("cpu", "cpu.shares", || Ok("512".to_string()));

    let limits = f.container.current_cpu_limits().await.unwrap();
    assert_eq!(limits.limit_in_shares, 512);
}

#[tokio::test]
async fn test_limit_disk_delegates_to_the_quota_manager_by_uid() {
    let f = fixture();
    let limits = DiskLimits {
        block_limit: 1,
        inode_limit: 11,
        byte_limit: 21,
        ..DiskLimits::default()
    };

    f.container.limit_disk(limits).await.unwrap();

    let limited = f.quota.limited.lock().unwrap();
    assert_eq!(limited.get(&1234), Some(&limits));
}

#[tokio::test]
async fn test_limit_disk_propagates_failure() {
    let f = fixture();
    f.quota.set_limits_fails.store(true, Ordering::SeqCst);

    assert!(f.container.limit_disk(DiskLimits::default()).await.is_err());
}

#[tokio::test]
async fn test_current_disk_limits_queries_the_quota_manager() {
    let f = fixture();
    let expected = DiskLimits {
        block_hard: 1234567,
        ..DiskLimits::default()
    };
    *f.quota.get_limits_result.lock().unwrap() = expected;

    assert_eq!(f.container.current_disk_limits().await.unwrap(), expected);
}

#[tokio::test]
async fn test_limit_bandwidth_delegates_to_the_bandwidth_manager() {
    let f = fixture();
    let limits = BandwidthLimits {
        rate_in_bytes_per_second: 128,
        burst_rate_in_bytes_per_second: 256,
    };

    f.container.limit_bandwidth(limits).await.unwrap();

    assert_eq!(*f.bandwidth.enforced_limits.lock().unwrap(), vec![limits]);
}

#[tokio::test]
async fn test_current_bandwidth_limits_returns_cache_or_zero() {
    let f = fixture();
    assert_eq!(
        f.container.current_bandwidth_limits(),
        BandwidthLimits::default()
    );

    let limits = BandwidthLimits {
        rate_in_bytes_per_second: 128,
        burst_rate_in_bytes_per_second: 256,
    };
    f.container.limit_bandwidth(limits).await.unwrap();
    assert_eq!(f.container.current_bandwidth_limits(), limits);
}

#[tokio::test]
async fn test_failed_bandwidth_limit_does_not_update_the_cache() {
    let f = fixture();
    f.bandwidth.set_limits_fails.store(true, Ordering::SeqCst);

    assert!(f
        .container
        .limit_bandwidth(BandwidthLimits {
            rate_in_bytes_per_second: 128,
            burst_rate_in_bytes_per_second: 256,
        })
        .await
        .is_err());

    assert_eq!(
        f.container.current_bandwidth_limits(),
        BandwidthLimits::default()
    );
}

// =============================================================================
// Net In / Net Out
// =============================================================================

#[tokio::test]
async fn test_net_in_runs_the_net_script_with_ports() {
    let f = fixture();
    let (host, container) = f.container.net_in(123, 456).await.unwrap();

    assert_eq!((host, container), (123, 456));

    let ran = f.runner.ran_matching("net.sh");
    assert_eq!(ran[0].args, vec!["in"]);
    assert_eq!(
        ran[0].env,
        env(&[("HOST_PORT", "123"), ("CONTAINER_PORT", "456")])
    );
}

#[tokio::test]
async fn test_net_in_acquires_host_ports_from_the_pool() {
    let f = fixture();

    let (host, container) = f.container.net_in(0, 456).await.unwrap();
    assert_eq!((host, container), (1000, 456));

    let (second_host, _) = f.container.net_in(0, 456).await.unwrap();
    assert_eq!(second_host, 1001);

    let (host, container) = f.container.net_in(0, 0).await.unwrap();
    assert_eq!((host, container), (1002, 1002));

    let ports = f.container.resources().ports;
    assert_eq!(ports, vec![1000, 1001, 1002]);
}

#[tokio::test]
async fn test_net_in_defaults_container_port_to_host_port() {
    let f = fixture();
    let (host, container) = f.container.net_in(123, 0).await.unwrap();
    assert_eq!((host, container), (123, 123));

    let ran = f.runner.ran_matching("net.sh");
    assert_eq!(
        ran[0].env,
        env(&[("HOST_PORT", "123"), ("CONTAINER_PORT", "123")])
    );
}

#[tokio::test]
async fn test_net_in_propagates_pool_exhaustion() {
    let f = fixture();
    f.port_pool.acquire_fails.store(true, Ordering::SeqCst);

    assert!(matches!(
        f.container.net_in(0, 456).await,
        Err(Error::PoolExhausted { .. })
    ));
}

#[tokio::test]
async fn test_net_in_propagates_script_failure() {
    let f = fixture();
    f.runner.fail_when_running(CommandPattern::path("net.sh"));

    assert!(f.container.net_in(123, 456).await.is_err());
}

#[tokio::test]
async fn test_net_out_runs_the_net_script_with_network_and_port() {
    let f = fixture();
    f.container.net_out("1.2.3.4/22", 567).await.unwrap();

    let ran = f.runner.ran_matching("net.sh");
    assert_eq!(ran[0].args, vec!["out"]);
    assert_eq!(
        ran[0].env,
        env(&[("NETWORK", "1.2.3.4/22"), ("PORT", "567")])
    );
}

#[tokio::test]
async fn test_net_out_serializes_port_zero_as_empty() {
    let f = fixture();
    f.container.net_out("1.2.3.4/22", 0).await.unwrap();

    let ran = f.runner.ran_matching("net.sh");
    assert_eq!(ran[0].env, env(&[("NETWORK", "1.2.3.4/22"), ("PORT", "")]));
}

#[tokio::test]
async fn test_net_out_rejects_empty_network_and_port() {
    let f = fixture();
    assert!(matches!(
        f.container.net_out("", 0).await,
        Err(Error::InvalidNetOut)
    ));
}

// =============================================================================
// Running Processes
// =============================================================================

#[tokio::test]
async fn test_run_spawns_bash_through_the_supervisor_with_rlimits() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    let (process_id, _stream) = f
        .container
        .run(ProcessSpec {
            script: "/some/script".to_string(),
            limits: ResourceLimits {
                address_space: Some(1),
                core: Some(2),
                cpu: Some(3),
                data: Some(4),
                fsize: Some(5),
                locks: Some(6),
                memlock: Some(7),
                msgqueue: Some(8),
                nice: Some(9),
                nofile: Some(10),
                nproc: Some(11),
                rss: Some(12),
                rtprio: Some(13),
                sigpending: Some(14),
                stack: Some(15),
            },
            ..ProcessSpec::default()
        })
        .await
        .unwrap();

    let spawned = f.runner.spawned_matching("bin/iomux-spawn");
    assert_eq!(spawned.len(), 1);
    assert_eq!(
        spawned[0].args,
        vec![
            format!("/depot/some-id/processes/{process_id}"),
            "/depot/some-id/bin/wsh".to_string(),
            "--socket".to_string(),
            "/depot/some-id/run/wshd.sock".to_string(),
            "--user".to_string(),
            "vcap".to_string(),
            "/bin/bash".to_string(),
        ]
    );
    assert_eq!(
        spawned[0].env,
        env(&[
            ("RLIMIT_AS", "1"),
            ("RLIMIT_CORE", "2"),
            ("RLIMIT_CPU", "3"),
            ("RLIMIT_DATA", "4"),
            ("RLIMIT_FSIZE", "5"),
            ("RLIMIT_LOCKS", "6"),
            ("RLIMIT_MEMLOCK", "7"),
            ("RLIMIT_MSGQUEUE", "8"),
            ("RLIMIT_NICE", "9"),
            ("RLIMIT_NOFILE", "10"),
            ("RLIMIT_NPROC", "11"),
            ("RLIMIT_RSS", "12"),
            ("RLIMIT_RTPRIO", "13"),
            ("RLIMIT_SIGPENDING", "14"),
            ("RLIMIT_STACK", "15"),
        ])
    );
    assert_eq!(spawned[0].stdin, Some(b"/some/script".to_vec()));
}

#[tokio::test]
async fn test_run_only_surfaces_set_rlimits() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container
        .run(ProcessSpec {
            script: "/some/script".to_string(),
            limits: ResourceLimits {
                cpu: Some(3),
                nofile: Some(10),
                ..ResourceLimits::default()
            },
            ..ProcessSpec::default()
        })
        .await
        .unwrap();

    let spawned = f.runner.spawned_matching("bin/iomux-spawn");
    assert_eq!(
        spawned[0].env,
        env(&[("RLIMIT_CPU", "3"), ("RLIMIT_NOFILE", "10")])
    );
}

#[tokio::test]
async fn test_run_renders_exported_environment_without_escaping_dollar() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container
        .run(ProcessSpec {
            script: "/some/script".to_string(),
            env: vec![
                EnvironmentVariable::new("ESCAPED", "kurt \"russell\""),
                EnvironmentVariable::new("INTERPOLATED", "snake $PLISSKEN"),
                EnvironmentVariable::new("UNESCAPED", "isaac\nhayes"),
            ],
            ..ProcessSpec::default()
        })
        .await
        .unwrap();

    let spawned = f.runner.spawned_matching("bin/iomux-spawn");
    let stdin = String::from_utf8(spawned[0].stdin.clone().unwrap()).unwrap();
    assert_eq!(
        stdin,
        "export ESCAPED=\"kurt \\\"russell\\\"\"\n\
         export INTERPOLATED=\"snake $PLISSKEN\"\n\
         export UNESCAPED=\"isaac\nhayes\"\n\
         /some/script"
    );
}

#[tokio::test]
async fn test_run_as_privileged_uses_root() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container
        .run(ProcessSpec {
            script: "/some/script".to_string(),
            privileged: true,
            ..ProcessSpec::default()
        })
        .await
        .unwrap();

    let spawned = f.runner.spawned_matching("bin/iomux-spawn");
    assert!(spawned[0].args.contains(&"root".to_string()));
    assert!(!spawned[0].args.contains(&"vcap".to_string()));
}

#[tokio::test]
async fn test_run_returns_unique_process_ids() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    let (first, _) = f.container.run(ProcessSpec::default()).await.unwrap();
    let (second, _) = f.container.run(ProcessSpec::default()).await.unwrap();

    assert_eq!(first, 0);
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_run_propagates_spawn_failure() {
    let f = fixture();
    f.runner
        .fail_when_spawning(CommandPattern::path("bin/iomux-spawn"));

    assert!(f.container.run(ProcessSpec::default()).await.is_err());
}

#[tokio::test]
async fn test_run_streams_stdout_stderr_and_exit_status() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    f.runner
        .when_spawning(CommandPattern::path("bin/iomux-link"), |mut p| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = p.stdout.write_all(b"hi out\n").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = p.stderr.write_all(b"hi err\n").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            p.exit(ExitStatus::from_code(42));
        });

    let (_, mut stream) = f
        .container
        .run(ProcessSpec {
            script: "/some/script".to_string(),
            ..ProcessSpec::default()
        })
        .await
        .unwrap();

    let chunk = stream.recv().await.unwrap();
    assert_eq!(chunk.source, Some(StreamSource::Stdout));
    assert_eq!(chunk.data, b"hi out\n");
    assert_eq!(chunk.exit_status, None);

    let chunk = stream.recv().await.unwrap();
    assert_eq!(chunk.source, Some(StreamSource::Stderr));
    assert_eq!(chunk.data, b"hi err\n");
    assert_eq!(chunk.exit_status, None);

    let chunk = stream.recv().await.unwrap();
    assert_eq!(chunk.source, None);
    assert!(chunk.data.is_empty());
    assert_eq!(chunk.exit_status, Some(42));

    assert!(stream.recv().await.is_none());
}

// =============================================================================
// Attaching
// =============================================================================

#[tokio::test]
async fn test_attach_receives_the_same_chunk_sequence() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    f.runner
        .when_spawning(CommandPattern::path("bin/iomux-link"), |mut p| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = p.stdout.write_all(b"hi out\n").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = p.stderr.write_all(b"hi err\n").await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            p.exit(ExitStatus::from_code(42));
        });

    let (process_id, mut run_stream) = f
        .container
        .run(ProcessSpec {
            script: "/some/script".to_string(),
            ..ProcessSpec::default()
        })
        .await
        .unwrap();

    let mut attach_stream = f.container.attach(process_id).unwrap();

    for _ in 0..3 {
        let run_chunk = run_stream.recv().await.unwrap();
        let attach_chunk = attach_stream.recv().await.unwrap();
        assert_eq!(run_chunk, attach_chunk);
    }

    assert!(run_stream.recv().await.is_none());
    assert!(attach_stream.recv().await.is_none());
}

#[tokio::test]
async fn test_attach_to_a_completed_process_fails() {
    let f = fixture();
    setup_successful_spawn(&f.runner);

    // The unscripted relay exits immediately.
    let (process_id, mut stream) = f.container.run(ProcessSpec::default()).await.unwrap();
    while stream.recv().await.is_some() {}

    assert!(matches!(
        f.container.attach(process_id),
        Err(Error::ProcessEnded(_))
    ));
}

#[tokio::test]
async fn test_attach_to_an_unknown_process_fails() {
    let f = fixture();
    assert!(matches!(
        f.container.attach(42),
        Err(Error::UnknownProcess(42))
    ));
}

// =============================================================================
// Streaming In and Out
// =============================================================================

#[tokio::test]
async fn test_stream_in_pipes_into_tar_extraction() {
    let f = fixture();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    f.runner
        .when_spawning(CommandPattern::path("bin/wsh"), move |mut p| {
            let sink = sink.clone();
            async move {
                let mut data = Vec::new();
                let _ = p.stdin.read_to_end(&mut data).await;
                sink.lock().unwrap().extend_from_slice(&data);
                p.exit(ExitStatus::from_code(0));
            }
        });

    let mut writer = f.container.stream_in("/some/directory/dst").await.unwrap();
    writer.write_all(b"the-tar-content").await.unwrap();
    writer.close().await.unwrap();

    assert_eq!(&*captured.lock().unwrap(), b"the-tar-content");

    let spawned = f.runner.spawned_matching("bin/wsh");
    assert_eq!(
        spawned[0].args,
        vec![
            "--socket",
            "/depot/some-id/run/wshd.sock",
            "--user",
            "vcap",
            "bash",
            "-c",
            "mkdir -p /some/directory/dst && tar xf - -C /some/directory/dst",
        ]
    );
}

#[tokio::test]
async fn test_stream_in_close_surfaces_extraction_failure() {
    let f = fixture();
    f.runner
        .when_spawning(CommandPattern::path("bin/wsh"), |mut p| async move {
            let mut data = Vec::new();
            let _ = p.stdin.read_to_end(&mut data).await;
            p.exit(ExitStatus::from_code(2));
        });

    let writer = f.container.stream_in("/some/directory/dst").await.unwrap();
    assert!(matches!(
        writer.close().await,
        Err(Error::ScriptFailed { status: 2, .. })
    ));
}

#[tokio::test]
async fn test_stream_in_propagates_spawn_failure() {
    let f = fixture();
    f.runner.fail_when_spawning(CommandPattern::path("bin/wsh"));

    assert!(f.container.stream_in("/some/dst").await.is_err());
}

#[tokio::test]
async fn test_stream_out_reads_the_tar_stream() {
    let f = fixture();
    f.runner
        .when_spawning(CommandPattern::path("bin/wsh"), |mut p| async move {
            let _ = p.stdout.write_all(b"the-compressed-content").await;
        });

    let mut reader = f.container.stream_out("/some/directory/dst").await.unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();
    assert_eq!(data, b"the-compressed-content");

    let spawned = f.runner.spawned_matching("bin/wsh");
    assert_eq!(
        spawned[0].args,
        vec![
            "--socket",
            "/depot/some-id/run/wshd.sock",
            "--user",
            "vcap",
            "tar",
            "cf",
            "-",
            "-C",
            "/some/directory",
            "dst",
        ]
    );
}

#[tokio::test]
async fn test_stream_out_with_trailing_slash_streams_contents() {
    let f = fixture();
    f.container.stream_out("/some/directory/dst/").await.unwrap();

    let spawned = f.runner.spawned_matching("bin/wsh");
    assert_eq!(
        spawned[0].args[4..],
        ["tar", "cf", "-", "-C", "/some/directory/dst/", "."]
            .map(String::from)
    );
}

// =============================================================================
// Snapshotting
// =============================================================================

#[tokio::test]
async fn test_snapshot_captures_the_complete_live_state() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container.start().await.unwrap();

    let memory = MemoryLimits {
        limit_in_bytes: 1024,
    };
    let disk = DiskLimits {
        block_limit: 1,
        inode_limit: 11,
        byte_limit: 21,
        ..DiskLimits::default()
    };
    let bandwidth = BandwidthLimits {
        rate_in_bytes_per_second: 1,
        burst_rate_in_bytes_per_second: 2,
    };
    let cpu = CpuLimits { limit_in_shares: 1 };

    f.container.limit_memory(memory).await.unwrap();

    // The unscripted notifier already fired, stopping the container.
    let container = f.container.clone();
    eventually(move || container.state() == State::Stopped).await;

    f.container.limit_disk(disk).await.unwrap();
    f.container.limit_bandwidth(bandwidth).await.unwrap();
    f.container.limit_cpu(cpu).await.unwrap();

    f.container.net_in(1, 2).await.unwrap();
    f.container.net_in(3, 4).await.unwrap();
    f.container.net_out("network-a", 1).await.unwrap();
    f.container.net_out("network-b", 2).await.unwrap();

    f.container.run(ProcessSpec::default()).await.unwrap();

    let bytes = serde_json::to_vec(&f.container.snapshot()).unwrap();
    let snapshot: ContainerSnapshot = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(snapshot.id, "some-id");
    assert_eq!(snapshot.handle, "some-handle");
    assert_eq!(snapshot.grace_time, Duration::from_secs(1));
    assert_eq!(snapshot.state, State::Stopped);
    assert_eq!(snapshot.events, vec!["out of memory".to_string()]);

    assert_eq!(snapshot.limits.memory, Some(memory));
    assert_eq!(snapshot.limits.disk, Some(disk));
    assert_eq!(snapshot.limits.bandwidth, Some(bandwidth));
    assert_eq!(snapshot.limits.cpu, Some(cpu));

    assert_eq!(snapshot.resources.uid, 1234);
    assert_eq!(snapshot.resources.network.to_string(), "10.254.0.0/30");

    assert_eq!(
        snapshot.net_ins,
        vec![
            NetInRule {
                host_port: 1,
                container_port: 2
            },
            NetInRule {
                host_port: 3,
                container_port: 4
            },
        ]
    );
    assert_eq!(
        snapshot.net_outs,
        vec![
            NetOutRule {
                network: "network-a".to_string(),
                port: 1
            },
            NetOutRule {
                network: "network-b".to_string(),
                port: 2
            },
        ]
    );

    assert!(snapshot.processes.contains(&ProcessSnapshot { id: 0 }));

    let mut expected_properties = Properties::new();
    expected_properties.insert("property-name".to_string(), "property-value".to_string());
    assert_eq!(snapshot.properties, expected_properties);
}

#[tokio::test]
async fn test_snapshot_saves_unset_limits_as_absent() {
    let f = fixture();

    let value = serde_json::to_value(f.container.snapshot()).unwrap();
    assert_eq!(value["limits"], serde_json::json!({}));
}

// =============================================================================
// Restoring
// =============================================================================

#[tokio::test]
async fn test_restore_sets_state_and_events() {
    let f = fixture();
    f.container
        .restore(ContainerSnapshot {
            state: State::Active,
            events: vec!["out of memory".to_string(), "foo".to_string()],
            ..ContainerSnapshot::default()
        })
        .await
        .unwrap();

    assert_eq!(f.container.state(), State::Active);
    assert_eq!(
        f.container.events(),
        vec!["out of memory".to_string(), "foo".to_string()]
    );
}

#[tokio::test]
async fn test_restore_rebinds_process_streams() {
    let f = fixture();

    let gate = Arc::new(tokio::sync::Notify::new());
    let hook_gate = gate.clone();
    f.runner
        .when_spawning(CommandPattern::path("bin/iomux-link"), move |mut p| {
            let gate = hook_gate.clone();
            async move {
                gate.notified().await;
                let _ = p.stdout.write_all(b"hello\n").await;
                let _ = p.next_signal().await;
                p.exit(ExitStatus::from_signal());
            }
        });

    f.container
        .restore(ContainerSnapshot {
            state: State::Active,
            processes: vec![ProcessSnapshot { id: 0 }],
            ..ContainerSnapshot::default()
        })
        .await
        .unwrap();

    let mut stream = f.container.attach(0).unwrap();
    gate.notify_one();

    let chunk = stream.recv().await.unwrap();
    assert_eq!(chunk.source, Some(StreamSource::Stdout));
    assert_eq!(chunk.data, b"hello\n");

    let spawned = f.runner.spawned_matching("bin/iomux-link");
    assert_eq!(
        spawned[0].args,
        vec![
            "-w",
            "/depot/some-id/processes/0/cursors",
            "/depot/some-id/processes/0",
        ]
    );
}

#[tokio::test]
async fn test_restore_starts_new_process_ids_after_the_highest() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container
        .restore(ContainerSnapshot {
            state: State::Active,
            processes: vec![ProcessSnapshot { id: 0 }, ProcessSnapshot { id: 1 }],
            ..ContainerSnapshot::default()
        })
        .await
        .unwrap();

    let (process_id, _) = f.container.run(ProcessSpec::default()).await.unwrap();
    assert_eq!(process_id, 2);
}

#[tokio::test]
async fn test_restore_replays_network_setup_and_rules_in_order() {
    let f = fixture();
    f.container
        .restore(ContainerSnapshot {
            state: State::Active,
            net_ins: vec![
                NetInRule {
                    host_port: 1234,
                    container_port: 5678,
                },
                NetInRule {
                    host_port: 1235,
                    container_port: 5679,
                },
            ],
            net_outs: vec![
                NetOutRule {
                    network: "somehost.example.com".to_string(),
                    port: 80,
                },
                NetOutRule {
                    network: "someotherhost.example.com".to_string(),
                    port: 8080,
                },
            ],
            ..ContainerSnapshot::default()
        })
        .await
        .unwrap();

    let args: Vec<Vec<String>> = f
        .runner
        .ran_matching("net.sh")
        .into_iter()
        .map(|command| command.args)
        .collect();
    assert_eq!(
        args,
        vec![
            vec!["setup".to_string()],
            vec!["in".to_string()],
            vec!["in".to_string()],
            vec!["out".to_string()],
            vec!["out".to_string()],
        ]
    );

    let ins = f.runner.ran_matching("net.sh");
    assert_eq!(
        ins[1].env,
        env(&[("HOST_PORT", "1234"), ("CONTAINER_PORT", "5678")])
    );
    assert_eq!(
        ins[3].env,
        env(&[("NETWORK", "somehost.example.com"), ("PORT", "80")])
    );
}

#[tokio::test]
async fn test_restore_propagates_net_script_failure() {
    for subcommand in ["setup", "in", "out"] {
        let f = fixture();
        f.runner
            .fail_when_running(CommandPattern::path("net.sh").with_args([subcommand]));

        let result = f
            .container
            .restore(ContainerSnapshot {
                state: State::Active,
                net_ins: vec![NetInRule {
                    host_port: 1234,
                    container_port: 5678,
                }],
                net_outs: vec![NetOutRule {
                    network: "somehost.example.com".to_string(),
                    port: 80,
                }],
                ..ContainerSnapshot::default()
            })
            .await;

        assert!(result.is_err(), "net.sh {subcommand} failure not surfaced");
    }
}

#[tokio::test]
async fn test_restore_reenforces_the_memory_limit() {
    let f = fixture();
    f.container
        .restore(ContainerSnapshot {
            state: State::Active,
            limits: boxpool::container::LimitsSnapshot {
                memory: Some(MemoryLimits {
                    limit_in_bytes: 1024,
                }),
                ..boxpool::container::LimitsSnapshot::default()
            },
            ..ContainerSnapshot::default()
        })
        .await
        .unwrap();

    let set_values = f.cgroups.set_values();
    assert!(set_values.contains(&SetValue::new(
        "memory",
        "memory.limit_in_bytes",
        "1024"
    )));
    assert!(set_values.contains(&SetValue::new(
        "memory",
        "memory.memsw.limit_in_bytes",
        "1024"
    )));

    // The unscripted notifier fires immediately.
    let container = f.container.clone();
    eventually(move || container.events().contains(&"out of memory".to_string())).await;
}

#[tokio::test]
async fn test_restore_without_memory_limit_sets_nothing() {
    let f = fixture();
    f.container
        .restore(ContainerSnapshot {
            state: State::Active,
            ..ContainerSnapshot::default()
        })
        .await
        .unwrap();

    assert!(f.cgroups.set_values().is_empty());
}

#[tokio::test]
async fn test_restore_propagates_memory_limit_failure() {
    let f = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    f.cgroups
        .when_setting("memory", "memory.limit_in_bytes", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                Err(script_error())
            } else {
                Ok(())
            }
        });

    let result = f
        .container
        .restore(ContainerSnapshot {
            state: State::Active,
            limits: boxpool::container::LimitsSnapshot {
                memory: Some(MemoryLimits {
                    limit_in_bytes: 1024,
                }),
                ..boxpool::container::LimitsSnapshot::default()
            },
            ..ContainerSnapshot::default()
        })
        .await;

    assert!(result.is_err());
}

// =============================================================================
// Info
// =============================================================================

#[tokio::test]
async fn test_info_reports_state_network_and_properties() {
    let f = fixture();
    let info = f.container.info().await.unwrap();

    assert_eq!(info.state, State::Born);
    assert!(info.events.is_empty());
    assert_eq!(
        info.properties.get("property-name"),
        Some(&"property-value".to_string())
    );
    assert_eq!(info.host_ip, "10.254.0.1");
    assert_eq!(info.container_ip, "10.254.0.2");
    assert_eq!(
        info.container_path.to_string_lossy(),
        "/depot/some-id"
    );
}

#[tokio::test]
async fn test_info_reports_live_process_ids() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    let (first, _) = f.container.run(ProcessSpec::default()).await.unwrap();
    let (second, _) = f.container.run(ProcessSpec::default()).await.unwrap();

    let info = f.container.info().await.unwrap();
    assert_eq!(info.process_ids, vec![first, second]);
}

#[tokio::test]
async fn test_info_parses_cgroup_accounting() {
    let f = fixture();
    f.cgroups.when_getting("memory", "memory.stat", || {
        Ok("cache 1\nrss 2\nswap 6\ntotal_rss 17\n".to_string())
    });
    f.cgroups
        .when_getting("cpuacct", "cpuacct.usage", || Ok("42\n".to_string()));
    f.cgroups
        .when_getting("cpuacct", "cpuacct.stat", || Ok("user 1\nsystem 2\n".to_string()));
    *f.quota.get_usage_result.lock().unwrap() = DiskStat {
        bytes_used: 1,
        inodes_used: 2,
    };
    *f.bandwidth.get_stats_result.lock().unwrap() = BandwidthStat {
        in_rate: 1,
        in_burst: 2,
        out_rate: 3,
        out_burst: 4,
    };

    let info = f.container.info().await.unwrap();
    assert_eq!(info.memory_stat.cache, 1);
    assert_eq!(info.memory_stat.rss, 2);
    assert_eq!(info.memory_stat.swap, 6);
    assert_eq!(info.memory_stat.total_rss, 17);
    assert_eq!(info.cpu_stat.usage, 42);
    assert_eq!(info.cpu_stat.user, 1);
    assert_eq!(info.cpu_stat.system, 2);
    assert_eq!(info.disk_stat.bytes_used, 1);
    assert_eq!(info.disk_stat.inodes_used, 2);
    assert_eq!(info.bandwidth_stat.out_burst, 4);
}

#[tokio::test]
async fn test_info_propagates_accounting_failures() {
    let f = fixture();
    f.cgroups
        .when_getting("memory", "memory.stat", || Err(script_error()));

    assert!(f.container.info().await.is_err());
}

// =============================================================================
// Round Trip
// =============================================================================

#[tokio::test]
async fn test_snapshot_restore_round_trip_preserves_observable_state() {
    let f = fixture();
    setup_successful_spawn(&f.runner);
    block_links(&f.runner);

    f.container.start().await.unwrap();
    f.container.net_in(1, 2).await.unwrap();
    f.container.net_out("network-a", 1).await.unwrap();
    f.container
        .limit_cpu(CpuLimits { limit_in_shares: 7 })
        .await
        .unwrap();
    f.container.run(ProcessSpec::default()).await.unwrap();

    let bytes = serde_json::to_vec(&f.container.snapshot()).unwrap();
    let snapshot: ContainerSnapshot = serde_json::from_slice(&bytes).unwrap();

    let restored_fixture = fixture();
    block_links(&restored_fixture.runner);
    restored_fixture
        .container
        .restore(snapshot.clone())
        .await
        .unwrap();

    let restored = restored_fixture.container.snapshot();
    assert_eq!(restored.id, snapshot.id);
    assert_eq!(restored.handle, snapshot.handle);
    assert_eq!(restored.grace_time, snapshot.grace_time);
    assert_eq!(restored.state, snapshot.state);
    assert_eq!(restored.events, snapshot.events);
    assert_eq!(restored.properties, snapshot.properties);
    assert_eq!(restored.net_ins, snapshot.net_ins);
    assert_eq!(restored.net_outs, snapshot.net_outs);
    assert_eq!(restored.limits.cpu, snapshot.limits.cpu);
    assert_eq!(restored.processes, snapshot.processes);
}
