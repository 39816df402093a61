//! End-to-end pool tests against the binary's reference worker.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relayvisor::{
    EventBus, EventKind, Payload, Pool, PoolConfig, RelayvisorError, WorkerState, WorkersConfig,
};

fn worker_command(mode: &str) -> String {
    format!(
        "{} internal-worker --mode {}",
        env!("CARGO_BIN_EXE_relayvisor"),
        mode
    )
}

fn workers_config(mode: &str, num_workers: u64) -> WorkersConfig {
    WorkersConfig {
        command: worker_command(mode),
        relay_timeout: Duration::from_secs(10).as_nanos() as u64,
        pool: PoolConfig {
            num_workers,
            allocate_timeout: Duration::from_secs(10).as_nanos() as u64,
            destroy_timeout: Duration::from_secs(5).as_nanos() as u64,
            ..PoolConfig::default()
        },
        ..WorkersConfig::default()
    }
}

fn start(config: &WorkersConfig) -> Pool {
    Pool::from_config(config, EventBus::default()).unwrap()
}

/// Poll `check` until it holds or five seconds pass.
fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

fn body(payload: &Payload) -> String {
    String::from_utf8_lossy(payload.body()).into_owned()
}

#[test]
fn test_echo_over_pipes() {
    let pool = start(&workers_config("echo", 1));
    let response = pool.exec(&Payload::new("ctx", "hello")).unwrap();
    assert_eq!(response.context(), b"ctx");
    assert_eq!(body(&response), "hello");

    let workers = pool.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].jobs, 1);
    assert_eq!(workers[0].state, WorkerState::Ready);
}

#[test]
fn test_echo_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = workers_config("echo", 2);
    config.relay = format!("unix://{}", dir.path().join("relay.sock").display());

    let pool = start(&config);
    assert_eq!(pool.workers().len(), 2);
    let response = pool.exec(&Payload::body_only("over unix")).unwrap();
    assert_eq!(body(&response), "over unix");
}

#[test]
fn test_echo_over_tcp() {
    let mut config = workers_config("echo", 2);
    config.relay = "tcp://127.0.0.1:0".to_string();

    let pool = start(&config);
    let response = pool.exec(&Payload::body_only("over tcp")).unwrap();
    assert_eq!(body(&response), "over tcp");
}

#[test]
fn test_pool_size_holds_under_concurrency() {
    let pool = Arc::new(start(&workers_config("echo", 3)));

    thread::scope(|s| {
        for i in 0..8 {
            let pool = Arc::clone(&pool);
            s.spawn(move || {
                for j in 0..5 {
                    let message = format!("job-{}-{}", i, j);
                    let response = pool.exec(&Payload::body_only(message.clone())).unwrap();
                    assert_eq!(body(&response), message);
                }
            });
        }
    });

    let stats = pool.stats();
    assert_eq!(stats.workers, 3);
    assert_eq!(stats.ready, 3);
    assert_eq!(stats.jobs, 40);
    assert_eq!(stats.errors, 0);
}

#[test]
fn test_allocate_timeout_is_bounded() {
    let mut config = workers_config("slow", 1);
    config.command.push_str(" --delay-ms 800");
    let pool = Arc::new(start(&config));

    let busy = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.exec(&Payload::body_only("slow")))
    };
    assert!(eventually(|| pool.stats().working == 1));

    let started = Instant::now();
    let err = pool
        .exec_timeout(&Payload::body_only("queued"), Duration::from_millis(100))
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, RelayvisorError::AllocateTimeout(_)));
    assert!(err.is_backpressure());
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(700));

    // The busy worker is unaffected.
    assert_eq!(body(&busy.join().unwrap().unwrap()), "slow");
    assert_eq!(pool.stats().allocate_timeouts, 1);
}

#[test]
fn test_crashed_worker_is_replaced_with_stderr() {
    let pool = start(&workers_config("broken", 1));
    let pid = pool.workers()[0].pid;

    let err = pool.exec(&Payload::body_only("boom")).unwrap_err();
    assert!(matches!(err, RelayvisorError::Worker { .. }), "{:?}", err);
    let stderr = err.stderr().unwrap_or_default();
    assert!(stderr.contains("worker crashed"), "stderr: {:?}", stderr);

    assert!(eventually(|| {
        let workers = pool.workers();
        workers.len() == 1 && workers[0].pid != pid && workers[0].state == WorkerState::Ready
    }));
    assert_eq!(pool.stats().restarts, 1);
}

#[test]
fn test_error_frame_is_job_error() {
    let pool = start(&workers_config("error", 1));
    let err = pool.exec(&Payload::body_only("x")).unwrap_err();
    match err {
        RelayvisorError::Job(message) => assert_eq!(message, "worker error mode"),
        other => panic!("expected job error, got {:?}", other),
    }
    assert_eq!(pool.stats().errors, 1);
}

#[test]
fn test_max_jobs_recycles_worker() {
    let mut config = workers_config("pid", 1);
    config.pool.max_jobs = 2;
    let pool = start(&config);

    let first = body(&pool.exec(&Payload::body_only("")).unwrap());
    let second = body(&pool.exec(&Payload::body_only("")).unwrap());
    let third = body(&pool.exec(&Payload::body_only("")).unwrap());

    assert_eq!(first, second);
    assert_ne!(second, third);
    assert_eq!(pool.stats().errors, 0);
}

#[test]
fn test_idle_worker_death_is_not_handed_out() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pool = start(&workers_config("pid", 1));
    let pid = pool.workers()[0].pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    thread::sleep(Duration::from_millis(100));

    let response = pool.exec(&Payload::body_only("")).unwrap();
    assert_ne!(body(&response), pid.to_string());
}

#[test]
fn test_destroy_waits_for_in_flight_job() {
    let mut config = workers_config("slow", 2);
    config.command.push_str(" --delay-ms 400");
    let pool = Arc::new(start(&config));

    let in_flight = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.exec(&Payload::body_only("finish me")))
    };
    assert!(eventually(|| pool.stats().working == 1));

    pool.destroy();
    assert!(pool.is_stopping());
    assert!(pool.workers().is_empty());
    assert_eq!(body(&in_flight.join().unwrap().unwrap()), "finish me");

    let err = pool.exec(&Payload::body_only("late")).unwrap_err();
    assert!(matches!(err, RelayvisorError::PoolStopped));
}

#[test]
fn test_destroy_kills_after_deadline() {
    let mut config = workers_config("slow", 1);
    config.command.push_str(" --delay-ms 10000");
    config.pool.destroy_timeout = Duration::from_millis(300).as_nanos() as u64;
    let pool = Arc::new(start(&config));

    let stuck = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.exec(&Payload::body_only("never")))
    };
    assert!(eventually(|| pool.stats().working == 1));

    let started = Instant::now();
    pool.destroy();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(stuck.join().unwrap().is_err());
}

#[test]
fn test_broken_start_fails_construction() {
    let err = Pool::from_config(&workers_config("broken-start", 2), EventBus::default())
        .err()
        .unwrap();
    assert!(!err.is_config());
}

#[test]
fn test_empty_command_is_config_error() {
    let mut config = workers_config("echo", 1);
    config.command = "   ".to_string();
    let err = Pool::from_config(&config, EventBus::default()).err().unwrap();
    assert!(err.is_config());
}

#[test]
fn test_events_report_worker_lifecycle() {
    let events = EventBus::default();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        events.add_listener(move |event: &relayvisor::Event| {
            seen.lock().unwrap().push(event.kind);
        });
    }

    let pool = Pool::from_config(&workers_config("echo", 2), events).unwrap();
    pool.destroy();

    assert!(eventually(|| {
        let seen = seen.lock().unwrap();
        seen.iter().filter(|k| **k == EventKind::WorkerCreate).count() == 2
            && seen.iter().filter(|k| **k == EventKind::WorkerDestruct).count() == 2
            && seen.contains(&EventKind::PoolCreate)
    }));
}

#[test]
fn test_distinct_workers_serve_parallel_jobs() {
    let pool = start(&workers_config("pid", 3));
    let pids: HashSet<u32> = pool.workers().iter().map(|w| w.pid).collect();
    assert_eq!(pids.len(), 3);

    for _ in 0..6 {
        let pid: u32 = body(&pool.exec(&Payload::body_only("")).unwrap())
            .parse()
            .unwrap();
        assert!(pids.contains(&pid));
    }
}
