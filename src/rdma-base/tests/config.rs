use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rdma_base::{Backoff, ConnectionConfig, Error, PollPolicy, SimFabric};

mod common;

fn scratch_file(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("rdma-base-{}-{}.toml", name, std::process::id()));
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn load_from_file() {
    let path = scratch_file(
        "load",
        r#"
send_wr = 32
buffer_size = 4096
rnr_retry_count = 7

[poll]
max_attempts = 1000
backoff = "spin"
"#,
    );
    let config = ConnectionConfig::from_path(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(config.send_wr, 32);
    assert_eq!(config.recv_wr, 16);
    assert_eq!(config.buffer_size, 4096);
    assert_eq!(config.rnr_retry_count, 7);
    assert_eq!(config.poll.max_attempts, Some(1000));
    assert_eq!(config.poll.backoff, Backoff::Spin);
    assert_eq!(config.conn_param().rnr_retry_count, 7);
}

#[test]
fn bad_files_are_reported() {
    let path = scratch_file("typo", "buffer_sise = 4096\n");
    let err = ConnectionConfig::from_path(&path).unwrap_err();
    fs::remove_file(&path).unwrap();
    assert!(matches!(err, Error::Config(_)), "{:?}", err);

    let missing = std::env::temp_dir().join("rdma-base-does-not-exist.toml");
    assert!(matches!(
        ConnectionConfig::from_path(missing),
        Err(Error::Io(_))
    ));
}

#[test]
fn poll_gives_up_after_attempts() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig {
        poll: PollPolicy::unbounded().with_max_attempts(16),
        ..Default::default()
    };
    let (_listener, mut server, _client) = common::registered_pair(&fabric, &config);
    server.post_receive().unwrap();
    assert!(matches!(server.poll_completion(), Err(Error::TimedOut(_))));
    // Nothing was consumed; the receive is still outstanding.
    assert_eq!(fabric.live_resources().unwrap().qps, 2);
}

#[test]
fn poll_gives_up_after_deadline() {
    let fabric = SimFabric::new();
    let config = ConnectionConfig::default();
    let (_listener, mut server, _client) = common::registered_pair(&fabric, &config);
    server.post_receive().unwrap();

    let policy = PollPolicy {
        backoff: Backoff::Exponential {
            initial_us: 10,
            max_us: 2_000,
        },
        ..PollPolicy::unbounded().with_timeout(Duration::from_millis(30))
    };
    assert_eq!(policy.timeout(), Some(Duration::from_millis(30)));
    let start = Instant::now();
    assert!(matches!(
        server.poll_completion_with(&policy),
        Err(Error::TimedOut(_))
    ));
    assert!(start.elapsed() >= Duration::from_millis(30));
}
