//! Integration tests for polled sessions.
//!
//! These tests require the `mock` feature to be enabled.

#![cfg(feature = "mock")]

use std::path::PathBuf;
use std::time::Duration;

use remote_exec::mock::{CommandBehavior, MockTransport};
use remote_exec::{
    CancellationToken, NodeConfig, PollHandle, PollRequest, PollState, RemoteError, RemoteNode,
    Timings,
};
use tokio::time::Instant;

fn node(transport: &MockTransport) -> RemoteNode<MockTransport> {
    let config = NodeConfig::new("172.16.0.9")
        .username("tester")
        .password("pw")
        .timings(Timings::fast());
    RemoteNode::new(config, transport.clone())
}

fn sink(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "remote-exec-{name}-{}.log",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);
    path
}

#[tokio::test(start_paused = true)]
async fn completed_run_reports_exit_status_and_fills_sink() {
    let transport = MockTransport::new().with_command(
        "ping -c 3",
        CommandBehavior::output("3 packets transmitted\n")
            .stderr("warning: ttl\n")
            .runtime(Duration::from_millis(300)),
    );
    let node = node(&transport);
    let path = sink("completed");
    let handle = PollHandle::new();

    let outcome = node
        .run_polled(
            PollRequest::new("ping -c 3 10.0.0.1", &path).timeout(Duration::from_secs(10)),
            &handle,
        )
        .await
        .unwrap();

    assert_eq!(outcome.state, PollState::Completed);
    assert_eq!(outcome.exit_status, Some(0));
    // stderr is merged into the stream
    assert!(outcome.output.contains("3 packets transmitted"));
    assert!(outcome.output.contains("warning: ttl"));
    assert_eq!(handle.state(), PollState::Completed);

    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written, outcome.output);
    assert!(node.session_stats().is_idle());

    let record = transport.commands().pop().unwrap();
    assert!(record.pty);
    assert!(record.closed);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_within_one_poll_interval() {
    let transport = MockTransport::new().with_command("tail -f", CommandBehavior::hang());
    let node = node(&transport);
    let path = sink("timeout");
    let timeout = Duration::from_secs(1);
    let interval = Timings::fast().poll_interval;

    let started = Instant::now();
    let outcome = node
        .run_polled(
            PollRequest::new("tail -f /var/log/messages", &path).timeout(timeout),
            &PollHandle::new(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.state, PollState::TimedOut);
    assert_eq!(outcome.exit_status, None);
    assert!(elapsed >= timeout, "stopped early: {elapsed:?}");
    assert!(elapsed <= timeout + interval, "stopped late: {elapsed:?}");
    assert_eq!(transport.open_channels(), 0);
    assert!(transport.commands().pop().unwrap().closed);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_ends_run_without_exit_status() {
    let transport = MockTransport::new().with_command("top", CommandBehavior::hang());
    let node = node(&transport);
    let path = sink("stop");
    let handle = PollHandle::new();

    let (outcome, ()) = tokio::join!(
        node.run_polled(PollRequest::new("top -b", &path), &handle),
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.stop();
        }
    );

    let outcome = outcome.unwrap();
    assert_eq!(outcome.state, PollState::Stopped);
    assert_eq!(outcome.exit_status, None);
    assert!(node.session_stats().is_idle());
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test(start_paused = true)]
async fn parent_token_stops_run() {
    let transport = MockTransport::new().with_command("watch", CommandBehavior::hang());
    let node = node(&transport);
    let path = sink("parent");
    let parent = CancellationToken::new();

    let (outcome, ()) = tokio::join!(
        node.run_polled_with_cancel(PollRequest::new("watch df", &path), &parent),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            parent.cancel();
        }
    );

    assert_eq!(outcome.unwrap().state, PollState::Stopped);
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test(start_paused = true)]
async fn inputs_follow_output_and_prune_clears_incremental() {
    let transport = MockTransport::new().with_command(
        "passwd",
        CommandBehavior::output("Current password: ")
            .echo_input()
            .runtime(Duration::from_millis(300)),
    );
    let node = node(&transport);
    let path = sink("prune");
    let handle = PollHandle::new();

    let (outcome, ()) = tokio::join!(
        node.run_polled(
            PollRequest::new("passwd", &path).input_data("old\\nnew"),
            &handle
        ),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(handle.state(), PollState::Polling);
            assert!(handle.incremental_output().starts_with("Current password: "));
            handle.prune();
            assert_eq!(handle.incremental_output(), "");
        }
    );

    let outcome = outcome.unwrap();
    assert_eq!(outcome.state, PollState::Completed);
    assert_eq!(outcome.output, "Current password: old\nnew\n");
    assert_eq!(handle.output(), outcome.output);
    assert!(!handle.incremental_output().contains("Current password"));

    let record = transport.commands().pop().unwrap();
    assert_eq!(record.written_text(), "old\nnew\n");
    std::fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn unwritable_sink_is_an_io_error() {
    let transport = MockTransport::new();
    let node = node(&transport);
    let path = std::env::temp_dir()
        .join("remote-exec-missing-dir")
        .join("nested")
        .join("out.log");

    let err = node
        .run_polled(PollRequest::new("uptime", &path), &PollHandle::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Io { .. }));
    assert!(node.session_stats().is_idle());
    assert_eq!(transport.open_channels(), 0);
}
