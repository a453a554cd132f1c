//! End-to-end tests against real child processes.
//!
//! `cat` echoes every frame back unchanged, which makes it a worker whose
//! response type equals its request type.

#![cfg(unix)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slotpool::{DispatchError, Dispatcher, DispatcherConfig, DisposeStage};
use slotpool_process::{
    ChannelError, CommandSpawner, ProcessAdapter, WorkerDispatcher, worker_dispatcher,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    id: u32,
    text: String,
}

fn echo(id: u32) -> Echo {
    Echo {
        id,
        text: format!("message {id}"),
    }
}

fn cat() -> CommandSpawner {
    CommandSpawner::new("cat")
}

#[tokio::test]
async fn requests_round_trip_through_workers() {
    let dispatcher: WorkerDispatcher<Echo, Echo> =
        worker_dispatcher(cat(), DispatcherConfig::new(2)).unwrap();
    let pids = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..8)
        .map(|id| {
            let pids = Arc::clone(&pids);
            dispatcher
                .submit(move |worker| async move {
                    if let Some(pid) = worker.pid() {
                        pids.lock().unwrap().insert(pid);
                    }
                    worker.call(echo(id)).await
                })
                .unwrap()
        })
        .collect();

    for (id, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response, echo(id as u32));
    }

    let spawned = pids.lock().unwrap().len();
    assert!((1..=2).contains(&spawned), "spawned {spawned} workers");

    dispatcher.shutdown().await.unwrap();
    insta::assert_json_snapshot!(dispatcher.stats(), @r#"
    {
      "concurrency": 2,
      "queued": 0,
      "running": 0,
      "slots": 0,
      "idle_slots": 0,
      "creating": 0,
      "closed": true
    }
    "#);
}

#[tokio::test]
async fn shutdown_request_is_sent_before_termination() {
    let adapter = ProcessAdapter::<Echo, Echo>::new(cat())
        .with_grace_period(Duration::from_secs(2))
        .with_shutdown_request(Echo {
            id: 0,
            text: "shutdown".to_string(),
        });
    let dispatcher = Dispatcher::start(DispatcherConfig::new(1).with_lazy(false), adapter)
        .await
        .unwrap();
    assert_eq!(dispatcher.stats().slots, 1);

    let response = dispatcher
        .submit(|worker| async move { worker.call(echo(1)).await })
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.id, 1);

    dispatcher.terminate().await.unwrap();
    assert!(dispatcher.is_closed());
}

#[tokio::test]
async fn worker_exiting_early_fails_only_its_task() {
    let dispatcher: WorkerDispatcher<Echo, Echo> = worker_dispatcher(
        CommandSpawner::new("sh").with_args(["-c", "exit 0"]),
        DispatcherConfig::new(1),
    )
    .unwrap();

    let result = dispatcher
        .submit(|worker| async move {
            // Give the child time to exit before talking to it.
            tokio::time::sleep(Duration::from_millis(50)).await;
            worker.call(echo(1)).await
        })
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(
        result,
        Err(ChannelError::Closed | ChannelError::Send(_))
    ));

    // Terminating a worker that already exited is not a failure.
    dispatcher.terminate().await.unwrap();
}

#[tokio::test]
async fn worker_ignoring_sigterm_is_killed_after_grace_period() {
    let spawner = CommandSpawner::new("sh").with_args(["-c", "trap '' TERM; exec cat"]);
    let adapter = ProcessAdapter::<Echo, Echo>::new(spawner)
        .with_grace_period(Duration::from_millis(100));
    let dispatcher = Dispatcher::new(DispatcherConfig::new(1), adapter).unwrap();

    let response = dispatcher
        .submit(|worker| async move { worker.call(echo(3)).await })
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, echo(3));

    tokio::time::timeout(Duration::from_secs(5), dispatcher.terminate())
        .await
        .expect("terminate should kill after the grace period")
        .unwrap();
}

#[tokio::test]
async fn missing_worker_binary_is_a_creation_failure() {
    let dispatcher: WorkerDispatcher<Echo, Echo> = worker_dispatcher(
        CommandSpawner::new("/nonexistent/slotpool-worker"),
        DispatcherConfig::new(1),
    )
    .unwrap();

    let result = dispatcher
        .submit(|worker| async move { worker.call(echo(1)).await })
        .unwrap()
        .await;
    assert!(matches!(result, Err(DispatchError::Creation(_))));
    assert_eq!(dispatcher.stats().slots, 0);
    dispatcher.terminate().await.unwrap();
}

#[tokio::test]
async fn failed_shutdown_request_still_terminates() {
    let adapter = ProcessAdapter::<Echo, Echo>::new(CommandSpawner::new("sh").with_args([
        "-c",
        "exec 0<&-; sleep 5",
    ]))
    .with_grace_period(Duration::from_secs(2))
    .with_shutdown_request(echo(0));
    let dispatcher = Dispatcher::start(DispatcherConfig::new(1).with_lazy(false), adapter)
        .await
        .unwrap();

    // Let the child close its stdin so the shutdown request cannot be written.
    tokio::time::sleep(Duration::from_millis(100)).await;

    match dispatcher.terminate().await {
        Err(DispatchError::Disposal(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors.failures()[0].stage, DisposeStage::Cleanup);
        }
        other => panic!("expected a cleanup failure, got {other:?}"),
    }
}

#[tokio::test]
async fn terminate_does_not_wait_for_unanswered_call() {
    // Reads every request, never answers.
    let spawner = CommandSpawner::new("sh").with_args(["-c", "exec cat > /dev/null"]);
    let adapter = ProcessAdapter::<Echo, Echo>::new(spawner)
        .with_grace_period(Duration::from_millis(200))
        .with_shutdown_request(echo(0));
    let dispatcher = Dispatcher::start(DispatcherConfig::new(1).with_lazy(false), adapter)
        .await
        .unwrap();

    let pending = dispatcher
        .submit(|worker| async move { worker.call(echo(1)).await })
        .unwrap();
    // Let the task write its request and start waiting for the response.
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), dispatcher.terminate())
        .await
        .expect("terminate should not wait for the pending call")
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending call should see the worker exit")
        .unwrap();
    assert!(matches!(
        result,
        Err(ChannelError::Closed | ChannelError::Receive(_))
    ));
}
