//! Integration tests for the queue engine state machine.

mod common;

use chrono::Duration;
use futures::future::join_all;

use relayq::clock::{Clock, ManualClock};
use relayq::{ListenerId, QueueError, TaskStatus};

use common::client_at;

#[tokio::test]
async fn test_round_trip_enqueue_to_complete() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");

    let task_id = queue.enqueue("X").await.unwrap();
    let reserved = queue.dequeue("host_10").await.unwrap();
    assert_eq!(reserved.as_ref(), Some(&task_id));

    let parameters = queue.start(&task_id, "host_10", 321).await.unwrap();
    assert_eq!(parameters, "X");
    queue.complete(&task_id, "host_10", 321, "Y").await.unwrap();

    let task = client.task(&task_id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Complete));
    assert_eq!(task.parameters(), Some("X"));
    assert_eq!(task.result(), Some("Y"));
    assert_eq!(task.error(), None);
    assert_eq!(task.node(), Some("host_10"));
    assert_eq!(task.pid(), Some(321));

    let stats = client.admin().queue("Q").stats().await.unwrap();
    assert_eq!(stats.complete, 1);
    assert_eq!(stats.in_flight(), 0);
}

#[tokio::test]
async fn test_result_and_error_are_exclusive() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");

    let ok = queue.enqueue("ok").await.unwrap();
    let bad = queue.enqueue("bad").await.unwrap();
    for task_id in [&ok, &bad] {
        queue.dequeue("host_1").await.unwrap();
        queue.start(task_id, "host_1", 5).await.unwrap();
    }
    queue.complete(&ok, "host_1", 5, "fine").await.unwrap();
    queue.fail(&bad, "host_1", 5, "boom").await.unwrap();

    // A second terminal transition is rejected and leaves the outcome alone.
    let err = queue.fail(&ok, "host_1", 5, "late").await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidState {
            status: Some(TaskStatus::Complete),
            ..
        }
    ));

    for status in [TaskStatus::Complete, TaskStatus::Failed] {
        for task in client.admin().queue("Q").tasks(status).await.unwrap() {
            assert!(
                task.result().is_none() || task.error().is_none(),
                "task {} has both result and error",
                task.id()
            );
        }
    }
    assert_eq!(client.task(&bad).await.unwrap().error(), Some("boom"));
    assert_eq!(client.task(&ok).await.unwrap().error(), None);
}

#[tokio::test]
async fn test_dequeue_moves_task_into_one_reserved_list() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");
    let admin = client.admin();

    for listener in ["host_1", "host_2"] {
        queue.add_listener(listener).await.unwrap();
    }
    let first = queue.enqueue("a").await.unwrap();
    let second = queue.enqueue("b").await.unwrap();

    let taken_by_one = queue.dequeue("host_1").await.unwrap().unwrap();
    let taken_by_two = queue.dequeue("host_2").await.unwrap().unwrap();
    assert_eq!(taken_by_one, first);
    assert_eq!(taken_by_two, second);
    assert_eq!(queue.dequeue("host_1").await.unwrap(), None);

    let reserved = admin.queue("Q").tasks(TaskStatus::Reserved).await.unwrap();
    let mut ids: Vec<_> = reserved.iter().map(|t| t.id().clone()).collect();
    ids.sort();
    let mut expected = vec![first.clone(), second.clone()];
    expected.sort();
    assert_eq!(ids, expected);

    assert_eq!(client.task(&first).await.unwrap().node(), Some("host_1"));
    assert_eq!(client.task(&second).await.unwrap().node(), Some("host_2"));
    assert_eq!(admin.queue("Q").stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_concurrent_remove_listener_has_one_winner() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");
    queue.add_listener("host_77").await.unwrap();

    let removals = join_all((0..8).map(|_| queue.remove_listener("host_77"))).await;
    let counts: Vec<u64> = removals.into_iter().map(Result::unwrap).collect();

    assert_eq!(counts.iter().filter(|c| **c == 1).count(), 1);
    assert_eq!(counts.iter().filter(|c| **c == 0).count(), 7);

    let queues = client.admin().queues().await.unwrap();
    assert_eq!(queues[0].listeners, 0);
}

#[tokio::test]
async fn test_enqueue_due_tasks_is_idempotent() {
    let (client, clock, _) = client_at(1000);
    let queue = client.queue("Q");

    queue
        .schedule("a", clock.now() + Duration::seconds(1))
        .await
        .unwrap();
    queue
        .schedule("b", clock.now() + Duration::seconds(2))
        .await
        .unwrap();
    clock.advance(Duration::seconds(2));

    assert_eq!(queue.enqueue_due_tasks().await.unwrap(), 2);
    assert_eq!(queue.enqueue_due_tasks().await.unwrap(), 0);

    let stats = client.admin().queue("Q").stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.scheduled, 0);
}

#[tokio::test]
async fn test_due_tasks_are_promoted_in_eta_order() {
    let (client, clock, _) = client_at(1000);
    let queue = client.queue("Q");

    let late = queue
        .schedule("late", clock.now() + Duration::seconds(9))
        .await
        .unwrap();
    let early = queue
        .schedule("early", clock.now() + Duration::seconds(3))
        .await
        .unwrap();
    clock.advance(Duration::seconds(10));
    queue.enqueue_due_tasks().await.unwrap();

    assert_eq!(queue.dequeue("host_1").await.unwrap(), Some(early));
    assert_eq!(queue.dequeue("host_1").await.unwrap(), Some(late));
}

#[tokio::test]
async fn test_schedule_in_past_matches_enqueue() {
    let (client, clock, _) = client_at(1000);
    let queue = client.queue("Q");

    let enqueued = queue.enqueue("P").await.unwrap();
    let scheduled = queue
        .schedule("P", clock.now() - Duration::seconds(30))
        .await
        .unwrap();

    let a = client.task(&enqueued).await.unwrap();
    let b = client.task(&scheduled).await.unwrap();
    assert_eq!(a.status(), b.status());
    assert_eq!(b.status(), Some(TaskStatus::Pending));
    assert_eq!(a.parameters(), b.parameters());
    assert_eq!(a.created(), b.created());
    assert_eq!(b.eta(), None);

    let stats = client.admin().queue("Q").stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.scheduled, 0);
}

#[tokio::test]
async fn test_scheduled_task_becomes_due_exactly_at_eta() {
    let (client, clock, _) = client_at(1000);
    let queue = client.queue("Q");

    let task_id = queue
        .schedule("P", ManualClock::at_secs(1005).now())
        .await
        .unwrap();
    assert_eq!(
        client.task(&task_id).await.unwrap().status(),
        Some(TaskStatus::Scheduled)
    );

    clock.set(ManualClock::at_secs(1004).now());
    assert_eq!(queue.enqueue_due_tasks().await.unwrap(), 0);
    assert_eq!(
        client.task(&task_id).await.unwrap().status(),
        Some(TaskStatus::Scheduled)
    );

    clock.set(ManualClock::at_secs(1005).now());
    assert_eq!(queue.enqueue_due_tasks().await.unwrap(), 1);
    assert_eq!(
        client.task(&task_id).await.unwrap().status(),
        Some(TaskStatus::Pending)
    );

    let listener = client
        .listener_with_id("Q", ListenerId::new("host", 1))
        .await
        .unwrap();
    let task = listener.listen().await.unwrap();
    assert_eq!(task.id(), &task_id);
    assert_eq!(task.parameters(), Some("P"));
    assert_eq!(task.status(), Some(TaskStatus::Reserved));
}

#[tokio::test]
async fn test_listen_promotes_due_tasks() {
    let (client, clock, _) = client_at(1000);
    let queue = client.queue("Q");
    let listener = client
        .listener_with_id("Q", ListenerId::new("host", 1))
        .await
        .unwrap();

    queue
        .schedule("soon", clock.now() + Duration::seconds(5))
        .await
        .unwrap();
    assert!(listener.poll().await.unwrap().is_none());

    clock.advance(Duration::seconds(5));
    let task = listener.poll().await.unwrap().unwrap();
    assert_eq!(task.parameters(), Some("soon"));
}

#[tokio::test]
async fn test_delete_only_terminal_tasks() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");

    let running = queue.enqueue("r").await.unwrap();
    queue.dequeue("host_1").await.unwrap();
    queue.start(&running, "host_1", 9).await.unwrap();

    let err = queue
        .delete_task(&running, TaskStatus::Started)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { .. }));
    assert_eq!(
        client.task(&running).await.unwrap().status(),
        Some(TaskStatus::Started)
    );

    queue.complete(&running, "host_1", 9, "done").await.unwrap();
    queue
        .delete_task(&running, TaskStatus::Complete)
        .await
        .unwrap();

    let gone = client.task(&running).await.unwrap();
    assert!(gone.is_empty());
    assert_eq!(gone.status(), None);
    assert_eq!(gone.parameters(), None);
    assert_eq!(client.admin().queue("Q").stats().await.unwrap().complete, 0);

    let err = queue
        .delete_task(&running, TaskStatus::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::TaskNotFound(_)));
}

#[tokio::test]
async fn test_delete_through_another_queue_is_rejected() {
    let (client, _, _) = client_at(1000);
    let a = client.queue("A");
    let b = client.queue("B");

    let task_id = b.enqueue("owned by b").await.unwrap();
    b.dequeue("host_1").await.unwrap();
    b.start(&task_id, "host_1", 3).await.unwrap();
    b.complete(&task_id, "host_1", 3, "ok").await.unwrap();

    let err = a
        .delete_task(&task_id, TaskStatus::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::WrongQueue { ref owner, .. } if owner == "B"));

    let task = client.task(&task_id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Complete));
    assert_eq!(client.admin().queue("B").stats().await.unwrap().complete, 1);

    b.delete_task(&task_id, TaskStatus::Complete).await.unwrap();
    assert!(client.task(&task_id).await.unwrap().is_empty());
    assert_eq!(client.admin().queue("B").stats().await.unwrap().complete, 0);
}

#[tokio::test]
async fn test_start_through_another_queue_is_rejected() {
    let (client, _, _) = client_at(1000);
    let task_id = client.queue("B").enqueue("p").await.unwrap();
    client.queue("B").dequeue("host_1").await.unwrap();

    let err = client
        .queue("A")
        .start(&task_id, "host_1", 3)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::WrongQueue { .. }));
    assert_eq!(
        client.task(&task_id).await.unwrap().status(),
        Some(TaskStatus::Reserved)
    );
}

#[tokio::test]
async fn test_timestamps_are_non_decreasing() {
    let (client, clock, _) = client_at(1000);
    let queue = client.queue("Q");

    let task_id = queue.enqueue("x").await.unwrap();
    let created = client.task(&task_id).await.unwrap().created().unwrap();

    clock.advance(Duration::milliseconds(1500));
    queue.dequeue("host_1").await.unwrap();
    let reserved_at = client.task(&task_id).await.unwrap().updated().unwrap();

    clock.advance(Duration::seconds(3));
    queue.start(&task_id, "host_1", 1).await.unwrap();
    let task = client.task(&task_id).await.unwrap();

    assert_eq!(task.created(), Some(created));
    assert!(reserved_at > created);
    assert!(task.updated().unwrap() > reserved_at);
    assert_eq!(
        task.updated().unwrap().timestamp_millis(),
        (1000 + 1) * 1000 + 500 + 3000
    );
}
