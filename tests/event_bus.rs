//! Event Bus Integration Tests
//!
//! Tests for per-owner delivery, drop-on-no-subscriber and deregistration.

use std::time::Duration;

use tokio_test::{assert_pending, assert_ready_eq, task};

use scribe::core::EventBus;
use scribe::domain::{EventFrame, NoteEvent, KEEPALIVE_FRAME};

#[tokio::test]
async fn test_events_without_subscribers_are_not_replayed() {
    let bus = EventBus::new(8);
    assert_eq!(bus.broadcast(1, "note-created", "1"), 0);
    assert_eq!(bus.owner_count(), 0);

    let mut sub = bus.subscribe(1);
    assert_eq!(sub.try_recv(), Some(EventFrame::KeepAlive));

    let mut next = task::spawn(sub.recv());
    assert_pending!(next.poll());
}

#[tokio::test]
async fn test_each_subscriber_gets_every_frame_in_order() {
    let bus = EventBus::new(8);
    let mut first = bus.subscribe(7);
    let mut second = bus.subscribe(7);

    assert_eq!(bus.publish(7, NoteEvent::Created, "3"), 2);
    assert_eq!(bus.broadcast(7, "note-status", "{}"), 2);

    for sub in [&mut first, &mut second] {
        assert_eq!(sub.recv().await, Some(EventFrame::KeepAlive));
        assert_eq!(sub.recv().await, Some(EventFrame::event("note-created", "3")));
        assert_eq!(sub.recv().await, Some(EventFrame::event("note-status", "{}")));
    }
}

#[tokio::test]
async fn test_owners_are_isolated() {
    let bus = EventBus::new(8);
    let mut alice = bus.subscribe(1);
    let mut bob = bus.subscribe(2);
    alice.try_recv();
    bob.try_recv();

    assert_eq!(bus.publish(1, NoteEvent::Archived, "10"), 1);
    assert_eq!(alice.try_recv(), Some(EventFrame::event("note-archived", "10")));
    assert_eq!(bob.try_recv(), None);
}

#[tokio::test]
async fn test_dropped_subscription_deregisters() {
    let bus = EventBus::new(8);
    let keep = bus.subscribe(1);
    let gone = bus.subscribe(1);
    assert_eq!(bus.subscriber_count(1), 2);

    drop(gone);
    assert_eq!(bus.subscriber_count(1), 1);
    assert_eq!(bus.publish(1, NoteEvent::Deleted, "4"), 1);

    drop(keep);
    assert_eq!(bus.owner_count(), 0);
    assert_eq!(bus.publish(1, NoteEvent::Deleted, "4"), 0);
}

#[tokio::test]
async fn test_full_buffer_drops_frames_but_keeps_subscriber() {
    let bus = EventBus::new(2);
    let mut sub = bus.subscribe(1);

    // Keep-alive occupies one slot
    assert_eq!(bus.broadcast(1, "a", "1"), 1);
    assert_eq!(bus.broadcast(1, "b", "2"), 0);
    assert_eq!(bus.subscriber_count(1), 1);

    assert_eq!(sub.try_recv(), Some(EventFrame::KeepAlive));
    assert_eq!(sub.try_recv(), Some(EventFrame::event("a", "1")));
    assert_eq!(sub.try_recv(), None);

    assert_eq!(bus.broadcast(1, "c", "3"), 1);
    assert_eq!(sub.try_recv(), Some(EventFrame::event("c", "3")));
}

#[tokio::test]
async fn test_waiting_subscriber_wakes_on_publish() {
    let bus = EventBus::new(8);
    let mut sub = bus.subscribe(5);
    sub.try_recv();

    {
        let mut next = task::spawn(sub.recv());
        assert_pending!(next.poll());

        bus.publish(5, NoteEvent::Processed, "9");
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some(EventFrame::event("note-processed", "9")));
    }

    let publisher = bus.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(5, NoteEvent::Unarchived, "9")
    });
    let frame = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .unwrap();
    assert_eq!(frame, Some(EventFrame::event("note-unarchived", "9")));
    assert_eq!(handle.await.unwrap(), 1);
}

#[test]
fn test_frames_render_as_sse() {
    assert_eq!(EventFrame::KeepAlive.to_sse(), KEEPALIVE_FRAME);
    let frame = EventFrame::event("note-status", r#"{"note_id":1,"status":"processing"}"#);
    assert_eq!(
        frame.to_string(),
        "event: note-status\ndata: {\"note_id\":1,\"status\":\"processing\"}\n\n"
    );
}
