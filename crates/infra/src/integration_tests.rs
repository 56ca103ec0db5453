//! End-to-end tests: client → event log → reader → projection, with the
//! chat room as the worked domain.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use streamlog_chat::{ChatEvent, ChatProjection};
use streamlog_core::{Cursor, StreamName, UserId};
use streamlog_events::{
    crypto, process_staged, EventEnvelope, EventMeta, LogData, LogDataKind,
    LogDataKindDeserializer, ProcessCallback, Projection, ProjectionError, ProjectionTx, Snapshot,
};

use crate::client::Client;
use crate::event_log::{AppendResult, EventLog, EventLogError, InMemoryEventLog, ReadResult};
use crate::keys::InMemorySystemConnector;
use crate::reader::{Reader, ReaderError};
use crate::snapshot_store::InMemorySnapshotStore;

struct Harness {
    log: Arc<InMemoryEventLog>,
    snapshots: Arc<InMemorySnapshotStore>,
    client: Arc<Client>,
}

async fn harness(page_size: usize) -> Harness {
    let log = Arc::new(InMemoryEventLog::with_page_size(page_size));
    harness_over(log.clone(), log).await
}

async fn harness_over(log: Arc<InMemoryEventLog>, front: Arc<dyn EventLog>) -> Harness {
    streamlog_observability::tracing::init(streamlog_observability::tracing::LogFormat::Text);

    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let keys = Arc::new(InMemorySystemConnector::new(front.clone()));
    let client = Arc::new(Client::new(front, snapshots.clone(), keys));

    client.create_stream(&StreamName::root(), None).await.unwrap();
    client.create_stream(&name("/chatrooms"), None).await.unwrap();

    Harness {
        log,
        snapshots,
        client,
    }
}

fn name(s: &str) -> StreamName {
    StreamName::new(s).unwrap()
}

fn said(user: &str, hour: u32, min: u32, id: u64, text: &str) -> EventEnvelope<ChatEvent> {
    let at = Utc.with_ymd_and_hms(2020, 8, 20, hour, min, 0).unwrap();
    EventEnvelope::new(
        EventMeta::new(at).with_user(UserId::new(user).unwrap()),
        ChatEvent::message(id, text),
    )
}

async fn open_room(h: &Harness, room: &str) -> StreamName {
    let stream = name(room);
    h.client.create_stream(&stream, None).await.unwrap();
    stream
}

fn chat_reader(h: &Harness, stream: &StreamName) -> Reader<ChatProjection> {
    Reader::new(stream.clone(), ChatProjection::new(stream.clone()), h.client.clone())
}

/// Post through the reader, the way an application would.
async fn post(
    reader: &Reader<ChatProjection>,
    user: &str,
    hour: u32,
    min: u32,
    text: &str,
) -> Result<AppendResult, ReaderError> {
    reader
        .transact_write(move |_| async move {
            let id = reader.with_projection(|p| p.next_id()).await;
            let cursor = reader.cursor().await;
            Ok(reader
                .client()
                .append_after(&cursor, &[said(user, hour, min, id, text)])
                .await?)
        })
        .await
}

#[tokio::test]
async fn chat_room_renders_posted_messages() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/offtopic").await;
    let reader = chat_reader(&h, &room);

    post(&reader, "joonas", 13, 45, "Testing first message").await.unwrap();
    post(&reader, "joonas", 13, 47, "Is anybody listening?").await.unwrap();

    reader.load_until_realtime().await.unwrap();
    assert_eq!(
        reader.with_projection(|p| p.rendered()).await,
        vec![
            "13:45:00 joonas: Testing first message",
            "13:47:00 joonas: Is anybody listening?",
        ]
    );

    // A second process sees the same room.
    let other = chat_reader(&h, &room);
    other.load_until_realtime().await.unwrap();
    assert_eq!(
        other.with_projection(|p| p.rendered()).await,
        reader.with_projection(|p| p.rendered()).await
    );
}

#[tokio::test]
async fn replay_is_idempotent_and_writes_no_extra_snapshots() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/a").await;
    h.client
        .append(&room, &[said("u", 9, 0, 1, "one"), said("u", 9, 1, 2, "two")])
        .await
        .unwrap();

    let reader = chat_reader(&h, &room);
    reader.load_until_realtime().await.unwrap();
    let before = reader.with_projection(|p| p.room().clone()).await;
    let writes = h.snapshots.write_calls();

    reader.load_until_realtime().await.unwrap();
    reader.load_until_realtime().await.unwrap();

    assert_eq!(reader.with_projection(|p| p.room().clone()).await, before);
    assert_eq!(h.snapshots.write_calls(), writes);
}

/// Records the version of every committed batch.
struct Committed {
    cursor: Cursor,
    events: usize,
    versions: Vec<i64>,
}

impl Projection for Committed {
    type Event = ChatEvent;

    fn process_events(
        &mut self,
        process: ProcessCallback<'_, ChatEvent>,
    ) -> Result<(), ProjectionError> {
        let before = self.cursor.clone();
        process_staged(
            &mut self.events,
            &mut self.cursor,
            |count: &mut usize, _| {
                *count += 1;
                Ok(())
            },
            process,
        )?;
        if self.cursor != before {
            self.versions.push(self.cursor.version());
        }
        Ok(())
    }

    fn event_types(&self) -> Vec<LogDataKindDeserializer<ChatEvent>> {
        vec![LogDataKindDeserializer::encrypted_data(ChatEvent::types())]
    }
}

#[tokio::test]
async fn every_entry_is_delivered_exactly_once() {
    let h = harness(2).await;
    let room = open_room(&h, "/chatrooms/busy").await;
    let reader = Reader::new(
        room.clone(),
        Committed {
            cursor: Cursor::beginning_of(room.clone()),
            events: 0,
            versions: Vec::new(),
        },
        h.client.clone(),
    );

    let mut id = 0;
    for round in 0..4 {
        for _ in 0..=round {
            id += 1;
            h.client.append(&room, &[said("u", 10, 0, id, "m")]).await.unwrap();
        }
        reader.load_until_realtime().await.unwrap();
    }

    let head = h.log.head(&room).unwrap();
    let (versions, events) = reader
        .with_projection(|p| (p.versions.clone(), p.events))
        .await;
    assert_eq!(versions, (0..=head).collect::<Vec<_>>());
    assert_eq!(events as u64, id);
}

#[tokio::test]
async fn pagination_reaches_the_head() {
    let h = harness(3).await;
    let room = open_room(&h, "/chatrooms/paged").await;
    for id in 1..=10 {
        h.client.append(&room, &[said("u", 11, 0, id, "x")]).await.unwrap();
    }

    let reader = chat_reader(&h, &room);
    reader.load_until_realtime().await.unwrap();

    assert_eq!(reader.cursor().await, Cursor::new(room, 10));
    assert_eq!(reader.with_projection(|p| p.room().lines().len()).await, 10);
}

#[tokio::test]
async fn cold_start_uses_a_seeded_snapshot() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/snap").await;
    h.client.append(&room, &[said("u", 8, 0, 1, "replayed one")]).await.unwrap();
    h.client.append(&room, &[said("u", 8, 1, 2, "replayed two")]).await.unwrap();
    h.client.append(&room, &[said("u", 8, 2, 3, "after snapshot")]).await.unwrap();

    // State as of version 2 that replay would never produce.
    let mut seeded = ChatProjection::new(room.clone());
    let at = Cursor::new(room.clone(), 2);
    let mut seed = |tx: &mut dyn ProjectionTx<ChatEvent>| -> Result<(), ProjectionError> {
        tx.handle_event(said("snap", 7, 0, 2, "from snapshot"))?;
        tx.commit(at.clone())?;
        Ok(())
    };
    seeded.process_events(&mut seed).unwrap();

    let dek = h.client.load_dek(&room).await.unwrap();
    let sealed = crypto::seal(&seeded.snapshot().unwrap(), &dek).unwrap();
    let perspective = seeded.snapshot_perspective().unwrap();
    h.client
        .write_snapshot(&Snapshot::new(at, sealed, perspective))
        .await
        .unwrap();

    let reader = chat_reader(&h, &room);
    reader.load_until_realtime().await.unwrap();

    assert_eq!(
        reader.with_projection(|p| p.rendered()).await,
        vec!["07:00:00 snap: from snapshot", "08:02:00 u: after snapshot"]
    );
    assert_eq!(reader.cursor().await, Cursor::new(room, 3));
}

#[tokio::test]
async fn undecryptable_snapshot_is_ignored() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/garbled").await;
    h.client.append(&room, &[said("u", 8, 0, 1, "kept")]).await.unwrap();

    let perspective = ChatProjection::new(room.clone()).snapshot_perspective().unwrap();
    h.client
        .write_snapshot(&Snapshot::new(Cursor::new(room.clone(), 1), vec![1, 2, 3], perspective))
        .await
        .unwrap();

    let reader = chat_reader(&h, &room);
    reader.load_until_realtime().await.unwrap();
    assert_eq!(reader.with_projection(|p| p.rendered()).await, vec!["08:00:00 u: kept"]);
}

#[tokio::test]
async fn transact_write_converges_on_the_third_try() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/race").await;
    let reader = chat_reader(&h, &room);
    let tries = AtomicUsize::new(0);

    let (reader, tries, room) = (&reader, &tries, &room);
    let result = reader
        .transact_write(move |attempt| async move {
            tries.fetch_add(1, Ordering::SeqCst);
            let cursor = reader.cursor().await;
            let id = reader.with_projection(|p| p.next_id()).await;
            if attempt < 3 {
                // Someone else wins the race for this position.
                reader
                    .client()
                    .append(room, &[said("rival", 12, attempt, 100 + attempt as u64, "first!")])
                    .await?;
            }
            Ok(reader
                .client()
                .append_after(&cursor, &[said("me", 12, 30, id, "mine")])
                .await?)
        })
        .await
        .unwrap();

    assert_eq!(tries.load(Ordering::SeqCst), 3);
    assert_eq!(result.cursor.version(), 3);

    reader.load_until_realtime().await.unwrap();
    let lines = reader.with_projection(|p| p.rendered()).await;
    assert_eq!(lines.last().map(String::as_str), Some("12:30:00 me: mine"));
}

#[tokio::test]
async fn transact_write_gives_up_after_four_tries() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/hopeless").await;
    let reader = chat_reader(&h, &room);
    let tries = AtomicUsize::new(0);

    let (reader, tries, room) = (&reader, &tries, &room);
    let err = reader
        .transact_write(move |attempt| async move {
            tries.fetch_add(1, Ordering::SeqCst);
            let cursor = reader.cursor().await;
            reader
                .client()
                .append(room, &[said("rival", 12, attempt, 100 + attempt as u64, "again")])
                .await?;
            Ok(reader
                .client()
                .append_after(&cursor, &[said("me", 12, 30, 1, "never")])
                .await?)
        })
        .await
        .unwrap_err();

    assert_eq!(tries.load(Ordering::SeqCst), 4);
    assert!(matches!(err, ReaderError::RetriesExhausted { tries: 4, .. }));
    assert!(err.to_string().contains('4'));
}

#[tokio::test]
async fn transact_write_does_not_retry_other_failures() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/plain").await;
    let reader = chat_reader(&h, &room);
    let tries = AtomicUsize::new(0);

    let tries_ref = &tries;
    let err = reader
        .transact_write(move |_| async move {
            tries_ref.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ReaderError::Other(anyhow::anyhow!("message too long")))
        })
        .await
        .unwrap_err();

    assert_eq!(tries.load(Ordering::SeqCst), 1);
    assert!(err.to_string().contains("message too long"));
}

#[tokio::test]
async fn unknown_entry_kinds_are_stepped_over() {
    let h = harness(100).await;
    let room = open_room(&h, "/chatrooms/future").await;
    h.client.append(&room, &[said("u", 9, 0, 1, "before")]).await.unwrap();
    h.log
        .push_raw(&room, LogData::new(LogDataKind::Other(9), b"from a newer writer".to_vec()))
        .unwrap();
    h.client.append(&room, &[said("u", 9, 5, 2, "after")]).await.unwrap();

    let reader = chat_reader(&h, &room);
    reader.load_until_realtime().await.unwrap();

    assert_eq!(
        reader.with_projection(|p| p.rendered()).await,
        vec!["09:00:00 u: before", "09:05:00 u: after"]
    );
    assert_eq!(reader.cursor().await, Cursor::new(room, 3));
}

#[tokio::test]
async fn failed_child_creation_changes_nothing() {
    let h = harness(100).await;
    let parent = name("/chatrooms");
    let parent_head = h.log.head(&parent);
    h.log.fail_writes_to(&parent);

    let err = h
        .client
        .create_stream(&name("/chatrooms/doomed"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, crate::ClientError::EventLog(EventLogError::Storage(_))));
    assert_eq!(h.log.head(&name("/chatrooms/doomed")), None);
    assert_eq!(h.log.head(&parent), parent_head);

    h.log.heal(&parent);
    h.client.create_stream(&name("/chatrooms/doomed"), None).await.unwrap();
    assert_eq!(h.log.head(&parent), parent_head.map(|v| v + 1));
}

#[tokio::test]
async fn child_failure_after_the_parent_write_changes_nothing() {
    let h = harness(100).await;
    let parent = name("/chatrooms");
    let child = name("/chatrooms/halfway");
    let parent_head = h.log.head(&parent);
    h.log.fail_writes_to(&child);

    let err = h.client.create_stream(&child, None).await.unwrap_err();
    assert!(matches!(err, crate::ClientError::EventLog(EventLogError::Storage(_))));
    assert_eq!(h.log.head(&child), None);
    assert_eq!(h.log.head(&parent), parent_head);

    h.log.heal(&child);
    let created = h.client.create_stream(&child, None).await.unwrap();
    assert_eq!(created.parent, parent_head.map(|v| Cursor::new(parent.clone(), v + 1)));
}

/// Counts reads that reached the log.
struct CountingLog {
    inner: Arc<InMemoryEventLog>,
    reads: AtomicUsize,
}

#[async_trait]
impl EventLog for CountingLog {
    async fn read(&self, after: &Cursor) -> Result<ReadResult, EventLogError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(after).await
    }

    async fn append(
        &self,
        stream: &StreamName,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        self.inner.append(stream, data).await
    }

    async fn append_after(
        &self,
        after: &Cursor,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        self.inner.append_after(after, data).await
    }

    async fn create_stream(
        &self,
        stream: &StreamName,
        dek_envelope: &streamlog_events::DekEnvelope,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, EventLogError> {
        self.inner.create_stream(stream, dek_envelope, initial_data).await
    }
}

#[tokio::test(start_paused = true)]
async fn stale_reloads_are_coalesced() {
    let inner = Arc::new(InMemoryEventLog::new());
    let counting = Arc::new(CountingLog {
        inner: inner.clone(),
        reads: AtomicUsize::new(0),
    });
    let h = harness_over(inner, counting.clone()).await;
    let room = open_room(&h, "/chatrooms/hot").await;
    h.client.append(&room, &[said("u", 14, 0, 1, "warm up")]).await.unwrap();

    let reader = Arc::new(chat_reader(&h, &room));
    let max_age = Duration::from_secs(1);
    reader.load_until_realtime_if_stale(max_age).await.unwrap();

    // Fresh: nothing is read, new entries stay invisible.
    h.client.append(&room, &[said("u", 14, 1, 2, "new")]).await.unwrap();
    let reads = counting.reads.load(Ordering::SeqCst);
    reader.load_until_realtime_if_stale(max_age).await.unwrap();
    assert_eq!(counting.reads.load(Ordering::SeqCst), reads);
    assert_eq!(reader.with_projection(|p| p.room().lines().len()).await, 1);

    // Stale: a burst of callers costs one read.
    tokio::time::advance(Duration::from_secs(2)).await;
    let callers: Vec<_> = (0..5)
        .map(|_| {
            let reader = reader.clone();
            tokio::spawn(async move { reader.load_until_realtime_if_stale(max_age).await })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    assert_eq!(counting.reads.load(Ordering::SeqCst), reads + 1);
    assert_eq!(reader.with_projection(|p| p.room().lines().len()).await, 2);
}
