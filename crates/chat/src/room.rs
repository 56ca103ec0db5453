use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamlog_core::{Cursor, StreamName, UserId};
use streamlog_events::{
    process_staged, Event, EventEnvelope, EventTypes, LogDataKindDeserializer, ProcessCallback,
    Projection, ProjectionError, Snapshot, SnapshotPerspective,
};

pub const SNAPSHOT_CONTEXT: &str = "chat";
const SNAPSHOT_VERSION: u32 = 1;

/// Event: a message posted to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessage {
    pub id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
}

impl ChatEvent {
    pub fn message(id: u64, text: impl Into<String>) -> Self {
        ChatEvent::Message(ChatMessage {
            id,
            message: text.into(),
        })
    }

    pub fn types() -> EventTypes<ChatEvent> {
        EventTypes::new().register("chat.Message", ChatEvent::Message)
    }
}

impl Event for ChatEvent {
    fn meta_type(&self) -> &'static str {
        match self {
            ChatEvent::Message(_) => "chat.Message",
        }
    }

    fn encode_payload(&self) -> serde_json::Result<String> {
        match self {
            ChatEvent::Message(e) => serde_json::to_string(e),
        }
    }
}

/// One rendered line of a room's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub user: Option<UserId>,
    pub text: String,
}

impl core::fmt::Display for ChatLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let user = self.user.as_ref().map(UserId::as_str).unwrap_or("system");
        write!(f, "{} {}: {}", self.at.format("%H:%M:%S"), user, self.text)
    }
}

/// Read model: the messages of one room, in posting order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    lines: Vec<ChatLine>,
}

impl ChatRoom {
    pub fn lines(&self) -> &[ChatLine] {
        &self.lines
    }

    pub fn rendered(&self) -> Vec<String> {
        self.lines.iter().map(ToString::to_string).collect()
    }

    fn apply(&mut self, event: EventEnvelope<ChatEvent>) -> anyhow::Result<()> {
        let (meta, payload) = event.into_parts();
        match payload {
            ChatEvent::Message(msg) => {
                if self.lines.iter().any(|l| l.id == msg.id) {
                    anyhow::bail!("duplicate chat message id {}", msg.id);
                }
                self.lines.push(ChatLine {
                    id: msg.id,
                    at: meta.timestamp(),
                    user: meta.actor().cloned(),
                    text: msg.message,
                });
            }
        }
        Ok(())
    }
}

/// Replays a room stream into a [`ChatRoom`].
#[derive(Debug, Clone)]
pub struct ChatProjection {
    cursor: Cursor,
    room: ChatRoom,
}

impl ChatProjection {
    pub fn new(stream: StreamName) -> Self {
        Self {
            cursor: Cursor::beginning_of(stream),
            room: ChatRoom::default(),
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn room(&self) -> &ChatRoom {
        &self.room
    }

    pub fn rendered(&self) -> Vec<String> {
        self.room.rendered()
    }

    /// Next free message id.
    pub fn next_id(&self) -> u64 {
        self.room.lines.iter().map(|l| l.id).max().map_or(1, |id| id + 1)
    }
}

impl Projection for ChatProjection {
    type Event = ChatEvent;

    fn process_events(
        &mut self,
        process: ProcessCallback<'_, ChatEvent>,
    ) -> Result<(), ProjectionError> {
        process_staged(&mut self.room, &mut self.cursor, ChatRoom::apply, process)
    }

    fn event_types(&self) -> Vec<LogDataKindDeserializer<ChatEvent>> {
        vec![LogDataKindDeserializer::encrypted_data(ChatEvent::types())]
    }

    fn snapshot_perspective(&self) -> Option<SnapshotPerspective> {
        Some(SnapshotPerspective::new(SNAPSHOT_CONTEXT, SNAPSHOT_VERSION))
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.room)?)
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> anyhow::Result<()> {
        if snapshot.cursor.stream() != self.cursor.stream() {
            anyhow::bail!(
                "snapshot of {} offered to projection of {}",
                snapshot.cursor.stream(),
                self.cursor.stream()
            );
        }
        self.room = serde_json::from_slice(&snapshot.raw_data)?;
        self.cursor = snapshot.cursor.clone();
        Ok(())
    }
}
