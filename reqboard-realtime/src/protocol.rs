//! Message shapes exchanged with the change feed and the broadcast relay.
//!
//! Two families live here:
//!
//! ```text
//! change feed ──► RawChange ──try_from──► ChangeEvent ──► Reconciler
//!
//! relay channel "doc:<id>:presence"
//!   event "presence" ── PresenceMessage (Joined | Active | Cursor | Left)
//!   event "lock"     ── LockMessage     (Acquire | Release)
//! ```
//!
//! Broadcast payloads are bincode-encoded (serde mode); change rows stay JSON
//! because their columns are open-ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::Entity;
use crate::error::{RealtimeError, Result};

/// Identifies one connected client session (one per tab/process).
pub type ClientId = Uuid;
/// Identifies an authenticated user; a user may have several clients.
pub type UserId = Uuid;
/// Identifies a requirements document.
pub type DocumentId = Uuid;
/// Caller-assigned id attached to a write.
pub type OperationId = String;

/// Row column carrying the writer's client id.
pub const ORIGIN_COLUMN: &str = "client_id";
/// Row column carrying the writer's operation id.
pub const OPERATION_COLUMN: &str = "operation_id";

/// Relay event name for presence traffic.
pub const PRESENCE_EVENT: &str = "presence";
/// Relay event name for lock traffic.
pub const LOCK_EVENT: &str = "lock";

// ───────────────────────────────────────────────────────────────────
// Change feed
// ───────────────────────────────────────────────────────────────────

/// Watched entity kinds, one per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Block,
    Column,
    Requirement,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Document,
        EntityKind::Block,
        EntityKind::Column,
        EntityKind::Requirement,
    ];

    /// Table name on the change feed.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Document => "documents",
            EntityKind::Block => "blocks",
            EntityKind::Column => "columns",
            EntityKind::Requirement => "requirements",
        }
    }

    /// Parse a feed table name.
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }

    /// Column naming the parent entity, if the kind has one.
    pub fn parent_column(&self) -> Option<&'static str> {
        match self {
            EntityKind::Document => None,
            EntityKind::Block => Some("document_id"),
            EntityKind::Column | EntityKind::Requirement => Some("block_id"),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Row-level mutation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeType::Insert),
            "UPDATE" => Some(ChangeType::Update),
            "DELETE" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// Untyped row change as delivered by the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl RawChange {
    pub fn new(kind: EntityKind, change: ChangeType, new: Option<Value>, old: Option<Value>) -> Self {
        let event_type = match change {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        };
        Self {
            table: kind.table().to_string(),
            event_type: event_type.to_string(),
            new,
            old,
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// Best-effort `document_id` of the row, used by feeds to scope delivery.
    pub fn document_id(&self) -> Option<&str> {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get("document_id").and_then(Value::as_str))
    }

    /// Best-effort `id` of the row.
    pub fn row_id(&self) -> Option<String> {
        [self.new.as_ref(), self.old.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| row.get("id").and_then(crate::cache::id_string))
    }
}

/// One validated row-level mutation on a watched entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub change: ChangeType,
    /// Snapshot after the change (None on delete).
    pub new: Option<Entity>,
    /// Snapshot before the change (None on insert; may hold only the id).
    pub old: Option<Entity>,
    pub origin: Option<ClientId>,
    pub operation_id: Option<OperationId>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Id of the affected entity.
    pub fn entity_id(&self) -> &str {
        // try_from guarantees the relevant snapshot carries an id
        match self.change {
            ChangeType::Delete => self.old.as_ref().map(Entity::id).unwrap_or_default(),
            _ => self.new.as_ref().map(Entity::id).unwrap_or_default(),
        }
    }

    /// Snapshot used for parent resolution: new row, falling back to old.
    pub fn snapshot(&self) -> Option<&Entity> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = RealtimeError;

    fn try_from(raw: RawChange) -> Result<Self> {
        let kind = EntityKind::from_table(&raw.table)
            .ok_or_else(|| RealtimeError::Malformed(format!("unknown table {:?}", raw.table)))?;
        let change = ChangeType::parse(&raw.event_type).ok_or_else(|| {
            RealtimeError::Malformed(format!("unknown event type {:?}", raw.event_type))
        })?;

        let new = raw.new.map(Entity::try_from).transpose()?;
        let old = raw.old.map(Entity::try_from).transpose()?;

        match change {
            ChangeType::Insert | ChangeType::Update if new.is_none() => {
                return Err(RealtimeError::Malformed(format!("{kind} {change:?} without new row")));
            }
            ChangeType::Delete if old.is_none() => {
                return Err(RealtimeError::Malformed(format!("{kind} delete without old row")));
            }
            _ => {}
        }

        let rows = [new.as_ref(), old.as_ref()];
        let origin = rows
            .iter()
            .flatten()
            .find_map(|row| row.get_str(ORIGIN_COLUMN))
            .and_then(|s| Uuid::parse_str(s).ok());
        let operation_id = rows
            .iter()
            .flatten()
            .find_map(|row| row.get_str(OPERATION_COLUMN))
            .map(str::to_string);

        Ok(Self {
            kind,
            change,
            new,
            old,
            origin,
            operation_id,
            commit_timestamp: raw.commit_timestamp,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence & locks
// ───────────────────────────────────────────────────────────────────

/// Public profile announced on join/heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// Cursor location inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Block the cursor is in, if any.
    pub block_id: Option<String>,
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { block_id: None, x, y }
    }

    pub fn in_block(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }
}

/// Presence broadcasts on a document's presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// First announcement after subscribing.
    Joined {
        user: UserProfile,
        cursor: Option<CursorPosition>,
    },
    /// Periodic heartbeat.
    Active {
        user: UserProfile,
        cursor: Option<CursorPosition>,
    },
    /// High-frequency cursor move; does not count as a heartbeat.
    Cursor {
        user_id: UserId,
        position: CursorPosition,
    },
    /// Clean departure.
    Left { user_id: UserId },
}

impl PresenceMessage {
    pub fn user_id(&self) -> UserId {
        match self {
            PresenceMessage::Joined { user, .. } | PresenceMessage::Active { user, .. } => {
                user.user_id
            }
            PresenceMessage::Cursor { user_id, .. } | PresenceMessage::Left { user_id } => *user_id,
        }
    }
}

/// Soft-lock categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    Block,
    Column,
    Requirement,
}

impl std::str::FromStr for LockKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(LockKind::Block),
            "column" => Ok(LockKind::Column),
            "requirement" => Ok(LockKind::Requirement),
            other => Err(RealtimeError::Malformed(format!("unknown lock kind {other:?}"))),
        }
    }
}

/// Lock broadcasts on a document's presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockMessage {
    Acquire {
        entity_id: String,
        kind: LockKind,
        holder: UserProfile,
        client_id: ClientId,
    },
    Release {
        entity_id: String,
        user_id: UserId,
        client_id: ClientId,
    },
}

impl LockMessage {
    pub fn client_id(&self) -> ClientId {
        match self {
            LockMessage::Acquire { client_id, .. } | LockMessage::Release { client_id, .. } => {
                *client_id
            }
        }
    }
}

/// Encode a broadcast payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| RealtimeError::Encode(e.to_string()))
}

/// Decode a broadcast payload.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| RealtimeError::Decode(e.to_string()))?;
    Ok(msg)
}

// ───────────────────────────────────────────────────────────────────
// Channels
// ───────────────────────────────────────────────────────────────────

/// What a per-document channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    /// Row changes from the change feed.
    Changes,
    /// Presence, cursor and lock broadcasts.
    Presence,
}

/// Relay channel name for a document and purpose.
pub fn channel_name(doc_id: DocumentId, purpose: ChannelPurpose) -> String {
    match purpose {
        ChannelPurpose::Changes => format!("doc:{doc_id}:changes"),
        ChannelPurpose::Presence => format!("doc:{doc_id}:presence"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_kind_tables() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_table(kind.table()), Some(kind));
        }
        assert_eq!(EntityKind::from_table("comments"), None);
        assert_eq!(EntityKind::Block.parent_column(), Some("document_id"));
        assert_eq!(EntityKind::Requirement.parent_column(), Some("block_id"));
        assert_eq!(EntityKind::Document.parent_column(), None);
    }

    #[test]
    fn test_change_event_from_raw_insert() {
        let client = Uuid::new_v4();
        let raw = RawChange::new(
            EntityKind::Block,
            ChangeType::Insert,
            Some(json!({
                "id": "block-1",
                "document_id": "doc",
                "client_id": client.to_string(),
                "operation_id": "op-1",
            })),
            None,
        );

        let event = ChangeEvent::try_from(raw).unwrap();
        assert_eq!(event.kind, EntityKind::Block);
        assert_eq!(event.change, ChangeType::Insert);
        assert_eq!(event.entity_id(), "block-1");
        assert_eq!(event.origin, Some(client));
        assert_eq!(event.operation_id.as_deref(), Some("op-1"));
    }

    #[test]
    fn test_change_event_delete_uses_old_row() {
        let raw = RawChange::new(
            EntityKind::Column,
            ChangeType::Delete,
            None,
            Some(json!({ "id": 42 })),
        );
        let event = ChangeEvent::try_from(raw).unwrap();
        assert_eq!(event.entity_id(), "42");
        assert!(event.origin.is_none());
        assert!(event.operation_id.is_none());
    }

    #[test]
    fn test_lowercase_event_type_accepted() {
        let mut raw = RawChange::new(EntityKind::Document, ChangeType::Update, Some(json!({"id": "d"})), None);
        raw.event_type = "update".into();
        assert!(ChangeEvent::try_from(raw).is_ok());
    }

    #[test]
    fn test_malformed_changes_rejected() {
        let unknown_table = RawChange {
            table: "comments".into(),
            event_type: "INSERT".into(),
            new: Some(json!({"id": "c"})),
            old: None,
            commit_timestamp: None,
        };
        assert!(matches!(
            ChangeEvent::try_from(unknown_table),
            Err(RealtimeError::Malformed(_))
        ));

        let missing_id = RawChange::new(EntityKind::Block, ChangeType::Insert, Some(json!({"title": "x"})), None);
        assert!(ChangeEvent::try_from(missing_id).is_err());

        let insert_without_row = RawChange::new(EntityKind::Block, ChangeType::Insert, None, None);
        assert!(ChangeEvent::try_from(insert_without_row).is_err());

        let delete_without_row = RawChange::new(EntityKind::Block, ChangeType::Delete, None, None);
        assert!(ChangeEvent::try_from(delete_without_row).is_err());

        let mut bad_type = RawChange::new(EntityKind::Block, ChangeType::Insert, Some(json!({"id": "b"})), None);
        bad_type.event_type = "TRUNCATE".into();
        assert!(ChangeEvent::try_from(bad_type).is_err());
    }

    #[test]
    fn test_raw_change_json_shape() {
        let raw: RawChange = serde_json::from_value(json!({
            "table": "requirements",
            "event_type": "UPDATE",
            "new": {"id": "r1", "block_id": "b1"},
            "commit_timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(raw.old.is_none());
        assert_eq!(raw.row_id().as_deref(), Some("r1"));
        assert!(raw.commit_timestamp.is_some());
    }

    #[test]
    fn test_presence_message_encode_decode() {
        let user = UserProfile::new(Uuid::new_v4(), "Alice").with_avatar("https://a/x.png");
        let msg = PresenceMessage::Joined {
            user: user.clone(),
            cursor: Some(CursorPosition::new(1.5, 2.5).in_block("block-7")),
        };
        let decoded: PresenceMessage = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.user_id(), user.user_id);
    }

    #[test]
    fn test_lock_message_client_id() {
        let client = Uuid::new_v4();
        let msg = LockMessage::Release {
            entity_id: "req-1".into(),
            user_id: Uuid::new_v4(),
            client_id: client,
        };
        assert_eq!(msg.client_id(), client);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode::<LockMessage>(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_lock_kind_parse() {
        assert_eq!("block".parse::<LockKind>().unwrap(), LockKind::Block);
        assert!("table".parse::<LockKind>().is_err());
    }

    #[test]
    fn test_channel_names_distinct_per_purpose() {
        let doc = Uuid::new_v4();
        assert_ne!(
            channel_name(doc, ChannelPurpose::Changes),
            channel_name(doc, ChannelPurpose::Presence)
        );
        assert!(channel_name(doc, ChannelPurpose::Presence).ends_with(":presence"));
    }
}
