use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskpulse_core::models::{EntityId, EntityKind, MutationFields};

use crate::{Error, Result};

/// What happened to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
    Reassigned,
}

impl Action {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Reassigned => "reassigned",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical pub/sub channels, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    TaskUpdates,
    CommentUpdates,
    ProjectUpdates,
}

impl Topic {
    pub const ALL: [Self; 3] = [Self::TaskUpdates, Self::CommentUpdates, Self::ProjectUpdates];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TaskUpdates => "task_updates",
            Self::CommentUpdates => "comment_updates",
            Self::ProjectUpdates => "project_updates",
        }
    }

    /// Topic carrying events about `kind`
    #[must_use]
    pub const fn for_entity(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Task => Self::TaskUpdates,
            EntityKind::Comment => Self::CommentUpdates,
            EntityKind::Project | EntityKind::Section | EntityKind::Group => Self::ProjectUpdates,
        }
    }

    /// External channel name: `{prefix}{topic}`
    #[must_use]
    pub fn channel(&self, key_prefix: &str) -> String {
        format!("{key_prefix}{}", self.as_str())
    }

    /// Topic by its bare name, e.g. `task_updates`
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.as_str() == name)
    }

    /// Reverse of [`Topic::channel`]
    #[must_use]
    pub fn from_channel(key_prefix: &str, channel: &str) -> Option<Self> {
        Self::from_name(channel.strip_prefix(key_prefix)?)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Realtime event, as carried on the wire and over pub/sub
///
/// ```json
/// {"entity":"task","action":"updated","data":{"id":"..","title":".."},"timestamp":"2024-05-01T10:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entity: EntityKind,
    pub action: Action,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(entity: EntityKind, action: Action, data: Value) -> Self {
        Self {
            entity,
            action,
            data,
            timestamp: Utc::now(),
        }
    }

    /// `updated` event carrying the changed fields plus the entity id
    #[must_use]
    pub fn updated(entity: EntityKind, id: &EntityId, fields: &MutationFields) -> Self {
        let mut data = fields.clone();
        data.insert("id".to_string(), Value::String(id.to_string()));
        Self::new(entity, Action::Updated, Value::Object(data))
    }

    /// Id of the entity this event is about (`data.id`)
    pub fn entity_id(&self) -> Result<EntityId> {
        let raw = self
            .data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidEvent(format!("{} event without data.id", self.entity)))?;

        raw.parse()
            .map_err(|_| Error::InvalidEvent(format!("Malformed entity id: {raw}")))
    }

    #[must_use]
    pub const fn topic(&self) -> Topic {
        Topic::for_entity(self.entity)
    }
}

pub fn encode(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

pub fn decode(payload: &str) -> Result<Event> {
    Ok(serde_json::from_str(payload)?)
}

/// Frame sent by a client over its realtime connection
///
/// Same shape as [`Event`], but the timestamp is optional and stamped by the
/// server when missing.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub entity: EntityKind,
    pub action: Action,
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ClientRequest {
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Validate the payload and turn it into a publishable event
    pub fn into_event(self) -> Result<Event> {
        if !self.data.is_object() {
            return Err(Error::InvalidEvent("data must be a JSON object".to_string()));
        }

        let event = Event {
            entity: self.entity,
            action: self.action,
            data: self.data,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        };
        event.entity_id()?;

        Ok(event)
    }
}
