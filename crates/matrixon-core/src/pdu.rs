// =============================================================================
// Matrixon Matrix NextServer - PDU Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Immutable room event (PDU) and its builder. Event IDs are content
//   addressed: `$` + unpadded URL-safe base64 of the SHA-256 of the
//   canonical JSON of the event without `event_id`, `signatures` and the
//   room version header.
//
// =============================================================================

use std::{cmp::Ordering, collections::BTreeMap};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use matrixon_common::{MatrixonError, Result};
use ruma::{
    events::TimelineEventType, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId,
    RoomVersionId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Signatures of a PDU: server name -> key id -> signature
pub type PduSignatures = BTreeMap<OwnedServerName, BTreeMap<String, String>>;

#[derive(Clone, Deserialize, Debug, Serialize)]
pub struct PduEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub origin_server_ts: u64,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<OwnedEventId>,
    pub depth: u64,
    pub auth_events: Vec<OwnedEventId>,
    /// Protocol version of the room, governing format and auth rules
    pub room_version: RoomVersionId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: PduSignatures,
}

/// The subset of a PDU covered by its reference hash, in canonical key order.
#[derive(Serialize)]
struct HashedPdu<'a> {
    auth_events: &'a [OwnedEventId],
    content: &'a serde_json::Value,
    depth: u64,
    origin_server_ts: u64,
    prev_events: &'a [OwnedEventId],
    room_id: &'a OwnedRoomId,
    sender: &'a OwnedUserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_key: Option<&'a str>,
    #[serde(rename = "type")]
    kind: &'a TimelineEventType,
}

impl HashedPdu<'_> {
    fn reference_hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(&canonicalize(serde_json::to_value(self)?))?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(&canonical)))
    }

    fn event_id(&self) -> Result<OwnedEventId> {
        OwnedEventId::try_from(format!("${}", self.reference_hash()?))
            .map_err(|e| MatrixonError::InvalidEvent(format!("reference hash is not an event id: {e}")))
    }
}

/// Sorts object keys recursively so the serialisation does not depend on
/// insertion order.
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}

impl PduEvent {
    fn hashed(&self) -> HashedPdu<'_> {
        HashedPdu {
            auth_events: &self.auth_events,
            content: &self.content,
            depth: self.depth,
            origin_server_ts: self.origin_server_ts,
            prev_events: &self.prev_events,
            room_id: &self.room_id,
            sender: &self.sender,
            state_key: self.state_key.as_deref(),
            kind: &self.kind,
        }
    }

    /// Recomputes the content-addressed ID of this event
    pub fn calculate_event_id(&self) -> Result<OwnedEventId> {
        self.hashed().event_id()
    }

    /// Checks that the event ID matches the event's content
    pub fn verify_content_hash(&self) -> Result<()> {
        let calculated = self.calculate_event_id()?;
        if calculated != self.event_id {
            warn!(
                "❌ Event ID mismatch: claimed {}, content hashes to {}",
                self.event_id, calculated
            );
            return Err(MatrixonError::InvalidEvent(format!(
                "event {} does not match its content hash {}",
                self.event_id, calculated
            )));
        }
        Ok(())
    }

    /// Whether this is a state event (has a state key)
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn state_key_equals(&self, state_key: &str) -> bool {
        self.state_key.as_deref() == Some(state_key)
    }

    /// Whether this is the room-creation event (`m.room.create` with an empty state key)
    pub fn is_create(&self) -> bool {
        self.kind == TimelineEventType::RoomCreate && self.state_key_equals("")
    }

    /// The `(type, state_key)` tuple identifying the state slot this event fills
    pub fn state_tuple(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|key| (self.kind.to_string(), key.clone()))
    }
}

// These impl's allow us to dedup state snapshots when resolving state
// for incoming events.
impl Eq for PduEvent {}
impl PartialEq for PduEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}
impl PartialOrd for PduEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PduEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event_id.cmp(&other.event_id)
    }
}

/// Build a PDU and derive its content-addressed event ID.
#[derive(Debug, Clone)]
pub struct PduBuilder {
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub event_type: TimelineEventType,
    pub content: serde_json::Value,
    pub state_key: Option<String>,
    pub prev_events: Vec<OwnedEventId>,
    pub auth_events: Vec<OwnedEventId>,
    pub depth: u64,
    pub origin_server_ts: u64,
    pub room_version: RoomVersionId,
    pub signatures: PduSignatures,
}

impl PduBuilder {
    /// Create a new PduBuilder with basic required fields
    pub fn new(
        room_id: OwnedRoomId,
        sender: OwnedUserId,
        event_type: TimelineEventType,
        content: serde_json::Value,
    ) -> Self {
        Self {
            room_id,
            sender,
            event_type,
            content,
            state_key: None,
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            depth: 1,
            origin_server_ts: 0,
            room_version: RoomVersionId::V10,
            signatures: PduSignatures::new(),
        }
    }

    pub fn state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn prev_events(mut self, prev_events: Vec<OwnedEventId>) -> Self {
        self.prev_events = prev_events;
        self
    }

    pub fn auth_events(mut self, auth_events: Vec<OwnedEventId>) -> Self {
        self.auth_events = auth_events;
        self
    }

    pub fn depth(mut self, depth: u64) -> Self {
        self.depth = depth;
        self
    }

    pub fn origin_server_ts(mut self, ts: u64) -> Self {
        self.origin_server_ts = ts;
        self
    }

    pub fn room_version(mut self, room_version: RoomVersionId) -> Self {
        self.room_version = room_version;
        self
    }

    /// Attach a signature; signatures are not covered by the reference hash
    pub fn signature(
        mut self,
        server: OwnedServerName,
        key_id: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        self.signatures
            .entry(server)
            .or_default()
            .insert(key_id.into(), signature.into());
        self
    }

    pub fn build(self) -> Result<PduEvent> {
        let event_id = HashedPdu {
            auth_events: &self.auth_events,
            content: &self.content,
            depth: self.depth,
            origin_server_ts: self.origin_server_ts,
            prev_events: &self.prev_events,
            room_id: &self.room_id,
            sender: &self.sender,
            state_key: self.state_key.as_deref(),
            kind: &self.event_type,
        }
        .event_id()?;

        debug!("🔧 Built PDU {} ({}) in {}", event_id, self.event_type, self.room_id);

        Ok(PduEvent {
            event_id,
            room_id: self.room_id,
            sender: self.sender,
            origin_server_ts: self.origin_server_ts,
            kind: self.event_type,
            content: self.content,
            state_key: self.state_key,
            prev_events: self.prev_events,
            depth: self.depth,
            auth_events: self.auth_events,
            room_version: self.room_version,
            signatures: self.signatures,
        })
    }
}
