//! Core types for Matrixon
//!
//! Values exchanged between the missing-state resolver and its collaborators:
//! resolved state snapshots, federation responses, local graph answers and
//! the inputs handed to the ingestion pipeline.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use matrixon_common::{MatrixonError, Result};
use ruma::{OwnedEventId, OwnedServerName, RoomId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{pdu::PduEvent, traits::SignatureVerifier};

/// A consistent state snapshot: the state events plus the auth events
/// backing them.
#[derive(Debug, Clone, Default)]
pub struct ResolvedState {
    pub auth_events: Vec<Arc<PduEvent>>,
    pub state_events: Vec<Arc<PduEvent>>,
}

impl ResolvedState {
    pub fn new(auth_events: Vec<Arc<PduEvent>>, state_events: Vec<Arc<PduEvent>>) -> Self {
        Self {
            auth_events,
            state_events,
        }
    }

    /// IDs of the state events, in order
    pub fn state_event_ids(&self) -> Vec<OwnedEventId> {
        self.state_events
            .iter()
            .map(|event| event.event_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.auth_events.is_empty() && self.state_events.is_empty()
    }

    /// Puts `event` into the state, replacing whatever held its `(type, state_key)` slot.
    /// Non-state events are ignored.
    pub fn insert_state_event(&mut self, event: Arc<PduEvent>) {
        let Some(tuple) = event.state_tuple() else {
            return;
        };
        match self
            .state_events
            .iter_mut()
            .find(|existing| existing.state_tuple().as_ref() == Some(&tuple))
        {
            Some(slot) => *slot = event,
            None => self.state_events.push(event),
        }
    }

    /// Whether more than one state event claims the same `(type, state_key)` slot
    pub fn has_duplicate_state_keys(&self) -> bool {
        let mut seen = HashSet::new();
        self.state_events
            .iter()
            .filter_map(|event| event.state_tuple())
            .any(|tuple| !seen.insert(tuple))
    }
}

/// Result of the backfill step
#[derive(Debug, Clone, Default)]
pub struct MissingEventsOutcome {
    /// Topologically ordered, oldest first
    pub new_events: Vec<Arc<PduEvent>>,
    pub gap_closed: bool,
    pub predecessor_state_known: bool,
}

/// Body of a `/get_missing_events` style request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingEventsRequest {
    /// Latest event IDs the local server already has; walking stops at these
    pub earliest_events: Vec<OwnedEventId>,
    /// The event IDs to retrieve the previous events for
    pub latest_events: Vec<OwnedEventId>,
    pub limit: usize,
}

/// Compact state answer: IDs only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIds {
    pub pdu_ids: Vec<OwnedEventId>,
    pub auth_chain_ids: Vec<OwnedEventId>,
}

impl StateIds {
    /// State IDs followed by auth chain IDs
    pub fn wanted_ids(&self) -> Vec<OwnedEventId> {
        self.pdu_ids
            .iter()
            .chain(self.auth_chain_ids.iter())
            .cloned()
            .collect()
    }
}

/// Full materialised state answer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteState {
    pub pdus: Vec<PduEvent>,
    pub auth_chain: Vec<PduEvent>,
}

impl RemoteState {
    /// Validity check that must pass before the response is used: every
    /// event belongs to the room, matches its content hash, carries a valid
    /// signature, and every auth event it references is part of the response.
    pub async fn check(&self, room_id: &RoomId, verifier: &dyn SignatureVerifier) -> Result<()> {
        let known: HashSet<&OwnedEventId> = self
            .pdus
            .iter()
            .chain(self.auth_chain.iter())
            .map(|event| &event.event_id)
            .collect();

        for event in self.pdus.iter().chain(self.auth_chain.iter()) {
            if event.room_id != room_id {
                warn!("❌ State response contains {} from room {}", event.event_id, event.room_id);
                return Err(MatrixonError::InvalidEvent(format!(
                    "event {} belongs to {} not {}",
                    event.event_id, event.room_id, room_id
                )));
            }
            event.verify_content_hash()?;
            verifier.verify_event(event).await?;
            if let Some(missing) = event.auth_events.iter().find(|id| !known.contains(id)) {
                return Err(MatrixonError::InvalidEvent(format!(
                    "auth event {} of {} missing from state response",
                    missing, event.event_id
                )));
            }
        }

        debug!(
            "✅ State response checked: {} state events, {} auth events",
            self.pdus.len(),
            self.auth_chain.len()
        );
        Ok(())
    }
}

/// Local answer to "what is the state after these events"
#[derive(Debug, Clone, Default)]
pub struct StateAfterEvents {
    /// False when any of the queried events is unknown locally
    pub prev_events_exist: bool,
    pub state_events: Vec<Arc<PduEvent>>,
}

/// Per-event-ID knowledge of a before-state snapshot
pub type SnapshotKnowledge = HashMap<OwnedEventId, bool>;

/// How the ingestion pipeline should treat an injected event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// Stored only so it is available for auth checks, no position in the DAG
    Outlier,
    /// Historical event; `Some` carries the explicit state before it, `None`
    /// means fast-forward from the state of its prev events
    Old {
        state_event_ids: Option<Vec<OwnedEventId>>,
    },
}

/// An event handed to the ingestion pipeline
#[derive(Debug, Clone)]
pub struct InputRoomEvent {
    pub kind: InputKind,
    pub event: Arc<PduEvent>,
    pub origin: OwnedServerName,
    /// Server to send the event out as; always `None` for re-injected history
    pub send_as_server: Option<OwnedServerName>,
}

impl InputRoomEvent {
    pub fn outlier(event: Arc<PduEvent>, origin: OwnedServerName) -> Self {
        Self {
            kind: InputKind::Outlier,
            event,
            origin,
            send_as_server: None,
        }
    }

    pub fn old_with_state(
        event: Arc<PduEvent>,
        origin: OwnedServerName,
        state_event_ids: Vec<OwnedEventId>,
    ) -> Self {
        Self {
            kind: InputKind::Old {
                state_event_ids: Some(state_event_ids),
            },
            event,
            origin,
            send_as_server: None,
        }
    }

    pub fn old_fast_forward(event: Arc<PduEvent>, origin: OwnedServerName) -> Self {
        Self {
            kind: InputKind::Old {
                state_event_ids: None,
            },
            event,
            origin,
            send_as_server: None,
        }
    }

    pub fn has_state(&self) -> bool {
        matches!(
            self.kind,
            InputKind::Old {
                state_event_ids: Some(_)
            }
        )
    }
}

/// An event the ingestion pipeline or the auth replay refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub event_id: OwnedEventId,
    pub reason: String,
}

/// What a missing-state resolution produced for its caller
#[derive(Debug, Clone, Default)]
pub struct MissingStateOutcome {
    /// State before the triggering event, when the caller must attach it
    /// while injecting that event. `None` means fast-forward is enough.
    pub resolved_state: Option<ResolvedState>,
    pub rejected: Vec<Rejection>,
    /// Number of events accepted by the ingestion pipeline
    pub injected: usize,
}
