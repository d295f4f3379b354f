//! Core traits for Matrixon
//!
//! The collaborators the missing-state resolver talks to. Each one is a seam
//! so the engine can be driven by a real federation client and database in
//! production and by in-memory fakes in tests.

use std::sync::Arc;

use async_trait::async_trait;
use ruma::{EventId, OwnedEventId, RoomId, RoomVersionId, ServerName};

use crate::{
    pdu::PduEvent,
    types::{
        InputRoomEvent, MissingEventsRequest, RemoteState, SnapshotKnowledge, StateAfterEvents,
        StateIds,
    },
    Result,
};

/// Outbound federation requests used while filling a gap
#[async_trait]
pub trait FederationGateway: Send + Sync {
    /// Ask `server` for the events between `earliest_events` and `latest_events`
    async fn get_missing_events(
        &self,
        server: &ServerName,
        room_id: &RoomId,
        request: MissingEventsRequest,
        room_version: &RoomVersionId,
    ) -> Result<Vec<PduEvent>>;

    /// IDs of the state (and its auth chain) before `event_id`
    async fn get_room_state_ids(
        &self,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateIds>;

    /// Full state (and its auth chain) before `event_id`
    async fn get_room_state(
        &self,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
        room_version: &RoomVersionId,
    ) -> Result<RemoteState>;

    /// A single event by ID
    async fn get_event(
        &self,
        server: &ServerName,
        event_id: &EventId,
        room_version: &RoomVersionId,
    ) -> Result<PduEvent>;
}

/// Read access to the locally stored room graph
#[async_trait]
pub trait LocalGraph: Send + Sync {
    /// Current forward extremities of the room
    async fn latest_events(&self, room_id: &RoomId) -> Result<Vec<OwnedEventId>>;

    /// State after the given events; `prev_events_exist` is false if any is unknown
    async fn state_after_events(
        &self,
        room_id: &RoomId,
        event_ids: &[OwnedEventId],
    ) -> Result<StateAfterEvents>;

    /// Locally stored events; unknown IDs are silently skipped
    async fn events_by_id(&self, event_ids: &[OwnedEventId]) -> Result<Vec<Arc<PduEvent>>>;

    /// Whether a before-state snapshot is recorded for each ID
    async fn state_snapshot_known(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<SnapshotKnowledge>;
}

/// Signature verification against the sending servers' keys
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_event(&self, event: &PduEvent) -> Result<()>;
}

/// Entry point of the room event ingestion pipeline
#[async_trait]
pub trait IngestionSink: Send + Sync {
    /// A `MatrixonError::Rejected` result means only this event was refused
    async fn process_room_event(&self, input: InputRoomEvent) -> Result<()>;
}

/// The state-resolution algorithm for a room version
#[async_trait]
pub trait StateResolver: Send + Sync {
    /// Merge the union of several state sets into one set with a single
    /// event per `(type, state_key)`
    async fn resolve_conflicts(
        &self,
        room_version: &RoomVersionId,
        state_events: Vec<Arc<PduEvent>>,
        auth_events: Vec<Arc<PduEvent>>,
    ) -> Result<Vec<Arc<PduEvent>>>;
}

/// Why an event failed authorisation against a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// One of the event's auth events was not in the supplied set
    MissingAuthEvent(OwnedEventId),
    Forbidden(String),
}

/// Room authorisation rules
pub trait EventAuthorizer: Send + Sync {
    /// Check `event` against the given auth events
    fn allowed(
        &self,
        event: &PduEvent,
        auth_events: &[Arc<PduEvent>],
    ) -> std::result::Result<(), AuthFailure>;
}
