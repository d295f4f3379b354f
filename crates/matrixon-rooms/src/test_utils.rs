// =============================================================================
// Matrixon Matrix NextServer - Gap Resolution Test Utilities
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   In-memory federation, local graph, ingestion sink, signature verifier
//   and state resolver for exercising the resolver without a network or a
//   database, plus a small room fixture producing valid event chains.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use matrixon_common::MatrixonError;
use matrixon_core::{
    FederationGateway, IngestionSink, InputKind, InputRoomEvent, LocalGraph, MissingEventsRequest,
    PduBuilder, PduEvent, RemoteState, Result, SignatureVerifier, SnapshotKnowledge,
    StateAfterEvents, StateIds, StateResolver,
};
use ruma::{
    events::TimelineEventType, EventId, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId,
    RoomId, RoomVersionId, ServerName,
};
use serde_json::json;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What one fake remote server knows
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    events: HashMap<OwnedEventId, PduEvent>,
    missing_events: Option<Vec<PduEvent>>,
    state_ids: HashMap<OwnedEventId, StateIds>,
    state: HashMap<OwnedEventId, RemoteState>,
    unavailable: bool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events served by `/event`
    pub fn with_events<'a>(mut self, events: impl IntoIterator<Item = &'a Arc<PduEvent>>) -> Self {
        for event in events {
            self.events.insert(event.event_id.clone(), (**event).clone());
        }
        self
    }

    /// Answer to every `/get_missing_events`
    pub fn with_missing_events<'a>(
        mut self,
        events: impl IntoIterator<Item = &'a Arc<PduEvent>>,
    ) -> Self {
        self.missing_events = Some(events.into_iter().map(|e| (**e).clone()).collect());
        self
    }

    /// `/state_ids` answer at `event_id`; the events it names are also served by `/state`
    pub fn with_state_at(
        mut self,
        event_id: &EventId,
        state: &[Arc<PduEvent>],
        auth_chain: &[Arc<PduEvent>],
    ) -> Self {
        self.state_ids.insert(
            event_id.to_owned(),
            StateIds {
                pdu_ids: state.iter().map(|e| e.event_id.clone()).collect(),
                auth_chain_ids: auth_chain.iter().map(|e| e.event_id.clone()).collect(),
            },
        );
        self.state.insert(
            event_id.to_owned(),
            RemoteState {
                pdus: state.iter().map(|e| (**e).clone()).collect(),
                auth_chain: auth_chain.iter().map(|e| (**e).clone()).collect(),
            },
        );
        self
    }

    /// Every request to this server fails
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }
}

/// A request the fake federation received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FederationCall {
    MissingEvents(OwnedServerName, MissingEventsRequest),
    StateIds(OwnedServerName, OwnedEventId),
    State(OwnedServerName, OwnedEventId),
    Event(OwnedServerName, OwnedEventId),
}

#[derive(Debug, Default)]
pub struct FakeFederation {
    servers: Mutex<HashMap<OwnedServerName, FakeServer>>,
    calls: Mutex<Vec<FederationCall>>,
    delays: Mutex<HashMap<OwnedServerName, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFederation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, name: &ServerName, server: FakeServer) -> Self {
        lock(&self.servers).insert(name.to_owned(), server);
        self
    }

    /// Every request to `name` takes `delay` before answering
    pub fn with_delay(self, name: &ServerName, delay: Duration) -> Self {
        lock(&self.delays).insert(name.to_owned(), delay);
        self
    }

    pub fn calls(&self) -> Vec<FederationCall> {
        lock(&self.calls).clone()
    }

    pub fn event_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, FederationCall::Event(..)))
            .count()
    }

    pub fn full_state_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, FederationCall::State(..)))
            .count()
    }

    /// Highest number of `/event` requests observed in flight at once
    pub fn max_concurrent_event_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, server: &ServerName, call: FederationCall) -> Result<FakeServer> {
        lock(&self.calls).push(call);
        let delay = lock(&self.delays).get(server).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let known = lock(&self.servers).get(server).cloned();
        match known {
            Some(fake) if !fake.unavailable => Ok(fake),
            _ => Err(MatrixonError::federation(server, "server unavailable")),
        }
    }
}

#[async_trait]
impl FederationGateway for FakeFederation {
    async fn get_missing_events(
        &self,
        server: &ServerName,
        _room_id: &RoomId,
        request: MissingEventsRequest,
        _room_version: &RoomVersionId,
    ) -> Result<Vec<PduEvent>> {
        let fake = self
            .enter(server, FederationCall::MissingEvents(server.to_owned(), request.clone()))
            .await?;
        let mut events = fake
            .missing_events
            .ok_or_else(|| MatrixonError::federation(server, "no missing events configured"))?;
        events.truncate(request.limit);
        Ok(events)
    }

    async fn get_room_state_ids(
        &self,
        server: &ServerName,
        _room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateIds> {
        let fake = self
            .enter(server, FederationCall::StateIds(server.to_owned(), event_id.to_owned()))
            .await?;
        fake.state_ids
            .get(event_id)
            .cloned()
            .ok_or_else(|| MatrixonError::NotFound(format!("no state at {event_id}")))
    }

    async fn get_room_state(
        &self,
        server: &ServerName,
        _room_id: &RoomId,
        event_id: &EventId,
        _room_version: &RoomVersionId,
    ) -> Result<RemoteState> {
        let fake = self
            .enter(server, FederationCall::State(server.to_owned(), event_id.to_owned()))
            .await?;
        fake.state
            .get(event_id)
            .cloned()
            .ok_or_else(|| MatrixonError::NotFound(format!("no state at {event_id}")))
    }

    async fn get_event(
        &self,
        server: &ServerName,
        event_id: &EventId,
        _room_version: &RoomVersionId,
    ) -> Result<PduEvent> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self
            .enter(server, FederationCall::Event(server.to_owned(), event_id.to_owned()))
            .await
            .and_then(|fake| {
                fake.events
                    .get(event_id)
                    .cloned()
                    .ok_or_else(|| MatrixonError::NotFound(format!("no event {event_id}")))
            });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Default)]
struct GraphState {
    events: HashMap<OwnedEventId, Arc<PduEvent>>,
    state_after: HashMap<OwnedEventId, Vec<Arc<PduEvent>>>,
    snapshot_known: HashSet<OwnedEventId>,
    latest: HashMap<OwnedRoomId, Vec<OwnedEventId>>,
}

/// Local graph where events with a known state snapshot also know the
/// state after them.
#[derive(Debug, Default)]
pub struct FakeLocalGraph {
    inner: Mutex<GraphState>,
}

fn with_event_applied(mut state: Vec<Arc<PduEvent>>, event: &Arc<PduEvent>) -> Vec<Arc<PduEvent>> {
    if let Some(tuple) = event.state_tuple() {
        state.retain(|existing| existing.state_tuple().as_ref() != Some(&tuple));
        state.push(Arc::clone(event));
    }
    state
}

impl FakeLocalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `event` without a state snapshot
    pub fn add_outlier(&self, event: &Arc<PduEvent>) {
        lock(&self.inner)
            .events
            .insert(event.event_id.clone(), Arc::clone(event));
    }

    /// Stores `event` with `state_before` as its snapshot
    pub fn add_with_state(&self, event: &Arc<PduEvent>, state_before: Vec<Arc<PduEvent>>) {
        let mut inner = lock(&self.inner);
        inner
            .events
            .insert(event.event_id.clone(), Arc::clone(event));
        inner.snapshot_known.insert(event.event_id.clone());
        inner
            .state_after
            .insert(event.event_id.clone(), with_event_applied(state_before, event));
    }

    pub fn set_latest_events(&self, room_id: &RoomId, latest: Vec<OwnedEventId>) {
        lock(&self.inner).latest.insert(room_id.to_owned(), latest);
    }

    pub fn has_snapshot(&self, event_id: &EventId) -> bool {
        lock(&self.inner).snapshot_known.contains(event_id)
    }

    /// What the ingestion pipeline does with an accepted event
    fn ingest(&self, input: &InputRoomEvent) {
        let event = &input.event;
        let state_before = {
            let inner = lock(&self.inner);
            match &input.kind {
                InputKind::Outlier => None,
                InputKind::Old {
                    state_event_ids: Some(ids),
                } => Some(
                    ids.iter()
                        .filter_map(|id| inner.events.get(id).cloned())
                        .collect::<Vec<_>>(),
                ),
                InputKind::Old {
                    state_event_ids: None,
                } => match event.prev_events.as_slice() {
                    [] => Some(Vec::new()),
                    [prev, ..] => inner.state_after.get(prev).cloned(),
                },
            }
        };
        match state_before {
            Some(state) => self.add_with_state(event, state),
            None => self.add_outlier(event),
        }
    }
}

#[async_trait]
impl LocalGraph for FakeLocalGraph {
    async fn latest_events(&self, room_id: &RoomId) -> Result<Vec<OwnedEventId>> {
        Ok(lock(&self.inner)
            .latest
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn state_after_events(
        &self,
        _room_id: &RoomId,
        event_ids: &[OwnedEventId],
    ) -> Result<StateAfterEvents> {
        let inner = lock(&self.inner);
        let mut state_events = Vec::new();
        for id in event_ids {
            match inner.state_after.get(id) {
                Some(state) => state_events.extend(state.iter().cloned()),
                None => return Ok(StateAfterEvents::default()),
            }
        }
        Ok(StateAfterEvents {
            prev_events_exist: true,
            state_events,
        })
    }

    async fn events_by_id(&self, event_ids: &[OwnedEventId]) -> Result<Vec<Arc<PduEvent>>> {
        let inner = lock(&self.inner);
        Ok(event_ids
            .iter()
            .filter_map(|id| inner.events.get(id).cloned())
            .collect())
    }

    async fn state_snapshot_known(
        &self,
        event_ids: &[OwnedEventId],
    ) -> Result<SnapshotKnowledge> {
        let inner = lock(&self.inner);
        Ok(event_ids
            .iter()
            .map(|id| (id.clone(), inner.snapshot_known.contains(id)))
            .collect())
    }
}

/// Ingestion sink recording every input, optionally applying it to a graph
#[derive(Debug, Default)]
pub struct RecordingSink {
    inputs: Mutex<Vec<InputRoomEvent>>,
    graph: Option<Arc<FakeLocalGraph>>,
    rejected: HashSet<OwnedEventId>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted events are stored in `graph`, giving them state snapshots
    pub fn applying_to(graph: Arc<FakeLocalGraph>) -> Self {
        Self {
            graph: Some(graph),
            ..Self::default()
        }
    }

    pub fn rejecting(mut self, event_id: &EventId) -> Self {
        self.rejected.insert(event_id.to_owned());
        self
    }

    pub fn inputs(&self) -> Vec<InputRoomEvent> {
        lock(&self.inputs).clone()
    }

    pub fn injected_ids(&self) -> Vec<OwnedEventId> {
        self.inputs()
            .into_iter()
            .map(|input| input.event.event_id.clone())
            .collect()
    }
}

#[async_trait]
impl IngestionSink for RecordingSink {
    async fn process_room_event(&self, input: InputRoomEvent) -> Result<()> {
        lock(&self.inputs).push(input.clone());
        if self.rejected.contains(&input.event.event_id) {
            return Err(MatrixonError::rejected(
                input.event.event_id.clone(),
                "rejected by test sink",
            ));
        }
        if let Some(graph) = &self.graph {
            graph.ingest(&input);
        }
        Ok(())
    }
}

/// Accepts every signature except those of the listed events
#[derive(Debug, Default)]
pub struct FakeVerifier {
    bad: HashSet<OwnedEventId>,
}

impl FakeVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, event_id: &EventId) -> Self {
        self.bad.insert(event_id.to_owned());
        self
    }
}

#[async_trait]
impl SignatureVerifier for FakeVerifier {
    async fn verify_event(&self, event: &PduEvent) -> Result<()> {
        if self.bad.contains(&event.event_id) {
            return Err(MatrixonError::InvalidEvent(format!(
                "bad signature on {}",
                event.event_id
            )));
        }
        Ok(())
    }
}

/// Keeps the newest event, by `(origin_server_ts, event_id)`, for each
/// `(type, state_key)` slot
#[derive(Debug, Default)]
pub struct LatestWinsResolver {
    calls: AtomicUsize,
    inputs: Mutex<Vec<usize>>,
}

impl LatestWinsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of state events each call received
    pub fn input_sizes(&self) -> Vec<usize> {
        lock(&self.inputs).clone()
    }
}

#[async_trait]
impl StateResolver for LatestWinsResolver {
    async fn resolve_conflicts(
        &self,
        _room_version: &RoomVersionId,
        state_events: Vec<Arc<PduEvent>>,
        _auth_events: Vec<Arc<PduEvent>>,
    ) -> Result<Vec<Arc<PduEvent>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.inputs).push(state_events.len());

        let mut winners: HashMap<(String, String), Arc<PduEvent>> = HashMap::new();
        for event in state_events {
            let Some(tuple) = event.state_tuple() else {
                continue;
            };
            let replace = winners.get(&tuple).map_or(true, |current| {
                (event.origin_server_ts, &event.event_id)
                    > (current.origin_server_ts, &current.event_id)
            });
            if replace {
                winners.insert(tuple, event);
            }
        }
        let mut resolved: Vec<_> = winners.into_values().collect();
        resolved.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        Ok(resolved)
    }
}

/// Builds a valid chain of events for one room
#[derive(Debug, Clone)]
pub struct TestRoom {
    pub room_id: OwnedRoomId,
    pub creator: OwnedUserId,
    pub create: Arc<PduEvent>,
    pub creator_join: Arc<PduEvent>,
    pub power_levels: Arc<PduEvent>,
    pub join_rules: Arc<PduEvent>,
    clock: u64,
}

impl TestRoom {
    pub fn new(room_id: OwnedRoomId, creator: OwnedUserId) -> Result<Self> {
        let create = Arc::new(
            PduBuilder::new(
                room_id.clone(),
                creator.clone(),
                TimelineEventType::RoomCreate,
                json!({ "creator": creator }),
            )
            .state_key("")
            .origin_server_ts(1)
            .build()?,
        );
        let creator_join = Arc::new(
            PduBuilder::new(
                room_id.clone(),
                creator.clone(),
                TimelineEventType::RoomMember,
                json!({ "membership": "join" }),
            )
            .state_key(creator.as_str())
            .prev_events(vec![create.event_id.clone()])
            .auth_events(vec![create.event_id.clone()])
            .depth(2)
            .origin_server_ts(2)
            .build()?,
        );
        let power_levels = Arc::new(
            PduBuilder::new(
                room_id.clone(),
                creator.clone(),
                TimelineEventType::RoomPowerLevels,
                json!({ "users": { creator.as_str(): 100 } }),
            )
            .state_key("")
            .prev_events(vec![creator_join.event_id.clone()])
            .auth_events(vec![create.event_id.clone(), creator_join.event_id.clone()])
            .depth(3)
            .origin_server_ts(3)
            .build()?,
        );
        let join_rules = Arc::new(
            PduBuilder::new(
                room_id.clone(),
                creator.clone(),
                TimelineEventType::RoomJoinRules,
                json!({ "join_rule": "public" }),
            )
            .state_key("")
            .prev_events(vec![power_levels.event_id.clone()])
            .auth_events(vec![
                create.event_id.clone(),
                power_levels.event_id.clone(),
                creator_join.event_id.clone(),
            ])
            .depth(4)
            .origin_server_ts(4)
            .build()?,
        );

        Ok(Self {
            room_id,
            creator,
            create,
            creator_join,
            power_levels,
            join_rules,
            clock: 100,
        })
    }

    /// The four events every room starts with, oldest first
    pub fn initial_events(&self) -> Vec<Arc<PduEvent>> {
        vec![
            Arc::clone(&self.create),
            Arc::clone(&self.creator_join),
            Arc::clone(&self.power_levels),
            Arc::clone(&self.join_rules),
        ]
    }

    /// Auth events for anything the creator sends
    pub fn auth_ids(&self) -> Vec<OwnedEventId> {
        vec![
            self.create.event_id.clone(),
            self.power_levels.event_id.clone(),
            self.creator_join.event_id.clone(),
        ]
    }

    fn next_ts(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn depth_after(prev: &[&Arc<PduEvent>]) -> u64 {
        prev.iter().map(|e| e.depth).max().unwrap_or(0) + 1
    }

    /// A message from the creator on top of `prev`
    pub fn message(&mut self, prev: &[&Arc<PduEvent>], body: &str) -> Result<Arc<PduEvent>> {
        let ts = self.next_ts();
        Ok(Arc::new(
            PduBuilder::new(
                self.room_id.clone(),
                self.creator.clone(),
                TimelineEventType::RoomMessage,
                json!({ "msgtype": "m.text", "body": body }),
            )
            .prev_events(prev.iter().map(|e| e.event_id.clone()).collect())
            .auth_events(self.auth_ids())
            .depth(Self::depth_after(prev))
            .origin_server_ts(ts)
            .build()?,
        ))
    }

    /// A state event from the creator on top of `prev`
    pub fn state(
        &mut self,
        prev: &[&Arc<PduEvent>],
        kind: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<Arc<PduEvent>> {
        let ts = self.next_ts();
        Ok(Arc::new(
            PduBuilder::new(
                self.room_id.clone(),
                self.creator.clone(),
                TimelineEventType::from(kind),
                content,
            )
            .state_key(state_key)
            .prev_events(prev.iter().map(|e| e.event_id.clone()).collect())
            .auth_events(self.auth_ids())
            .depth(Self::depth_after(prev))
            .origin_server_ts(ts)
            .build()?,
        ))
    }
}
