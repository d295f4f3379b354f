// =============================================================================
// Matrixon Matrix NextServer - Missing State Resolution
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   One resolution request for an incoming event with unknown prev events.
//   Tries to close the gap with /get_missing_events first; otherwise works
//   out the state at the backward extremity, injects the recovered history
//   in order and, if that still leaves the prev events without state,
//   computes the state before the incoming event itself.
//
// =============================================================================

use std::{collections::HashSet, sync::Arc};

use matrixon_common::MatrixonError;
use matrixon_core::{
    ordering::{order_auth_and_state_events, reverse_topological_ordering},
    Deadline, InputRoomEvent, MissingEventsOutcome, MissingEventsRequest, MissingStateOutcome,
    PduEvent, Rejection, ResolvedState, Result,
};
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, RoomVersionId};
use tracing::{debug, info, instrument, warn};

use super::Service;
use crate::{event_cache::EventCache, metrics};

/// Per-event resolution context. Its caches live exactly as long as the
/// request.
pub(crate) struct GapResolutionRequest<'a> {
    pub(super) service: &'a Service,
    pub(super) origin: OwnedServerName,
    /// Candidate servers, origin first
    pub(super) servers: Vec<OwnedServerName>,
    pub(super) room_id: OwnedRoomId,
    pub(super) room_version: RoomVersionId,
    pub(super) deadline: Deadline,
    pub(super) cache: EventCache,
}

impl<'a> GapResolutionRequest<'a> {
    pub(super) fn new(
        service: &'a Service,
        origin: OwnedServerName,
        servers: Vec<OwnedServerName>,
        event: &PduEvent,
        deadline: Deadline,
    ) -> Self {
        Self {
            service,
            origin,
            servers,
            room_id: event.room_id.clone(),
            room_version: event.room_version.clone(),
            deadline,
            cache: EventCache::new(),
        }
    }

    pub(super) async fn run(&self, event: Arc<PduEvent>) -> Result<MissingStateOutcome> {
        let mut outcome = MissingStateOutcome::default();

        let MissingEventsOutcome {
            mut new_events,
            gap_closed,
            predecessor_state_known,
        } = self.get_missing_events(&event).await?;

        if gap_closed {
            info!("✅ Gap filled by /get_missing_events, injecting {} new events", new_events.len());
            metrics::record_backfill_closed();
            for new_event in &new_events {
                self.inject(
                    InputRoomEvent::old_fast_forward(Arc::clone(new_event), self.origin.clone()),
                    &mut outcome,
                )
                .await?;
            }

            // Injection itself may have produced the snapshots we were missing.
            if predecessor_state_known || self.is_prev_state_known(&event).await {
                info!("✅ Gap filled and state found for all prev events");
                return Ok(outcome);
            }
        }

        // The backfill is never empty here; see get_missing_events.
        let backwards_extremity = new_events.remove(0);
        debug!("🔧 Resolving state at backwards extremity {}", backwards_extremity.event_id);

        let (resolved_state, rejection) = self
            .lookup_resolved_state_before_event(&backwards_extremity)
            .await?;
        outcome.rejected.extend(rejection);

        let had_events = self.cache.seen_snapshot().await;

        // Outliers go first so the extremity's state has no missing auth events.
        self.send_outliers(&resolved_state, &had_events, &mut outcome)
            .await?;

        self.inject(
            InputRoomEvent::old_with_state(
                Arc::clone(&backwards_extremity),
                self.origin.clone(),
                resolved_state.state_event_ids(),
            ),
            &mut outcome,
        )
        .await?;

        // Newer backfilled events fast-forward from the extremity's state.
        for new_event in new_events {
            self.inject(
                InputRoomEvent::old_fast_forward(new_event, self.origin.clone()),
                &mut outcome,
            )
            .await?;
        }

        if self.is_prev_state_known(&event).await {
            info!("✅ State rolled forward to the prev events of {}", event.event_id);
            return Ok(outcome);
        }

        debug!("🔧 Prev state still unknown, resolving state before {}", event.event_id);
        let (resolved_state, rejection) = self.lookup_resolved_state_before_event(&event).await?;
        outcome.rejected.extend(rejection);
        self.send_outliers(&resolved_state, &had_events, &mut outcome)
            .await?;

        outcome.resolved_state = Some(resolved_state);
        Ok(outcome)
    }

    /// Asks the candidate servers for the events between our latest events
    /// and `event`. The returned events are ordered oldest first.
    #[instrument(skip_all, fields(event_id = %event.event_id))]
    pub(super) async fn get_missing_events(&self, event: &PduEvent) -> Result<MissingEventsOutcome> {
        let latest_events = self.service.local.latest_events(&self.room_id).await?;
        self.cache.mark_seen(&latest_events).await;

        let request = MissingEventsRequest {
            earliest_events: latest_events,
            latest_events: vec![event.event_id.clone()],
            limit: self.service.config.missing_events_limit,
        };

        let mut response = None;
        let mut last_error = String::from("no candidate servers");
        for server in &self.servers {
            let attempt_timeout = self
                .deadline
                .attempt_timeout(self.service.config.per_attempt_timeout());
            match tokio::time::timeout(
                attempt_timeout,
                self.service.federation.get_missing_events(
                    server,
                    &self.room_id,
                    request.clone(),
                    &self.room_version,
                ),
            )
            .await
            {
                Ok(Ok(events)) => {
                    response = Some(events);
                    break;
                }
                Ok(Err(e)) => {
                    warn!(
                        "⚠️ {} pushed us an event but {} did not respond to /get_missing_events: {}",
                        self.origin, server, e
                    );
                    last_error = e.to_string();
                }
                Err(_) => {
                    if self.deadline.is_expired() {
                        return Err(MatrixonError::timeout(format!(
                            "/get_missing_events for {}",
                            event.event_id
                        )));
                    }
                    warn!("⚠️ /get_missing_events to {} timed out", server);
                    last_error = format!("{server} timed out");
                }
            }
        }

        let Some(events) = response else {
            warn!(
                "❌ {} server(s) couldn't give us details about prev_events of {}, dropping it until they can",
                self.servers.len(),
                event.event_id
            );
            return Err(MatrixonError::MissingPrevEvents {
                event_id: event.event_id.clone(),
                reason: last_error,
            });
        };

        debug!("/get_missing_events returned {} events", events.len());
        let mut missing_events = Vec::with_capacity(events.len());
        for missing_event in events {
            if missing_event.room_id != self.room_id {
                warn!(
                    "⚠️ Dropping {} from /get_missing_events: belongs to {}",
                    missing_event.event_id, missing_event.room_id
                );
                continue;
            }
            if let Err(e) = missing_event.verify_content_hash() {
                warn!("⚠️ Dropping event from /get_missing_events: {}", e);
                continue;
            }
            missing_events.push(self.cache.cache_and_return(missing_event).await);
        }

        let new_events = reverse_topological_ordering(missing_events);
        if new_events.is_empty() {
            return Err(MatrixonError::MissingPrevEvents {
                event_id: event.event_id.clone(),
                reason: "/get_missing_events returned no usable events".into(),
            });
        }

        let has_prev_event = event
            .prev_events
            .iter()
            .any(|prev| new_events.iter().any(|e| &e.event_id == prev));
        if !has_prev_event {
            warn!(
                "❌ /get_missing_events didn't return any prev events of {} ({:?})",
                event.event_id, event.prev_events
            );
            return Err(MatrixonError::MissingPrevEvents {
                event_id: event.event_id.clone(),
                reason: format!(
                    "/get_missing_events didn't return any of the prev events {:?}",
                    event.prev_events
                ),
            });
        }

        let gap_closed = self.reaches_known_history(&new_events[0]).await?;
        let predecessor_state_known = gap_closed && self.is_prev_state_known(event).await;

        Ok(MissingEventsOutcome {
            new_events,
            gap_closed,
            predecessor_state_known,
        })
    }

    /// Whether the earliest backfilled event is the start of the room or
    /// attaches to history whose state we know.
    async fn reaches_known_history(&self, earliest: &PduEvent) -> Result<bool> {
        if earliest.prev_events.is_empty() && earliest.is_create() {
            return Ok(true);
        }

        let known = self
            .service
            .local
            .state_snapshot_known(&[earliest.event_id.clone()])
            .await?;
        if known.get(&earliest.event_id).copied().unwrap_or(false) {
            return Ok(true);
        }

        if earliest.prev_events.is_empty() {
            return Ok(false);
        }
        let known = self
            .service
            .local
            .state_snapshot_known(&earliest.prev_events)
            .await?;
        Ok(earliest
            .prev_events
            .iter()
            .all(|id| known.get(id).copied().unwrap_or(false)))
    }

    /// Whether every prev event of `event` has a known before-state snapshot
    pub(super) async fn is_prev_state_known(&self, event: &PduEvent) -> bool {
        match self
            .service
            .local
            .state_snapshot_known(&event.prev_events)
            .await
        {
            Ok(known) => event
                .prev_events
                .iter()
                .all(|id| known.get(id).copied().unwrap_or(false)),
            Err(e) => {
                warn!("⚠️ Failed to check prev state of {}: {}", event.event_id, e);
                false
            }
        }
    }

    /// State before `event`: the state after each of its prev events,
    /// combined through the oracle unless a single trustworthy state can be
    /// used as-is.
    #[instrument(skip_all, fields(event_id = %event.event_id))]
    pub(super) async fn lookup_resolved_state_before_event(
        &self,
        event: &PduEvent,
    ) -> Result<(ResolvedState, Option<Rejection>)> {
        let mut states = Vec::with_capacity(event.prev_events.len());
        for prev_event_id in &event.prev_events {
            states.push(self.lookup_state_after_event(prev_event_id).await?);
        }

        if states.is_empty() {
            if !event.is_create() {
                return Err(MatrixonError::InconsistentGapState {
                    event_id: event.event_id.clone(),
                    room_id: self.room_id.clone(),
                    expected: event.prev_events.len(),
                    found: 0,
                });
            }
            return Ok((ResolvedState::default(), None));
        }

        // A single local snapshot has been through state resolution already.
        let single_trustworthy = matches!(
            states.as_slice(),
            [(state, true)] if event.is_create() || !state.state_events.is_empty()
        );
        if single_trustworthy {
            debug!("Using trustworthy local state as-is");
            let (state, _) = states.remove(0);
            return Ok((state, None));
        }

        let lock = self.service.room_mutexes.lock(&self.room_id).await;
        let result = self
            .resolve_states_and_check(
                states.into_iter().map(|(state, _)| state).collect(),
                event,
            )
            .await;
        drop(lock);
        self.service.room_mutexes.cleanup().await;
        result
    }

    /// Pushes every auth and state event not seen before this request as an
    /// outlier, auth events first.
    async fn send_outliers(
        &self,
        resolved_state: &ResolvedState,
        had_events: &HashSet<OwnedEventId>,
        outcome: &mut MissingStateOutcome,
    ) -> Result<()> {
        let outliers = order_auth_and_state_events(
            &resolved_state.auth_events,
            &resolved_state.state_events,
        );
        let mut sent = 0;
        for outlier in outliers {
            // Seen after the snapshot means sent by an earlier call.
            if had_events.contains(&outlier.event_id) || self.cache.is_seen(&outlier.event_id).await
            {
                continue;
            }
            self.cache.mark_seen([&outlier.event_id]).await;
            self.inject(InputRoomEvent::outlier(outlier, self.origin.clone()), outcome)
                .await?;
            sent += 1;
        }
        debug!("Sent {} outliers", sent);
        Ok(())
    }

    /// Hands one event to the ingestion pipeline; a rejection is recorded
    /// and does not fail the request.
    async fn inject(&self, input: InputRoomEvent, outcome: &mut MissingStateOutcome) -> Result<()> {
        let event_id = input.event.event_id.clone();
        match self.service.sink.process_room_event(input).await {
            Ok(()) => {
                outcome.injected += 1;
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                warn!("⚠️ Ingestion rejected {}: {}", event_id, e);
                metrics::record_rejected_event("ingestion");
                outcome.rejected.push(Rejection {
                    event_id,
                    reason: e.to_string(),
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
