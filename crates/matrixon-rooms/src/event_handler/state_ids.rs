// =============================================================================
// Matrixon Matrix NextServer - State Lookup Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Works out the state after a prev event: from the local graph when we
//   have it, otherwise from a remote server via /state_ids plus individual
//   /event fetches, switching to a single /state call when most of the
//   state is unknown to us.
//
// =============================================================================

use std::{collections::HashSet, sync::Arc};

use matrixon_common::MatrixonError;
use matrixon_core::{PduEvent, ResolvedState, Result, StateIds};
use ruma::{EventId, OwnedEventId, ServerName};
use tracing::{debug, info, instrument, trace, warn};

use super::missing_state::GapResolutionRequest;
use crate::{fetch_pool::FetchOutcome, metrics};

/// Whether a /state_ids answer with `missing` of `total` IDs unknown should
/// be abandoned for a full /state fetch. Both comparisons are strict.
pub fn should_fetch_full_state(missing: usize, total: usize, concurrent_requests: usize) -> bool {
    missing > concurrent_requests && missing > total / 2
}

impl GapResolutionRequest<'_> {
    /// State after `event_id`, and whether it came from our own graph
    /// (trustworthy) or from a remote server.
    #[instrument(skip(self))]
    pub(super) async fn lookup_state_after_event(
        &self,
        event_id: &EventId,
    ) -> Result<(ResolvedState, bool)> {
        if let Some(state) = self.lookup_state_after_event_locally(event_id).await {
            return Ok((state, true));
        }

        let mut state = self.lookup_missing_state_via_state_ids(event_id).await?;

        // The state after a state event includes the event itself.
        match self.lookup_event(event_id, true).await {
            Ok(event) => state.insert_state_event(event),
            Err(e) if e.is_signature_failure() => return Ok((state, false)),
            Err(e) => return Err(e),
        }
        Ok((state, false))
    }

    async fn lookup_state_after_event_locally(&self, event_id: &EventId) -> Option<ResolvedState> {
        let response = match self
            .service
            .local
            .state_after_events(&self.room_id, &[event_id.to_owned()])
            .await
        {
            Ok(response) if response.prev_events_exist => response,
            Ok(_) => {
                debug!("State after {} is not known locally", event_id);
                return None;
            }
            Err(e) => {
                warn!("⚠️ Failed to query state after {} locally: {}", event_id, e);
                return None;
            }
        };

        let mut state_events = Vec::with_capacity(response.state_events.len());
        for event in response.state_events {
            state_events.push(self.cache.cache_shared(event).await);
        }
        self.cache
            .mark_seen(state_events.iter().map(|event| &event.event_id))
            .await;

        let mut wanted = HashSet::new();
        let auth_event_ids: Vec<OwnedEventId> = state_events
            .iter()
            .flat_map(|event| event.auth_events.iter())
            .filter(|id| wanted.insert(*id))
            .cloned()
            .collect();

        let (mut auth_events, missing) = self.cache.partition(&auth_event_ids).await;
        if !missing.is_empty() {
            debug!("Fetching {} missing auth events from the local graph", missing.len());
            match self.service.local.events_by_id(&missing).await {
                Ok(events) => {
                    for event in events {
                        let event = self.cache.cache_shared(event).await;
                        self.cache.mark_seen([&event.event_id]).await;
                        auth_events.push(event);
                    }
                }
                Err(e) => {
                    warn!("⚠️ Failed to load auth events of local state after {}: {}", event_id, e);
                    return None;
                }
            }
        }

        Some(ResolvedState::new(auth_events, state_events))
    }

    /// State before `event_id` according to the candidate servers
    #[instrument(skip(self))]
    pub(super) async fn lookup_missing_state_via_state_ids(
        &self,
        event_id: &EventId,
    ) -> Result<ResolvedState> {
        info!("🔧 Looking up missing state via /state_ids at {}", event_id);
        metrics::record_state_ids_lookup();

        let mut last_error = None;
        for server in &self.servers {
            let attempt_timeout = self
                .deadline
                .attempt_timeout(self.service.config.per_attempt_timeout());
            match tokio::time::timeout(
                attempt_timeout,
                self.service
                    .federation
                    .get_room_state_ids(server, &self.room_id, event_id),
            )
            .await
            {
                Ok(Ok(state_ids)) => {
                    return self.resolve_state_ids(server, event_id, state_ids).await;
                }
                Ok(Err(e)) => {
                    warn!("⚠️ /state_ids at {} from {} failed: {}", event_id, server, e);
                    last_error = Some(MatrixonError::federation(
                        server.clone(),
                        format!("/state_ids at {event_id}: {e}"),
                    ));
                }
                Err(_) => {
                    if self.deadline.is_expired() {
                        return Err(MatrixonError::timeout(format!("/state_ids at {event_id}")));
                    }
                    warn!("⚠️ /state_ids at {} from {} timed out", event_id, server);
                    last_error = Some(MatrixonError::federation(
                        server.clone(),
                        format!("/state_ids at {event_id} timed out"),
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MatrixonError::NotFound(format!("no candidate server for state at {event_id}"))
        }))
    }

    /// Turns a /state_ids answer into events: request cache, then local
    /// graph, then the fetch pool, or one /state call if too much is missing.
    async fn resolve_state_ids(
        &self,
        server: &ServerName,
        event_id: &EventId,
        state_ids: StateIds,
    ) -> Result<ResolvedState> {
        let wanted = state_ids.wanted_ids();
        let total = wanted.len();
        let mut unique = HashSet::new();
        let wanted: Vec<OwnedEventId> = wanted
            .into_iter()
            .filter(|id| unique.insert(id.clone()))
            .collect();

        let (_, mut missing) = self.cache.partition(&wanted).await;
        if !missing.is_empty() {
            let local = self.service.local.events_by_id(&missing).await?;
            let mut found = HashSet::with_capacity(local.len());
            for event in local {
                let event = self.cache.cache_shared(event).await;
                self.cache.mark_seen([&event.event_id]).await;
                found.insert(event.event_id.clone());
            }
            missing.retain(|id| !found.contains(id));
        }

        let concurrent_requests = self.service.pool.width();
        debug!(
            "/state_ids at {} missing {}/{} events",
            event_id,
            missing.len(),
            total
        );

        if should_fetch_full_state(missing.len(), total, concurrent_requests) {
            debug!(
                "🔧 {} of {} state and auth events missing, fetching all state at {}",
                missing.len(),
                total,
                event_id
            );
            return self.lookup_missing_state_via_state(server, event_id).await;
        }

        if !missing.is_empty() {
            debug!(
                "🔧 Fetching {} missing state events at {} with {} concurrent requests",
                missing.len(),
                event_id,
                self.service.pool.effective_width(missing.len())
            );
            let results = self
                .service
                .pool
                .run(missing, self.deadline, |missing_event_id: OwnedEventId| async move {
                    self.lookup_event(&missing_event_id, false).await
                })
                .await;

            let mut fetched = 0;
            for (missing_event_id, outcome) in results {
                match outcome {
                    FetchOutcome::Fetched(_) => fetched += 1,
                    FetchOutcome::Failed(e) if e.is_timeout() => return Err(e),
                    FetchOutcome::Failed(e) if e.is_signature_failure() => {
                        debug!("Discarding {}: {}", missing_event_id, e)
                    }
                    FetchOutcome::Failed(e) => {
                        warn!("⚠️ Failed to fetch missing event {}: {}", missing_event_id, e)
                    }
                    FetchOutcome::Cancelled => {
                        return Err(MatrixonError::timeout(format!(
                            "fetching state at {event_id}"
                        )))
                    }
                }
            }
            metrics::record_events_fetched(fetched);
        }

        Ok(self.create_resp_state_from_state_ids(&state_ids).await)
    }

    /// Full state before `event_id` from `server`, checked before use
    #[instrument(skip(self))]
    async fn lookup_missing_state_via_state(
        &self,
        server: &ServerName,
        event_id: &EventId,
    ) -> Result<ResolvedState> {
        metrics::record_full_state_fallback();
        let attempt_timeout = self
            .deadline
            .attempt_timeout(self.service.config.per_attempt_timeout());
        let state = tokio::time::timeout(
            attempt_timeout,
            self.service.federation.get_room_state(
                server,
                &self.room_id,
                event_id,
                &self.room_version,
            ),
        )
        .await
        .map_err(|_| MatrixonError::timeout(format!("/state at {event_id} from {server}")))?
        .map_err(|e| MatrixonError::federation(server, format!("/state at {event_id}: {e}")))?;

        state
            .check(&self.room_id, self.service.verifier.as_ref())
            .await?;

        let mut auth_events = Vec::with_capacity(state.auth_chain.len());
        for event in state.auth_chain {
            auth_events.push(self.cache.cache_and_return(event).await);
        }
        let mut state_events = Vec::with_capacity(state.pdus.len());
        for event in state.pdus {
            state_events.push(self.cache.cache_and_return(event).await);
        }

        info!(
            "✅ Fetched full state at {}: {} state events, {} auth events",
            event_id,
            state_events.len(),
            auth_events.len()
        );
        Ok(ResolvedState::new(auth_events, state_events))
    }

    /// Builds the state from whatever the request cache holds for the IDs;
    /// events we could not get are left out.
    async fn create_resp_state_from_state_ids(&self, state_ids: &StateIds) -> ResolvedState {
        let (state_events, missing_state) = self.cache.partition(&state_ids.pdu_ids).await;
        let (auth_events, missing_auth) = self.cache.partition(&state_ids.auth_chain_ids).await;
        for id in &missing_state {
            trace!("Missing state event {}", id);
        }
        for id in &missing_auth {
            trace!("Missing auth event {}", id);
        }
        ResolvedState::new(auth_events, state_events)
    }

    /// One event by ID: optionally from the local graph, otherwise from the
    /// first candidate server that has it. The event's signature is checked
    /// before it is cached.
    pub(super) async fn lookup_event(
        &self,
        event_id: &EventId,
        local_first: bool,
    ) -> Result<Arc<PduEvent>> {
        if local_first {
            match self.service.local.events_by_id(&[event_id.to_owned()]).await {
                Ok(mut events) if events.len() == 1 => {
                    return Ok(self.cache.cache_shared(events.remove(0)).await);
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "⚠️ Failed to query local graph for {}: {}, falling back to remote",
                    event_id, e
                ),
            }
        }

        let mut found = None;
        for server in &self.servers {
            let attempt_timeout = self
                .deadline
                .attempt_timeout(self.service.config.per_attempt_timeout());
            match tokio::time::timeout(
                attempt_timeout,
                self.service
                    .federation
                    .get_event(server, event_id, &self.room_version),
            )
            .await
            {
                Ok(Ok(event)) => {
                    if event.event_id.as_str() != event_id.as_str() {
                        warn!(
                            "⚠️ {} returned {} when asked for {}",
                            server, event.event_id, event_id
                        );
                        continue;
                    }
                    if let Err(e) = event.verify_content_hash() {
                        warn!("⚠️ {} returned a malformed {}: {}", server, event_id, e);
                        continue;
                    }
                    found = Some(event);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("⚠️ Failed to get missing /event {} from {}: {}", event_id, server, e);
                }
                Err(_) => {
                    if self.deadline.is_expired() {
                        return Err(MatrixonError::timeout(format!("/event {event_id}")));
                    }
                    warn!("⚠️ /event {} from {} timed out", event_id, server);
                }
            }
        }

        let Some(event) = found else {
            warn!(
                "❌ Failed to get missing /event {} from {} server(s)",
                event_id,
                self.servers.len()
            );
            return Err(MatrixonError::NotFound(format!(
                "wasn't able to find event {} via {} server(s)",
                event_id,
                self.servers.len()
            )));
        };

        if let Err(e) = self.service.verifier.verify_event(&event).await {
            warn!("⚠️ Couldn't validate signature of {} from /event: {}", event_id, e);
            metrics::record_signature_failure();
            return Err(MatrixonError::SignatureVerification {
                event_id: event.event_id.clone(),
                reason: e.to_string(),
            });
        }

        Ok(self.cache.cache_and_return(event).await)
    }
}
