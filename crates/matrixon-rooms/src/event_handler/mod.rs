// =============================================================================
// Matrixon Matrix NextServer - Event Handler Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Entry point for incoming events whose prev events are unknown locally.
//   Holds the collaborators a resolution needs and runs one resolution
//   request per event under the configured deadline.
//
// =============================================================================

mod auth;
mod missing_state;
mod state_ids;

use std::{sync::Arc, time::Instant};

use matrixon_common::MatrixonError;
use matrixon_core::{
    utils::generate_request_id, Deadline, EventAuthorizer, FederationGateway,
    GapResolutionConfig, IngestionSink, LocalGraph, MissingStateOutcome, PduEvent, Result,
    SignatureVerifier, StateResolver,
};
use ruma::{OwnedServerName, ServerName};
use tracing::{info, instrument, warn};

pub use auth::AuthEventsAuthorizer;
pub use state_ids::should_fetch_full_state;

use self::missing_state::GapResolutionRequest;
use crate::{fetch_pool::FetchPool, metrics, room_mutex::RoomMutexMap};

pub struct Service {
    pub(crate) federation: Arc<dyn FederationGateway>,
    pub(crate) local: Arc<dyn LocalGraph>,
    pub(crate) verifier: Arc<dyn SignatureVerifier>,
    pub(crate) sink: Arc<dyn IngestionSink>,
    pub(crate) resolver: Arc<dyn StateResolver>,
    pub(crate) authorizer: Arc<dyn EventAuthorizer>,
    pub(crate) room_mutexes: Arc<RoomMutexMap>,
    pub(crate) config: GapResolutionConfig,
    pub(crate) pool: FetchPool,
}

impl Service {
    /// Builds a resolver with the default [`AuthEventsAuthorizer`].
    ///
    /// `room_mutexes` is shared with every other resolver of the process so
    /// state resolution for a room never runs twice at once.
    pub fn new(
        federation: Arc<dyn FederationGateway>,
        local: Arc<dyn LocalGraph>,
        verifier: Arc<dyn SignatureVerifier>,
        sink: Arc<dyn IngestionSink>,
        resolver: Arc<dyn StateResolver>,
        room_mutexes: Arc<RoomMutexMap>,
        config: GapResolutionConfig,
    ) -> Self {
        let pool = FetchPool::new(config.concurrent_requests);
        Self {
            federation,
            local,
            verifier,
            sink,
            resolver,
            authorizer: Arc::new(AuthEventsAuthorizer),
            room_mutexes,
            config,
            pool,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn EventAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &GapResolutionConfig {
        &self.config
    }

    /// Fills the gap in front of `event`, an incoming event with unknown
    /// prev events, by backfilling or by computing state at the new backward
    /// extremity.
    ///
    /// Recovered history is pushed into the ingestion pipeline. `event`
    /// itself is not: when the returned `resolved_state` is `Some`, the
    /// caller must attach it when injecting `event`.
    ///
    /// `servers` are the candidate servers for the room; `origin` is always
    /// asked first.
    #[instrument(
        skip_all,
        fields(
            request_id = %generate_request_id(),
            room_id = %event.room_id,
            event_id = %event.event_id,
            origin = %origin,
        )
    )]
    pub async fn process_event_with_missing_state(
        &self,
        origin: &ServerName,
        servers: &[OwnedServerName],
        event: Arc<PduEvent>,
    ) -> Result<MissingStateOutcome> {
        let start = Instant::now();
        metrics::record_gap_request();
        info!("🔧 Resolving missing state for {}", event.event_id);

        let mut candidates = vec![origin.to_owned()];
        candidates.extend(servers.iter().filter(|s| s.as_str() != origin.as_str()).cloned());

        let deadline = Deadline::after(self.config.request_timeout());
        let request = GapResolutionRequest::new(self, origin.to_owned(), candidates, &event, deadline);

        let result = match tokio::time::timeout_at(deadline.instant(), request.run(event.clone())).await {
            Ok(result) => result,
            Err(_) => Err(MatrixonError::timeout(format!(
                "resolving missing state for {} took longer than {:?}",
                event.event_id,
                self.config.request_timeout()
            ))),
        };

        match &result {
            Ok(outcome) => info!(
                "✅ Missing state for {} handled in {:?}: {} injected, {} rejected, state {}",
                event.event_id,
                start.elapsed(),
                outcome.injected,
                outcome.rejected.len(),
                if outcome.resolved_state.is_some() { "returned" } else { "known" }
            ),
            Err(e) => {
                warn!("❌ Missing state for {} failed after {:?}", event.event_id, start.elapsed());
                e.log();
            }
        }
        result
    }
}
