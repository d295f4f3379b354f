// =============================================================================
// Matrixon Matrix NextServer - Event Cache Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Request-scoped memo of fetched events plus the set of event IDs already
//   seen while resolving one incoming event. Owned by a single resolution
//   request and dropped with it; shared by reference with fetch workers.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use matrixon_core::PduEvent;
use ruma::{EventId, OwnedEventId};
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

#[derive(Debug, Default)]
pub struct EventCache {
    seen: Mutex<HashSet<OwnedEventId>>,
    fetched: RwLock<HashMap<OwnedEventId, Arc<PduEvent>>>,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical cached copy of `event`, inserting it if absent.
    ///
    /// Never overwrites: a second insert of the same ID hands back the first `Arc`.
    pub async fn cache_and_return(&self, event: PduEvent) -> Arc<PduEvent> {
        if let Some(cached) = self.fetched.read().await.get(&event.event_id) {
            return Arc::clone(cached);
        }

        let mut fetched = self.fetched.write().await;
        Arc::clone(
            fetched
                .entry(event.event_id.clone())
                .or_insert_with(|| Arc::new(event)),
        )
    }

    /// Same as [`cache_and_return`](Self::cache_and_return) for an event that is already shared
    pub async fn cache_shared(&self, event: Arc<PduEvent>) -> Arc<PduEvent> {
        let mut fetched = self.fetched.write().await;
        Arc::clone(
            fetched
                .entry(event.event_id.clone())
                .or_insert(event),
        )
    }

    pub async fn get(&self, event_id: &EventId) -> Option<Arc<PduEvent>> {
        self.fetched.read().await.get(event_id).cloned()
    }

    /// Splits `event_ids` into cached events and IDs still missing
    pub async fn partition(
        &self,
        event_ids: &[OwnedEventId],
    ) -> (Vec<Arc<PduEvent>>, Vec<OwnedEventId>) {
        let fetched = self.fetched.read().await;
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for id in event_ids {
            match fetched.get(id) {
                Some(event) => found.push(Arc::clone(event)),
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    pub async fn mark_seen<'a, I>(&self, event_ids: I)
    where
        I: IntoIterator<Item = &'a OwnedEventId>,
    {
        let mut seen = self.seen.lock().await;
        for id in event_ids {
            if seen.insert(id.clone()) {
                trace!("Marked {} as seen", id);
            }
        }
    }

    pub async fn is_seen(&self, event_id: &EventId) -> bool {
        self.seen.lock().await.contains(event_id)
    }

    /// Copy of the seen set, taken before the first outliers are emitted
    pub async fn seen_snapshot(&self) -> HashSet<OwnedEventId> {
        self.seen.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.fetched.read().await.len()
    }
}
