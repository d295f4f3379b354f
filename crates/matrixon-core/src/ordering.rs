// =============================================================================
// Matrixon Matrix NextServer - Event Ordering Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Deterministic topological orderings of event batches. Events are emitted
//   only after every event they reference (within the batch) has been
//   emitted; ties are broken by (depth, origin_server_ts, event_id).
//
// =============================================================================

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::Arc,
};

use ruma::OwnedEventId;
use tracing::warn;

use crate::pdu::PduEvent;

type TieBreak = (u64, u64, OwnedEventId);

fn tie_break(event: &PduEvent) -> TieBreak {
    (event.depth, event.origin_server_ts, event.event_id.clone())
}

/// Kahn's algorithm over the edges returned by `edges`, restricted to the batch.
fn kahn<F>(events: Vec<Arc<PduEvent>>, edges: F) -> Vec<Arc<PduEvent>>
where
    F: Fn(&PduEvent) -> &[OwnedEventId],
{
    let mut by_id: HashMap<OwnedEventId, Arc<PduEvent>> = HashMap::with_capacity(events.len());
    for event in events {
        by_id.entry(event.event_id.clone()).or_insert(event);
    }

    let mut in_degree: HashMap<&OwnedEventId, usize> = HashMap::with_capacity(by_id.len());
    let mut children: HashMap<&OwnedEventId, Vec<&OwnedEventId>> = HashMap::new();
    for (id, event) in &by_id {
        let parents: HashSet<&OwnedEventId> = edges(event.as_ref())
            .iter()
            .filter(|parent| by_id.contains_key(*parent) && *parent != id)
            .collect();
        in_degree.insert(id, parents.len());
        for parent in parents {
            children.entry(parent).or_default().push(id);
        }
    }

    let mut ready: BinaryHeap<Reverse<(TieBreak, &OwnedEventId)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| Reverse((tie_break(&by_id[*id]), *id)))
        .collect();

    let mut ordered = Vec::with_capacity(by_id.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        ordered.push(Arc::clone(&by_id[id]));
        for child in children.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((tie_break(&by_id[*child]), *child)));
                }
            }
        }
    }

    if ordered.len() < by_id.len() {
        // Only reachable with hand-crafted IDs that form a cycle.
        warn!(
            "⚠️ Cycle detected while ordering {} events, appending {} leftovers",
            by_id.len(),
            by_id.len() - ordered.len()
        );
        let emitted: HashSet<OwnedEventId> =
            ordered.iter().map(|event| event.event_id.clone()).collect();
        let mut leftovers: Vec<_> = by_id
            .values()
            .filter(|event| !emitted.contains(&event.event_id))
            .cloned()
            .collect();
        leftovers.sort_by_key(|event| tie_break(event));
        ordered.extend(leftovers);
    }

    ordered
}

/// Orders events oldest first by their `prev_events` edges.
pub fn reverse_topological_ordering(events: Vec<Arc<PduEvent>>) -> Vec<Arc<PduEvent>> {
    kahn(events, |event| &event.prev_events)
}

/// Deduplicates the union of auth and state events and orders it so every
/// event comes after the auth events it references.
pub fn order_auth_and_state_events(
    auth_events: &[Arc<PduEvent>],
    state_events: &[Arc<PduEvent>],
) -> Vec<Arc<PduEvent>> {
    let union = auth_events.iter().chain(state_events.iter()).cloned().collect();
    kahn(union, |event| &event.auth_events)
}
