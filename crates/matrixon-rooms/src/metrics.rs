// =============================================================================
// Matrixon Matrix NextServer - Gap Resolution Metrics
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Counters recorded through the `metrics` facade. No exporter is
//   installed here; the host process decides where they go.
//
// =============================================================================

use metrics::counter;

pub fn record_gap_request() {
    counter!("matrixon_gap_requests_total").increment(1);
}

pub fn record_backfill_closed() {
    counter!("matrixon_gap_backfill_closed_total").increment(1);
}

pub fn record_state_ids_lookup() {
    counter!("matrixon_gap_state_ids_lookups_total").increment(1);
}

pub fn record_full_state_fallback() {
    counter!("matrixon_gap_full_state_fallbacks_total").increment(1);
}

pub fn record_events_fetched(count: usize) {
    counter!("matrixon_gap_events_fetched_total").increment(count as u64);
}

pub fn record_signature_failure() {
    counter!("matrixon_gap_signature_failures_total").increment(1);
}

/// `stage` is where the rejection happened: `auth_replay` or `ingestion`
pub fn record_rejected_event(stage: &'static str) {
    counter!("matrixon_gap_rejected_events_total", "stage" => stage).increment(1);
}

pub fn record_state_resolution() {
    counter!("matrixon_gap_state_resolutions_total").increment(1);
}
