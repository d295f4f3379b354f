// =============================================================================
// Matrixon Rooms Service Library
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Gap detection and missing state resolution for federated room events.
//   When a remote server pushes an event whose prev events we have never
//   seen, the event handler backfills the gap or reconstructs the state at
//   the new backward extremity before the event is ingested.
//
// =============================================================================

pub mod event_cache;
pub mod event_handler;
pub mod fetch_pool;
pub mod metrics;
pub mod room_mutex;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use event_cache::EventCache;
pub use event_handler::{should_fetch_full_state, AuthEventsAuthorizer, Service};
pub use fetch_pool::{FetchOutcome, FetchPool};
pub use room_mutex::{RoomMutexGuard, RoomMutexMap};
