// =============================================================================
// Matrixon Matrix NextServer - Room Mutex Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Registry of per-room locks serialising state resolution for a room.
//   Owned by the host process and handed to each resolver instance.
//
// =============================================================================

use std::{collections::HashMap, sync::Arc};

use ruma::{OwnedRoomId, RoomId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
pub struct RoomMutexMap {
    rooms: RwLock<HashMap<OwnedRoomId, Arc<Mutex<()>>>>,
}

/// Held while state for the room is being resolved
pub type RoomMutexGuard = OwnedMutexGuard<()>;

impl RoomMutexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, room_id: &RoomId) -> RoomMutexGuard {
        let mutex = Arc::clone(
            self.rooms
                .write()
                .await
                .entry(room_id.to_owned())
                .or_default(),
        );
        mutex.lock_owned().await
    }

    /// Drops locks nobody holds or waits on
    pub async fn cleanup(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        let removed = before - rooms.len();
        if removed > 0 {
            debug!("🔧 Pruned {} idle room locks", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }
}
