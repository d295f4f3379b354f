// =============================================================================
// Matrixon Matrix NextServer - Bounded Fetch Pool Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Fixed-width worker pool for fetching many missing events at once. A set
//   of workers drains a shared queue; results are handed back only after
//   every worker has finished. Workers check the request deadline before
//   starting each item and in-flight work is cut off when it expires.
//
// =============================================================================

use std::{collections::VecDeque, future::Future};

use futures::future::join_all;
use matrixon_common::MatrixonError;
use matrixon_core::{Deadline, Result};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Result of one work item
#[derive(Debug)]
pub enum FetchOutcome<T> {
    Fetched(T),
    Failed(MatrixonError),
    /// The request deadline expired before or while the item was processed
    Cancelled,
}

impl<T> FetchOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Fetched(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPool {
    width: usize,
}

impl FetchPool {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Workers actually started for `items` work items
    pub fn effective_width(&self, items: usize) -> usize {
        self.width.min(items)
    }

    /// Runs `work` over every item with at most `width` items in flight.
    ///
    /// Every item gets an outcome; the order of the returned pairs is the
    /// completion order.
    pub async fn run<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        deadline: Deadline,
        work: F,
    ) -> Vec<(I, FetchOutcome<T>)>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let workers = self.effective_width(items.len());
        if workers == 0 {
            return Vec::new();
        }
        debug!("🔧 Fetching {} items with {} workers", items.len(), workers);

        let queue = Mutex::new(items.into_iter().collect::<VecDeque<_>>());
        let results = Mutex::new(Vec::new());

        let worker = |worker_id: usize| {
            let queue = &queue;
            let results = &results;
            let work = &work;
            async move {
                loop {
                    let Some(item) = queue.lock().await.pop_front() else {
                        break;
                    };

                    let outcome = if deadline.is_expired() {
                        FetchOutcome::Cancelled
                    } else {
                        match tokio::time::timeout_at(deadline.instant(), work(item.clone())).await
                        {
                            Ok(Ok(value)) => FetchOutcome::Fetched(value),
                            Ok(Err(e)) => FetchOutcome::Failed(e),
                            Err(_) => FetchOutcome::Cancelled,
                        }
                    };
                    trace!("Fetch worker {} finished an item", worker_id);
                    results.lock().await.push((item, outcome));
                }
            }
        };

        join_all((0..workers).map(worker)).await;
        results.into_inner()
    }
}
