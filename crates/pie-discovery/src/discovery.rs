//! Iterative tracker lookup.
//!
//! ```text
//!   visited = {}
//!   loop:
//!     C = table.nearest(target, fanout)
//!     if C ⊆ visited: done
//!     for c in C (concurrently):
//!       FindTrackerReq{target} ──▶ c
//!       FindTrackerRes{OK, candidates} ◀── c
//!       insert + connect each new candidate
//!     visited ∪= C
//! ```
//!
//! Each round either discovers new trackers close to the target or returns
//! the same candidate set as the previous round, so the loop is bounded by
//! the number of trackers reachable from the table.

use crate::table::RoutingTable;
use crate::tracker::Tracker;
use pie_core::{Context, Error, FindTrackerReq, Id, NetMessage, Result, Status};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Result of a completed lookup
#[derive(Debug, Clone, Default)]
pub struct FindOutcome {
    /// Trackers queried during the lookup
    pub visited: HashSet<Id>,
    /// Number of query rounds issued
    pub rounds: usize,
}

impl RoutingTable {
    /// Find trackers close to `target`
    ///
    /// Repeatedly queries the `fanout` nearest known trackers until a round
    /// yields no unvisited candidate. Trackers learned along the way are
    /// inserted and connected; trackers that cannot be reached or whose
    /// session dies are removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] when `ctx` is cancelled. Failures of
    /// individual trackers are not errors.
    pub async fn find_tracker(
        self: &Arc<Self>,
        ctx: &Context,
        target: &Id,
        fanout: usize,
        request_timeout: Duration,
    ) -> Result<FindOutcome> {
        let mut outcome = FindOutcome::default();
        loop {
            if ctx.is_cancelled() {
                return Err(Error::Canceled);
            }
            let candidates = self.nearest(target, fanout, None);
            if candidates.iter().all(|t| outcome.visited.contains(&t.id())) {
                tracing::debug!(
                    "Lookup for {:?} converged after {} rounds, {} visited",
                    target,
                    outcome.rounds,
                    outcome.visited.len()
                );
                return Ok(outcome);
            }

            let ids: Vec<Id> = candidates.iter().map(|t| t.id()).collect();
            self.find_tracker_once(ctx, target, candidates, request_timeout).await;
            outcome.visited.extend(ids);
            outcome.rounds += 1;
        }
    }

    /// Query each candidate once for trackers near `target`
    ///
    /// All queries run concurrently and are joined before returning.
    pub async fn find_tracker_once(
        self: &Arc<Self>,
        ctx: &Context,
        target: &Id,
        candidates: Vec<Arc<Tracker>>,
        request_timeout: Duration,
    ) {
        let mut tasks = JoinSet::new();
        for tracker in candidates {
            let table = Arc::clone(self);
            let ctx = ctx.clone();
            let target = *target;
            tasks.spawn(async move {
                let id = tracker.id();
                match table.query_tracker(&ctx, &tracker, &target, request_timeout).await {
                    Ok(found) => table.add_candidates(&ctx, found).await,
                    Err(e) => tracing::debug!("Lookup query to {:?} failed: {}", id, e),
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Lookup task failed: {}", e);
            }
        }
    }

    async fn query_tracker(
        &self,
        ctx: &Context,
        tracker: &Arc<Tracker>,
        target: &Id,
        request_timeout: Duration,
    ) -> Result<Vec<Arc<Tracker>>> {
        let session = match self.connect_tracker(ctx, tracker).await {
            Ok(session) => session,
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(e) => {
                self.remove_if_same(tracker);
                return Err(e);
            }
        };
        let deadline = Instant::now() + request_timeout;

        let exchange = async {
            let mut stream = session.open_stream().await?;
            let request = NetMessage::FindTrackerReq(FindTrackerReq::new(target));
            stream.send_message(&request, Some(deadline)).await?;
            let response = stream.recv_message(Some(deadline)).await;
            if let Err(e) = stream.close().await {
                tracing::debug!("Failed to close lookup stream: {}", e);
            }
            response
        };
        let response = match ctx.run(exchange).await {
            Ok(response) => response,
            Err(e @ Error::Closed(_)) => {
                self.remove_if_same(tracker);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let NetMessage::FindTrackerRes(res) = response else {
            return Err(Error::InvalidMessage(format!(
                "expected FindTrackerRes, got {}",
                response.message_type()
            )));
        };
        if res.status != Status::Ok {
            return Err(Error::InvalidMessage(format!(
                "lookup answered with status {:?}",
                res.status
            )));
        }

        let mut found = Vec::with_capacity(res.candidates.len());
        for candidate in res.candidates {
            match candidate.parse_id() {
                Ok(id) => found.push(Arc::new(Tracker::new(id, candidate.addr))),
                Err(e) => tracing::debug!("Skipping malformed candidate: {}", e),
            }
        }
        Ok(found)
    }

    async fn add_candidates(self: &Arc<Self>, ctx: &Context, found: Vec<Arc<Tracker>>) {
        let local_id = self.local_id();
        let mut tasks = JoinSet::new();
        for tracker in found {
            let id = tracker.id();
            if id.is_zero() || Some(id) == local_id || !self.insert_if_absent(tracker.clone()) {
                continue;
            }
            tracing::debug!("Discovered tracker {:?} at {:?}", id, tracker.addr());
            let table = Arc::clone(self);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                if let Err(e) = table.connect_inserted(&ctx, &tracker).await {
                    tracing::debug!("Discovered tracker {:?} unreachable: {}", id, e);
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Connect task failed: {}", e);
            }
        }
    }
}
