//! Reclaims ports and routes of leases that expired without a teardown.

use chrono::{DateTime, Utc};
use common::SweepReport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::allocator::PortAllocator;
use crate::error::BrokerError;
use crate::routing::RoutingReconciler;

pub struct GarbageCollector {
    allocator: PortAllocator,
    routing: RoutingReconciler,
    /// How long a tombstone belongs to the call that made it. Must outlast
    /// the slowest teardown or rollback, or their late route removal could
    /// hit a port that was collected and leased again in the meantime.
    grace: Duration,
    running: AtomicBool,
}

impl GarbageCollector {
    pub fn new(allocator: PortAllocator, routing: RoutingReconciler, grace: Duration) -> Self {
        Self {
            allocator,
            routing,
            grace,
            running: AtomicBool::new(false),
        }
    }

    /// One pass: list expired rows and abandoned tombstones, take over the
    /// ones still eligible, remove their routes in bulk, then free the ports.
    /// When route removal fails the rows stay reclaiming and a pass after the
    /// grace window picks them up again.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, BrokerError> {
        let stale_before = now - chrono::Duration::milliseconds(self.grace.as_millis() as i64);
        let candidates = self.allocator.list_expired(now, stale_before).await?;
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let mut marked = Vec::with_capacity(candidates.len());
        for record in &candidates {
            if let Some(tombstone) = self.allocator.mark_reclaiming(record, now, stale_before).await? {
                marked.push(tombstone);
            } else {
                tracing::debug!(port = record.port, lease = %record.key, "Lease refreshed since listing, skipping");
                report.skipped += 1;
            }
        }
        if marked.is_empty() {
            return Ok(report);
        }

        let ports: Vec<u16> = marked.iter().map(|t| t.port).collect();
        self.routing.remove_routes(&ports).await?;
        for tombstone in &marked {
            if self.allocator.forget(tombstone).await? {
                report.reclaimed.push(tombstone.port);
            }
        }

        tracing::info!(
            candidates = report.candidates,
            reclaimed = report.reclaimed.len(),
            skipped = report.skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    async fn sweep_logged(&self) {
        if let Err(e) = self.sweep(Utc::now()).await {
            tracing::warn!(error = %e, "Sweep failed, will retry on the next pass");
        }
    }

    /// Start a sweep in the background unless one is already running in this
    /// process. Returns the handle of the spawned sweep, if any.
    pub fn trigger(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!("Sweep already in flight");
            return None;
        }
        let gc = Arc::clone(self);
        Some(tokio::spawn(async move {
            gc.sweep_logged().await;
            gc.running.store(false, Ordering::Release);
        }))
    }

    /// Sweep on a fixed interval, starting immediately.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let gc = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if gc.running.swap(true, Ordering::AcqRel) {
                    continue;
                }
                gc.sweep_logged().await;
                gc.running.store(false, Ordering::Release);
            }
        })
    }
}
