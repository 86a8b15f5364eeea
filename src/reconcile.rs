//! Periodic diff of recorded meetings against the provider's live presence.
//!
//! A recorded meeting whose room shows up occupied is confirmed. A confirmed
//! meeting whose room has emptied is finished. Unconfirmed meetings that are
//! not yet occupied are left alone: their participants may still be connecting.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::{FinishReport, MeetingService};
use crate::provider::VideoProvider;
use crate::roomname::RoomName;
use crate::store::{InProgressMeeting, MeetingStore};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub confirmed: Vec<RoomName>,
    pub finish: FinishReport,
    /// Occupied rooms with no record.
    pub orphaned: Vec<RoomName>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous tick was still running.
    Skipped,
    /// Nothing recorded, so presence was not queried.
    Idle,
    StoreUnavailable,
    PresenceUnavailable,
    Reconciled(TickReport),
}

pub struct Reconciler {
    store: Arc<dyn MeetingStore>,
    provider: Arc<dyn VideoProvider>,
    service: Arc<MeetingService>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn MeetingStore>, provider: Arc<dyn VideoProvider>, service: Arc<MeetingService>) -> Self {
        Self { store, provider, service, running: AtomicBool::new(false) }
    }

    /// Runs one reconciliation pass unless another is already in flight.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("previous presence check still running, skipping tick");
            return TickOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let records = match self.store.get_all().await {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, "unable to read in-progress meetings");
                return TickOutcome::StoreUnavailable;
            }
        };
        if records.is_empty() {
            tracing::debug!("no meetings in progress, doing nothing");
            return TickOutcome::Idle;
        }

        let occupied = match self.provider.presence().await {
            Ok(occupied) => occupied,
            Err(err) => {
                tracing::error!(error = %err, "unable to obtain global presence data");
                return TickOutcome::PresenceUnavailable;
            }
        };

        TickOutcome::Reconciled(self.reconcile(records, &occupied).await)
    }

    async fn reconcile(&self, records: Vec<InProgressMeeting>, occupied: &HashSet<RoomName>) -> TickReport {
        let mut report = TickReport::default();

        let recorded: HashSet<&RoomName> = records.iter().map(|record| &record.room_name).collect();
        report.orphaned = occupied.iter().filter(|room| !recorded.contains(room)).cloned().collect();
        report.orphaned.sort();
        for room in &report.orphaned {
            tracing::debug!(%room, "occupied room has no in-progress record");
        }

        let confirmations = records
            .iter()
            .filter(|record| !record.confirmed && occupied.contains(&record.room_name))
            .map(|record| async move { (&record.room_name, self.store.confirm(&record.room_name).await) });
        for (room, result) in join_all(confirmations).await {
            match result {
                Ok(true) => {
                    tracing::info!(%room, "meeting confirmed by presence");
                    report.confirmed.push(room.clone());
                }
                Ok(false) => tracing::debug!(%room, "meeting vanished before it could be confirmed"),
                Err(err) => tracing::error!(%room, error = %err, "unable to confirm meeting"),
            }
        }

        let finished: Vec<InProgressMeeting> = records
            .into_iter()
            .filter(|record| record.confirmed && !occupied.contains(&record.room_name))
            .collect();
        if !finished.is_empty() {
            tracing::info!(count = finished.len(), "meetings no longer present");
            report.finish = self.service.finish_records(&finished).await;
        }
        report
    }

    /// Ticks every `period` until the task is aborted. Ticks missed while one
    /// is running are dropped, not queued.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }
}
