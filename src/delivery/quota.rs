//! Rolling send quota, independent of rate limiting.
//!
//! Windows are aligned to wall-clock boundaries (midnight UTC for daily,
//! the top of the hour for hourly). The counter resets the first time a
//! reservation observes a later window start than the stored one, so the
//! reset is correct across restarts without any scheduled job.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DeliveryConfig;

use super::DeliveryError;

/// Length of a quota window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    /// Resets at midnight UTC.
    #[default]
    Daily,
    /// Resets at the top of every UTC hour.
    Hourly,
}

impl QuotaPeriod {
    /// Start of the window containing `now`.
    pub fn window_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour = match self {
            Self::Daily => 0,
            Self::Hourly => now.hour(),
        };
        now.date_naive()
            .and_hms_opt(hour, 0, 0)
            .map_or(now, |naive| naive.and_utc())
    }
}

/// Persistable view of the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    /// Start of the window this counter belongs to.
    pub window_start: DateTime<Utc>,
    /// Sends counted in the window.
    pub used: u32,
    /// Hard ceiling for the window.
    pub ceiling: u32,
}

/// A successful reservation, used to hand back budget that was never spent.
///
/// A reservation is pending until it is committed (a send was made) or
/// released (no call happened). Only committed sends are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReservation {
    window_start: DateTime<Utc>,
    amount: u32,
}

/// Reservation released on drop unless [`commit`](QuotaHold::commit)ted.
///
/// Held across the gates and the provider call so that every early return,
/// and an unwinding panic, hands the budget back.
#[derive(Debug)]
#[must_use = "dropping a hold releases its reservation"]
pub struct QuotaHold<'a> {
    tracker: &'a QuotaTracker,
    reservation: Option<QuotaReservation>,
}

impl QuotaHold<'_> {
    /// Count the held sends as spent.
    pub fn commit(mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.tracker.commit(reservation);
        }
    }
}

impl Drop for QuotaHold<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.tracker.release(reservation);
        }
    }
}

#[derive(Debug)]
struct Counter {
    window_start: DateTime<Utc>,
    committed: u32,
    pending: u32,
    ceiling: u32,
}

impl Counter {
    fn in_use(&self) -> u32 {
        self.committed.saturating_add(self.pending)
    }
}

/// Enforces the per-window send ceiling for the whole process.
#[derive(Debug)]
pub struct QuotaTracker {
    period: QuotaPeriod,
    counter: Mutex<Counter>,
}

impl QuotaTracker {
    /// Create a tracker with an empty current window.
    pub fn new(ceiling: u32, period: QuotaPeriod) -> Self {
        Self::new_at(ceiling, period, Utc::now())
    }

    /// Create a tracker whose current window contains `now`.
    pub fn new_at(ceiling: u32, period: QuotaPeriod, now: DateTime<Utc>) -> Self {
        Self {
            period,
            counter: Mutex::new(Counter {
                window_start: period.window_start(now),
                committed: 0,
                pending: 0,
                ceiling,
            }),
        }
    }

    /// Build a tracker from the delivery configuration.
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.daily_quota, config.quota_period)
    }

    /// Configured window length.
    pub fn period(&self) -> QuotaPeriod {
        self.period
    }

    /// Hard ceiling per window.
    pub fn ceiling(&self) -> u32 {
        self.lock().ceiling
    }

    /// Atomically take `n` sends from the current window as spent.
    ///
    /// Returns `false` without side effects when the window lacks budget.
    pub fn reserve(&self, n: u32) -> bool {
        self.reserve_at(n, Utc::now())
    }

    /// [`reserve`](Self::reserve) evaluated at an explicit instant.
    pub fn reserve_at(&self, n: u32, now: DateTime<Utc>) -> bool {
        self.reserve_slot_at(n, now)
            .map(|reservation| self.commit(reservation))
            .is_some()
    }

    /// Reserve `n` pending sends, returning a handle that can release them again.
    pub fn reserve_slot(&self, n: u32) -> Option<QuotaReservation> {
        self.reserve_slot_at(n, Utc::now())
    }

    /// [`reserve_slot`](Self::reserve_slot) evaluated at an explicit instant.
    pub fn reserve_slot_at(&self, n: u32, now: DateTime<Utc>) -> Option<QuotaReservation> {
        let mut counter = self.lock();
        self.roll(&mut counter, now);
        let total = counter.in_use().checked_add(n)?;
        if total > counter.ceiling {
            debug!(
                used = counter.in_use(),
                ceiling = counter.ceiling,
                "quota reservation refused"
            );
            return None;
        }
        counter.pending = counter.pending.saturating_add(n);
        Some(QuotaReservation {
            window_start: counter.window_start,
            amount: n,
        })
    }

    /// Reserve `n` sends behind a guard that releases them unless committed.
    pub fn hold(&self, n: u32) -> Option<QuotaHold<'_>> {
        self.reserve_slot(n).map(|reservation| QuotaHold {
            tracker: self,
            reservation: Some(reservation),
        })
    }

    /// Like [`reserve_slot`](Self::reserve_slot), reporting the refusal as an error.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::QuotaExceeded`] when the window lacks budget.
    pub fn try_reserve(&self, n: u32) -> Result<QuotaReservation, DeliveryError> {
        self.reserve_slot(n).ok_or_else(|| {
            let counter = self.lock();
            DeliveryError::QuotaExceeded {
                used: counter.in_use(),
                ceiling: counter.ceiling,
            }
        })
    }

    /// Turn a pending reservation into spent sends.
    ///
    /// Ignored once its window has rolled over.
    pub fn commit(&self, reservation: QuotaReservation) {
        let mut counter = self.lock();
        if counter.window_start == reservation.window_start {
            counter.pending = counter.pending.saturating_sub(reservation.amount);
            counter.committed = counter.committed.saturating_add(reservation.amount);
        }
    }

    /// Return an unspent reservation. Ignored once its window has rolled over.
    pub fn release(&self, reservation: QuotaReservation) {
        let mut counter = self.lock();
        if counter.window_start == reservation.window_start {
            counter.pending = counter.pending.saturating_sub(reservation.amount);
        }
    }

    /// Sends left in the current window, counting pending reservations as used.
    pub fn remaining(&self) -> u32 {
        self.remaining_at(Utc::now())
    }

    /// [`remaining`](Self::remaining) evaluated at an explicit instant.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> u32 {
        let mut counter = self.lock();
        self.roll(&mut counter, now);
        counter.ceiling.saturating_sub(counter.in_use())
    }

    /// Committed sends in the current window, for persistence.
    ///
    /// Pending reservations are left out: they may still be released.
    pub fn snapshot(&self) -> QuotaWindow {
        self.snapshot_at(Utc::now())
    }

    /// [`snapshot`](Self::snapshot) evaluated at an explicit instant.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> QuotaWindow {
        let mut counter = self.lock();
        self.roll(&mut counter, now);
        QuotaWindow {
            window_start: counter.window_start,
            used: counter.committed,
            ceiling: counter.ceiling,
        }
    }

    /// Adopt a persisted window if it is the current one.
    ///
    /// The larger of the stored and in-memory committed counts wins, so
    /// restoring never hands out budget that was already spent. Stale windows
    /// are ignored.
    pub fn restore(&self, stored: &QuotaWindow) {
        self.restore_at(stored, Utc::now());
    }

    /// [`restore`](Self::restore) evaluated at an explicit instant.
    pub fn restore_at(&self, stored: &QuotaWindow, now: DateTime<Utc>) {
        let mut counter = self.lock();
        self.roll(&mut counter, now);
        if stored.window_start == counter.window_start && stored.used > counter.committed {
            info!(
                used = stored.used,
                ceiling = counter.ceiling,
                "restored quota usage for current window"
            );
            counter.committed = stored.used;
        }
    }

    fn roll(&self, counter: &mut Counter, now: DateTime<Utc>) {
        let start = self.period.window_start(now);
        if start > counter.window_start {
            debug!(previous = %counter.window_start, current = %start, "quota window rolled over");
            counter.window_start = start;
            counter.committed = 0;
            counter.pending = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counter> {
        self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
