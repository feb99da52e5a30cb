//! Deadline scheduler for the run loop.
//!
//! Every periodic activity owns one slot keyed by [`TimerKind`]. A timer fires
//! once and is re-armed by its handler after the work completes, so a slow
//! run never overlaps the next one. Time comes from `tokio::time`, which lets
//! tests drive it with a paused clock.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Scheduled activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Link status broadcast
    LinkStatus,
    /// Many-to-one route request
    ManyToOneRouteRequest,
    /// Periodic state save
    SaveState,
    /// Expiry sweep of transient tables
    Housekeeping,
    /// APS acknowledgment wait for one outstanding frame
    ApsAckTimeout {
        /// Destination short address
        destination16: u16,
        /// APS counter
        counter: u8,
    },
    /// End of the permit-join window
    JoinWindowClose,
    /// Switch to the staged network key
    NetworkKeySwitch,
    /// Automatic network key rotation
    NetworkKeyUpdate,
    /// End of Green Power commissioning
    GpCommissioningExit,
}

/// Single-shot deadlines, at most one per [`TimerKind`]
#[derive(Debug, Default)]
pub struct Scheduler {
    deadlines: BTreeMap<TimerKind, Instant>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire after `delay`, replacing any earlier deadline
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.schedule_at(kind, Instant::now() + delay);
    }

    /// Arm `kind` to fire at `deadline`
    pub fn schedule_at(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines.insert(kind, deadline);
    }

    /// Disarm `kind`; returns whether it was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    /// Whether `kind` is armed
    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Deadline of `kind`, if armed
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, deadline)| (*deadline, *kind))
            .collect();
        due.sort();

        for (_, kind) in &due {
            self.deadlines.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    /// Disarm everything
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether nothing is armed
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TimerKind::SaveState, Duration::from_secs(60));
        scheduler.schedule(TimerKind::LinkStatus, Duration::from_secs(15));
        scheduler.schedule(
            TimerKind::ApsAckTimeout {
                destination16: 0x1234,
                counter: 7,
            },
            Duration::from_millis(1500),
        );

        assert_eq!(
            scheduler.next_deadline(),
            Some(Instant::now() + Duration::from_millis(1500))
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        let fired = scheduler.pop_expired(Instant::now());
        assert_eq!(
            fired,
            vec![
                TimerKind::ApsAckTimeout {
                    destination16: 0x1234,
                    counter: 7
                },
                TimerKind::LinkStatus
            ]
        );
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.is_scheduled(TimerKind::SaveState));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_and_cancel() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TimerKind::Housekeeping, Duration::from_secs(1));
        scheduler.schedule(TimerKind::Housekeeping, Duration::from_secs(5));
        assert_eq!(scheduler.len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(scheduler.pop_expired(Instant::now()).is_empty());

        assert!(scheduler.cancel(TimerKind::Housekeeping));
        assert!(!scheduler.cancel(TimerKind::Housekeeping));
        assert_eq!(scheduler.next_deadline(), None);

        scheduler.schedule(TimerKind::JoinWindowClose, Duration::from_secs(1));
        scheduler.clear();
        assert!(scheduler.is_empty());
    }
}
