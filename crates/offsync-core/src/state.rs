//! Shared sync state types.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::models::OutboxCounts;

/// Where the reconciliation engine is within a round
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Pushing,
    Pulling,
}

impl SyncPhase {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Pushing => 1,
            Self::Pulling => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Pushing,
            2 => Self::Pulling,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Pushing => "pushing",
            Self::Pulling => "pulling",
        })
    }
}

/// Lock-free holder for the current phase, readable while a round runs
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn get(&self) -> SyncPhase {
        SyncPhase::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, phase: SyncPhase) {
        self.0.store(phase.to_u8(), Ordering::SeqCst);
    }
}

/// Unified sync state shown to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    /// Summarise engine phase, last round outcome and outbox contents
    pub const fn summarize(
        phase: SyncPhase,
        last_round_failed: bool,
        online: bool,
        counts: &OutboxCounts,
    ) -> Self {
        if !matches!(phase, SyncPhase::Idle) {
            Self::Syncing
        } else if !online {
            Self::Offline
        } else if last_round_failed || counts.conflict > 0 || counts.failed > 0 {
            Self::Error
        } else if counts.pending > 0 || counts.in_flight > 0 {
            Self::Syncing
        } else {
            Self::Synced
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cell_round_trips() {
        let cell = PhaseCell::default();
        assert_eq!(cell.get(), SyncPhase::Idle);
        cell.set(SyncPhase::Pulling);
        assert_eq!(cell.get(), SyncPhase::Pulling);
    }

    #[test]
    fn summarize_prefers_active_round() {
        let counts = OutboxCounts {
            failed: 1,
            ..OutboxCounts::default()
        };
        assert_eq!(
            SyncState::summarize(SyncPhase::Pushing, true, false, &counts),
            SyncState::Syncing
        );
        assert_eq!(
            SyncState::summarize(SyncPhase::Idle, false, false, &counts),
            SyncState::Offline
        );
        assert_eq!(
            SyncState::summarize(SyncPhase::Idle, false, true, &counts),
            SyncState::Error
        );
        assert_eq!(
            SyncState::summarize(SyncPhase::Idle, false, true, &OutboxCounts::default()),
            SyncState::Synced
        );
    }
}
