// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sequence Engine: the seven-state scan control FSM.
//!
//! Exactly one scan is in progress at a time. Dispatch is serialized —
//! external callers submit events through [`SequenceEngine::dispatch`];
//! there is no re-entrant transition. Every transition is additionally
//! broadcast on an observability channel so a status endpoint or test
//! harness can watch the engine without polling its state directly.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StateFault;

const MAX_RETRY_COUNT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    Idle,
    Configure,
    Arm,
    Scanning,
    Streaming,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Single,
    Continuous,
    Calibration,
}

/// Events consumed by the engine. `data` carried inline where the
/// transition table requires it (only `StartScan` needs a payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEvent {
    StartScan(ScanMode),
    ConfigDone,
    ArmDone,
    FrameReady,
    Complete,
    StopScan,
    Error,
    ErrorCleared,
}

/// Running counters mirroring `seq_stats_t` from the original firmware.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SequenceStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub errors: u64,
    pub retries: u64,
}

/// Emitted on every transition (including rejected ones) for observability.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: SequenceState,
    pub event: SequenceEvent,
    pub to: SequenceState,
    pub accepted: bool,
}

pub struct SequenceEngine {
    state: SequenceState,
    mode: ScanMode,
    retry_budget: u8,
    stats: SequenceStats,
    transitions_tx: broadcast::Sender<Transition>,
}

impl SequenceEngine {
    pub fn new() -> Self {
        let (transitions_tx, _) = broadcast::channel(256);
        Self {
            state: SequenceState::Idle,
            mode: ScanMode::Single,
            retry_budget: 0,
            stats: SequenceStats::default(),
            transitions_tx,
        }
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn retry_budget(&self) -> u8 {
        self.retry_budget
    }

    pub fn stats(&self) -> SequenceStats {
        self.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions_tx.subscribe()
    }

    fn emit(&self, from: SequenceState, event: SequenceEvent, to: SequenceState, accepted: bool) {
        let _ = self.transitions_tx.send(Transition { from, event, to, accepted });
    }

    /// Submit one event. Serialized by `&mut self` — callers own an
    /// `mpsc`-fed task that owns the engine exclusively and applies events
    /// one at a time.
    pub fn dispatch(&mut self, event: SequenceEvent) -> Result<(), StateFault> {
        use SequenceEvent as E;
        use SequenceState as S;

        if let E::StartScan(_) = event {
            if self.state != S::Idle && self.state != S::Complete {
                self.emit(self.state, event, self.state, false);
                return Err(StateFault::Busy);
            }
        }

        // STOP_SCAN is unconditional and idempotent: it always succeeds,
        // including a no-op from IDLE (applying it twice equals once).
        if event == E::StopScan {
            self.transition(event, S::Idle);
            return Ok(());
        }

        let next = match (self.state, event) {
            (S::Idle, E::StartScan(mode)) => {
                self.mode = mode;
                self.retry_budget = 0;
                Some(S::Configure)
            }
            (S::Configure, E::ConfigDone) => Some(S::Arm),
            (S::Arm, E::ArmDone) => Some(S::Scanning),
            (S::Scanning, E::FrameReady) => {
                self.stats.frames_received += 1;
                Some(S::Streaming)
            }
            (S::Streaming, E::Complete) => {
                self.stats.frames_sent += 1;
                Some(match self.mode {
                    ScanMode::Single => S::Complete,
                    ScanMode::Continuous => S::Scanning,
                    ScanMode::Calibration => S::Arm,
                })
            }
            (S::Configure, E::Error) | (S::Arm, E::Error) | (S::Scanning, E::Error)
            | (S::Streaming, E::Error) => {
                self.stats.errors += 1;
                Some(S::Error)
            }
            (S::Error, E::ErrorCleared) => {
                if self.retry_budget >= MAX_RETRY_COUNT {
                    self.emit(self.state, event, self.state, false);
                    return Err(StateFault::RetryExhausted);
                }
                self.retry_budget += 1;
                self.stats.retries += 1;
                Some(S::Scanning)
            }
            _ => None,
        };

        match next {
            Some(to) => {
                self.transition(event, to);
                Ok(())
            }
            None => {
                self.emit(self.state, event, self.state, false);
                Err(StateFault::InvalidTransition)
            }
        }
    }

    fn transition(&mut self, event: SequenceEvent, to: SequenceState) {
        let from = self.state;
        self.state = to;
        self.emit(from, event, to, true);
    }
}

impl Default for SequenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SequenceEvent as E;
    use SequenceState as S;

    fn scan_to_scanning(engine: &mut SequenceEngine) {
        engine.dispatch(E::StartScan(ScanMode::Single)).unwrap();
        engine.dispatch(E::ConfigDone).unwrap();
        engine.dispatch(E::ArmDone).unwrap();
    }

    #[test]
    fn single_scan_happy_path() {
        let mut engine = SequenceEngine::new();
        scan_to_scanning(&mut engine);
        assert_eq!(engine.state(), S::Scanning);
        engine.dispatch(E::FrameReady).unwrap();
        assert_eq!(engine.state(), S::Streaming);
        engine.dispatch(E::Complete).unwrap();
        assert_eq!(engine.state(), S::Complete);
        assert_eq!(engine.stats().frames_sent, 1);
    }

    #[test]
    fn continuous_mode_loops_to_scanning() {
        let mut engine = SequenceEngine::new();
        engine.dispatch(E::StartScan(ScanMode::Continuous)).unwrap();
        engine.dispatch(E::ConfigDone).unwrap();
        engine.dispatch(E::ArmDone).unwrap();
        engine.dispatch(E::FrameReady).unwrap();
        engine.dispatch(E::Complete).unwrap();
        assert_eq!(engine.state(), S::Scanning);
    }

    #[test]
    fn calibration_mode_loops_to_arm() {
        let mut engine = SequenceEngine::new();
        engine.dispatch(E::StartScan(ScanMode::Calibration)).unwrap();
        engine.dispatch(E::ConfigDone).unwrap();
        engine.dispatch(E::ArmDone).unwrap();
        engine.dispatch(E::FrameReady).unwrap();
        engine.dispatch(E::Complete).unwrap();
        assert_eq!(engine.state(), S::Arm);
    }

    #[test]
    fn start_scan_while_busy_fails() {
        let mut engine = SequenceEngine::new();
        scan_to_scanning(&mut engine);
        let err = engine.dispatch(E::StartScan(ScanMode::Single)).unwrap_err();
        assert_eq!(err, StateFault::Busy);
    }

    #[test]
    fn stop_scan_returns_to_idle_from_any_state() {
        let mut engine = SequenceEngine::new();
        scan_to_scanning(&mut engine);
        engine.dispatch(E::StopScan).unwrap();
        assert_eq!(engine.state(), S::Idle);
    }

    #[test]
    fn retry_budget_exhausts_after_three_clears() {
        let mut engine = SequenceEngine::new();
        scan_to_scanning(&mut engine);
        engine.dispatch(E::Error).unwrap();
        assert_eq!(engine.state(), S::Error);

        for expected_budget in 1..=3u8 {
            engine.dispatch(E::ErrorCleared).unwrap();
            assert_eq!(engine.state(), S::Scanning);
            assert_eq!(engine.retry_budget(), expected_budget);
            engine.dispatch(E::Error).unwrap();
        }

        let err = engine.dispatch(E::ErrorCleared).unwrap_err();
        assert_eq!(err, StateFault::RetryExhausted);
        assert_eq!(engine.state(), S::Error);
    }

    #[test]
    fn unlisted_transition_is_invalid_without_side_effects() {
        let mut engine = SequenceEngine::new();
        let err = engine.dispatch(E::FrameReady).unwrap_err();
        assert_eq!(err, StateFault::InvalidTransition);
        assert_eq!(engine.state(), S::Idle);
    }

    #[test]
    fn idle_to_configure_resets_retry_budget() {
        let mut engine = SequenceEngine::new();
        scan_to_scanning(&mut engine);
        engine.dispatch(E::Error).unwrap();
        engine.dispatch(E::ErrorCleared).unwrap();
        engine.dispatch(E::StopScan).unwrap();
        assert_eq!(engine.state(), S::Idle);
        engine.dispatch(E::StartScan(ScanMode::Single)).unwrap();
        assert_eq!(engine.retry_budget(), 0);
    }
}
