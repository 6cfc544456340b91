//! Recognition session — turns observations from one class video into a
//! deduplicated attendance roster.

use crate::gallery::GallerySnapshot;
use crate::matcher::{self, MatchResult};
use crate::types::Embedding;
use chrono::{DateTime, Local, TimeDelta};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("cannot {operation} a session in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Finished,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Finished => "finished",
        })
    }
}

/// A single detected face from one video frame.
#[derive(Debug, Clone)]
pub struct Observation {
    pub embedding: Embedding,
    /// Offset of the frame within the video, if known.
    pub frame_timestamp: Option<Duration>,
}

impl Observation {
    pub fn new(embedding: Embedding, frame_timestamp: Option<Duration>) -> Self {
        Self {
            embedding,
            frame_timestamp,
        }
    }
}

/// A student marked present.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub identity: String,
    pub roll_no: String,
    pub section: String,
    pub first_marked_at: DateTime<Local>,
    /// Video offset of the first accepted observation.
    pub frame_offset: Option<Duration>,
}

/// Final attendance of one session.
#[derive(Debug, Clone)]
pub struct Roster {
    pub session_id: Uuid,
    pub section: Option<String>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// True when the scan was cancelled and the roster is partial.
    pub cancelled: bool,
    /// Entries in first-marked order.
    pub entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }
}

struct Running {
    snapshot: GallerySnapshot,
    anchor: DateTime<Local>,
    entries: Vec<RosterEntry>,
}

enum Phase {
    Idle,
    Running(Running),
    Finished,
}

/// State machine `Idle -> Running -> Finished` over one gallery snapshot.
pub struct RecognitionSession {
    id: Uuid,
    threshold: f32,
    phase: Phase,
}

impl RecognitionSession {
    pub fn new(threshold: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            threshold,
            phase: Phase::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::Running(_) => SessionState::Running,
            Phase::Finished => SessionState::Finished,
        }
    }

    /// Start matching against `snapshot`, anchoring frame offsets at now.
    pub fn start(&mut self, snapshot: GallerySnapshot) -> Result<(), SessionError> {
        self.start_at(snapshot, Local::now())
    }

    /// Start matching against `snapshot`; frame offsets are added to `anchor`
    /// to produce `first_marked_at`.
    pub fn start_at(&mut self, snapshot: GallerySnapshot, anchor: DateTime<Local>) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::Idle) {
            return Err(self.invalid("start"));
        }
        tracing::info!(
            session = %self.id,
            section = snapshot.section().unwrap_or("ALL"),
            gallery = snapshot.len(),
            threshold = self.threshold,
            "session started"
        );
        self.phase = Phase::Running(Running {
            snapshot,
            anchor,
            entries: Vec::new(),
        });
        Ok(())
    }

    /// Match one observation and mark its identity on first sight.
    pub fn observe(&mut self, observation: &Observation) -> Result<MatchResult, SessionError> {
        let Phase::Running(run) = &mut self.phase else {
            return Err(self.invalid("observe"));
        };

        let entries = run.snapshot.entries();
        let result = match matcher::best_match(&observation.embedding, entries) {
            Some((idx, score)) if matcher::accepts(score, self.threshold) => {
                let entry = &entries[idx];
                if !run.entries.iter().any(|e| e.identity == entry.identity) {
                    let first_marked_at = mark_time(run.anchor, observation.frame_timestamp);
                    tracing::info!(
                        session = %self.id,
                        identity = %entry.identity,
                        score,
                        at = %first_marked_at.format("%H:%M:%S"),
                        "student marked present"
                    );
                    run.entries.push(RosterEntry {
                        identity: entry.identity.clone(),
                        roll_no: entry.roll_no.clone(),
                        section: entry.section.clone(),
                        first_marked_at,
                        frame_offset: observation.frame_timestamp,
                    });
                }
                MatchResult {
                    identity: Some(entry.identity.clone()),
                    score,
                }
            }
            Some((_, score)) => MatchResult::unknown(score),
            None => MatchResult::unknown(0.0),
        };

        tracing::debug!(
            session = %self.id,
            identity = ?result.identity,
            score = result.score,
            "observation matched"
        );
        Ok(result)
    }

    /// Whether `identity` has been marked in this session.
    pub fn is_marked(&self, identity: &str) -> bool {
        match &self.phase {
            Phase::Running(run) => run.entries.iter().any(|e| e.identity == identity),
            _ => false,
        }
    }

    pub fn roster_len(&self) -> usize {
        match &self.phase {
            Phase::Running(run) => run.entries.len(),
            _ => 0,
        }
    }

    /// Finish the session and return its roster.
    pub fn finish(&mut self) -> Result<Roster, SessionError> {
        self.close("finish", false)
    }

    /// Stop early, keeping the partial roster accumulated so far.
    pub fn cancel(&mut self) -> Result<Roster, SessionError> {
        self.close("cancel", true)
    }

    fn close(&mut self, operation: &'static str, cancelled: bool) -> Result<Roster, SessionError> {
        let run = match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Running(run) => run,
            other => {
                self.phase = other;
                return Err(self.invalid(operation));
            }
        };

        let roster = Roster {
            session_id: self.id,
            section: run.snapshot.section().map(str::to_string),
            started_at: run.anchor,
            finished_at: Local::now(),
            cancelled,
            entries: run.entries,
        };
        tracing::info!(
            session = %self.id,
            present = roster.len(),
            cancelled,
            "session finished"
        );
        Ok(roster)
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state(),
        }
    }
}

/// `anchor + offset`, or wall-clock now when there is no frame offset.
fn mark_time(anchor: DateTime<Local>, offset: Option<Duration>) -> DateTime<Local> {
    offset
        .and_then(|d| TimeDelta::from_std(d).ok())
        .and_then(|d| anchor.checked_add_signed(d))
        .unwrap_or_else(Local::now)
}
