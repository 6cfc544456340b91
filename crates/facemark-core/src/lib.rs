//! facemark-core — Attendance by face embedding.
//!
//! Keeps a gallery of enrolled students (one mean embedding each), matches
//! probe embeddings against it by cosine similarity, and aggregates the
//! matches of one class video into a deduplicated attendance roster.

pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod record;
pub mod session;
pub mod types;

pub use gallery::{GalleryEntry, GalleryError, GallerySnapshot, GalleryStore};
pub use matcher::{MatchResult, DEFAULT_SIMILARITY_THRESHOLD};
pub use pipeline::{Embedder, FaceDetector, FaceImage, Frame, FrameFaces, PipelineError, ScanReport, ScanStats};
pub use record::{RecordError, RecordRow, RecordSummary};
pub use session::{Observation, RecognitionSession, Roster, RosterEntry, SessionError, SessionState};
pub use types::Embedding;
