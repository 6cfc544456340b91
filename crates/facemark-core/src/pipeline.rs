//! Scan pipeline — drives a recognition session from video frames.
//!
//! Face detection and embedding are external collaborators, plugged in
//! through [`FaceDetector`] and [`Embedder`]. A failure on one face is
//! logged and counted as "no match"; it never aborts the scan.

use crate::session::{Observation, RecognitionSession, Roster, SessionError};
use crate::types::Embedding;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// A decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed pixel data, layout defined by the detector.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Offset of the frame within the video.
    pub timestamp: Option<Duration>,
}

/// A cropped face, ready for embedding.
#[derive(Debug, Clone)]
pub struct FaceImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Finds faces in a frame and crops them.
pub trait FaceDetector {
    fn detect_and_crop(&mut self, frame: &Frame) -> Result<Vec<FaceImage>, PipelineError>;
}

/// Maps a face crop to an identity embedding.
pub trait Embedder {
    fn embed(&mut self, face: &FaceImage) -> Result<Embedding, PipelineError>;
}

/// Embedded faces of one frame. Failed faces are kept so they can be counted.
#[derive(Debug, Clone)]
pub struct FrameFaces {
    pub timestamp: Option<Duration>,
    pub faces: Vec<Result<Embedding, PipelineError>>,
}

/// Run detection and embedding on one frame.
///
/// A detection failure is reported as a single failed face.
pub fn embed_frame<D, E>(detector: &mut D, embedder: &mut E, frame: &Frame) -> FrameFaces
where
    D: FaceDetector + ?Sized,
    E: Embedder + ?Sized,
{
    let faces = match detector.detect_and_crop(frame) {
        Ok(crops) => crops.iter().map(|face| embedder.embed(face)).collect(),
        Err(e) => vec![Err(e)],
    };
    FrameFaces {
        timestamp: frame.timestamp,
        faces,
    }
}

/// Counters collected over one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub frames: usize,
    pub faces: usize,
    pub failed_faces: usize,
    pub recognized: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub roster: Roster,
    pub stats: ScanStats,
}

/// Feed `frames` into a running `session` until the input ends or
/// `cancel` is set.
///
/// The cancel flag is checked between frames. On cancellation the session
/// is closed with the partial roster gathered so far.
pub fn run_scan<I>(session: &mut RecognitionSession, frames: I, cancel: &AtomicBool) -> Result<ScanReport, SessionError>
where
    I: IntoIterator<Item = FrameFaces>,
{
    let mut stats = ScanStats::default();

    for frame in frames {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!(session = %session.id(), frames = stats.frames, "scan cancelled");
            let roster = session.cancel()?;
            return Ok(ScanReport { roster, stats });
        }
        stats.frames += 1;

        for face in frame.faces {
            stats.faces += 1;
            let embedding = match face {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::warn!(
                        session = %session.id(),
                        frame = stats.frames,
                        error = %e,
                        "face skipped"
                    );
                    stats.failed_faces += 1;
                    continue;
                }
            };

            let result = session.observe(&Observation::new(embedding, frame.timestamp))?;
            if result.is_match() {
                stats.recognized += 1;
            } else {
                stats.unknown += 1;
            }
        }
    }

    let roster = session.finish()?;
    tracing::info!(
        session = %roster.session_id,
        frames = stats.frames,
        faces = stats.faces,
        failed = stats.failed_faces,
        present = roster.len(),
        "scan complete"
    );
    Ok(ScanReport { roster, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::{GalleryEntry, GallerySnapshot};
    use crate::matcher::DEFAULT_SIMILARITY_THRESHOLD;
    use crate::session::SessionState;
    use std::sync::atomic::AtomicUsize;

    /// Treats every byte of the frame as one face whose "pixel" selects a
    /// basis vector; byte 0xFF fails to embed, and a frame of width 0
    /// fails detection.
    struct ByteDetector;

    impl FaceDetector for ByteDetector {
        fn detect_and_crop(&mut self, frame: &Frame) -> Result<Vec<FaceImage>, PipelineError> {
            if frame.width == 0 {
                return Err(PipelineError::Detection("empty frame".into()));
            }
            Ok(frame
                .data
                .iter()
                .map(|&b| FaceImage {
                    data: vec![b],
                    width: 1,
                    height: 1,
                })
                .collect())
        }
    }

    struct BasisEmbedder;

    impl Embedder for BasisEmbedder {
        fn embed(&mut self, face: &FaceImage) -> Result<Embedding, PipelineError> {
            match face.data[0] {
                0xFF => Err(PipelineError::Embedding("degenerate crop".into())),
                b => {
                    let mut values = vec![0.0; 3];
                    values[b as usize % 3] = 1.0;
                    Ok(Embedding::new(values))
                }
            }
        }
    }

    fn frame(data: &[u8], width: u32, secs: u64) -> Frame {
        Frame {
            data: data.to_vec(),
            width,
            height: 1,
            timestamp: Some(Duration::from_secs(secs)),
        }
    }

    fn gallery() -> GallerySnapshot {
        let entry = |id: &str, values: Vec<f32>| GalleryEntry {
            identity: id.into(),
            reference_embedding: Embedding::new(values),
            roll_no: "0".into(),
            section: "A".into(),
        };
        GallerySnapshot::new(
            vec![entry("Alice", vec![1.0, 0.0, 0.0]), entry("Bob", vec![0.0, 1.0, 0.0])],
            None,
        )
    }

    fn started() -> RecognitionSession {
        let mut session = RecognitionSession::new(DEFAULT_SIMILARITY_THRESHOLD);
        session.start(gallery()).unwrap();
        session
    }

    #[test]
    fn test_embed_frame_keeps_per_face_failures() {
        let faces = embed_frame(&mut ByteDetector, &mut BasisEmbedder, &frame(&[0, 0xFF, 1], 3, 2));
        assert_eq!(faces.timestamp, Some(Duration::from_secs(2)));
        assert_eq!(faces.faces.len(), 3);
        assert!(faces.faces[0].is_ok());
        assert_eq!(faces.faces[1], Err(PipelineError::Embedding("degenerate crop".into())));
    }

    #[test]
    fn test_detection_failure_is_one_failed_face() {
        let faces = embed_frame(&mut ByteDetector, &mut BasisEmbedder, &frame(&[0], 0, 0));
        assert_eq!(faces.faces, vec![Err(PipelineError::Detection("empty frame".into()))]);
    }

    #[test]
    fn test_failures_do_not_abort_scan() {
        let frames = vec![frame(&[0xFF, 2], 2, 1), frame(&[5], 0, 2), frame(&[0, 1, 0], 3, 3)];
        let (mut det, mut emb) = (ByteDetector, BasisEmbedder);
        let stream = frames.iter().map(|f| embed_frame(&mut det, &mut emb, f));

        let report = run_scan(&mut started(), stream, &AtomicBool::new(false)).unwrap();

        assert_eq!(
            report.stats,
            ScanStats {
                frames: 3,
                faces: 6,
                failed_faces: 2,
                recognized: 3,
                unknown: 1,
            }
        );
        let ids: Vec<_> = report.roster.entries.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["Alice", "Bob"]);
        assert!(!report.roster.cancelled);
    }

    #[test]
    fn test_cancel_between_frames_keeps_partial_roster() {
        let cancel = AtomicBool::new(false);
        let embedded = AtomicUsize::new(0);
        let frames = vec![frame(&[0], 1, 1), frame(&[1], 1, 2), frame(&[1], 1, 3)];
        let (mut det, mut emb) = (ByteDetector, BasisEmbedder);

        let stream = frames.iter().map(|f| {
            // Cancellation arrives while the first frame is being processed.
            if embedded.fetch_add(1, Ordering::Relaxed) == 0 {
                cancel.store(true, Ordering::Relaxed);
            }
            embed_frame(&mut det, &mut emb, f)
        });

        let mut session = started();
        let report = run_scan(&mut session, stream, &cancel).unwrap();

        assert!(report.roster.cancelled);
        assert_eq!(report.stats.frames, 0);
        assert!(report.roster.is_empty());
        assert_eq!(session.state(), SessionState::Finished);
    }

    #[test]
    fn test_cancel_after_some_frames() {
        let cancel = AtomicBool::new(false);
        let frames = vec![
            FrameFaces {
                timestamp: Some(Duration::from_secs(1)),
                faces: vec![Ok(Embedding::new(vec![1.0, 0.0, 0.0]))],
            },
            FrameFaces {
                timestamp: Some(Duration::from_secs(2)),
                faces: vec![Ok(Embedding::new(vec![0.0, 1.0, 0.0]))],
            },
        ];
        let stream = frames.into_iter().enumerate().map(|(i, f)| {
            if i == 1 {
                cancel.store(true, Ordering::Relaxed);
            }
            f
        });

        let report = run_scan(&mut started(), stream, &cancel).unwrap();
        assert!(report.roster.cancelled);
        assert_eq!(report.stats.frames, 1);
        assert_eq!(report.roster.len(), 1);
        assert!(report.roster.get("Alice").is_some());
    }

    #[test]
    fn test_scan_requires_running_session() {
        let mut session = RecognitionSession::new(DEFAULT_SIMILARITY_THRESHOLD);
        let result = run_scan(&mut session, Vec::new(), &AtomicBool::new(false));
        assert!(result.is_err());
    }
}
