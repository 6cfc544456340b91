use facemark_core::pipeline::{self, ScanReport};
use facemark_core::{FrameFaces, GallerySnapshot, RecognitionSession, SessionError};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Frames to scan, produced lazily on the engine thread.
pub type FrameSource = Box<dyn Iterator<Item = FrameFaces> + Send>;

/// Messages sent from the async front end to the engine thread.
enum EngineRequest {
    Scan {
        snapshot: GallerySnapshot,
        frames: FrameSource,
        cancel: Arc<AtomicBool>,
        reply: oneshot::Sender<Result<ScanReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Scan `frames` against `snapshot` in a fresh session.
    ///
    /// Setting `cancel` stops the scan between frames; the reply then
    /// carries the partial roster.
    pub async fn scan(
        &self,
        snapshot: GallerySnapshot,
        frames: FrameSource,
        cancel: Arc<AtomicBool>,
    ) -> Result<ScanReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Scan {
                snapshot,
                frames,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread so frame iteration never
/// blocks the async runtime. The thread exits when every handle is dropped.
pub fn spawn_engine(threshold: f32) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facemark-engine".into())
        .spawn(move || {
            tracing::info!(threshold, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Scan {
                        snapshot,
                        frames,
                        cancel,
                        reply,
                    } => {
                        let result = run_scan(threshold, snapshot, frames, &cancel);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_scan(
    threshold: f32,
    snapshot: GallerySnapshot,
    frames: FrameSource,
    cancel: &AtomicBool,
) -> Result<ScanReport, EngineError> {
    let mut session = RecognitionSession::new(threshold);
    session.start(snapshot)?;
    Ok(pipeline::run_scan(&mut session, frames, cancel)?)
}
