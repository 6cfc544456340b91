//! Pre-computed embeddings produced by an external detector + embedder.
//!
//! Observation files are JSON Lines, one sampled frame per line:
//!
//! ```text
//! {"t_ms": 1500, "faces": [[0.12, -0.03, ...], {"error": "blurred crop"}]}
//! ```
//!
//! A face is either an embedding or a recorded embedding failure. A line
//! that does not parse counts as one failed face; a read error ends the
//! stream the way a truncated video would.

use facemark_core::{Embedding, FrameFaces, PipelineError};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize)]
struct FrameLine {
    #[serde(default)]
    t_ms: Option<u64>,
    #[serde(default)]
    faces: Vec<FaceLine>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FaceLine {
    Embedding(Vec<f32>),
    Failed { error: String },
}

impl FrameLine {
    fn into_frame(self) -> FrameFaces {
        let faces = self
            .faces
            .into_iter()
            .map(|face| match face {
                FaceLine::Embedding(values) => {
                    let embedding = Embedding::new(values);
                    if embedding.dim() > 0 && embedding.is_finite() {
                        Ok(embedding)
                    } else {
                        Err(PipelineError::Embedding("empty or non-finite embedding".into()))
                    }
                }
                FaceLine::Failed { error } => Err(PipelineError::Embedding(error)),
            })
            .collect();
        FrameFaces {
            timestamp: self.t_ms.map(Duration::from_millis),
            faces,
        }
    }
}

/// Streams [`FrameFaces`] from a JSON Lines source.
pub struct ObservationReader<R> {
    lines: io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> ObservationReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

/// Open an observation file for streaming.
pub fn open(path: &Path) -> io::Result<ObservationReader<BufReader<File>>> {
    Ok(ObservationReader::new(BufReader::new(File::open(path)?)))
}

impl<R: BufRead> Iterator for ObservationReader<R> {
    type Item = FrameFaces;

    fn next(&mut self) -> Option<FrameFaces> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(line = self.line_no + 1, error = %e, "observation read failed; ending stream");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            return Some(match serde_json::from_str::<FrameLine>(&line) {
                Ok(frame) => frame.into_frame(),
                Err(e) => FrameFaces {
                    timestamp: None,
                    faces: vec![Err(PipelineError::Detection(format!("line {}: {e}", self.line_no)))],
                },
            });
        }
    }
}

/// Read enrollment samples: a JSON array of embedding arrays.
pub fn load_samples(path: &Path, model_version: Option<&str>) -> anyhow::Result<Vec<Embedding>> {
    let file = File::open(path)?;
    let samples: Vec<Vec<f32>> = serde_json::from_reader(BufReader::new(file))?;
    Ok(samples
        .into_iter()
        .map(|values| Embedding {
            values,
            model_version: model_version.map(str::to_string),
        })
        .collect())
}
