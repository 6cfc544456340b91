//! Gallery store — enrolled students and their reference embeddings.
//!
//! The gallery is held in memory and written through to a JSON file on
//! every mutation. Each save replaces the whole file (temp file + rename),
//! so readers never observe a partially written gallery.

use crate::types::Embedding;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("enrollment requires at least one sample embedding")]
    EmptySamples,
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("sample {index} is empty or contains a non-finite value")]
    NonFiniteSample { index: usize },
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("gallery I/O failed at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("gallery file {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to encode gallery: {0}")]
    Encode(#[from] serde_json::Error),
}

impl GalleryError {
    /// True for errors caused by malformed enrollment input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GalleryError::EmptyIdentity
                | GalleryError::EmptySamples
                | GalleryError::DimensionMismatch { .. }
                | GalleryError::NonFiniteSample { .. }
        )
    }

    fn io(path: &Path, source: io::Error) -> Self {
        GalleryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One enrolled student.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: String,
    /// Component-wise mean of the enrollment samples.
    pub reference_embedding: Embedding,
    pub roll_no: String,
    pub section: String,
}

/// Component-wise arithmetic mean of `samples`.
///
/// All samples must be non-empty, finite, and of equal dimension. The
/// model version is kept only when every sample agrees on it.
pub fn mean_embedding(samples: &[Embedding]) -> Result<Embedding, GalleryError> {
    let first = samples.first().ok_or(GalleryError::EmptySamples)?;
    let dim = first.dim();

    let mut sum = vec![0.0f32; dim];
    for (index, sample) in samples.iter().enumerate() {
        if sample.dim() != dim {
            return Err(GalleryError::DimensionMismatch {
                expected: dim,
                got: sample.dim(),
            });
        }
        if dim == 0 || !sample.is_finite() {
            return Err(GalleryError::NonFiniteSample { index });
        }
        for (acc, v) in sum.iter_mut().zip(&sample.values) {
            *acc += v;
        }
    }

    let n = samples.len() as f32;
    let values = sum.into_iter().map(|v| v / n).collect();
    let model_version = first
        .model_version
        .clone()
        .filter(|v| samples.iter().all(|s| s.model_version.as_ref() == Some(v)));

    Ok(Embedding {
        values,
        model_version,
    })
}

/// Immutable view of the gallery taken when a session starts.
///
/// Enrollments and deletions made after the snapshot was taken do not
/// affect it.
#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    entries: Arc<[GalleryEntry]>,
    section: Option<String>,
}

impl GallerySnapshot {
    pub fn new(entries: Vec<GalleryEntry>, section: Option<String>) -> Self {
        Self {
            entries: entries.into(),
            section,
        }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Section the snapshot was filtered to, if any.
    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persistent identity -> entry mapping with write-through saves.
///
/// A single mutex guards the in-memory entries and is held across each
/// save, so concurrent `enroll`/`delete` calls are serialized.
pub struct GalleryStore {
    path: PathBuf,
    entries: Mutex<Vec<GalleryEntry>>,
}

impl GalleryStore {
    /// Load the gallery from `path`. A missing file yields an empty gallery;
    /// an unreadable or malformed file is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let path = path.into();
        let entries = read_file(&path)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "gallery loaded");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the entire gallery.
    pub fn save(&self) -> Result<(), GalleryError> {
        let entries = self.lock();
        write_file(&self.path, &entries)
    }

    /// Enroll (or re-enroll) `identity` from a set of sample embeddings.
    ///
    /// Re-enrolling overwrites the previous entry in place. The in-memory
    /// gallery changes only if the save succeeds.
    pub fn enroll(
        &self,
        identity: &str,
        samples: &[Embedding],
        roll_no: &str,
        section: &str,
    ) -> Result<GalleryEntry, GalleryError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(GalleryError::EmptyIdentity);
        }
        let reference_embedding = mean_embedding(samples)?;

        let mut entries = self.lock();

        // Every entry in one gallery shares the embedding dimension.
        if let Some(other) = entries.iter().find(|e| e.identity != identity) {
            let expected = other.reference_embedding.dim();
            if expected != reference_embedding.dim() {
                return Err(GalleryError::DimensionMismatch {
                    expected,
                    got: reference_embedding.dim(),
                });
            }
        }

        let entry = GalleryEntry {
            identity: identity.to_string(),
            reference_embedding,
            roll_no: roll_no.to_string(),
            section: section.to_string(),
        };

        let mut next = entries.clone();
        let replaced = match next.iter_mut().find(|e| e.identity == identity) {
            Some(existing) => {
                *existing = entry.clone();
                true
            }
            None => {
                next.push(entry.clone());
                false
            }
        };
        write_file(&self.path, &next)?;
        *entries = next;

        tracing::info!(
            identity,
            roll_no,
            section,
            samples = samples.len(),
            dim = entry.reference_embedding.dim(),
            replaced,
            "student enrolled"
        );
        Ok(entry)
    }

    /// All entries in insertion order, optionally restricted to one section.
    pub fn lookup_all(&self, section: Option<&str>) -> Vec<GalleryEntry> {
        self.lock()
            .iter()
            .filter(|e| section.map_or(true, |s| e.section == s))
            .cloned()
            .collect()
    }

    pub fn get(&self, identity: &str) -> Result<GalleryEntry, GalleryError> {
        self.lock()
            .iter()
            .find(|e| e.identity == identity)
            .cloned()
            .ok_or_else(|| GalleryError::NotFound(identity.to_string()))
    }

    /// Remove `identity`. Returns `false` (without saving) if it was absent.
    pub fn delete(&self, identity: &str) -> Result<bool, GalleryError> {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.identity == identity) else {
            tracing::debug!(identity, "delete: identity not enrolled");
            return Ok(false);
        };

        let mut next = entries.clone();
        next.remove(pos);
        write_file(&self.path, &next)?;
        *entries = next;

        tracing::info!(identity, "student deleted");
        Ok(true)
    }

    /// Take an immutable snapshot, optionally filtered to one section.
    pub fn snapshot(&self, section: Option<&str>) -> GallerySnapshot {
        GallerySnapshot::new(self.lookup_all(section), section.map(str::to_string))
    }

    /// Distinct sections in first-seen order.
    pub fn sections(&self) -> Vec<String> {
        let entries = self.lock();
        let mut sections: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if !sections.contains(&entry.section) {
                sections.push(entry.section.clone());
            }
        }
        sections
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<GalleryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_file(path: &Path) -> Result<Vec<GalleryEntry>, GalleryError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GalleryError::io(path, e)),
    };

    let corrupt = |reason: String| GalleryError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let GalleryFile(entries) = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    let dim = entries.first().map(|e| e.reference_embedding.dim());
    for entry in &entries {
        let embedding = &entry.reference_embedding;
        if embedding.dim() == 0 || !embedding.is_finite() {
            return Err(corrupt(format!("entry `{}` has an invalid embedding", entry.identity)));
        }
        if Some(embedding.dim()) != dim {
            return Err(corrupt(format!(
                "entry `{}` has dimension {}, expected {}",
                entry.identity,
                embedding.dim(),
                dim.unwrap_or_default()
            )));
        }
    }
    Ok(entries)
}

fn write_file(path: &Path, entries: &[GalleryEntry]) -> Result<(), GalleryError> {
    let encoded = serde_json::to_vec_pretty(&GalleryFileRef(entries))?;

    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| GalleryError::io(parent, e))?;

    // Uniquely named sibling, so concurrent writers never share a temp file.
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| GalleryError::io(parent, e))?;
    let write_tmp = |file: &mut fs::File| -> io::Result<()> {
        file.write_all(&encoded)?;
        file.sync_all()
    };
    write_tmp(tmp.as_file_mut()).map_err(|e| GalleryError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| GalleryError::io(path, e.error))?;

    tracing::debug!(path = %path.display(), entries = entries.len(), "gallery saved");
    Ok(())
}

// --- On-disk format: { "<identity>": { embedding, roll_no, section } } ---

#[derive(Serialize)]
struct StoredEntryRef<'a> {
    embedding: &'a [f32],
    roll_no: &'a str,
    section: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_version: Option<&'a str>,
}

#[derive(Deserialize)]
struct StoredEntry {
    embedding: Vec<f32>,
    roll_no: String,
    section: String,
    #[serde(default)]
    model_version: Option<String>,
}

struct GalleryFileRef<'a>(&'a [GalleryEntry]);

impl Serialize for GalleryFileRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in self.0 {
            map.serialize_entry(
                &entry.identity,
                &StoredEntryRef {
                    embedding: &entry.reference_embedding.values,
                    roll_no: &entry.roll_no,
                    section: &entry.section,
                    model_version: entry.reference_embedding.model_version.as_deref(),
                },
            )?;
        }
        map.end()
    }
}

/// Insertion-ordered gallery, rejecting duplicate identities.
struct GalleryFile(Vec<GalleryEntry>);

impl<'de> Deserialize<'de> for GalleryFile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GalleryVisitor;

        impl<'de> Visitor<'de> for GalleryVisitor {
            type Value = GalleryFile;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of identity to gallery entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<GalleryFile, A::Error> {
                let mut entries: Vec<GalleryEntry> = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((identity, stored)) = access.next_entry::<String, StoredEntry>()? {
                    if entries.iter().any(|e| e.identity == identity) {
                        return Err(de::Error::custom(format!("duplicate identity `{identity}`")));
                    }
                    entries.push(GalleryEntry {
                        identity,
                        reference_embedding: Embedding {
                            values: stored.embedding,
                            model_version: stored.model_version,
                        },
                        roll_no: stored.roll_no,
                        section: stored.section,
                    });
                }
                Ok(GalleryFile(entries))
            }
        }

        deserializer.deserialize_map(GalleryVisitor)
    }
}
