//! Attendance records — one write-once CSV file per finished session.

use crate::session::Roster;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Header row, kept exact for spreadsheet export downstream.
pub const RECORD_HEADER: [&str; 4] = ["Name", "Roll No", "Section", "Timestamp"];

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record I/O failed at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("record already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("{} is not an attendance record (header: {found})", .path.display())]
    UnexpectedHeader { path: PathBuf, found: String },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// One row of an attendance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Roll No")]
    pub roll_no: String,
    #[serde(rename = "Section")]
    pub section: String,
    /// Time of first sighting, `HH:MM:SS`.
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

/// A record file found in the records directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
    pub path: PathBuf,
    pub name: String,
    pub rows: usize,
}

/// File name for `roster`: `attendance_<SECTION|ALL>_<YYYY-MM-DD_HH-MM-SS>.csv`.
pub fn record_file_name(roster: &Roster) -> String {
    let tag: String = roster
        .section
        .as_deref()
        .unwrap_or("ALL")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "attendance_{tag}_{}.csv",
        roster.finished_at.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Write `roster` as a new CSV file in `dir`. Never overwrites.
pub fn write_record(dir: &Path, roster: &Roster) -> Result<PathBuf, RecordError> {
    fs::create_dir_all(dir).map_err(|source| RecordError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(record_file_name(roster));
    let file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(RecordError::AlreadyExists(path)),
        Err(source) => return Err(RecordError::Io { path, source }),
    };

    remove_on_error(&path, write_rows(file, roster))?;

    tracing::info!(
        path = %path.display(),
        session = %roster.session_id,
        rows = roster.len(),
        cancelled = roster.cancelled,
        "attendance record written"
    );
    Ok(path)
}

fn write_rows(file: fs::File, roster: &Roster) -> Result<(), RecordError> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(RECORD_HEADER)?;
    for entry in &roster.entries {
        writer.serialize(RecordRow {
            name: entry.identity.clone(),
            roll_no: entry.roll_no.clone(),
            section: entry.section.clone(),
            timestamp: entry.first_marked_at.format("%H:%M:%S").to_string(),
        })?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Delete a partially written record so the name is free for a retry.
fn remove_on_error(path: &Path, result: Result<(), RecordError>) -> Result<(), RecordError> {
    if result.is_err() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial record");
        }
    }
    result
}

/// Read the rows of one record, checking its header.
pub fn read_record(path: &Path) -> Result<Vec<RecordRow>, RecordError> {
    let mut reader = csv::Reader::from_path(path)?;

    let headers = reader.headers()?;
    if !headers.iter().eq(RECORD_HEADER) {
        return Err(RecordError::UnexpectedHeader {
            path: path.to_path_buf(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }

    reader
        .deserialize()
        .collect::<Result<Vec<RecordRow>, _>>()
        .map_err(RecordError::from)
}

/// List the CSV records in `dir`, sorted by file name. A missing directory
/// has no records.
pub fn list_records(dir: &Path) -> Result<Vec<RecordSummary>, RecordError> {
    let io_err = |source: io::Error| RecordError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut paths = Vec::new();
    for entry in read_dir {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        // Other CSV files may share the folder; skip them.
        let rows = match read_record(&path) {
            Ok(rows) => rows.len(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record");
                continue;
            }
        };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        records.push(RecordSummary { path, name, rows });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RosterEntry;
    use chrono::{Local, TimeZone};
    use uuid::Uuid;

    fn roster(section: Option<&str>, names: &[&str]) -> Roster {
        let at = Local.with_ymd_and_hms(2026, 3, 9, 10, 15, 0).unwrap();
        Roster {
            session_id: Uuid::new_v4(),
            section: section.map(str::to_string),
            started_at: at,
            finished_at: at,
            cancelled: false,
            entries: names
                .iter()
                .enumerate()
                .map(|(i, name)| RosterEntry {
                    identity: name.to_string(),
                    roll_no: format!("{}", 100 + i),
                    section: section.unwrap_or("A").to_string(),
                    first_marked_at: at + chrono::TimeDelta::seconds(i as i64 * 61),
                    frame_offset: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_record_has_exact_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_record(dir.path(), &roster(Some("B"), &["Alice", "Bob"])).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "attendance_B_2026-03-09_10-15-00.csv"
        );
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Name,Roll No,Section,Timestamp\nAlice,100,B,10:15:00\nBob,101,B,10:16:01\n"
        );
    }

    #[test]
    fn test_empty_roster_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_record(dir.path(), &roster(None, &[])).unwrap();
        assert!(path.ends_with("attendance_ALL_2026-03-09_10-15-00.csv"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "Name,Roll No,Section,Timestamp\n");
    }

    #[test]
    fn test_record_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let r = roster(Some("A"), &["Alice"]);
        write_record(dir.path(), &r).unwrap();
        let err = write_record(dir.path(), &r).unwrap_err();
        assert!(matches!(err, RecordError::AlreadyExists(_)));
    }

    #[test]
    fn test_section_tag_is_sanitized() {
        let name = record_file_name(&roster(Some("CS/2 b"), &[]));
        assert_eq!(name, "attendance_CS_2_b_2026-03-09_10-15-00.csv");
    }

    #[test]
    fn test_quoted_fields_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_record(dir.path(), &roster(Some("A"), &["Doe, Jane"])).unwrap();

        let rows = read_record(&path).unwrap();
        assert_eq!(
            rows,
            vec![RecordRow {
                name: "Doe, Jane".into(),
                roll_no: "100".into(),
                section: "A".into(),
                timestamp: "10:15:00".into(),
            }]
        );
    }

    #[test]
    fn test_list_records_sorted_with_row_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), &roster(Some("B"), &["Bob"])).unwrap();
        write_record(dir.path(), &roster(Some("A"), &["Alice", "Carol"])).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let records = list_records(dir.path()).unwrap();
        let summary: Vec<_> = records.iter().map(|r| (r.name.as_str(), r.rows)).collect();
        assert_eq!(
            summary,
            vec![
                ("attendance_A_2026-03-09_10-15-00", 2),
                ("attendance_B_2026-03-09_10-15-00", 1),
            ]
        );
    }

    #[test]
    fn test_list_records_skips_foreign_csv() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), &roster(Some("A"), &["Alice"])).unwrap();
        fs::write(dir.path().join("attendance_export.csv"), "Student,Present
Alice,yes
").unwrap();

        let records = list_records(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "attendance_A_2026-03-09_10-15-00");
        assert_eq!(records[0].rows, 1);
    }

    #[test]
    fn test_failed_write_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance_A_2026-03-09_10-15-00.csv");
        fs::write(&path, "Name,Roll No\n").unwrap();

        let failed = Err(RecordError::Io {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        });
        assert!(remove_on_error(&path, failed).is_err());
        assert!(!path.exists());

        // The name is free again for the same roster.
        write_record(dir.path(), &roster(Some("A"), &["Alice"])).unwrap();
        assert_eq!(read_record(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_successful_write_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kept.csv");
        fs::write(&path, "x").unwrap();
        remove_on_error(&path, Ok(())).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_list_records_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_records(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_foreign_csv_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.csv");
        fs::write(&path, "id,value\n1,2\n").unwrap();
        assert!(matches!(read_record(&path), Err(RecordError::UnexpectedHeader { .. })));
    }
}
