//! Buffer recovery: scanning session files and locating the last checkpoint.

use std::path::{Path, PathBuf};

use super::event::{BufferEvent, EventType};
use super::writer::BufferError;

// ─── ScanOutcome ─────────────────────────────────────────────────────────────

/// Result of scanning one session file's content.
#[derive(Debug, Default, PartialEq)]
pub struct ScanOutcome {
    /// Events parsed in file order.
    pub events: Vec<BufferEvent>,
    /// Number of interior lines that failed validation.
    pub corrupted_lines: usize,
    /// The final non-empty line failed to parse and nothing valid followed
    /// it, the classic crash-mid-append shape, not corruption.
    pub last_line_truncated: bool,
}

// ─── scan_file ───────────────────────────────────────────────────────────────

/// Scan the content of one session file.
///
/// Rules:
/// - Every non-empty line must parse as a JSON *object* with at least
///   `type` and `timestamp`; anything else (arrays, type-less objects,
///   unknown type tags) counts as corrupted.
/// - A parse failure on the last non-empty line, with no valid event after
///   it, is reported as `last_line_truncated` instead of corruption.
pub fn scan_file(content: &str) -> ScanOutcome {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect();

    let mut outcome = ScanOutcome::default();
    let last_index = lines.len().saturating_sub(1);

    for (i, line) in lines.iter().enumerate() {
        match parse_line(line) {
            Some(event) => outcome.events.push(event),
            None => {
                // Only a *JSON parse* failure on the very last line counts
                // as truncation; a line that parses but fails validation is
                // corrupt wherever it sits.
                let json_broken = serde_json::from_str::<serde_json::Value>(line).is_err();
                if i == last_index && json_broken {
                    outcome.last_line_truncated = true;
                } else {
                    outcome.corrupted_lines += 1;
                }
            }
        }
    }

    outcome
}

/// Parse one line into a [`BufferEvent`], enforcing the minimum shape.
fn parse_line(line: &str) -> Option<BufferEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("type") || !obj.contains_key("timestamp") {
        return None;
    }
    serde_json::from_value(value).ok()
}

// ─── Recovery ────────────────────────────────────────────────────────────────

/// Outcome of recovering a job's buffer directory.
#[derive(Debug, Default)]
pub struct Recovery {
    /// The last checkpoint event whose CRC matched, if any.
    pub last_checkpoint: Option<BufferEvent>,
    /// Events strictly after the checkpoint (or the full list without one).
    pub events_after: Vec<BufferEvent>,
    /// The session file the recovery was read from.
    pub session_file: Option<String>,
    /// Corruption observed while scanning.
    pub corrupted_lines: usize,
    pub last_line_truncated: bool,
}

/// Recover the most recent session of `job_id` under `base`.
///
/// Walks session files in sorted order, scans the most recent one, and
/// splits its events around the last valid `CHECKPOINT`.
pub fn recover(base: &Path, job_id: &str) -> Result<Recovery, BufferError> {
    let dir = base.join(job_id);
    let mut sessions = list_session_files(&dir)?;
    sessions.sort();

    let Some(latest) = sessions.last() else {
        return Ok(Recovery::default());
    };

    let content = std::fs::read_to_string(latest)?;
    let scan = scan_file(&content);

    let checkpoint_index = scan
        .events
        .iter()
        .rposition(|e| e.event_type == EventType::Checkpoint && e.crc_matches());

    let (last_checkpoint, events_after) = match checkpoint_index {
        Some(i) => (Some(scan.events[i].clone()), scan.events[i + 1..].to_vec()),
        None => (None, scan.events.clone()),
    };

    Ok(Recovery {
        last_checkpoint,
        events_after,
        session_file: latest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        corrupted_lines: scan.corrupted_lines,
        last_line_truncated: scan.last_line_truncated,
    })
}

fn list_session_files(dir: &Path) -> Result<Vec<PathBuf>, BufferError> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(name) = name {
            if name.starts_with("session-") && name.ends_with(".jsonl") {
                files.push(path);
            }
        }
    }
    Ok(files)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
