//! Append-only session file writer.
//!
//! One [`JobBuffer`] owns the session files of a single job.  The file
//! handle is exclusive to this process; nothing else writes the directory.
//! Every append produces a whole line or nothing: a cancelled handler can
//! never leave a partial frame behind, because serialization happens before
//! any byte reaches the file.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use thiserror::Error;

use super::event::{BufferEvent, BufferMetadata, EventType};

// ─── BufferError ─────────────────────────────────────────────────────────────

/// I/O failures while writing buffer files.  These are fatal for the job;
/// the worker records the job FAILED with error kind `buffer_io`.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer_io: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer_io: serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ─── JobBuffer ───────────────────────────────────────────────────────────────

/// Writer for one job's append-only event log.
///
/// Layout under `dir`:
/// ```text
/// {base}/{job_id}/session-001.jsonl
/// {base}/{job_id}/session-002.jsonl
/// {base}/{job_id}/metadata.json
/// ```
pub struct JobBuffer {
    dir: PathBuf,
    job_id: String,
    session_no: u32,
    sequence: u64,
    file: File,
}

impl JobBuffer {
    /// Open (or create) the buffer directory for `job_id` and start the
    /// first session file that does not exist yet.
    pub fn open(base: &Path, job_id: &str) -> Result<Self, BufferError> {
        let dir = base.join(job_id);
        fs::create_dir_all(&dir)?;

        let mut session_no = 1;
        while dir.join(session_file_name(session_no)).exists() {
            session_no += 1;
        }
        let file = open_append(&dir.join(session_file_name(session_no)))?;

        Ok(Self {
            dir,
            job_id: job_id.to_string(),
            session_no,
            sequence: 0,
            file,
        })
    }

    /// The current session file name, e.g. `session-001.jsonl`.
    pub fn session_file(&self) -> String {
        session_file_name(self.session_no)
    }

    /// The session number of the file currently being written.
    pub fn session_no(&self) -> u32 {
        self.session_no
    }

    /// Next sequence number that `append` would assign.
    pub fn next_sequence(&self) -> u64 {
        self.sequence
    }

    /// Append one event, assigning the next sequence number.
    ///
    /// The line is flushed before returning; checkpoint events are
    /// additionally fsynced so a checkpoint acknowledgement implies the
    /// bytes are on disk.
    pub fn append(&mut self, mut event: BufferEvent) -> Result<BufferEvent, BufferError> {
        event.sequence = self.sequence;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        if event.event_type == EventType::Checkpoint {
            self.file.sync_data()?;
        }
        self.sequence += 1;
        Ok(event)
    }

    /// Roll to the next session file and reset the sequence counter to 0.
    pub fn new_session(&mut self) -> Result<(), BufferError> {
        self.file.sync_data()?;
        self.session_no += 1;
        self.file = open_append(&self.dir.join(session_file_name(self.session_no)))?;
        self.sequence = 0;
        Ok(())
    }

    /// Persist the session summary as `metadata.json` (atomic replace).
    pub fn write_metadata(&self, meta: &BufferMetadata) -> Result<(), BufferError> {
        let tmp = self.dir.join("metadata.json.tmp");
        let body = serde_json::to_vec_pretty(meta)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.dir.join("metadata.json"))?;
        Ok(())
    }

    /// Job id this buffer belongs to.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The directory holding this job's session files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn session_file_name(no: u32) -> String {
    format!("session-{no:03}.jsonl")
}

fn open_append(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new().create(true).append(true).open(path)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
