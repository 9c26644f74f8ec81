//! Skill metadata index with mtime-gated refresh.
//!
//! Each subdirectory of the skills root containing a `SKILL.md` is one
//! skill.  The file starts with YAML frontmatter (title, tags, summary,
//! constraints) followed by the prompt body.  `refresh` re-reads only
//! files whose mtime changed since the last scan.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Tool and capability constraints a skill imposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillConstraints {
    /// Empty list means unrestricted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default = "default_true")]
    pub network_access: bool,
    #[serde(default = "default_true")]
    pub shell_access: bool,
}

fn default_true() -> bool {
    true
}

impl SkillConstraints {
    pub fn permissive() -> Self {
        Self {
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            network_access: true,
            shell_access: true,
        }
    }
}

/// Indexed metadata for one skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillEntry {
    /// Directory name under the skills root.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub constraints: SkillConstraints,
    pub file_path: PathBuf,
    pub content_hash: String,
    #[serde(skip, default = "SystemTime::now")]
    pub mtime: SystemTime,
}

/// A resolved skill: metadata plus its full markdown content.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSkill {
    pub entry: SkillEntry,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("skill not found: {0}")]
    NotFound(String),

    #[error("skill io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("skill frontmatter error in {path}: {message}")]
    Frontmatter { path: String, message: String },
}

// ─── Frontmatter ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontMatter {
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    constraints: Option<SkillConstraints>,
}

/// Split a SKILL.md into (frontmatter yaml, body).
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    Some((yaml, body))
}

// ─── SkillIndex ──────────────────────────────────────────────────────────────

pub struct SkillIndex {
    root: PathBuf,
    entries: RwLock<HashMap<String, SkillEntry>>,
}

impl SkillIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Scan the root, re-reading only skills whose SKILL.md mtime changed.
    /// Skills whose directory disappeared are dropped.
    pub fn refresh(&self) -> Result<usize, SkillError> {
        let mut seen = HashMap::new();
        let mut reloaded = 0usize;

        let entries = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write(&self.entries).clear();
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        for dir_entry in entries {
            let dir = dir_entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let skill_file = dir.join("SKILL.md");
            let Ok(meta) = std::fs::metadata(&skill_file) else {
                continue;
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let id = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let cached = read(&self.entries).get(&id).cloned();
            let entry = match cached {
                Some(entry) if entry.mtime == mtime => entry,
                _ => {
                    reloaded += 1;
                    match load_entry(&id, &skill_file, mtime) {
                        Ok(entry) => entry,
                        Err(e) => {
                            log::warn!("skills: skipping '{id}': {e}");
                            continue;
                        }
                    }
                }
            };
            seen.insert(id, entry);
        }

        *write(&self.entries) = seen;
        Ok(reloaded)
    }

    /// All indexed entries, sorted by id.
    pub fn list(&self) -> Vec<SkillEntry> {
        let mut entries: Vec<SkillEntry> = read(&self.entries).values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn get(&self, id: &str) -> Option<SkillEntry> {
        read(&self.entries).get(id).cloned()
    }

    /// Load the full content of the named skills, preserving input order.
    /// Unknown names fail the whole resolve.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<ResolvedSkill>, SkillError> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let entry = self
                .get(name)
                .ok_or_else(|| SkillError::NotFound(name.clone()))?;
            let content = std::fs::read_to_string(&entry.file_path)?;
            resolved.push(ResolvedSkill { entry, content });
        }
        Ok(resolved)
    }
}

fn load_entry(id: &str, path: &Path, mtime: SystemTime) -> Result<SkillEntry, SkillError> {
    let content = std::fs::read_to_string(path)?;
    let (yaml, _body) = split_frontmatter(&content).ok_or_else(|| SkillError::Frontmatter {
        path: path.display().to_string(),
        message: "missing --- frontmatter block".into(),
    })?;
    let front: FrontMatter =
        serde_yaml::from_str(yaml).map_err(|e| SkillError::Frontmatter {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());

    Ok(SkillEntry {
        id: id.to_string(),
        title: front.title,
        tags: front.tags,
        summary: front.summary,
        constraints: front.constraints.unwrap_or_else(SkillConstraints::permissive),
        file_path: path.to_path_buf(),
        content_hash: hex::encode(hasher.finalize()),
        mtime,
    })
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
