use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use loam_core::{LessonId, LoamError, Result};

use crate::lesson::{ActivationRecord, Lesson, LessonStatus};

/// Filter for [`LessonStore::iter`].
#[derive(Debug, Clone, Default)]
pub struct LessonFilter {
    pub status: Option<LessonStatus>,
    pub domain_key: Option<String>,
}

/// The lesson store: an in-memory index over an append-mostly JSONL log.
///
/// Every mutation appends the full updated record; load is last-wins by
/// id. `compact` rewrites the log atomically (temp file, fsync, rename).
/// Concurrency contract: single writer, in-process sequential access;
/// readers of the file get a consistent snapshot via rename atomicity.
///
/// On I/O failure the store degrades to in-memory for the rest of the
/// process and logs a warning — operations keep succeeding so the
/// session can complete.
pub struct LessonStore {
    lessons: HashMap<LessonId, Lesson>,
    path: Option<PathBuf>,
    appender: Option<File>,
    degraded: bool,
}

impl LessonStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut lessons = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let mut total = 0usize;
            let mut bad = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                total += 1;
                match serde_json::from_str::<Lesson>(&line) {
                    Ok(lesson) => {
                        lessons.insert(lesson.id.clone(), lesson);
                    }
                    Err(e) => {
                        bad += 1;
                        debug!(error = %e, "skipping unreadable lesson record");
                    }
                }
            }
            if bad > 0 {
                warn!(bad, total, "lesson log contained unreadable records");
            }
            info!(count = lessons.len(), ?path, "loaded lesson store");
        }

        let appender = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            lessons,
            path: Some(path.to_path_buf()),
            appender: Some(appender),
            degraded: false,
        })
    }

    /// A store that never touches disk (tests, degraded sessions).
    pub fn in_memory() -> Self {
        Self {
            lessons: HashMap::new(),
            path: None,
            appender: None,
            degraded: false,
        }
    }

    /// Whether disk persistence has been abandoned for this process.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Number of lessons currently in the store (all statuses).
    pub fn len(&self) -> usize {
        self.lessons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty()
    }

    /// Add or merge a lesson. A dedup hit (same trigger set, rule-text
    /// Jaccard ≥ `dedup_jaccard`) merges into the existing record and
    /// returns its id. New lessons are checked for conflicts against
    /// trigger-overlapping disagreeing lessons and linked symmetrically.
    pub fn upsert(&mut self, lesson: Lesson, dedup_jaccard: f64, conflict_jaccard: f64) -> LessonId {
        // Dedup pass
        let dup_id = self
            .lessons
            .values()
            .find(|existing| existing.duplicates(&lesson, dedup_jaccard))
            .map(|existing| existing.id.clone());

        if let Some(id) = dup_id {
            let merged = self.lessons.get_mut(&id).map(|existing| {
                existing.merge(&lesson);
                existing.clone()
            });
            if let Some(merged) = merged {
                debug!(id = %id, "merged duplicate lesson");
                self.persist(&merged);
            }
            return id;
        }

        // Conflict pass — candidate conflicts get linked both ways
        let conflict_ids: Vec<LessonId> = self
            .lessons
            .values()
            .filter(|existing| existing.conflicts(&lesson, conflict_jaccard))
            .map(|existing| existing.id.clone())
            .collect();

        let mut lesson = lesson;
        for cid in &conflict_ids {
            lesson.conflicts_with.insert(cid.clone());
        }
        let id = lesson.id.clone();
        self.lessons.insert(id.clone(), lesson.clone());
        self.persist(&lesson);

        for cid in conflict_ids {
            if let Some(other) = self.lessons.get_mut(&cid) {
                other.conflicts_with.insert(id.clone());
                let other = other.clone();
                self.persist(&other);
            }
        }
        id
    }

    pub fn get(&self, id: &str) -> Option<&Lesson> {
        self.lessons.get(id)
    }

    /// Iterate lessons matching the filter.
    pub fn iter(&self, filter: &LessonFilter) -> impl Iterator<Item = &Lesson> {
        self.lessons.values().filter(move |l| {
            filter.status.is_none_or(|s| l.status == s)
                && filter
                    .domain_key
                    .as_deref()
                    .is_none_or(|d| l.domain_key == d)
        })
    }

    /// Lessons retrieval may consider (candidate or promoted).
    pub fn retrievable(&self) -> impl Iterator<Item = &Lesson> {
        self.lessons.values().filter(|l| l.status.retrievable())
    }

    /// Move a lesson to a new status, recording the reason. No-op once a
    /// terminal status (archived) is reached or when the status is
    /// unchanged. Returns whether a transition happened.
    pub fn transition(&mut self, id: &str, new_status: LessonStatus, reason: &str) -> bool {
        let Some(lesson) = self.lessons.get_mut(id) else {
            return false;
        };
        if lesson.status.is_terminal() || lesson.status == new_status {
            return false;
        }
        info!(
            id = %id,
            from = ?lesson.status,
            to = ?new_status,
            reason,
            "lesson transition"
        );
        lesson.status = new_status;
        lesson.updated_at = chrono::Utc::now();
        let snapshot = lesson.clone();
        self.persist(&snapshot);
        true
    }

    /// Link two lessons as conflicting, symmetrically.
    pub fn link_conflict(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        let (Some(_), Some(_)) = (self.lessons.get(a), self.lessons.get(b)) else {
            return;
        };
        if let Some(la) = self.lessons.get_mut(a) {
            la.conflicts_with.insert(b.to_string());
            let la = la.clone();
            self.persist(&la);
        }
        if let Some(lb) = self.lessons.get_mut(b) {
            lb.conflicts_with.insert(a.to_string());
            let lb = lb.clone();
            self.persist(&lb);
        }
    }

    /// Record an activation against a lesson.
    pub fn record_activation(&mut self, id: &str, activation: ActivationRecord) {
        if let Some(lesson) = self.lessons.get_mut(id) {
            lesson.record_activation(activation);
            let snapshot = lesson.clone();
            self.persist(&snapshot);
        }
    }

    /// Apply an in-place edit and persist. Returns false for unknown ids.
    pub fn modify(&mut self, id: &str, f: impl FnOnce(&mut Lesson)) -> bool {
        let Some(lesson) = self.lessons.get_mut(id) else {
            return false;
        };
        f(lesson);
        lesson.updated_at = chrono::Utc::now();
        let snapshot = lesson.clone();
        self.persist(&snapshot);
        true
    }

    /// Rewrite the log to one record per lesson: write temp file, fsync,
    /// atomic rename. Preserves every lesson (archived included — nothing
    /// is hard-deleted by default).
    pub fn compact(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(()); // in-memory store has nothing to compact
        };
        if self.degraded {
            return Err(LoamError::Store(
                "store is degraded to in-memory; cannot compact".into(),
            ));
        }

        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut ordered: Vec<&Lesson> = self.lessons.values().collect();
            ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            for lesson in ordered {
                serde_json::to_writer(&mut tmp, lesson)?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        // Reopen the appender against the new file
        self.appender = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        info!(count = self.lessons.len(), "compacted lesson store");
        Ok(())
    }

    fn persist(&mut self, lesson: &Lesson) {
        if self.degraded {
            return;
        }
        let Some(appender) = self.appender.as_mut() else {
            return; // purely in-memory store
        };
        let result = serde_json::to_string(lesson)
            .map_err(LoamError::from)
            .and_then(|line| {
                appender.write_all(line.as_bytes())?;
                appender.write_all(b"\n")?;
                appender.flush()?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(error = %e, "lesson store write failed; degrading to in-memory for this session");
            self.degraded = true;
            self.appender = None;
        }
    }
}
