use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use loam_core::{ActivationPoint, DomainKey, Lane, LessonId, SessionId, SCHEMA_VERSION};

/// Lesson lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Candidate,
    Promoted,
    Suppressed,
    Archived,
}

impl LessonStatus {
    /// Whether retrieval may ever return a lesson in this status.
    pub fn retrievable(&self) -> bool {
        matches!(self, LessonStatus::Candidate | LessonStatus::Promoted)
    }

    /// Archived is terminal; transitions out of it are no-ops.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LessonStatus::Archived)
    }
}

/// Scope the critic believes a lesson applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeHint {
    Task,
    #[default]
    Domain,
    Global,
}

/// One recorded injection of a lesson into a session, with the utility the
/// promoter later attributed to it. Kept inside the lesson record (bounded)
/// so promotion windows survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub session_id: SessionId,
    pub domain_key: DomainKey,
    pub task_cluster: String,
    pub lane: Lane,
    pub point: ActivationPoint,
    /// Filled in by the promoter once the session outcome is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utility: Option<f64>,
    /// Set when the producing session's verdict was uncertain.
    #[serde(default)]
    pub weight_blocked: bool,
    pub at: DateTime<Utc>,
}

/// Cap on activation history kept per lesson.
pub const ACTIVATION_HISTORY_CAP: usize = 64;

/// The primary persisted entity: a short natural-language rule with the
/// triggers it fires on and the evidence of whether it helps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub status: LessonStatus,
    /// Short human-readable rule, typically "WRONG X → CORRECT Y".
    pub rule_text: String,
    pub trigger_fingerprints: BTreeSet<String>,
    /// Tags produced by the fingerprinter — trusted.
    #[serde(default)]
    pub system_tags: BTreeSet<String>,
    /// Tags proposed by the critic — advisory only.
    #[serde(default)]
    pub model_tags: BTreeSet<String>,
    pub domain_key: DomainKey,
    #[serde(default)]
    pub task_cluster: Option<String>,
    pub source_session_id: SessionId,
    #[serde(default)]
    pub retrieval_count: u64,
    #[serde(default)]
    pub helpful_count: u64,
    #[serde(default)]
    pub harmful_count: u64,
    /// Laplace-smoothed scalar in [0,1]; recomputed on every write.
    #[serde(default)]
    pub reliability: f64,
    #[serde(default)]
    pub conflicts_with: BTreeSet<LessonId>,
    /// Conflict losses per opponent, for the suppression rule.
    #[serde(default)]
    pub conflict_losses: std::collections::BTreeMap<LessonId, u32>,
    /// Born in an uncertain session; cannot promote without fresh
    /// consistent evidence.
    #[serde(default)]
    pub weight_blocked: bool,
    #[serde(default)]
    pub activations: Vec<ActivationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retrieved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// A candidate lesson as emitted by the critic, before storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateLesson {
    pub trigger_fingerprints: BTreeSet<String>,
    pub rule_text: String,
    #[serde(default)]
    pub scope_hint: ScopeHint,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Lesson {
    /// Build a fresh candidate record from critic output.
    pub fn from_candidate(
        candidate: &CandidateLesson,
        domain_key: &str,
        task_cluster: Option<&str>,
        source_session_id: SessionId,
        system_tags: BTreeSet<String>,
        weight_blocked: bool,
    ) -> Self {
        let now = Utc::now();
        let mut lesson = Self {
            id: new_lesson_id(&candidate.rule_text, domain_key),
            status: LessonStatus::Candidate,
            rule_text: candidate.rule_text.clone(),
            trigger_fingerprints: candidate.trigger_fingerprints.clone(),
            system_tags,
            model_tags: candidate.tags.clone(),
            domain_key: domain_key.to_string(),
            task_cluster: task_cluster.map(String::from),
            source_session_id,
            retrieval_count: 0,
            helpful_count: 0,
            harmful_count: 0,
            reliability: 0.0,
            conflicts_with: BTreeSet::new(),
            conflict_losses: Default::default(),
            weight_blocked,
            activations: Vec::new(),
            last_retrieved_at: None,
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        };
        lesson.recompute_reliability();
        lesson
    }

    /// All tags, trusted first.
    pub fn tags(&self) -> BTreeSet<String> {
        self.system_tags
            .union(&self.model_tags)
            .cloned()
            .collect()
    }

    /// `(helpful + 1) / (helpful + harmful + 2)` — Laplace smoothing.
    pub fn recompute_reliability(&mut self) {
        self.reliability = (self.helpful_count as f64 + 1.0)
            / ((self.helpful_count + self.harmful_count) as f64 + 2.0);
    }

    /// Record one injection. History is bounded; oldest entries fall off.
    pub fn record_activation(&mut self, activation: ActivationRecord) {
        self.retrieval_count += 1;
        self.last_retrieved_at = Some(activation.at);
        self.activations.push(activation);
        if self.activations.len() > ACTIVATION_HISTORY_CAP {
            let excess = self.activations.len() - ACTIVATION_HISTORY_CAP;
            self.activations.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    /// Dedup rule: identical trigger set AND rule-text Jaccard at or above
    /// the threshold.
    pub fn duplicates(&self, other: &Lesson, dedup_jaccard: f64) -> bool {
        self.trigger_fingerprints == other.trigger_fingerprints
            && token_jaccard(&self.rule_text, &other.rule_text) >= dedup_jaccard
    }

    /// Conflict rule: trigger sets overlap by at least one fingerprint AND
    /// the rules disagree (Jaccard below the conflict threshold).
    pub fn conflicts(&self, other: &Lesson, conflict_jaccard: f64) -> bool {
        self.id != other.id
            && !self.trigger_fingerprints.is_disjoint(&other.trigger_fingerprints)
            && token_jaccard(&self.rule_text, &other.rule_text) < conflict_jaccard
    }

    /// Merge `other` into `self` (dedup hit). Counters add, `created_at`
    /// keeps the earliest, the higher-reliability rule text wins, and the
    /// id stays `self`'s.
    pub fn merge(&mut self, other: &Lesson) {
        if other.reliability > self.reliability {
            self.rule_text = other.rule_text.clone();
        }
        self.retrieval_count += other.retrieval_count;
        self.helpful_count += other.helpful_count;
        self.harmful_count += other.harmful_count;
        self.system_tags.extend(other.system_tags.iter().cloned());
        self.model_tags.extend(other.model_tags.iter().cloned());
        self.conflicts_with.extend(other.conflicts_with.iter().cloned());
        self.activations.extend(other.activations.iter().cloned());
        if self.activations.len() > ACTIVATION_HISTORY_CAP {
            let excess = self.activations.len() - ACTIVATION_HISTORY_CAP;
            self.activations.drain(..excess);
        }
        // A confirmed re-emergence lifts the uncertainty block
        if !other.weight_blocked {
            self.weight_blocked = false;
        }
        self.created_at = self.created_at.min(other.created_at);
        self.updated_at = Utc::now();
        self.recompute_reliability();
    }
}

/// Short stable id: hash of rule text + domain + a random suffix so two
/// distinct lessons can never collide even with identical text.
fn new_lesson_id(rule_text: &str, domain_key: &str) -> LessonId {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in rule_text.bytes().chain(domain_key.bytes()) {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("L{:08x}{}", hash as u32, &suffix[..8])
}

/// Small stop-word list excluded from rule-text Jaccard.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "be", "to", "of", "in", "on", "for", "and", "or", "not", "use",
    "with", "when", "it", "its", "this", "that",
];

/// Token Jaccard over lowercased word tokens minus stop words.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    set_jaccard(&ta, &tb)
}

/// Jaccard over two string sets. Empty-vs-empty is 1.0.
pub fn set_jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= 2 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}
