use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use loam_core::{ActivationPoint, Lane, LessonId, TransferPolicy};

use crate::lesson::{token_jaccard, Lesson};
use crate::store::LessonStore;

/// Tunables for ranked retrieval. Benchmarks parameterize these through
/// config rather than relying on the defaults.
#[derive(Debug, Clone)]
pub struct RetrieverParams {
    pub prerun_top_k: usize,
    pub onerror_top_m: usize,
    pub transfer_policy: TransferPolicy,
    pub transfer_multiplier: f64,
    pub transfer_prerun_cap: usize,
    pub transfer_onerror_cap: usize,
    pub strict_confidence_threshold: f64,
    pub per_session_cap: usize,
    pub per_tag_cap: usize,
    pub recency_half_life_days: f64,
}

impl Default for RetrieverParams {
    fn default() -> Self {
        Self {
            prerun_top_k: 10,
            onerror_top_m: 2,
            transfer_policy: TransferPolicy::Auto,
            transfer_multiplier: 0.6,
            transfer_prerun_cap: 2,
            transfer_onerror_cap: 1,
            strict_confidence_threshold: 0.5,
            per_session_cap: 2,
            per_tag_cap: 3,
            recency_half_life_days: 14.0,
        }
    }
}

/// What a retrieval point asks for.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub domain_key: String,
    pub point: ActivationPoint,
    /// Task text (pre-run) and/or recent error text (on-error).
    pub context_text: String,
    /// The failing fingerprint, on-error only.
    pub fingerprint: Option<String>,
    pub tags: BTreeSet<String>,
}

/// A lesson selected for injection, with its score and lane.
#[derive(Debug, Clone)]
pub struct RankedLesson {
    pub lesson: Lesson,
    pub score: f64,
    pub lane: Lane,
}

/// Result of one retrieval: the selected lessons plus the conflict pairs
/// that were resolved away (loser, winner) — the promoter counts losses.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub selected: Vec<RankedLesson>,
    pub conflict_losses: Vec<(LessonId, LessonId)>,
}

impl RetrievalOutcome {
    pub fn lesson_ids(&self) -> Vec<LessonId> {
        self.selected.iter().map(|r| r.lesson.id.clone()).collect()
    }
}

/// Two-lane ranked lesson retrieval.
pub struct Retriever {
    params: RetrieverParams,
}

impl Retriever {
    pub fn new(params: RetrieverParams) -> Self {
        Self { params }
    }

    /// Pre-run retrieval: top-K lessons for (task_text, domain_key).
    pub fn prerun(&self, store: &LessonStore, domain_key: &str, task_text: &str) -> RetrievalOutcome {
        self.retrieve(
            store,
            &RetrievalQuery {
                domain_key: domain_key.to_string(),
                point: ActivationPoint::Prerun,
                context_text: task_text.to_string(),
                fingerprint: None,
                tags: BTreeSet::new(),
            },
        )
    }

    /// On-error retrieval: top-M hints for a fresh failure.
    pub fn on_error(
        &self,
        store: &LessonStore,
        domain_key: &str,
        fingerprint: &str,
        tags: &BTreeSet<String>,
        error_text: &str,
    ) -> RetrievalOutcome {
        self.retrieve(
            store,
            &RetrievalQuery {
                domain_key: domain_key.to_string(),
                point: ActivationPoint::OnError,
                context_text: error_text.to_string(),
                fingerprint: Some(fingerprint.to_string()),
                tags: tags.clone(),
            },
        )
    }

    fn limit_for(&self, point: ActivationPoint) -> usize {
        match point {
            ActivationPoint::Prerun => self.params.prerun_top_k,
            ActivationPoint::OnError => self.params.onerror_top_m,
        }
    }

    fn transfer_cap_for(&self, point: ActivationPoint) -> usize {
        match point {
            ActivationPoint::Prerun => self.params.transfer_prerun_cap,
            ActivationPoint::OnError => self.params.transfer_onerror_cap,
        }
    }

    fn retrieve(&self, store: &LessonStore, query: &RetrievalQuery) -> RetrievalOutcome {
        // Score every retrievable lesson in both lanes. Suppressed and
        // archived lessons never enter the pool.
        let mut strict: Vec<RankedLesson> = Vec::new();
        let mut transfer: Vec<RankedLesson> = Vec::new();
        for lesson in store.retrievable() {
            let lane = if lesson.domain_key == query.domain_key {
                Lane::Strict
            } else {
                Lane::Transfer
            };
            if lane == Lane::Transfer && self.params.transfer_policy == TransferPolicy::Off {
                continue;
            }
            let mut score = self.score(lesson, query);
            if lane == Lane::Transfer {
                score *= self.params.transfer_multiplier;
            }
            if score <= 0.0 {
                continue;
            }
            let ranked = RankedLesson {
                lesson: lesson.clone(),
                score,
                lane,
            };
            match lane {
                Lane::Strict => strict.push(ranked),
                Lane::Transfer => transfer.push(ranked),
            }
        }

        // Auto mode: transfer only fires when the strict lane has no
        // high-confidence hit.
        let transfer_enabled = match self.params.transfer_policy {
            TransferPolicy::Off => false,
            TransferPolicy::Always => true,
            TransferPolicy::Auto => !strict
                .iter()
                .any(|r| r.score >= self.params.strict_confidence_threshold),
        };

        let mut pool = strict;
        if transfer_enabled {
            pool.extend(transfer);
        }
        pool.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        // Conflict resolution over the pool: the higher-reliability side
        // of a linked pair wins; the other is skipped for this retrieval.
        let mut conflict_losses: Vec<(LessonId, LessonId)> = Vec::new();
        let present: HashMap<LessonId, f64> = pool
            .iter()
            .map(|r| (r.lesson.id.clone(), r.lesson.reliability))
            .collect();
        pool.retain(|r| {
            for opponent in &r.lesson.conflicts_with {
                if let Some(&their_reliability) = present.get(opponent) {
                    let ours = r.lesson.reliability;
                    let lost = ours < their_reliability
                        || (ours == their_reliability && r.lesson.id > *opponent);
                    if lost {
                        conflict_losses.push((r.lesson.id.clone(), opponent.clone()));
                        return false;
                    }
                }
            }
            true
        });

        // Guarded greedy selection in score order.
        let limit = self.limit_for(query.point);
        let transfer_cap = self.transfer_cap_for(query.point);
        let mut selected: Vec<RankedLesson> = Vec::new();
        let mut per_session: HashMap<uuid::Uuid, usize> = HashMap::new();
        let mut per_tag: HashMap<String, usize> = HashMap::new();
        let mut transfer_used = 0usize;

        for ranked in pool {
            if selected.len() >= limit {
                break;
            }
            if ranked.lane == Lane::Transfer && transfer_used >= transfer_cap {
                continue;
            }
            let session_count = per_session
                .get(&ranked.lesson.source_session_id)
                .copied()
                .unwrap_or(0);
            if session_count >= self.params.per_session_cap {
                continue;
            }
            let tags = ranked.lesson.tags();
            if tags
                .iter()
                .any(|t| per_tag.get(t).copied().unwrap_or(0) >= self.params.per_tag_cap)
            {
                continue;
            }

            *per_session.entry(ranked.lesson.source_session_id).or_insert(0) += 1;
            for t in &tags {
                *per_tag.entry(t.clone()).or_insert(0) += 1;
            }
            if ranked.lane == Lane::Transfer {
                transfer_used += 1;
            }
            selected.push(ranked);
        }

        debug!(
            point = ?query.point,
            domain = %query.domain_key,
            selected = selected.len(),
            "retrieval complete"
        );
        RetrievalOutcome {
            selected,
            conflict_losses,
        }
    }

    /// score = 0.40·fingerprint_match + 0.25·tag_overlap
    ///       + 0.20·text_similarity + 0.10·reliability + 0.05·recency
    fn score(&self, lesson: &Lesson, query: &RetrievalQuery) -> f64 {
        let fingerprint_match = match &query.fingerprint {
            Some(fp) => fingerprint_match(fp, &lesson.trigger_fingerprints),
            None => 0.0,
        };
        let tag_overlap = tag_overlap(&query.tags, &lesson.tags());
        let text_similarity = token_jaccard(&lesson.rule_text, &query.context_text);
        let age_days = (Utc::now() - lesson.updated_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency = 0.5f64.powf(age_days / self.params.recency_half_life_days);

        0.40 * fingerprint_match
            + 0.25 * tag_overlap
            + 0.20 * text_similarity
            + 0.10 * lesson.reliability
            + 0.05 * recency
    }
}

/// Exact trigger hit = 1.0; one fingerprint a prefix of the other = 0.5;
/// anything else = 0.0.
fn fingerprint_match(query_fp: &str, triggers: &BTreeSet<String>) -> f64 {
    let mut best: f64 = 0.0;
    for trigger in triggers {
        let score = if trigger == query_fp {
            1.0
        } else if trigger.starts_with(query_fp) || query_fp.starts_with(trigger.as_str()) {
            0.5
        } else {
            0.0
        };
        best = best.max(score);
    }
    best
}

/// Tag-set overlap for scoring: zero when either side has no tags, so
/// retrieval keeps working (on other signals) with empty tag sets.
fn tag_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers(fps: &[&str]) -> BTreeSet<String> {
        fps.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fingerprint_match_exact() {
        let t = triggers(&["table:keep|operator_mismatch"]);
        assert_eq!(fingerprint_match("table:keep|operator_mismatch", &t), 1.0);
    }

    #[test]
    fn test_fingerprint_match_prefix_scores_half() {
        let t = triggers(&["table:keep|operator_mismatch"]);
        // Either direction of the prefix relation counts as partial
        assert_eq!(fingerprint_match("table:keep", &t), 0.5);
        let t = triggers(&["table:keep"]);
        assert_eq!(fingerprint_match("table:keep|operator_mismatch", &t), 0.5);
    }

    #[test]
    fn test_fingerprint_match_same_residual_different_family_is_zero() {
        // Identical body under a different tool-family prefix is not a
        // match: the prefix exists precisely to keep tools from colliding.
        let t = triggers(&["table:keep|operator_mismatch"]);
        assert_eq!(fingerprint_match("flux:keep|operator_mismatch", &t), 0.0);
    }

    #[test]
    fn test_fingerprint_match_best_of_triggers() {
        let t = triggers(&["table:sort|sort_direction", "table:keep|operator_mismatch"]);
        assert_eq!(fingerprint_match("table:keep|operator_mismatch", &t), 1.0);
        assert_eq!(fingerprint_match("http:get|missing_field", &t), 0.0);
    }

    #[test]
    fn test_tag_overlap_empty_sets_score_zero() {
        let some = triggers(&["operator_mismatch"]);
        assert_eq!(tag_overlap(&BTreeSet::new(), &some), 0.0);
        assert_eq!(tag_overlap(&some, &BTreeSet::new()), 0.0);
        assert_eq!(tag_overlap(&BTreeSet::new(), &BTreeSet::new()), 0.0);
        assert_eq!(tag_overlap(&some, &some), 1.0);
    }
}
