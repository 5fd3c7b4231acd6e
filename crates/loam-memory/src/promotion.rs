use chrono::{Duration, Utc};
use tracing::{debug, info};

use loam_core::{LessonId, SessionId, Verdict};

use crate::lesson::{Lesson, LessonStatus};
use crate::store::{LessonFilter, LessonStore};

/// Tunables for promotion / suppression / archival.
#[derive(Debug, Clone)]
pub struct PromoterParams {
    pub utility_threshold: f64,
    pub evidence_window: usize,
    pub regression_floor: f64,
    pub suppression_retrievals: usize,
    pub suppression_conflict_losses: u32,
    pub archive_age_days: i64,
    pub archive_reliability_floor: f64,
}

impl Default for PromoterParams {
    fn default() -> Self {
        Self {
            utility_threshold: 0.20,
            evidence_window: 3,
            regression_floor: -0.5,
            suppression_retrievals: 3,
            suppression_conflict_losses: 3,
            archive_age_days: 60,
            archive_reliability_floor: 0.4,
        }
    }
}

/// Everything the promoter needs to know about a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub verdict: Verdict,
    /// Referee score, when a referee signal exists.
    pub referee_score: Option<f64>,
    /// Referee score baseline over the recent window (caller-estimated).
    pub referee_score_baseline: Option<f64>,
    /// Fraction of failing steps whose fingerprint appeared in prior sessions.
    pub fingerprint_recurrence_before: f64,
    /// Same fraction after hint injection within this session.
    pub fingerprint_recurrence_after: f64,
    /// Steps until the first successful tool call, if any succeeded.
    pub steps_to_first_success: Option<u32>,
    /// Baseline steps-to-first-success over the recent window.
    pub baseline_steps_to_first_success: Option<u32>,
}

/// What one promoter pass changed.
#[derive(Debug, Clone, Default)]
pub struct PromotionReport {
    pub updated: Vec<LessonId>,
    pub promoted: Vec<LessonId>,
    pub suppressed: Vec<LessonId>,
    pub archived: Vec<LessonId>,
}

/// Recomputes per-lesson utility from session outcomes and applies
/// lifecycle transitions.
pub struct Promoter {
    params: PromoterParams,
}

impl Promoter {
    pub fn new(params: PromoterParams) -> Self {
        Self { params }
    }

    /// Per-activation utility for this session.
    ///
    /// `0.50·error_reduction + 0.30·step_efficiency_gain +
    /// 0.20·referee_score_gain`; without a referee signal the last weight
    /// is redistributed proportionally (0.625 / 0.375).
    pub fn activation_utility(&self, outcome: &SessionOutcome) -> f64 {
        let error_reduction =
            if outcome.fingerprint_recurrence_after < outcome.fingerprint_recurrence_before {
                1.0
            } else {
                0.0
            };

        let step_gain = match (
            outcome.steps_to_first_success,
            outcome.baseline_steps_to_first_success,
        ) {
            (Some(actual), Some(baseline)) if baseline > 0 => {
                ((baseline as f64 - actual as f64) / baseline as f64).clamp(-1.0, 1.0)
            }
            _ => 0.0,
        };

        match (outcome.referee_score, outcome.referee_score_baseline) {
            (Some(score), baseline) => {
                let gain = (score - baseline.unwrap_or(0.0)).clamp(-1.0, 1.0);
                0.50 * error_reduction + 0.30 * step_gain + 0.20 * gain
            }
            // No referee signal: redistribute its weight
            (None, _) => 0.625 * error_reduction + 0.375 * step_gain,
        }
    }

    /// End-of-run update: attribute utility to this session's activations,
    /// refresh counters, apply transitions, and run the archival sweep.
    pub fn update(&self, store: &mut LessonStore, outcome: &SessionOutcome) -> PromotionReport {
        let mut report = PromotionReport::default();
        let utility = self.activation_utility(outcome);
        let session_failed = !outcome.verdict.counts_as_pass();

        // Lessons with an unattributed activation from this session
        let touched: Vec<LessonId> = store
            .iter(&LessonFilter::default())
            .filter(|l| {
                l.activations
                    .iter()
                    .any(|a| a.session_id == outcome.session_id && a.utility.is_none())
            })
            .map(|l| l.id.clone())
            .collect();

        for id in &touched {
            store.modify(id, |lesson| {
                for activation in lesson
                    .activations
                    .iter_mut()
                    .filter(|a| a.session_id == outcome.session_id && a.utility.is_none())
                {
                    // Uncertain sessions contribute no positive evidence
                    activation.utility = Some(if session_failed { utility.min(0.0) } else { utility });
                }
                if utility > 0.0 && !session_failed {
                    lesson.helpful_count += 1;
                } else if utility < 0.0 || session_failed {
                    lesson.harmful_count += 1;
                }
                lesson.recompute_reliability();
            });
            report.updated.push(id.clone());
            debug!(id = %id, utility, "attributed activation utility");
        }

        for id in &touched {
            self.apply_transitions(store, id, &mut report);
        }

        report.archived = self.sweep_archive(store);
        report
    }

    /// Count conflict losses reported by retrieval; repeated losses to the
    /// same opponent suppress the loser.
    pub fn record_conflict_losses(
        &self,
        store: &mut LessonStore,
        losses: &[(LessonId, LessonId)],
    ) -> Vec<LessonId> {
        let mut suppressed = Vec::new();
        for (loser, winner) in losses {
            let mut count = 0u32;
            store.modify(loser, |lesson| {
                let entry = lesson.conflict_losses.entry(winner.clone()).or_insert(0);
                *entry += 1;
                count = *entry;
            });
            if count >= self.params.suppression_conflict_losses
                && store.transition(
                    loser,
                    LessonStatus::Suppressed,
                    &format!("lost conflict resolution {count} times to {winner}"),
                )
            {
                suppressed.push(loser.clone());
            }
        }
        suppressed
    }

    fn apply_transitions(&self, store: &mut LessonStore, id: &str, report: &mut PromotionReport) {
        let Some(lesson) = store.get(id) else {
            return;
        };
        let lesson = lesson.clone();

        if self.should_suppress(&lesson) {
            if store.transition(
                id,
                LessonStatus::Suppressed,
                "sustained non-positive utility",
            ) {
                report.suppressed.push(id.to_string());
            }
            return;
        }

        if lesson.status == LessonStatus::Candidate && self.should_promote(&lesson) {
            if store.transition(id, LessonStatus::Promoted, "sustained positive utility") {
                report.promoted.push(id.to_string());
            }
        }
    }

    /// Promotion: aggregate utility ≥ threshold across ≥ evidence_window
    /// relevant runs, no single major regression, not weight-blocked.
    fn should_promote(&self, lesson: &Lesson) -> bool {
        if lesson.weight_blocked {
            return false;
        }
        let utilities = self.relevant_utilities(lesson);
        if utilities.len() < self.params.evidence_window {
            return false;
        }
        if utilities.iter().any(|u| *u <= self.params.regression_floor) {
            return false;
        }
        let mean = utilities.iter().sum::<f64>() / utilities.len() as f64;
        mean >= self.params.utility_threshold
    }

    /// Suppression: retrieved ≥ N times with mean utility ≤ 0.
    fn should_suppress(&self, lesson: &Lesson) -> bool {
        if lesson.status == LessonStatus::Suppressed || lesson.status.is_terminal() {
            return false;
        }
        let attributed: Vec<f64> = lesson
            .activations
            .iter()
            .filter_map(|a| a.utility)
            .collect();
        if attributed.len() < self.params.suppression_retrievals {
            return false;
        }
        let mean = attributed.iter().sum::<f64>() / attributed.len() as f64;
        mean <= 0.0
    }

    /// Evidence window: same domain_key first; task_cluster neighbors fill
    /// in when the domain alone has fewer than the window size. This keeps
    /// rarely-used domains from starving.
    fn relevant_utilities(&self, lesson: &Lesson) -> Vec<f64> {
        let mut utilities: Vec<f64> = lesson
            .activations
            .iter()
            .filter(|a| a.domain_key == lesson.domain_key)
            .filter_map(|a| a.utility)
            .collect();
        if utilities.len() < self.params.evidence_window {
            if let Some(cluster) = &lesson.task_cluster {
                utilities.extend(
                    lesson
                        .activations
                        .iter()
                        .filter(|a| a.domain_key != lesson.domain_key && a.task_cluster == *cluster)
                        .filter_map(|a| a.utility),
                );
            }
        }
        utilities
    }

    /// Archive lessons idle past the age cutoff with low reliability.
    fn sweep_archive(&self, store: &mut LessonStore) -> Vec<LessonId> {
        let cutoff = Utc::now() - Duration::days(self.params.archive_age_days);
        let stale: Vec<LessonId> = store
            .iter(&LessonFilter::default())
            .filter(|l| {
                !l.status.is_terminal()
                    && l.reliability < self.params.archive_reliability_floor
                    && l.last_retrieved_at.unwrap_or(l.created_at) < cutoff
            })
            .map(|l| l.id.clone())
            .collect();
        for id in &stale {
            store.transition(id, LessonStatus::Archived, "idle past archive age");
            info!(id = %id, "archived idle lesson");
        }
        stale
    }
}
