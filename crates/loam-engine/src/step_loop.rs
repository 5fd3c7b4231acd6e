use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loam_config::LoamConfig;
use loam_core::{
    ActivationPoint, ContractSpec, EvalSource, FailureChannel, Message, Result, Role, SessionId,
    ToolAdapter, ToolOutcome, Verdict,
};
use loam_memory::event_log::prior_fingerprints;
use loam_memory::promotion::PromoterParams;
use loam_memory::retrieval::RetrieverParams;
use loam_memory::{
    ActivationRecord, ErrorEvent, Fingerprinter, FingerprintInput, Lesson, LessonStore, Promoter,
    Retriever, SessionEvent, SessionEventLog, SessionMetrics, SessionOutcome,
};
use loam_model::{ModelClient, RetryingClient, TurnRequest};

use crate::critic::{Critic, CriticParams, TraceEntry};
use crate::knowledge::KnowledgeProvider;
use crate::prompt;
use crate::referee::Referee;
use crate::validate::validate_shape;

/// Everything that defines one session to run.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: SessionId,
    pub task_id: String,
    pub task_text: String,
    /// Declarative pass/fail contract, when the task has one.
    pub contract: Option<ContractSpec>,
    /// Coarse task grouping; defaults to `task:<task_id>`.
    pub task_cluster: Option<String>,
    /// Optional domain knowledge snippet injected into the prompt.
    pub knowledge_snippet: Option<String>,
}

/// What a finished session reports back to the caller.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub metrics: SessionMetrics,
    pub verdict: Verdict,
    /// True when the session died on a model transport failure — the only
    /// condition that surfaces in the process exit code.
    pub transport_failure: bool,
}

/// Drives one session: prompt build, serial turn/tool protocol, validation
/// retry, error capture, hint injection, reflection, and the end-of-run
/// pipeline (referee → critic → store → promoter → metrics).
pub struct SessionRunner {
    config: LoamConfig,
    model: Arc<dyn ModelClient>,
    judge: Option<Arc<dyn ModelClient>>,
    critic_client: Arc<dyn ModelClient>,
    adapter: Arc<dyn ToolAdapter>,
    cancel: CancellationToken,
}

impl SessionRunner {
    pub fn new(
        config: LoamConfig,
        model: Arc<dyn ModelClient>,
        adapter: Arc<dyn ToolAdapter>,
    ) -> Self {
        let retrying: Arc<dyn ModelClient> = Arc::new(RetryingClient::new(
            Arc::clone(&model),
            config.model.transport_retries,
            Duration::from_millis(config.model.backoff_base_ms),
        ));
        Self {
            config,
            model: retrying,
            judge: Some(model.clone()),
            critic_client: model,
            adapter,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a dedicated judge transport (defaults to the primary model).
    pub fn with_judge(mut self, judge: Arc<dyn ModelClient>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Disable the LLM judge; the referee becomes contract-only.
    pub fn without_judge(mut self) -> Self {
        self.judge = None;
        self
    }

    /// Use a dedicated critic transport (defaults to the primary model).
    pub fn with_critic_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.critic_client = client;
        self
    }

    /// External cancel signal; the loop aborts at the next suspension point.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one session to completion against the shared lesson store.
    pub async fn run(&self, spec: &SessionSpec, store: &mut LessonStore) -> Result<SessionReport> {
        let started = Instant::now();
        let domain_key = self.adapter.domain_key();
        let tool_family = domain_key
            .split(':')
            .next()
            .unwrap_or(domain_key.as_str())
            .to_string();
        let fingerprinter = Fingerprinter::new(tool_family);
        let tool_spec = self.adapter.tool_spec();
        let task_cluster = spec
            .task_cluster
            .clone()
            .unwrap_or_else(|| format!("task:{}", spec.task_id));

        let mut metrics = SessionMetrics::new(spec.session_id, &spec.task_id, &domain_key);
        metrics.store_snapshot_lessons = store.len();

        let events_dir = self.config.storage.data_dir.join("events");
        let mut event_log =
            match SessionEventLog::create(&events_dir, spec.session_id, &spec.task_id, &domain_key)
            {
                Ok(log) => log,
                Err(e) => {
                    warn!(error = %e, "cannot create session event log, recording nothing");
                    SessionEventLog::sink()
                }
            };
        let prior_fps = prior_fingerprints(&events_dir, spec.session_id);

        let retriever = Retriever::new(retriever_params(&self.config));
        let promoter = Promoter::new(promoter_params(&self.config));

        // ── Pre-run retrieval ──────────────────────────────────
        let prerun = if self.config.learning.prerun_top_k > 0 {
            retriever.prerun(store, &domain_key, &spec.task_text)
        } else {
            Default::default()
        };
        promoter.record_conflict_losses(store, &prerun.conflict_losses);
        let mut injected_fps: HashSet<String> = HashSet::new();
        if !prerun.selected.is_empty() {
            metrics.v2_prerun_lesson_ids = prerun.lesson_ids();
            metrics.v2_lesson_activations += 1;
            event_log.append(&SessionEvent::Retrieval {
                step_index: 0,
                point: ActivationPoint::Prerun,
                lesson_ids: prerun.lesson_ids(),
            });
            for ranked in &prerun.selected {
                store.record_activation(
                    &ranked.lesson.id,
                    ActivationRecord {
                        session_id: spec.session_id,
                        domain_key: domain_key.clone(),
                        task_cluster: task_cluster.clone(),
                        lane: ranked.lane,
                        point: ActivationPoint::Prerun,
                        utility: None,
                        weight_blocked: false,
                        at: chrono::Utc::now(),
                    },
                );
                injected_fps.extend(ranked.lesson.trigger_fingerprints.iter().cloned());
            }
        }

        let system_prompt = prompt::build_system_prompt(
            &spec.task_text,
            spec.knowledge_snippet.as_deref(),
            &prerun.selected,
            &tool_spec,
        );

        // ── Turn loop ──────────────────────────────────────────
        let mut messages = vec![Message::text(spec.session_id, Role::User, &spec.task_text)];
        let mut trace: Vec<TraceEntry> = Vec::new();
        let mut step: u32 = 1;
        let mut validation_attempts_this_step: u32 = 0;
        let mut last_error_fp: Option<String> = None;
        let mut hard_failures: u32 = 0;
        let mut failing_steps: Vec<String> = Vec::new();
        let mut failing_after_injection: usize = 0;
        let mut first_success_step: Option<u32> = None;
        let mut fail_reason: Option<String> = None;
        let mut transport_failure = false;
        let mut pending_reflection: Option<String> = None;
        let deadline = if self.config.session.wall_clock_secs > 0 {
            Some(started + Duration::from_secs(self.config.session.wall_clock_secs))
        } else {
            None
        };

        loop {
            if self.cancel.is_cancelled() {
                fail_reason = Some("cancelled".into());
                break;
            }
            if step > self.config.session.max_steps {
                warn!(session = %spec.session_id, "max steps reached");
                fail_reason = Some("budget: max_steps".into());
                break;
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    warn!(session = %spec.session_id, "wall-clock budget reached");
                    fail_reason = Some("budget: wall_clock".into());
                    break;
                }
            }

            // Forced reflection: a short no-tool turn before the next
            // execution.
            if let Some(reason) = pending_reflection.take() {
                metrics.reflection_turns += 1;
                event_log.append(&SessionEvent::Reflection {
                    step_index: step,
                    reason: reason.clone(),
                });
                messages.push(Message::text(
                    spec.session_id,
                    Role::User,
                    prompt::reflection_prompt(),
                ));
                let request = self.turn_request(&messages, &system_prompt, vec![]);
                match self.model.turn(&request).await {
                    Ok(turn) => {
                        debug!(session = %spec.session_id, "reflection turn complete");
                        messages.push(Message::text(
                            spec.session_id,
                            Role::Assistant,
                            turn.text(),
                        ));
                    }
                    Err(e) if e.is_transport() => {
                        transport_failure = true;
                        fail_reason = Some("transport".into());
                        break;
                    }
                    Err(e) => {
                        fail_reason = Some(format!("model: {e}"));
                        break;
                    }
                }
                continue;
            }

            let request = self.turn_request(&messages, &system_prompt, vec![tool_spec.clone()]);
            let turn = match self.model.turn(&request).await {
                Ok(turn) => turn,
                Err(e) if e.is_transport() => {
                    transport_failure = true;
                    fail_reason = Some("transport".into());
                    break;
                }
                Err(e) => {
                    fail_reason = Some(format!("model: {e}"));
                    break;
                }
            };

            let mut assistant = Message::text(spec.session_id, Role::Assistant, turn.text());
            assistant.tool_call = turn.tool_call.clone();
            messages.push(assistant);

            let Some(call) = turn.tool_call else {
                // Text-only turn with nothing further to do — normal end.
                info!(session = %spec.session_id, step, "session ended normally");
                break;
            };

            // ── Shape validation with same-step retry ──────────
            if let Err(verr) = validate_shape(&tool_spec.input_schema, &call.payload) {
                if validation_attempts_this_step < self.config.session.validation_retry_cap {
                    validation_attempts_this_step += 1;
                    metrics.validation_retry_attempts += 1;
                    event_log.append(&SessionEvent::ValidationRetry {
                        step_index: step,
                        attempt: validation_attempts_this_step,
                        detail: verr.detail.clone(),
                    });
                    messages.push(Message::text(
                        spec.session_id,
                        Role::User,
                        prompt::format_validation_error(&verr.detail, &tool_spec),
                    ));
                    // Step counter deliberately not advanced.
                    continue;
                }
                metrics.validation_retry_capped_events += 1;
                validation_attempts_this_step = 0;
                pending_reflection = Some("validation retry cap reached".into());
                step += 1;
                continue;
            }
            validation_attempts_this_step = 0;

            if self.cancel.is_cancelled() {
                fail_reason = Some("cancelled".into());
                break;
            }

            // ── Execute ────────────────────────────────────────
            let outcome = match self.adapter.execute(&call.payload).await {
                Ok(outcome) => outcome,
                // Adapter infrastructure faults become failure data too;
                // only transport errors are fatal to the session.
                Err(e) => ToolOutcome::failed(format!("adapter failure: {e}")),
            };

            let mut result_content = match &outcome.error {
                Some(err) => format!("ERROR: {err}"),
                None => outcome.output.clone(),
            };

            let failure = classify_failure(&outcome);
            match failure {
                Some((channel, error_text, state_signature)) => {
                    if channel == FailureChannel::HardFailure {
                        metrics.tool_errors += 1;
                        hard_failures += 1;
                    }
                    let (fp, tags) = fingerprinter.fingerprint(&FingerprintInput {
                        error_text: &error_text,
                        action_payload: Some(&call.payload),
                        state_signature: state_signature
                            .as_ref()
                            .map(|(b, a)| (b.as_str(), a.as_str())),
                        channel,
                    });
                    event_log.append(&SessionEvent::Error(ErrorEvent {
                        session_id: spec.session_id,
                        step_index: step,
                        tool_name: call.tool_name.clone(),
                        action_payload: call.payload.clone(),
                        error_text: error_text.clone(),
                        fingerprint: fp.clone(),
                        tags: tags.clone(),
                        channel,
                        at: chrono::Utc::now(),
                    }));
                    trace.push(TraceEntry {
                        tool_name: call.tool_name.clone(),
                        payload: call.payload.clone(),
                        output: outcome.output.clone(),
                        error: Some(if error_text.is_empty() {
                            channel.as_str().to_string()
                        } else {
                            error_text.clone()
                        }),
                        fingerprint: Some(fp.clone()),
                    });
                    failing_steps.push(fp.clone());
                    if injected_fps.contains(&fp) {
                        failing_after_injection += 1;
                    }

                    // ── On-error retrieval + hint injection ────
                    if self.config.learning.onerror_top_m > 0 {
                        let retrieved =
                            retriever.on_error(store, &domain_key, &fp, &tags, &error_text);
                        promoter.record_conflict_losses(store, &retrieved.conflict_losses);
                        if !retrieved.selected.is_empty() {
                            event_log.append(&SessionEvent::Retrieval {
                                step_index: step,
                                point: ActivationPoint::OnError,
                                lesson_ids: retrieved.lesson_ids(),
                            });
                            for ranked in &retrieved.selected {
                                store.record_activation(
                                    &ranked.lesson.id,
                                    ActivationRecord {
                                        session_id: spec.session_id,
                                        domain_key: domain_key.clone(),
                                        task_cluster: task_cluster.clone(),
                                        lane: ranked.lane,
                                        point: ActivationPoint::OnError,
                                        utility: None,
                                        weight_blocked: false,
                                        at: chrono::Utc::now(),
                                    },
                                );
                            }
                            metrics.v2_lesson_activations += retrieved.selected.len() as u32;
                            injected_fps.insert(fp.clone());
                            result_content.push_str(&prompt::format_hints(&retrieved.selected));
                        }
                    }

                    // ── Repetition monitor ─────────────────────
                    let repeated = last_error_fp.as_deref() == Some(fp.as_str());
                    if repeated {
                        pending_reflection = Some("same fingerprint twice in a row".into());
                    } else if hard_failures >= self.config.session.reflection_failure_threshold {
                        pending_reflection = Some("accumulated hard failures".into());
                    }
                    last_error_fp = Some(fp);
                }
                None => {
                    trace.push(TraceEntry {
                        tool_name: call.tool_name.clone(),
                        payload: call.payload.clone(),
                        output: outcome.output.clone(),
                        error: None,
                        fingerprint: None,
                    });
                    if first_success_step.is_none() {
                        first_success_step = Some(step);
                    }
                    last_error_fp = None;
                }
            }

            messages.push(Message::tool_result(
                spec.session_id,
                &call.id,
                result_content,
                outcome.is_error(),
            ));
            step += 1;
        }

        // ── Post-session ───────────────────────────────────────
        metrics.steps = step.saturating_sub(1);
        metrics.wall_clock_ms = started.elapsed().as_millis() as u64;
        if !failing_steps.is_empty() {
            let total = failing_steps.len() as f64;
            let recurring = failing_steps
                .iter()
                .filter(|fp| prior_fps.contains(*fp))
                .count() as f64;
            metrics.fingerprint_recurrence_before = recurring / total;
            metrics.fingerprint_recurrence_after = failing_after_injection as f64 / total;
        }
        metrics.fail_reason = fail_reason.clone();

        let cancelled = fail_reason.as_deref() == Some("cancelled");
        let budget_or_error_failure = fail_reason.is_some();

        let verdict = if transport_failure {
            metrics.eval_source = EvalSource::None;
            Verdict::Fail
        } else {
            let final_state = match self.adapter.capture_final_state().await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "final state capture failed, using last successful output");
                    trace
                        .iter()
                        .rev()
                        .find(|t| t.error.is_none())
                        .map(|t| t.output.clone())
                }
            };
            // A cancelled session skips the judge (no further model calls)
            // but still gets a contract verdict when one is declared.
            let judge = if cancelled { None } else { self.judge.clone() };
            let judge_model = self
                .config
                .model
                .judge_model
                .clone()
                .unwrap_or_else(|| self.config.model.model.clone());
            let referee = Referee::new(judge, judge_model);
            let report = referee
                .evaluate(spec.contract.as_ref(), &spec.task_text, final_state.as_deref())
                .await;
            metrics.eval_source = report.eval_source;
            metrics.score = report.score;
            if budget_or_error_failure {
                // Budget exhaustion and cancellation end the session as
                // fail regardless of what the evidence shows.
                Verdict::Fail
            } else {
                report.verdict
            }
        };
        metrics.passed = verdict.counts_as_pass();

        // ── Critic: candidate lessons ──────────────────────────
        if !transport_failure && !cancelled && !trace.is_empty() {
            let knowledge = KnowledgeProvider::new(tool_spec.docs_manifest.clone());
            let error_context: String = failing_steps.join(" ");
            let excerpt = knowledge.excerpt(&format!("{} {}", spec.task_text, error_context));
            let critic = Critic::new(
                Arc::clone(&self.critic_client),
                CriticParams {
                    model: self
                        .config
                        .model
                        .critic_model
                        .clone()
                        .unwrap_or_else(|| self.config.model.model.clone()),
                    mode: self.config.learning.mode,
                    ..Default::default()
                },
            );
            match critic.generate(&trace, verdict, excerpt.as_deref()).await {
                Ok(candidates) => {
                    let session_tags = session_system_tags(&trace, &fingerprinter);
                    for candidate in candidates {
                        let lesson = Lesson::from_candidate(
                            &candidate,
                            &domain_key,
                            Some(&task_cluster),
                            spec.session_id,
                            session_tags.clone(),
                            verdict == Verdict::Uncertain,
                        );
                        let id = store.upsert(
                            lesson,
                            self.config.promotion.dedup_jaccard,
                            self.config.promotion.conflict_jaccard,
                        );
                        debug!(id = %id, "stored candidate lesson");
                    }
                }
                Err(e) => warn!(error = %e, "critic failed; no candidate lessons this session"),
            }
        }

        // ── Promoter update ────────────────────────────────────
        if !transport_failure && !cancelled {
            let (baseline_score, baseline_steps) = baselines_from_metrics(
                &self.config.storage.data_dir.join("metrics"),
                &domain_key,
                spec.session_id,
            );
            let outcome = SessionOutcome {
                session_id: spec.session_id,
                verdict,
                referee_score: if metrics.eval_source == EvalSource::None {
                    None
                } else {
                    Some(metrics.score)
                },
                referee_score_baseline: baseline_score,
                fingerprint_recurrence_before: metrics.fingerprint_recurrence_before,
                fingerprint_recurrence_after: metrics.fingerprint_recurrence_after,
                steps_to_first_success: first_success_step,
                baseline_steps_to_first_success: baseline_steps,
            };
            let report = promoter.update(store, &outcome);
            if !report.promoted.is_empty() || !report.suppressed.is_empty() {
                info!(
                    promoted = report.promoted.len(),
                    suppressed = report.suppressed.len(),
                    archived = report.archived.len(),
                    "promoter transitions applied"
                );
            }
        }

        // ── Metrics — always written ───────────────────────────
        let metrics_dir = self.config.storage.data_dir.join("metrics");
        if let Err(e) = metrics.write(&metrics_dir) {
            warn!(error = %e, "failed to write session metrics");
        }

        Ok(SessionReport {
            metrics,
            verdict,
            transport_failure,
        })
    }

    fn turn_request(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: Vec<loam_core::ToolSpec>,
    ) -> TurnRequest {
        TurnRequest {
            model: self.config.model.model.clone(),
            messages: messages.to_vec(),
            tools,
            system: Some(system_prompt.to_string()),
            max_tokens: self.config.model.max_tokens,
            temperature: self.config.model.temperature,
            stop_conditions: vec![],
        }
    }
}

/// Classify a tool outcome into a failure channel, or `None` for success.
///
/// Hard failures come from `error`. A soft no-progress signal fires when
/// the adapter reports an unchanged state through `state_delta`
/// (`{"changed": false, "before": ..., "after": ...}`).
fn classify_failure(
    outcome: &ToolOutcome,
) -> Option<(FailureChannel, String, Option<(String, String)>)> {
    if let Some(err) = &outcome.error {
        return Some((FailureChannel::HardFailure, err.clone(), None));
    }
    if let Some(delta) = &outcome.state_delta {
        if delta.get("changed").and_then(|c| c.as_bool()) == Some(false) {
            let before = delta
                .get("before")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let after = delta
                .get("after")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            return Some((FailureChannel::NoProgress, String::new(), Some((before, after))));
        }
    }
    None
}

/// Trusted tags for this session: re-derive from each failing trace entry.
fn session_system_tags(trace: &[TraceEntry], fingerprinter: &Fingerprinter) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    for entry in trace {
        if let Some(err) = &entry.error {
            let (_, entry_tags) = fingerprinter.fingerprint(&FingerprintInput {
                error_text: err,
                action_payload: Some(&entry.payload),
                state_signature: None,
                channel: FailureChannel::HardFailure,
            });
            tags.extend(entry_tags);
        }
    }
    tags
}

/// Baseline estimation over prior sessions of the same domain: mean
/// referee score and mean steps. Bounded scan of the metrics directory.
fn baselines_from_metrics(
    metrics_dir: &Path,
    domain_key: &str,
    exclude: SessionId,
) -> (Option<f64>, Option<u32>) {
    let Ok(entries) = std::fs::read_dir(metrics_dir) else {
        return (None, None);
    };
    let exclude_name = format!("session-{exclude}.json");
    let mut scores = Vec::new();
    let mut steps = Vec::new();
    for entry in entries.flatten().take(64) {
        if entry.file_name().to_string_lossy() == exclude_name {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(m) = serde_json::from_str::<SessionMetrics>(&raw) else {
            continue;
        };
        if m.domain_key != domain_key {
            continue;
        }
        scores.push(m.score);
        steps.push(m.steps);
    }
    let baseline_score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    };
    let baseline_steps = if steps.is_empty() {
        None
    } else {
        Some((steps.iter().map(|s| *s as u64).sum::<u64>() / steps.len() as u64) as u32)
    };
    (baseline_score, baseline_steps)
}

fn retriever_params(config: &LoamConfig) -> RetrieverParams {
    RetrieverParams {
        prerun_top_k: config.learning.prerun_top_k,
        onerror_top_m: config.learning.onerror_top_m,
        transfer_policy: config.learning.transfer,
        transfer_multiplier: config.learning.transfer_multiplier,
        transfer_prerun_cap: config.learning.transfer_prerun_cap,
        transfer_onerror_cap: config.learning.transfer_onerror_cap,
        strict_confidence_threshold: config.learning.strict_confidence_threshold,
        per_session_cap: config.learning.per_session_cap,
        per_tag_cap: config.learning.per_tag_cap,
        recency_half_life_days: config.learning.recency_half_life_days,
    }
}

fn promoter_params(config: &LoamConfig) -> PromoterParams {
    PromoterParams {
        utility_threshold: config.promotion.utility_threshold,
        evidence_window: config.promotion.evidence_window,
        regression_floor: config.promotion.regression_floor,
        suppression_retrievals: config.promotion.suppression_retrievals,
        suppression_conflict_losses: config.promotion.suppression_conflict_losses as u32,
        archive_age_days: config.promotion.archive_age_days,
        archive_reliability_floor: config.promotion.archive_reliability_floor,
    }
}
