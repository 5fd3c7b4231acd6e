use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use loam_core::{ContractResult, ContractSpec, EvalSource, Message, Role, Verdict};
use loam_model::{ModelClient, TurnRequest};

/// The referee's final report for a session.
#[derive(Debug, Clone)]
pub struct RefereeReport {
    pub verdict: Verdict,
    pub score: f64,
    pub eval_source: EvalSource,
    pub contract_result: Option<ContractResult>,
    pub judge_reasons: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JudgeOutput {
    pass: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    reasons: Option<String>,
}

/// Dual-authority verdict producer: a deterministic contract evaluator
/// first, an LLM judge alongside, combined by the disagreement table:
///
/// | contract | judge | final     |
/// |----------|-------|-----------|
/// | pass     | pass  | pass      |
/// | fail     | fail  | fail      |
/// | pass     | fail  | uncertain |
/// | fail     | pass  | uncertain |
/// | absent   | pass  | pass      |
/// | absent   | fail  | fail      |
pub struct Referee {
    judge: Option<Arc<dyn ModelClient>>,
    judge_model: String,
}

impl Referee {
    pub fn new(judge: Option<Arc<dyn ModelClient>>, judge_model: impl Into<String>) -> Self {
        Self {
            judge,
            judge_model: judge_model.into(),
        }
    }

    /// Evaluate a finished session. `final_state` is `None` when the
    /// adapter failed to capture evidence — the contract cannot run then
    /// and the judge fills in where possible.
    pub async fn evaluate(
        &self,
        contract: Option<&ContractSpec>,
        task_text: &str,
        final_state: Option<&str>,
    ) -> RefereeReport {
        let contract_declared = contract.is_some_and(|c| !c.is_empty());
        let contract_result = match (contract, final_state) {
            (Some(spec), Some(state)) if !spec.is_empty() => Some(spec.evaluate(state)),
            _ => None,
        };

        // The judge runs even when evidence capture failed — it sees a
        // placeholder and usually fails the session, which is the right
        // default for missing evidence.
        let judge_evidence = final_state.unwrap_or("(no final state captured)");
        let judge_outcome = match &self.judge {
            Some(judge) => match self.run_judge(judge.as_ref(), task_text, judge_evidence).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(error = %e, "judge call failed");
                    None
                }
            },
            None => None,
        };

        let report = match (&contract_result, &judge_outcome) {
            (Some(contract), Some(judge)) => {
                let verdict = match (contract.passed, judge.pass) {
                    (true, true) => Verdict::Pass,
                    (false, false) => Verdict::Fail,
                    // Authorities disagree
                    _ => Verdict::Uncertain,
                };
                RefereeReport {
                    verdict,
                    score: judge.score.unwrap_or(if contract.passed { 1.0 } else { 0.0 }),
                    eval_source: EvalSource::Contract,
                    contract_result: contract_result.clone(),
                    judge_reasons: judge.reasons.clone(),
                }
            }
            (Some(contract), None) => RefereeReport {
                verdict: if contract.passed {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                },
                score: if contract.passed { 1.0 } else { 0.0 },
                eval_source: EvalSource::Contract,
                contract_result: contract_result.clone(),
                judge_reasons: None,
            },
            (None, Some(judge)) => RefereeReport {
                verdict: if judge.pass { Verdict::Pass } else { Verdict::Fail },
                score: judge.score.unwrap_or(if judge.pass { 1.0 } else { 0.0 }),
                // A declared contract that could not evaluate makes the
                // judge a fallback authority, not the primary one.
                eval_source: if contract_declared {
                    EvalSource::JudgeFallback
                } else {
                    EvalSource::JudgePrimary
                },
                contract_result: None,
                judge_reasons: judge.reasons.clone(),
            },
            (None, None) => RefereeReport {
                verdict: Verdict::Uncertain,
                score: 0.0,
                eval_source: EvalSource::None,
                contract_result: None,
                judge_reasons: None,
            },
        };

        info!(
            verdict = ?report.verdict,
            score = report.score,
            source = ?report.eval_source,
            "referee verdict"
        );
        report
    }

    async fn run_judge(
        &self,
        judge: &dyn ModelClient,
        task_text: &str,
        final_state: &str,
    ) -> loam_core::Result<JudgeOutput> {
        let prompt = format!(
            "Judge whether this agent session accomplished its task.\n\n\
             Task:\n{task_text}\n\n\
             Final observable state:\n{final_state}\n\n\
             Rubric: pass only if the final state shows the task's goal was \
             achieved; partial or wrong-shaped results fail.\n\n\
             Output only JSON: {{\"pass\": true|false, \"score\": 0.0-1.0, \
             \"reasons\": \"...\"}}"
        );
        let request = TurnRequest {
            model: self.judge_model.clone(),
            messages: vec![Message::text(uuid::Uuid::nil(), Role::User, &prompt)],
            tools: vec![],
            system: Some("You are a strict session judge. Output only valid JSON.".to_string()),
            max_tokens: 512,
            temperature: 0.0,
            stop_conditions: vec![],
        };
        let turn = judge.turn(&request).await?;
        let text = turn.text();
        let json_text = text
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        match serde_json::from_str::<JudgeOutput>(json_text) {
            Ok(out) => Ok(out),
            Err(e) => {
                debug!(error = %e, "judge output unparsable, treating as fail");
                Ok(JudgeOutput {
                    pass: false,
                    score: Some(0.0),
                    reasons: Some("judge output unparsable".into()),
                })
            }
        }
    }
}
