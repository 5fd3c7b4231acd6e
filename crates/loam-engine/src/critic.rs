use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use loam_core::{LearningMode, Message, Result, Role, Verdict};
use loam_memory::CandidateLesson;
use loam_model::{ModelClient, TurnRequest};

/// One step of the session trace handed to the critic.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub tool_name: String,
    pub payload: Value,
    pub output: String,
    pub error: Option<String>,
    pub fingerprint: Option<String>,
}

/// Critic tunables. The known-wrong list is the lesson-poisoning defense:
/// a candidate whose rule matches one of these patterns is rejected
/// before storage.
#[derive(Debug, Clone)]
pub struct CriticParams {
    pub model: String,
    pub mode: LearningMode,
    pub max_rule_chars: usize,
    pub known_wrong_patterns: Vec<String>,
}

impl Default for CriticParams {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-haiku-3-5".into(),
            mode: LearningMode::Auto,
            max_rule_chars: 160,
            known_wrong_patterns: vec![
                "supports wildcard".into(),
                "wildcard *".into(),
                "any operator works".into(),
                "case does not matter".into(),
                "quoting is optional".into(),
            ],
        }
    }
}

/// Rules with no actionable content, rejected outright.
const GENERIC_PHRASES: &[&str] = &[
    "be careful",
    "be cautious",
    "be more careful",
    "double check",
    "double-check",
    "read the docs",
    "read the documentation",
    "pay attention",
    "try again",
    "think carefully",
];

/// Asks the model to distill candidate lessons from a finished session
/// trace, then filters them for quality before they reach the store.
pub struct Critic {
    client: Arc<dyn ModelClient>,
    params: CriticParams,
}

impl Critic {
    pub fn new(client: Arc<dyn ModelClient>, params: CriticParams) -> Self {
        Self { client, params }
    }

    /// Generate filtered candidate lessons for a session. Returns an empty
    /// list when the model produces nothing usable — never an error for
    /// parse problems, only for transport failure.
    pub async fn generate(
        &self,
        trace: &[TraceEntry],
        verdict: Verdict,
        knowledge_excerpt: Option<&str>,
    ) -> Result<Vec<CandidateLesson>> {
        if trace.is_empty() {
            return Ok(vec![]);
        }

        let prompt = self.build_prompt(trace, verdict, knowledge_excerpt);
        let request = TurnRequest {
            model: self.params.model.clone(),
            messages: vec![Message::text(uuid::Uuid::nil(), Role::User, &prompt)],
            tools: vec![],
            system: Some(
                "You are a precise lesson extractor for a tool-using agent. \
                 Output only a JSON array, nothing else."
                    .to_string(),
            ),
            max_tokens: 1024,
            temperature: 0.2,
            stop_conditions: vec![],
        };

        let turn = self.client.turn(&request).await?;
        let raw = parse_candidates(&turn.text());
        let session_fingerprints: BTreeSet<String> = trace
            .iter()
            .filter_map(|t| t.fingerprint.clone())
            .collect();
        let kept = self.quality_filter(raw, &session_fingerprints);
        info!(count = kept.len(), "critic produced candidate lessons");
        Ok(kept)
    }

    fn build_prompt(
        &self,
        trace: &[TraceEntry],
        verdict: Verdict,
        knowledge_excerpt: Option<&str>,
    ) -> String {
        let mut prompt = String::from(
            "Analyze this tool-use session and extract lessons that would help \
             a future agent avoid the failures seen here.\n\n\
             Output a JSON array of objects with exactly these fields:\n\
             - \"trigger_fingerprints\": list of failure fingerprints from the \
             trace that the lesson is about (must be copied verbatim)\n\
             - \"rule_text\": one short rule, at most 160 characters, preferring \
             the form \"WRONG <mistake> → CORRECT <fix>\"\n\
             - \"scope_hint\": one of \"task\", \"domain\", \"global\"\n\
             - \"tags\": optional list of short labels\n\n\
             Rules must be specific and actionable. If there is nothing worth \
             keeping, output [].\n",
        );

        match self.params.mode {
            LearningMode::Legacy => {
                // Legacy prompt may carry a worked exemplar
                prompt.push_str(
                    "\nExample:\n\
                     [{\"trigger_fingerprints\": [\"table:keep|operator_mismatch\"], \
                     \"rule_text\": \"WRONG symbolic operators → CORRECT word operators gt, lt, eq\", \
                     \"scope_hint\": \"domain\", \"tags\": [\"operator_mismatch\"]}]\n",
                );
            }
            LearningMode::Strict | LearningMode::Auto => {
                if let Some(excerpt) = knowledge_excerpt {
                    prompt.push_str("\nRelevant tool documentation:\n");
                    prompt.push_str(excerpt);
                    prompt.push('\n');
                }
            }
        }

        prompt.push_str(&format!("\nSession verdict: {verdict:?}\n\nTrace:\n"));
        for (i, entry) in trace.iter().enumerate() {
            let payload: String = entry.payload.to_string().chars().take(200).collect();
            prompt.push_str(&format!("[step {}] {}({})\n", i + 1, entry.tool_name, payload));
            match &entry.error {
                Some(err) => {
                    let err: String = err.chars().take(300).collect();
                    prompt.push_str(&format!("  ERROR: {err}\n"));
                    if let Some(fp) = &entry.fingerprint {
                        prompt.push_str(&format!("  fingerprint: {fp}\n"));
                    }
                }
                None => {
                    let out: String = entry.output.chars().take(200).collect();
                    prompt.push_str(&format!("  OK: {out}\n"));
                }
            }
        }
        prompt
    }

    /// Pre-store quality filter:
    /// - reject generic non-advice,
    /// - reject known-wrong patterns (poisoning defense),
    /// - reject candidates whose triggers are empty or never occurred in
    ///   this session,
    /// - reject rules far over the length contract.
    fn quality_filter(
        &self,
        candidates: Vec<CandidateLesson>,
        session_fingerprints: &BTreeSet<String>,
    ) -> Vec<CandidateLesson> {
        candidates
            .into_iter()
            .filter(|c| {
                let rule = c.rule_text.to_lowercase();
                if c.rule_text.trim().is_empty()
                    || c.rule_text.chars().count() > self.params.max_rule_chars + 40
                {
                    debug!(rule = %c.rule_text, "rejecting candidate: length");
                    return false;
                }
                if GENERIC_PHRASES.iter().any(|p| rule.contains(p)) {
                    debug!(rule = %c.rule_text, "rejecting candidate: generic");
                    return false;
                }
                if self
                    .params
                    .known_wrong_patterns
                    .iter()
                    .any(|p| rule.contains(&p.to_lowercase()))
                {
                    warn!(rule = %c.rule_text, "rejecting candidate: known-wrong pattern");
                    return false;
                }
                let grounded = c
                    .trigger_fingerprints
                    .iter()
                    .any(|fp| session_fingerprints.contains(fp));
                if c.trigger_fingerprints.is_empty() || !grounded {
                    debug!(rule = %c.rule_text, "rejecting candidate: ungrounded triggers");
                    return false;
                }
                true
            })
            .map(|mut c| {
                if c.rule_text.chars().count() > self.params.max_rule_chars {
                    c.rule_text = c.rule_text.chars().take(self.params.max_rule_chars).collect();
                }
                c
            })
            .collect()
    }
}

/// Parse the model's JSON array, tolerating markdown code fences.
fn parse_candidates(text: &str) -> Vec<CandidateLesson> {
    let json_text = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str::<Vec<CandidateLesson>>(json_text) {
        Ok(items) => items,
        Err(e) => {
            debug!(error = %e, "failed to parse critic output");
            vec![]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_model::MockModel;

    fn trace_with_failure() -> Vec<TraceEntry> {
        vec![
            TraceEntry {
                tool_name: "gridtool".into(),
                payload: serde_json::json!({"command": "KEEP age > 30"}),
                output: String::new(),
                error: Some("unknown operator '>'".into()),
                fingerprint: Some("table:keep|operator_mismatch".into()),
            },
            TraceEntry {
                tool_name: "gridtool".into(),
                payload: serde_json::json!({"command": "KEEP age gt 30"}),
                output: "2 rows kept".into(),
                error: None,
                fingerprint: None,
            },
        ]
    }

    fn critic_with_response(response: &str) -> Critic {
        let model = MockModel::new("mock").with_text(response);
        Critic::new(Arc::new(model), CriticParams::default())
    }

    #[tokio::test]
    async fn test_extracts_grounded_candidate() {
        let critic = critic_with_response(
            r#"[{"trigger_fingerprints": ["table:keep|operator_mismatch"],
                "rule_text": "WRONG '>' → CORRECT word operators gt, lt, eq",
                "scope_hint": "domain", "tags": ["operator_mismatch"]}]"#,
        );
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].rule_text.contains("gt"));
    }

    #[tokio::test]
    async fn test_tolerates_markdown_fences() {
        let critic = critic_with_response(
            "```json\n[{\"trigger_fingerprints\": [\"table:keep|operator_mismatch\"], \
             \"rule_text\": \"WRONG '>' → CORRECT gt\", \"scope_hint\": \"domain\"}]\n```",
        );
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_generic_rule() {
        let critic = critic_with_response(
            r#"[{"trigger_fingerprints": ["table:keep|operator_mismatch"],
                "rule_text": "be careful with operators", "scope_hint": "domain"}]"#,
        );
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_known_wrong_pattern() {
        // S3: the poisoning defense catches a factually wrong claim
        let critic = critic_with_response(
            r#"[{"trigger_fingerprints": ["table:keep|operator_mismatch"],
                "rule_text": "aggregation supports wildcard * for all columns",
                "scope_hint": "domain"}]"#,
        );
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_ungrounded_triggers() {
        let critic = critic_with_response(
            r#"[{"trigger_fingerprints": ["table:sort|sort_direction"],
                "rule_text": "WRONG down → CORRECT desc for sort order",
                "scope_hint": "domain"}]"#,
        );
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert!(candidates.is_empty(), "fingerprint never appeared in session");
    }

    #[tokio::test]
    async fn test_rejects_empty_triggers() {
        let critic = critic_with_response(
            r#"[{"trigger_fingerprints": [], "rule_text": "WRONG x → CORRECT y",
                "scope_hint": "domain"}]"#,
        );
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_output_yields_empty() {
        let critic = critic_with_response("I think the lesson here is to use gt.");
        let candidates = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_empty_trace_skips_model_call() {
        let model = MockModel::new("mock");
        let requests = model.recorded_requests();
        let critic = Critic::new(Arc::new(model), CriticParams::default());
        let candidates = critic.generate(&[], Verdict::Pass, None).await.unwrap();
        assert!(candidates.is_empty());
        assert!(requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let model = MockModel::new("mock").with_transport_error("down");
        let critic = Critic::new(Arc::new(model), CriticParams::default());
        let result = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_strict_mode_includes_knowledge_excerpt() {
        let model = MockModel::new("mock").with_text("[]");
        let requests = model.recorded_requests();
        let critic = Critic::new(
            Arc::new(model),
            CriticParams {
                mode: LearningMode::Strict,
                ..Default::default()
            },
        );
        let _ = critic
            .generate(
                &trace_with_failure(),
                Verdict::Fail,
                Some("Operators are words: gt, lt, eq."),
            )
            .await
            .unwrap();
        let recorded = requests.lock();
        let prompt = recorded[0].messages[0].text_content();
        assert!(prompt.contains("Operators are words"));
        assert!(!prompt.contains("Example:"));
    }

    #[tokio::test]
    async fn test_legacy_mode_carries_exemplar() {
        let model = MockModel::new("mock").with_text("[]");
        let requests = model.recorded_requests();
        let critic = Critic::new(
            Arc::new(model),
            CriticParams {
                mode: LearningMode::Legacy,
                ..Default::default()
            },
        );
        let _ = critic
            .generate(&trace_with_failure(), Verdict::Fail, None)
            .await
            .unwrap();
        let recorded = requests.lock();
        assert!(recorded[0].messages[0].text_content().contains("Example:"));
    }

    #[test]
    fn test_overlong_rule_truncated_to_contract() {
        let critic = critic_with_response("");
        let long_rule = "WRONG x → CORRECT ".to_string() + &"y".repeat(170);
        let kept = critic.quality_filter(
            vec![CandidateLesson {
                trigger_fingerprints: ["fp".to_string()].into(),
                rule_text: long_rule,
                scope_hint: Default::default(),
                tags: BTreeSet::new(),
            }],
            &["fp".to_string()].into(),
        );
        assert_eq!(kept.len(), 1);
        assert!(kept[0].rule_text.chars().count() <= 160);
    }
}
