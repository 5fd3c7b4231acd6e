#[cfg(test)]
mod tests {
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    use loam_core::{ActivationPoint, Lane, TransferPolicy, Verdict};
    use loam_memory::{
        ActivationRecord, CandidateLesson, Lesson, LessonFilter, LessonStatus, LessonStore,
        Promoter, RetrievalQuery, Retriever, SessionOutcome,
    };
    use loam_memory::promotion::PromoterParams;
    use loam_memory::retrieval::RetrieverParams;

    fn candidate(rule: &str, triggers: &[&str]) -> CandidateLesson {
        CandidateLesson {
            trigger_fingerprints: triggers.iter().map(|s| s.to_string()).collect(),
            rule_text: rule.to_string(),
            scope_hint: Default::default(),
            tags: BTreeSet::new(),
        }
    }

    fn make_lesson(rule: &str, triggers: &[&str], domain: &str) -> Lesson {
        Lesson::from_candidate(
            &candidate(rule, triggers),
            domain,
            Some("task:t1"),
            Uuid::new_v4(),
            BTreeSet::new(),
            false,
        )
    }

    fn activation(session: Uuid, domain: &str) -> ActivationRecord {
        ActivationRecord {
            session_id: session,
            domain_key: domain.to_string(),
            task_cluster: "task:t1".to_string(),
            lane: Lane::Strict,
            point: ActivationPoint::Prerun,
            utility: None,
            weight_blocked: false,
            at: Utc::now(),
        }
    }

    fn passing_outcome(session: Uuid) -> SessionOutcome {
        SessionOutcome {
            session_id: session,
            verdict: Verdict::Pass,
            referee_score: Some(1.0),
            referee_score_baseline: Some(0.0),
            fingerprint_recurrence_before: 0.8,
            fingerprint_recurrence_after: 0.0,
            steps_to_first_success: Some(1),
            baseline_steps_to_first_success: Some(4),
        }
    }

    fn failing_outcome(session: Uuid) -> SessionOutcome {
        SessionOutcome {
            session_id: session,
            verdict: Verdict::Fail,
            referee_score: Some(0.0),
            referee_score_baseline: Some(0.0),
            fingerprint_recurrence_before: 0.5,
            fingerprint_recurrence_after: 0.5,
            steps_to_first_success: None,
            baseline_steps_to_first_success: None,
        }
    }

    // ── Lesson store ───────────────────────────────────────────

    mod store {
        use super::*;

        #[test]
        fn test_upsert_and_get() {
            let mut store = LessonStore::in_memory();
            let lesson = make_lesson("use gt not symbol", &["table:keep|operator_mismatch"], "table:gridtool");
            let id = store.upsert(lesson, 0.65, 0.25);
            assert_eq!(store.len(), 1);
            assert_eq!(store.get(&id).unwrap().rule_text, "use gt not symbol");
        }

        #[test]
        fn test_dedup_merges_counters_and_reuses_id() {
            let mut store = LessonStore::in_memory();
            let mut first = make_lesson(
                "operators are words use gt lt eq",
                &["table:keep|operator_mismatch"],
                "table:gridtool",
            );
            first.helpful_count = 2;
            let first_id = store.upsert(first, 0.65, 0.25);

            let mut second = make_lesson(
                "operators are words use gt lt ne",
                &["table:keep|operator_mismatch"],
                "table:gridtool",
            );
            second.helpful_count = 3;
            let second_id = store.upsert(second, 0.65, 0.25);

            assert_eq!(first_id, second_id);
            assert_eq!(store.len(), 1);
            assert_eq!(store.get(&first_id).unwrap().helpful_count, 5);
        }

        #[test]
        fn test_no_two_duplicates_coexist() {
            // Invariant: for any two stored lessons, not both same trigger
            // set and rule Jaccard >= threshold.
            let mut store = LessonStore::in_memory();
            store.upsert(
                make_lesson("quote paths with spaces always", &["shell:cp|path_quote"], "shell:fs"),
                0.65,
                0.25,
            );
            store.upsert(
                make_lesson("quote paths with spaces everywhere", &["shell:cp|path_quote"], "shell:fs"),
                0.65,
                0.25,
            );
            let all: Vec<&Lesson> = store.iter(&LessonFilter::default()).collect();
            for a in &all {
                for b in &all {
                    if a.id != b.id {
                        assert!(!a.duplicates(b, 0.65));
                    }
                }
            }
        }

        #[test]
        fn test_conflict_links_are_symmetric() {
            let mut store = LessonStore::in_memory();
            let a = store.upsert(
                make_lesson("always quote paths containing spaces", &["shell:cp|path_quote"], "shell:fs"),
                0.65,
                0.25,
            );
            let b = store.upsert(
                make_lesson("never wrap file arguments escape whitespace instead", &["shell:cp|path_quote"], "shell:fs"),
                0.65,
                0.25,
            );
            assert!(store.get(&a).unwrap().conflicts_with.contains(&b));
            assert!(store.get(&b).unwrap().conflicts_with.contains(&a));
        }

        #[test]
        fn test_transition_terminal_is_noop() {
            let mut store = LessonStore::in_memory();
            let id = store.upsert(make_lesson("rule", &["fp"], "d"), 0.65, 0.25);
            assert!(store.transition(&id, LessonStatus::Archived, "test"));
            assert!(!store.transition(&id, LessonStatus::Promoted, "should not apply"));
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Archived);
        }

        #[test]
        fn test_disk_roundtrip_last_wins() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("lessons.jsonl");
            let id = {
                let mut store = LessonStore::open(&path).unwrap();
                let id = store.upsert(make_lesson("rule one", &["fp1"], "d"), 0.65, 0.25);
                store.modify(&id, |l| l.helpful_count = 7);
                id
            };
            let store = LessonStore::open(&path).unwrap();
            assert_eq!(store.len(), 1);
            assert_eq!(store.get(&id).unwrap().helpful_count, 7);
        }

        #[test]
        fn test_compaction_preserves_ids_and_counters() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("lessons.jsonl");
            let mut store = LessonStore::open(&path).unwrap();
            let id1 = store.upsert(make_lesson("rule one about sorting", &["fp1"], "d"), 0.65, 0.25);
            let id2 = store.upsert(make_lesson("rule two about operators", &["fp2"], "d"), 0.65, 0.25);
            store.modify(&id1, |l| l.helpful_count = 4);
            store.modify(&id1, |l| l.harmful_count = 1);
            // Multiple appends per lesson — the log is longer than the set
            let raw_before = std::fs::read_to_string(&path).unwrap();
            assert!(raw_before.lines().count() > 2);

            store.compact().unwrap();
            let raw_after = std::fs::read_to_string(&path).unwrap();
            assert_eq!(raw_after.lines().count(), 2);

            let reloaded = LessonStore::open(&path).unwrap();
            assert_eq!(reloaded.get(&id1).unwrap().helpful_count, 4);
            assert_eq!(reloaded.get(&id1).unwrap().harmful_count, 1);
            assert!(reloaded.get(&id2).is_some());
        }

        #[test]
        fn test_store_still_appends_after_compaction() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("lessons.jsonl");
            let mut store = LessonStore::open(&path).unwrap();
            store.upsert(make_lesson("first", &["fp1"], "d"), 0.65, 0.25);
            store.compact().unwrap();
            store.upsert(make_lesson("second unrelated rule", &["fp2"], "d"), 0.65, 0.25);
            let reloaded = LessonStore::open(&path).unwrap();
            assert_eq!(reloaded.len(), 2);
        }

        #[test]
        fn test_unreadable_lines_skipped_on_load() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("lessons.jsonl");
            {
                let mut store = LessonStore::open(&path).unwrap();
                store.upsert(make_lesson("good rule", &["fp"], "d"), 0.65, 0.25);
            }
            // Corrupt the log with a partial line
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "{{\"id\": \"trunc").unwrap();

            let store = LessonStore::open(&path).unwrap();
            assert_eq!(store.len(), 1);
        }
    }

    // ── Retrieval ──────────────────────────────────────────────

    mod retrieval {
        use super::*;

        fn seeded_store() -> (LessonStore, String) {
            let mut store = LessonStore::in_memory();
            let mut l = make_lesson(
                "operators are words use gt lt eq not symbols",
                &["table:keep|operator_mismatch"],
                "table:gridtool",
            );
            l.system_tags.insert("operator_mismatch".into());
            l.helpful_count = 4;
            l.recompute_reliability();
            let id = store.upsert(l, 0.65, 0.25);
            (store, id)
        }

        #[test]
        fn test_on_error_exact_fingerprint_hit() {
            let (store, id) = seeded_store();
            let retriever = Retriever::new(RetrieverParams::default());
            let tags: BTreeSet<String> = ["operator_mismatch".to_string()].into();
            let outcome = retriever.on_error(
                &store,
                "table:gridtool",
                "table:keep|operator_mismatch",
                &tags,
                "unknown operator",
            );
            assert_eq!(outcome.selected.len(), 1);
            assert_eq!(outcome.selected[0].lesson.id, id);
            assert_eq!(outcome.selected[0].lane, Lane::Strict);
            assert!(outcome.selected[0].score >= 0.5);
        }

        #[test]
        fn test_retrieval_tolerates_empty_tags() {
            let (store, _) = seeded_store();
            let retriever = Retriever::new(RetrieverParams::default());
            let outcome = retriever.on_error(
                &store,
                "table:gridtool",
                "table:keep|operator_mismatch",
                &BTreeSet::new(),
                "unknown operator",
            );
            assert_eq!(outcome.selected.len(), 1);
        }

        #[test]
        fn test_empty_store_returns_empty() {
            let store = LessonStore::in_memory();
            let retriever = Retriever::new(RetrieverParams::default());
            let outcome = retriever.prerun(&store, "table:gridtool", "filter rows by age");
            assert!(outcome.selected.is_empty());
        }

        #[test]
        fn test_suppressed_never_returned() {
            let (mut store, id) = seeded_store();
            store.transition(&id, LessonStatus::Suppressed, "test");
            let retriever = Retriever::new(RetrieverParams::default());
            let tags: BTreeSet<String> = ["operator_mismatch".to_string()].into();
            let outcome = retriever.on_error(
                &store,
                "table:gridtool",
                "table:keep|operator_mismatch",
                &tags,
                "unknown operator",
            );
            assert!(outcome.selected.is_empty());
        }

        #[test]
        fn test_archived_never_returned() {
            let (mut store, id) = seeded_store();
            store.transition(&id, LessonStatus::Archived, "test");
            let retriever = Retriever::new(RetrieverParams::default());
            let outcome = retriever.prerun(&store, "table:gridtool", "operators gt lt eq");
            assert!(outcome.selected.is_empty());
        }

        #[test]
        fn test_on_error_cap_respected() {
            let mut store = LessonStore::in_memory();
            for i in 0..6 {
                let extra = format!("table:keep|operator_mismatch_{i}");
                let mut l = make_lesson(
                    &format!("distinct advice number {i} about operators being words"),
                    &[extra.as_str(), "table:keep|operator_mismatch"],
                    "table:gridtool",
                );
                l.system_tags.insert(format!("tag_{i}"));
                store.upsert(l, 0.65, 0.0);
            }
            let retriever = Retriever::new(RetrieverParams::default());
            let outcome = retriever.on_error(
                &store,
                "table:gridtool",
                "table:keep|operator_mismatch",
                &BTreeSet::new(),
                "unknown operator",
            );
            assert!(outcome.selected.len() <= 2);
        }

        #[test]
        fn test_per_session_cap() {
            let mut store = LessonStore::in_memory();
            let source = Uuid::new_v4();
            for i in 0..4 {
                let mut l = make_lesson(
                    &format!("advice variant {i} on filtering rows by words"),
                    &[&format!("table:keep|fp{i}")],
                    "table:gridtool",
                );
                l.source_session_id = source;
                store.upsert(l, 0.65, 0.0);
            }
            let params = RetrieverParams {
                prerun_top_k: 10,
                ..Default::default()
            };
            let retriever = Retriever::new(params);
            let outcome = retriever.prerun(&store, "table:gridtool", "filtering rows by words");
            assert!(outcome.selected.len() <= 2, "per-session cap violated");
        }

        #[test]
        fn test_per_tag_cap() {
            let mut store = LessonStore::in_memory();
            for i in 0..5 {
                let mut l = make_lesson(
                    &format!("tagged advice {i} about keeping rows filtered"),
                    &[&format!("table:keep|fp{i}")],
                    "table:gridtool",
                );
                l.system_tags.insert("operator_mismatch".into());
                store.upsert(l, 0.65, 0.0);
            }
            let retriever = Retriever::new(RetrieverParams::default());
            let outcome = retriever.prerun(&store, "table:gridtool", "keeping rows filtered");
            assert!(outcome.selected.len() <= 3, "per-tag cap violated");
        }

        #[test]
        fn test_transfer_off_excludes_cross_domain() {
            let mut store = LessonStore::in_memory();
            store.upsert(
                make_lesson(
                    "aggregation functions are lowercase words",
                    &["table:tally|function_case"],
                    "table:gridtool",
                ),
                0.65,
                0.25,
            );
            let params = RetrieverParams {
                transfer_policy: TransferPolicy::Off,
                ..Default::default()
            };
            let retriever = Retriever::new(params);
            let outcome = retriever.prerun(&store, "flux:fluxtool", "aggregation functions lowercase");
            assert!(outcome.selected.is_empty());
        }

        #[test]
        fn test_auto_transfer_fires_without_strict_hits() {
            let mut store = LessonStore::in_memory();
            let mut l = make_lesson(
                "aggregation functions are lowercase words sum count avg",
                &["table:tally|function_case"],
                "table:gridtool",
            );
            l.system_tags.insert("function_case".into());
            l.helpful_count = 5;
            l.recompute_reliability();
            store.upsert(l, 0.65, 0.25);

            let retriever = Retriever::new(RetrieverParams::default());
            let tags: BTreeSet<String> = ["function_case".to_string()].into();
            let outcome = retriever.on_error(
                &store,
                "flux:fluxtool",
                "flux:group|function_case",
                &tags,
                "aggregation function must be lowercase sum count avg",
            );
            assert_eq!(outcome.selected.len(), 1);
            assert_eq!(outcome.selected[0].lane, Lane::Transfer);
        }

        #[test]
        fn test_auto_transfer_suppressed_by_confident_strict_hit() {
            let mut store = LessonStore::in_memory();
            // Strong same-domain lesson
            let mut strict_l = make_lesson(
                "use word operators gt lt eq",
                &["flux:group|operator_mismatch"],
                "flux:fluxtool",
            );
            strict_l.system_tags.insert("operator_mismatch".into());
            strict_l.helpful_count = 9;
            strict_l.recompute_reliability();
            store.upsert(strict_l, 0.65, 0.25);
            // Cross-domain lesson that would otherwise transfer
            store.upsert(
                make_lesson(
                    "some other domain advice on operators",
                    &["table:keep|operator_mismatch"],
                    "table:gridtool",
                ),
                0.65,
                0.25,
            );

            let retriever = Retriever::new(RetrieverParams::default());
            let tags: BTreeSet<String> = ["operator_mismatch".to_string()].into();
            let outcome = retriever.on_error(
                &store,
                "flux:fluxtool",
                "flux:group|operator_mismatch",
                &tags,
                "unknown operator use word operators",
            );
            assert!(!outcome.selected.is_empty());
            assert!(outcome.selected.iter().all(|r| r.lane == Lane::Strict));
        }

        #[test]
        fn test_conflict_resolution_keeps_higher_reliability() {
            let mut store = LessonStore::in_memory();
            let mut strong = make_lesson(
                "always quote paths containing spaces",
                &["shell:cp|path_quote"],
                "shell:fs",
            );
            strong.helpful_count = 9;
            strong.recompute_reliability();
            let strong_id = store.upsert(strong, 0.65, 0.25);

            let mut weak = make_lesson(
                "never wrap file arguments escape whitespace instead",
                &["shell:cp|path_quote"],
                "shell:fs",
            );
            weak.harmful_count = 5;
            weak.recompute_reliability();
            let weak_id = store.upsert(weak, 0.65, 0.25);

            let retriever = Retriever::new(RetrieverParams::default());
            let outcome = retriever.on_error(
                &store,
                "shell:fs",
                "shell:cp|path_quote",
                &BTreeSet::new(),
                "path with spaces failed",
            );
            let ids = outcome.lesson_ids();
            assert!(ids.contains(&strong_id));
            assert!(!ids.contains(&weak_id));
            assert!(outcome
                .conflict_losses
                .iter()
                .any(|(loser, winner)| *loser == weak_id && *winner == strong_id));
        }

        #[test]
        fn test_retrieval_query_struct_usable() {
            // RetrievalQuery is public API for SPI consumers
            let q = RetrievalQuery {
                domain_key: "table:gridtool".into(),
                point: ActivationPoint::Prerun,
                context_text: "task".into(),
                fingerprint: None,
                tags: BTreeSet::new(),
            };
            assert_eq!(q.domain_key, "table:gridtool");
        }
    }

    // ── Promotion ──────────────────────────────────────────────

    mod promotion {
        use super::*;

        fn store_with_activated_lesson(sessions: usize) -> (LessonStore, String, Vec<Uuid>) {
            let mut store = LessonStore::in_memory();
            let id = store.upsert(
                make_lesson(
                    "operators are words use gt lt eq",
                    &["table:keep|operator_mismatch"],
                    "table:gridtool",
                ),
                0.65,
                0.25,
            );
            let mut session_ids = Vec::new();
            for _ in 0..sessions {
                let sid = Uuid::new_v4();
                store.record_activation(&id, activation(sid, "table:gridtool"));
                session_ids.push(sid);
            }
            (store, id, session_ids)
        }

        #[test]
        fn test_utility_weights_with_referee() {
            let promoter = Promoter::new(PromoterParams::default());
            let outcome = passing_outcome(Uuid::new_v4());
            let u = promoter.activation_utility(&outcome);
            // error_reduction=1, step_gain=0.75, referee_gain=1.0
            assert!((u - (0.5 + 0.3 * 0.75 + 0.2)).abs() < 1e-9);
        }

        #[test]
        fn test_utility_redistributes_without_referee() {
            let promoter = Promoter::new(PromoterParams::default());
            let mut outcome = passing_outcome(Uuid::new_v4());
            outcome.referee_score = None;
            let u = promoter.activation_utility(&outcome);
            assert!((u - (0.625 + 0.375 * 0.75)).abs() < 1e-9);
        }

        #[test]
        fn test_promotion_after_three_good_runs() {
            let (mut store, id, sessions) = store_with_activated_lesson(3);
            let promoter = Promoter::new(PromoterParams::default());
            for sid in &sessions {
                promoter.update(&mut store, &passing_outcome(*sid));
            }
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Promoted);
            assert!(store.get(&id).unwrap().helpful_count >= 3);
        }

        #[test]
        fn test_no_promotion_below_evidence_window() {
            let (mut store, id, sessions) = store_with_activated_lesson(2);
            let promoter = Promoter::new(PromoterParams::default());
            for sid in &sessions {
                promoter.update(&mut store, &passing_outcome(*sid));
            }
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Candidate);
        }

        #[test]
        fn test_weight_blocked_lesson_never_promotes() {
            let (mut store, id, sessions) = store_with_activated_lesson(3);
            store.modify(&id, |l| l.weight_blocked = true);
            let promoter = Promoter::new(PromoterParams::default());
            for sid in &sessions {
                promoter.update(&mut store, &passing_outcome(*sid));
            }
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Candidate);
        }

        #[test]
        fn test_suppression_after_three_useless_retrievals() {
            let (mut store, id, sessions) = store_with_activated_lesson(3);
            let promoter = Promoter::new(PromoterParams::default());
            for sid in &sessions {
                promoter.update(&mut store, &failing_outcome(*sid));
            }
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Suppressed);
        }

        #[test]
        fn test_major_regression_blocks_promotion() {
            let (mut store, id, sessions) = store_with_activated_lesson(4);
            let promoter = Promoter::new(PromoterParams::default());
            // One catastrophic run first
            store.modify(&id, |l| {
                l.activations[0].utility = Some(-0.8);
            });
            for sid in sessions.iter().skip(1) {
                promoter.update(&mut store, &passing_outcome(*sid));
            }
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Candidate);
        }

        #[test]
        fn test_conflict_loss_suppression() {
            let mut store = LessonStore::in_memory();
            let winner = store.upsert(
                make_lesson("always quote paths containing spaces", &["shell:cp|path_quote"], "shell:fs"),
                0.65,
                0.25,
            );
            let loser = store.upsert(
                make_lesson("never wrap file arguments escape whitespace instead", &["shell:cp|path_quote"], "shell:fs"),
                0.65,
                0.25,
            );
            let promoter = Promoter::new(PromoterParams::default());
            let losses = vec![(loser.clone(), winner.clone())];
            promoter.record_conflict_losses(&mut store, &losses);
            promoter.record_conflict_losses(&mut store, &losses);
            assert_eq!(store.get(&loser).unwrap().status, LessonStatus::Candidate);
            let suppressed = promoter.record_conflict_losses(&mut store, &losses);
            assert_eq!(suppressed, vec![loser.clone()]);
            assert_eq!(store.get(&loser).unwrap().status, LessonStatus::Suppressed);
        }

        #[test]
        fn test_archive_sweep_ignores_fresh_lessons() {
            let (mut store, id, sessions) = store_with_activated_lesson(1);
            let promoter = Promoter::new(PromoterParams::default());
            promoter.update(&mut store, &passing_outcome(sessions[0]));
            assert_ne!(store.get(&id).unwrap().status, LessonStatus::Archived);
        }

        #[test]
        fn test_archive_sweep_catches_idle_unreliable() {
            let mut store = LessonStore::in_memory();
            let id = store.upsert(make_lesson("stale advice", &["fp"], "d"), 0.65, 0.25);
            store.modify(&id, |l| {
                l.created_at = Utc::now() - chrono::Duration::days(120);
                l.last_retrieved_at = None;
                l.harmful_count = 3;
                l.recompute_reliability();
            });
            let promoter = Promoter::new(PromoterParams::default());
            let report = promoter.update(&mut store, &failing_outcome(Uuid::new_v4()));
            assert!(report.archived.contains(&id));
            assert_eq!(store.get(&id).unwrap().status, LessonStatus::Archived);
        }
    }

    // ── Event log ──────────────────────────────────────────────

    mod event_log {
        use super::*;
        use loam_core::FailureChannel;
        use loam_memory::{ErrorEvent, SessionEvent, SessionEventLog};

        fn error_event(session: Uuid, step: u32) -> ErrorEvent {
            ErrorEvent {
                session_id: session,
                step_index: step,
                tool_name: "gridtool".into(),
                action_payload: serde_json::json!({"command": "KEEP age > 30"}),
                error_text: "unknown operator".into(),
                fingerprint: "table:keep|operator_mismatch".into(),
                tags: BTreeSet::new(),
                channel: FailureChannel::HardFailure,
                at: Utc::now(),
            }
        }

        #[test]
        fn test_header_written_first() {
            let dir = tempfile::tempdir().unwrap();
            let session = Uuid::new_v4();
            let log =
                SessionEventLog::create(dir.path(), session, "t1", "table:gridtool").unwrap();
            let events = SessionEventLog::read(log.path().unwrap()).unwrap();
            assert_eq!(events.len(), 1);
            assert!(matches!(events[0], SessionEvent::Header { .. }));
        }

        #[test]
        fn test_step_indices_monotonic() {
            let dir = tempfile::tempdir().unwrap();
            let session = Uuid::new_v4();
            let mut log =
                SessionEventLog::create(dir.path(), session, "t1", "table:gridtool").unwrap();
            log.append(&SessionEvent::Error(error_event(session, 1)));
            log.append(&SessionEvent::Error(error_event(session, 2)));
            // Out-of-order append is dropped, not written
            log.append(&SessionEvent::Error(error_event(session, 1)));
            log.append(&SessionEvent::Error(error_event(session, 3)));

            let events = SessionEventLog::read(log.path().unwrap()).unwrap();
            let steps: Vec<u32> = events.iter().filter_map(|e| e.step_index()).collect();
            assert_eq!(steps, vec![1, 2, 3]);
            assert!(steps.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn test_error_count_tracked() {
            let dir = tempfile::tempdir().unwrap();
            let session = Uuid::new_v4();
            let mut log =
                SessionEventLog::create(dir.path(), session, "t1", "table:gridtool").unwrap();
            log.append(&SessionEvent::Error(error_event(session, 1)));
            log.append(&SessionEvent::Reflection {
                step_index: 2,
                reason: "repeat".into(),
            });
            assert_eq!(log.error_count(), 1);
        }

        #[test]
        fn test_prior_fingerprints_excludes_current() {
            let dir = tempfile::tempdir().unwrap();
            let old_session = Uuid::new_v4();
            let mut old_log =
                SessionEventLog::create(dir.path(), old_session, "t1", "table:gridtool").unwrap();
            old_log.append(&SessionEvent::Error(error_event(old_session, 1)));

            let current = Uuid::new_v4();
            let mut current_log =
                SessionEventLog::create(dir.path(), current, "t1", "table:gridtool").unwrap();
            let mut ev = error_event(current, 1);
            ev.fingerprint = "table:sort|sort_direction".into();
            current_log.append(&SessionEvent::Error(ev));

            let prior = loam_memory::event_log::prior_fingerprints(dir.path(), current);
            assert!(prior.contains("table:keep|operator_mismatch"));
            assert!(!prior.contains("table:sort|sort_direction"));
        }
    }

    // ── Metrics ────────────────────────────────────────────────

    mod metrics {
        use super::*;
        use loam_core::EvalSource;
        use loam_memory::SessionMetrics;

        #[test]
        fn test_write_and_read_roundtrip() {
            let dir = tempfile::tempdir().unwrap();
            let session = Uuid::new_v4();
            let mut m = SessionMetrics::new(session, "t1", "table:gridtool");
            m.passed = true;
            m.score = 0.9;
            m.steps = 4;
            m.v2_prerun_lesson_ids = vec!["L1".into()];
            m.v2_lesson_activations = 1;
            m.eval_source = EvalSource::Contract;
            m.write(dir.path()).unwrap();

            let restored = SessionMetrics::read(dir.path(), session).unwrap();
            assert!(restored.passed);
            assert_eq!(restored.v2_prerun_lesson_ids, vec!["L1".to_string()]);
            assert_eq!(restored.eval_source, EvalSource::Contract);
        }

        #[test]
        fn test_snapshot_distinct_from_injected() {
            let m = SessionMetrics::new(Uuid::new_v4(), "t1", "d");
            // Fields exist separately; a store of 50 with 3 injected must
            // be representable.
            let mut m = m;
            m.store_snapshot_lessons = 50;
            m.v2_prerun_lesson_ids = vec!["a".into(), "b".into(), "c".into()];
            assert_ne!(m.store_snapshot_lessons, m.v2_prerun_lesson_ids.len());
        }
    }
}
