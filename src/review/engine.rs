//! The review chain engine.
//!
//! A policy lists ordered stages (typically one builder, reviewers, and a
//! verifier).  Failing reviewer stages with actionable comments feed
//! revision tasks back to the builder; the loop repeats until every stage
//! passes, a policy-critical stage reports an unresolved conflict, or the
//! loop budget runs out; the latter two escalate to a human.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClassifiedError;

// ─── Policy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Builder,
    Reviewer,
    Verifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePolicy {
    pub id: String,
    pub kind: StageKind,
    /// Unresolved conflicts in critical stages escalate immediately.
    #[serde(default)]
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPolicy {
    pub stages: Vec<StagePolicy>,
    pub max_loops: u32,
}

// ─── Stage I/O ───────────────────────────────────────────────────────────────

/// The unit of work under review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// One reviewer comment that can be turned into a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionableComment {
    pub file: String,
    pub step: String,
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

/// What one stage reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub pass: bool,
    pub score: f32,
    #[serde(default)]
    pub comments: Vec<String>,
    #[serde(default)]
    pub actionable: Vec<ActionableComment>,
    #[serde(default)]
    pub unresolved_conflict: bool,
}

impl StageOutcome {
    pub fn passing(score: f32) -> Self {
        Self {
            pass: true,
            score,
            comments: Vec::new(),
            actionable: Vec::new(),
            unresolved_conflict: false,
        }
    }
}

/// A revision fed back to the builder, synthesized from one actionable
/// comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTask {
    pub source_stage_id: String,
    pub file: String,
    pub step: String,
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

// ─── StageRunner seam ────────────────────────────────────────────────────────

/// Executes one stage (an agent job in production, a script in tests).
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run_stage(
        &self,
        stage: &StagePolicy,
        task: &ReviewTask,
        revisions: &[RevisionTask],
        loop_no: u32,
    ) -> Result<StageOutcome, ClassifiedError>;
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    UnresolvedConflict,
    MaxLoopsExceeded,
}

/// Per-loop record of stage outcomes and the revisions they produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopRecord {
    pub loop_no: u32,
    pub stage_outcomes: Vec<(String, StageOutcome)>,
    pub revisions: Vec<RevisionTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub passed: bool,
    pub escalated_to_human: bool,
    #[serde(default)]
    pub escalation_reason: Option<EscalationReason>,
    pub loops_run: u32,
    pub records: Vec<LoopRecord>,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct ReviewChainEngine<R: StageRunner> {
    runner: R,
}

impl<R: StageRunner> ReviewChainEngine<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Run the chain to a verdict.
    pub async fn run(
        &self,
        policy: &ReviewPolicy,
        task: &ReviewTask,
    ) -> Result<ReviewOutcome, ClassifiedError> {
        let max_loops = policy.max_loops.max(1);
        let mut records = Vec::new();
        let mut revisions: Vec<RevisionTask> = Vec::new();

        for loop_no in 1..=max_loops {
            let mut outcomes = Vec::new();
            let mut loop_revisions = Vec::new();
            let mut all_passed = true;
            let mut conflict = false;

            for stage in &policy.stages {
                let outcome = self
                    .runner
                    .run_stage(stage, task, &revisions, loop_no)
                    .await?;
                log::debug!(
                    "review: loop {loop_no} stage '{}' pass={} score={}",
                    stage.id,
                    outcome.pass,
                    outcome.score
                );

                if outcome.unresolved_conflict && stage.critical {
                    conflict = true;
                }
                if !outcome.pass {
                    all_passed = false;
                    for comment in &outcome.actionable {
                        loop_revisions.push(RevisionTask {
                            source_stage_id: stage.id.clone(),
                            file: comment.file.clone(),
                            step: comment.step.clone(),
                            severity: comment.severity.clone(),
                            message: comment.message.clone(),
                            remediation: comment.remediation.clone(),
                        });
                    }
                }
                outcomes.push((stage.id.clone(), outcome));

                if conflict {
                    break;
                }
            }

            records.push(LoopRecord {
                loop_no,
                stage_outcomes: outcomes,
                revisions: loop_revisions.clone(),
            });

            if conflict {
                return Ok(ReviewOutcome {
                    passed: false,
                    escalated_to_human: true,
                    escalation_reason: Some(EscalationReason::UnresolvedConflict),
                    loops_run: loop_no,
                    records,
                });
            }
            if all_passed {
                return Ok(ReviewOutcome {
                    passed: true,
                    escalated_to_human: false,
                    escalation_reason: None,
                    loops_run: loop_no,
                    records,
                });
            }

            // Feed this loop's revisions to the next builder pass.
            revisions = loop_revisions;
        }

        Ok(ReviewOutcome {
            passed: false,
            escalated_to_human: true,
            escalation_reason: Some(EscalationReason::MaxLoopsExceeded),
            loops_run: max_loops,
            records,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn policy(max_loops: u32) -> ReviewPolicy {
        ReviewPolicy {
            stages: vec![
                StagePolicy {
                    id: "builder".into(),
                    kind: StageKind::Builder,
                    critical: false,
                },
                StagePolicy {
                    id: "reviewer".into(),
                    kind: StageKind::Reviewer,
                    critical: false,
                },
                StagePolicy {
                    id: "verifier".into(),
                    kind: StageKind::Verifier,
                    critical: true,
                },
            ],
            max_loops,
        }
    }

    fn task() -> ReviewTask {
        ReviewTask {
            id: "t1".into(),
            description: "implement the widget".into(),
            context: serde_json::Value::Null,
        }
    }

    /// Runner scripted per (stage id, loop number).
    struct ScriptedRunner {
        script: Box<dyn Fn(&str, u32, &[RevisionTask]) -> StageOutcome + Send + Sync>,
        calls: Mutex<Vec<(String, u32, usize)>>,
    }

    impl ScriptedRunner {
        fn new(
            script: impl Fn(&str, u32, &[RevisionTask]) -> StageOutcome + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StageRunner for ScriptedRunner {
        async fn run_stage(
            &self,
            stage: &StagePolicy,
            _task: &ReviewTask,
            revisions: &[RevisionTask],
            loop_no: u32,
        ) -> Result<StageOutcome, ClassifiedError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((stage.id.clone(), loop_no, revisions.len()));
            }
            Ok((self.script)(&stage.id, loop_no, revisions))
        }
    }

    fn failing_review(comment: &str) -> StageOutcome {
        StageOutcome {
            pass: false,
            score: 0.4,
            comments: vec![comment.to_string()],
            actionable: vec![ActionableComment {
                file: "src/widget.rs".into(),
                step: "build".into(),
                severity: "major".into(),
                message: comment.to_string(),
                remediation: Some("rename the field".into()),
            }],
            unresolved_conflict: false,
        }
    }

    #[tokio::test]
    async fn all_stages_passing_finishes_in_one_loop() {
        let engine = ReviewChainEngine::new(ScriptedRunner::new(|_, _, _| {
            StageOutcome::passing(0.9)
        }));
        let outcome = engine.run(&policy(3), &task()).await.unwrap();
        assert!(outcome.passed);
        assert!(!outcome.escalated_to_human);
        assert_eq!(outcome.loops_run, 1);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].stage_outcomes.len(), 3);
    }

    #[tokio::test]
    async fn failing_reviewer_feeds_revisions_to_next_loop() {
        let engine = ReviewChainEngine::new(ScriptedRunner::new(|stage, loop_no, _| {
            if stage == "reviewer" && loop_no == 1 {
                failing_review("naming is off")
            } else {
                StageOutcome::passing(0.9)
            }
        }));
        let outcome = engine.run(&policy(3), &task()).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.loops_run, 2);

        // Loop 1 synthesized one revision task from the comment.
        let revisions = &outcome.records[0].revisions;
        assert_eq!(revisions.len(), 1);
        assert_eq!(revisions[0].source_stage_id, "reviewer");
        assert_eq!(revisions[0].file, "src/widget.rs");
        assert_eq!(revisions[0].remediation.as_deref(), Some("rename the field"));
    }

    #[tokio::test]
    async fn builder_sees_revisions_on_second_loop() {
        let runner = ScriptedRunner::new(|stage, loop_no, _| {
            if stage == "reviewer" && loop_no == 1 {
                failing_review("fix it")
            } else {
                StageOutcome::passing(0.9)
            }
        });
        let engine = ReviewChainEngine::new(runner);
        engine.run(&policy(3), &task()).await.unwrap();

        let calls = engine.runner.calls.lock().unwrap().clone();
        // Builder on loop 2 received exactly 1 revision.
        assert!(calls.contains(&("builder".to_string(), 2, 1)));
        // Builder on loop 1 received none.
        assert!(calls.contains(&("builder".to_string(), 1, 0)));
    }

    #[tokio::test]
    async fn max_loops_exhaustion_escalates() {
        let engine = ReviewChainEngine::new(ScriptedRunner::new(|stage, _, _| {
            if stage == "reviewer" {
                failing_review("never happy")
            } else {
                StageOutcome::passing(0.9)
            }
        }));
        let outcome = engine.run(&policy(2), &task()).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.escalated_to_human);
        assert_eq!(
            outcome.escalation_reason,
            Some(EscalationReason::MaxLoopsExceeded)
        );
        assert_eq!(outcome.loops_run, 2);
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn critical_conflict_escalates_immediately() {
        let engine = ReviewChainEngine::new(ScriptedRunner::new(|stage, _, _| {
            if stage == "verifier" {
                StageOutcome {
                    pass: false,
                    score: 0.1,
                    comments: vec!["reviewers disagree".into()],
                    actionable: vec![],
                    unresolved_conflict: true,
                }
            } else {
                StageOutcome::passing(0.9)
            }
        }));
        let outcome = engine.run(&policy(5), &task()).await.unwrap();
        assert!(!outcome.passed);
        assert!(outcome.escalated_to_human);
        assert_eq!(
            outcome.escalation_reason,
            Some(EscalationReason::UnresolvedConflict)
        );
        assert_eq!(outcome.loops_run, 1, "no further loops after a conflict");
    }

    #[tokio::test]
    async fn non_critical_conflict_does_not_escalate() {
        let engine = ReviewChainEngine::new(ScriptedRunner::new(|stage, loop_no, _| {
            if stage == "reviewer" && loop_no == 1 {
                StageOutcome {
                    pass: false,
                    score: 0.5,
                    comments: vec![],
                    actionable: vec![],
                    unresolved_conflict: true, // reviewer is not critical
                }
            } else {
                StageOutcome::passing(0.9)
            }
        }));
        let outcome = engine.run(&policy(3), &task()).await.unwrap();
        assert!(outcome.passed);
        assert!(!outcome.escalated_to_human);
    }
}
