use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use keystone_core::errors::ProviderError;
use keystone_core::ids::{BrainstormId, ProjectId};
use keystone_core::models::{
    BrainstormSession, ContextSnapshot, SnapshotContent, SnapshotTrigger, SynthesisStatus,
    SynthesizedOutput,
};
use keystone_core::provider::{CompletionOptions, CompletionProvider};
use keystone_core::stream::{CompletionChunk, ProviderErrorInfo};
use keystone_core::tokens::TokenUsage;
use keystone_store::{BrainstormRepo, CandidateSet, Database, NewOutput, OutputRepo, SnapshotLinks};

use crate::context::{ChangeRecord, ContextBuilder};
use crate::error::SynthesisError;
use crate::events::SynthesisEvent;
use crate::parse::{parse_response, ParseTier};
use crate::prompt::{AssembledPrompt, AssemblyMode, PromptAssembler, PromptBudget, PromptInput};
use crate::snapshots::SnapshotService;

/// Largest delta a rerun will prompt with before rebuilding the full context.
pub const DEFAULT_MAX_DELTA_CHANGES: usize = 40;

/// Configuration for the synthesis runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub max_delta_changes: usize,
    pub budget: PromptBudget,
    /// Base completion options. The system prompt is filled in per run.
    pub options: CompletionOptions,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_delta_changes: DEFAULT_MAX_DELTA_CHANGES,
            budget: PromptBudget::default(),
            options: CompletionOptions::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SynthesisRequest {
    pub project_id: ProjectId,
    pub brainstorm_id: BrainstormId,
    pub mode: AssemblyMode,
}

/// Result of a run that reached the store. A provider failure or a
/// cancellation still produces an outcome, with a `failed` output and `error`
/// set.
#[derive(Clone, Debug)]
pub struct SynthesisOutcome {
    pub output: SynthesizedOutput,
    pub prompt: AssembledPrompt,
    pub tier: ParseTier,
    pub fell_back_to_full: bool,
    /// Recorded for completed runs only.
    pub snapshot: Option<ContextSnapshot>,
    pub error: Option<ProviderErrorInfo>,
}

impl SynthesisOutcome {
    pub fn is_completed(&self) -> bool {
        self.output.status == SynthesisStatus::Completed
    }
}

/// Text gathered from one provider stream.
#[derive(Clone, Debug, Default)]
pub(crate) struct StreamedReply {
    pub raw: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub failure: Option<ProviderError>,
}

/// Drain a provider stream, racing every chunk against `cancel`. The stream is
/// dropped on return, which aborts the underlying request.
pub(crate) async fn stream_reply(
    provider: &dyn CompletionProvider,
    prompt: &str,
    options: &CompletionOptions,
    cancel: &CancellationToken,
    mut on_text: impl FnMut(&str),
) -> StreamedReply {
    let mut reply = StreamedReply::default();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = provider.stream(prompt, options) => result,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            reply.failure = Some(e);
            return reply;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                reply.failure = Some(ProviderError::Cancelled);
                break;
            }
            next = stream.next() => next,
        };
        match next {
            Some(CompletionChunk::Text { text }) => {
                on_text(&text);
                reply.raw.push_str(&text);
            }
            Some(CompletionChunk::Done {
                usage,
                finish_reason,
            }) => {
                if let Some(usage) = usage {
                    reply.usage.merge(&usage);
                }
                reply.finish_reason = finish_reason;
                break;
            }
            Some(CompletionChunk::Error { error }) => {
                reply.failure = Some(error);
                break;
            }
            None => {
                reply.failure = Some(ProviderError::StreamInterrupted(
                    "stream ended without a terminal event".into(),
                ));
                break;
            }
        }
    }
    reply
}

/// Runs one synthesis: context → prompt → provider stream → parse → persist.
pub struct SynthesisRunner {
    provider: Arc<dyn CompletionProvider>,
    db: Database,
    config: RunnerConfig,
    event_tx: broadcast::Sender<SynthesisEvent>,
}

impl SynthesisRunner {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        db: Database,
        config: RunnerConfig,
        event_tx: broadcast::Sender<SynthesisEvent>,
    ) -> Self {
        Self {
            provider,
            db,
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn send_event(&self, event: SynthesisEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("no event receivers, synthesis event dropped");
        }
    }

    /// Load and check the brainstorm, then pick the context to prompt with.
    /// Returns the assembled prompt and whether a rerun fell back to full
    /// context.
    pub fn prepare(&self, req: &SynthesisRequest) -> Result<(BrainstormSession, AssembledPrompt, bool), SynthesisError> {
        let brainstorm = BrainstormRepo::new(self.db.clone()).get(&req.brainstorm_id)?;
        if brainstorm.project_id != req.project_id {
            return Err(SynthesisError::NotFound(format!(
                "brainstorm {} in project {}",
                req.brainstorm_id, req.project_id
            )));
        }

        let (mode, content, delta, fell_back) = self.plan_context(req, &brainstorm)?;
        let prompt = PromptAssembler::new(self.config.budget).assemble(PromptInput {
            mode,
            context: &content,
            delta: &delta,
            brainstorm: &brainstorm,
        });
        Ok((brainstorm, prompt, fell_back))
    }

    fn plan_context(
        &self,
        req: &SynthesisRequest,
        brainstorm: &BrainstormSession,
    ) -> Result<(AssemblyMode, SnapshotContent, Vec<ChangeRecord>, bool), SynthesisError> {
        let builder = ContextBuilder::new(self.db.clone());
        if req.mode == AssemblyMode::UpdateContext {
            let content = builder.build_full_context(&req.project_id)?;
            return Ok((AssemblyMode::UpdateContext, content, Vec::new(), false));
        }

        let Some(snapshot) = SnapshotService::new(self.db.clone()).latest(&req.project_id)? else {
            info!("no snapshot yet, using full context");
            let content = builder.build_full_context(&req.project_id)?;
            return Ok((AssemblyMode::UpdateContext, content, Vec::new(), true));
        };

        let mut delta = builder.build_delta_since_snapshot(&req.project_id, &snapshot)?;
        delta.retain(|c| {
            !matches!(c, ChangeRecord::BrainstormAdded { brainstorm_id, .. } if *brainstorm_id == brainstorm.id)
        });
        if delta.len() > self.config.max_delta_changes {
            info!(
                changes = delta.len(),
                max = self.config.max_delta_changes,
                "delta too large, using full context"
            );
            let content = builder.build_full_context(&req.project_id)?;
            return Ok((AssemblyMode::UpdateContext, content, Vec::new(), true));
        }
        Ok((AssemblyMode::Rerun, snapshot.content, delta, false))
    }

    #[instrument(skip(self, cancel), fields(project_id = %req.project_id, brainstorm_id = %req.brainstorm_id, mode = %req.mode))]
    pub async fn run(
        &self,
        req: SynthesisRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutcome, SynthesisError> {
        let (brainstorm, prompt, fell_back_to_full) = self.prepare(&req)?;

        self.send_event(SynthesisEvent::Prompt {
            mode: prompt.mode,
            fell_back_to_full,
            system: prompt.system.clone(),
            user: prompt.user.clone(),
        });

        let options = self.config.options.clone().with_system(prompt.system.clone());
        let reply = stream_reply(self.provider.as_ref(), &prompt.user, &options, cancel, |text| {
            self.send_event(SynthesisEvent::Chunk {
                text: text.to_string(),
            });
        })
        .await;

        let (candidates, tier, status, error) = match &reply.failure {
            None => {
                let parsed = parse_response(&reply.raw);
                (parsed.candidates, parsed.tier, SynthesisStatus::Completed, None)
            }
            Some(e) => {
                warn!(error = %e, kind = e.error_kind(), partial_len = reply.raw.len(), "synthesis stream failed");
                (
                    CandidateSet::default(),
                    ParseTier::None,
                    SynthesisStatus::Failed,
                    Some(ProviderErrorInfo::from(e)),
                )
            }
        };

        let output = OutputRepo::new(self.db.clone()).create(NewOutput {
            project_id: req.project_id.clone(),
            brainstorm_id: Some(brainstorm.id.clone()),
            content: reply.raw,
            candidates,
            status,
            error_message: error.as_ref().map(|e| e.message.clone()),
            provider: self.provider.name().to_string(),
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.provider.model().to_string()),
            usage: reply.usage,
        })?;

        let snapshot = if status == SynthesisStatus::Completed {
            Some(SnapshotService::new(self.db.clone()).capture(
                &req.project_id,
                SnapshotTrigger::Synthesis,
                SnapshotLinks {
                    synthesized_output_id: Some(output.id.clone()),
                    brainstorm_id: Some(brainstorm.id.clone()),
                },
            )?)
        } else {
            None
        };

        match &error {
            None => {
                info!(
                    output_id = %output.id,
                    tier = %tier,
                    systems = output.extracted_systems.len(),
                    details = output.extracted_system_details.len(),
                    "synthesis completed"
                );
                self.send_event(SynthesisEvent::Done {
                    output_id: output.id.clone(),
                    status: output.status,
                    tier,
                    extracted_systems: output.extracted_systems.len(),
                    extracted_system_details: output.extracted_system_details.len(),
                    suggested_systems: output.suggested_systems.len(),
                    suggested_system_details: output.suggested_system_details.len(),
                    usage: output.usage,
                });
            }
            Some(info) => {
                self.send_event(SynthesisEvent::Error {
                    output_id: Some(output.id.clone()),
                    error: info.clone(),
                });
            }
        }

        Ok(SynthesisOutcome {
            output,
            prompt,
            tier,
            fell_back_to_full,
            snapshot,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use keystone_core::models::{NewBrainstorm, NewSystem};
    use keystone_llm::mock::{MockProvider, MockResponse};
    use keystone_store::{ProjectRepo, SnapshotRepo, SystemRepo};

    const REPLY: &str = r#"{"extractedSystems":[{"name":"Combat","systemSlug":"combat","dependencies":["health"]},{"name":"Health","systemSlug":"health"}],"extractedSystemDetails":[{"name":"Damage formula","targetSystemSlug":"combat"}]}"#;

    fn setup() -> (Database, ProjectId, BrainstormSession) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        let brainstorm = BrainstormRepo::new(db.clone())
            .create(
                &project.id,
                NewBrainstorm {
                    title: "Fights".into(),
                    content: "Players fight monsters; damage reduces health.".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        (db, project.id, brainstorm)
    }

    fn request(project_id: &ProjectId, brainstorm: &BrainstormSession, mode: AssemblyMode) -> SynthesisRequest {
        SynthesisRequest {
            project_id: project_id.clone(),
            brainstorm_id: brainstorm.id.clone(),
            mode,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SynthesisEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn completed_run_persists_output_and_snapshot() {
        let (db, project_id, brainstorm) = setup();
        let (tx, mut rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text(&[
            &REPLY[..40],
            &REPLY[40..],
        ])]));
        let runner = SynthesisRunner::new(provider.clone(), db.clone(), RunnerConfig::default(), tx);

        let outcome = runner
            .run(request(&project_id, &brainstorm, AssemblyMode::Rerun), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert!(outcome.fell_back_to_full);
        assert_eq!(outcome.tier, ParseTier::Direct);
        assert_eq!(outcome.output.content, REPLY);
        assert_eq!(outcome.output.extracted_systems.len(), 2);
        assert_eq!(outcome.output.provider, "mock");
        assert_eq!(outcome.output.model, "mock-model");

        let snapshot = outcome.snapshot.unwrap();
        assert_eq!(snapshot.trigger, SnapshotTrigger::Synthesis);
        assert_eq!(snapshot.synthesized_output_id.as_ref(), Some(&outcome.output.id));
        assert_eq!(snapshot.brainstorm_id.as_ref(), Some(&brainstorm.id));

        assert_eq!(drain(&mut rx), vec!["prompt", "chunk", "chunk", "done"]);

        let call = &provider.calls()[0];
        assert!(call.prompt.contains("Players fight monsters"));
        assert!(call.options.system.as_deref().unwrap().contains("extractedSystems"));
    }

    #[tokio::test]
    async fn rerun_uses_snapshot_and_delta() {
        let (db, project_id, brainstorm) = setup();
        SnapshotService::new(db.clone())
            .capture(&project_id, SnapshotTrigger::Initial, SnapshotLinks::default())
            .unwrap();
        SystemRepo::new(db.clone())
            .create(
                &project_id,
                NewSystem {
                    name: "Inventory".into(),
                    slug: "inventory".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let (tx, _rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text(REPLY)]));
        let runner = SynthesisRunner::new(provider.clone(), db, RunnerConfig::default(), tx);

        let outcome = runner
            .run(request(&project_id, &brainstorm, AssemblyMode::Rerun), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.fell_back_to_full);
        assert_eq!(outcome.prompt.mode, AssemblyMode::Rerun);
        assert!(provider
            .last_prompt()
            .unwrap()
            .contains("+ system added: Inventory (inventory)"));
    }

    #[tokio::test]
    async fn oversized_delta_falls_back_to_full_context() {
        let (db, project_id, brainstorm) = setup();
        SnapshotService::new(db.clone())
            .capture(&project_id, SnapshotTrigger::Initial, SnapshotLinks::default())
            .unwrap();
        let systems = SystemRepo::new(db.clone());
        for slug in ["a", "b", "c"] {
            systems
                .create(
                    &project_id,
                    NewSystem {
                        name: slug.to_uppercase(),
                        slug: slug.into(),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let (tx, _rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text(REPLY)]));
        let config = RunnerConfig {
            max_delta_changes: 2,
            ..Default::default()
        };
        let runner = SynthesisRunner::new(provider, db, config, tx);

        let (_, prompt, fell_back) = runner
            .prepare(&request(&project_id, &brainstorm, AssemblyMode::Rerun))
            .unwrap();
        assert!(fell_back);
        assert_eq!(prompt.mode, AssemblyMode::UpdateContext);
        assert!(!prompt.user.contains("Changes since last snapshot"));
    }

    #[tokio::test]
    async fn brainstorm_from_another_project_is_not_found() {
        let (db, _project_id, brainstorm) = setup();
        let other = ProjectRepo::new(db.clone()).create("Other", None).unwrap();
        let (tx, _rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text(REPLY)]));
        let runner = SynthesisRunner::new(provider.clone(), db, RunnerConfig::default(), tx);

        let err = runner
            .run(request(&other.id, &brainstorm, AssemblyMode::Rerun), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn provider_error_persists_failed_output() {
        let (db, project_id, brainstorm) = setup();
        let (tx, mut rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_error(
            &["{\"extractedSystems\": ["],
            ProviderError::ProviderOverloaded,
        )]));
        let runner = SynthesisRunner::new(provider, db.clone(), RunnerConfig::default(), tx);

        let outcome = runner
            .run(request(&project_id, &brainstorm, AssemblyMode::UpdateContext), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.output.status, SynthesisStatus::Failed);
        assert_eq!(outcome.output.content, "{\"extractedSystems\": [");
        assert_eq!(outcome.error.as_ref().unwrap().kind, "provider_overloaded");
        assert!(outcome.snapshot.is_none());
        assert!(SnapshotRepo::new(db).latest(&project_id).unwrap().is_none());
        assert_eq!(drain(&mut rx), vec!["prompt", "chunk", "error"]);
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_content() {
        let (db, project_id, brainstorm) = setup();
        let (tx, _rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Pending(vec![
            CompletionChunk::text("{\"extractedSystems\": [{\"name\": \"Comb"),
        ])]));
        let runner = SynthesisRunner::new(provider, db.clone(), RunnerConfig::default(), tx);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = runner
            .run(request(&project_id, &brainstorm, AssemblyMode::UpdateContext), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.output.status, SynthesisStatus::Failed);
        assert_eq!(outcome.error.as_ref().unwrap().kind, "cancelled");
        assert!(outcome.output.content.contains("Comb"));
        let stored = OutputRepo::new(db).get(&outcome.output.id).unwrap();
        assert_eq!(stored.status, SynthesisStatus::Failed);
    }

    #[tokio::test]
    async fn unparseable_reply_still_completes() {
        let (db, project_id, brainstorm) = setup();
        let (tx, _rx) = broadcast::channel(64);
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("I could not find any systems.")]));
        let runner = SynthesisRunner::new(provider, db, RunnerConfig::default(), tx);

        let outcome = runner
            .run(request(&project_id, &brainstorm, AssemblyMode::UpdateContext), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.tier, ParseTier::None);
        assert!(outcome.output.extracted_systems.is_empty());
        assert_eq!(outcome.output.content, "I could not find any systems.");
    }
}
