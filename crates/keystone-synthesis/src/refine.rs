use std::fmt::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use keystone_core::errors::ProviderError;
use keystone_core::ids::OutputId;
use keystone_core::models::{BrainstormSession, ConversationMessage, MessageRole, SynthesizedOutput};
use keystone_core::provider::{CompletionOptions, CompletionProvider};
use keystone_store::{BrainstormRepo, CandidateSet, ConversationRepo, Database, OutputRepo};

use crate::error::SynthesisError;
use crate::parse::{parse_response, ParseTier};
use crate::prompt::{render_conversation, SYSTEM_PROMPT};
use crate::runner::stream_reply;

#[derive(Clone, Debug)]
pub struct RefinementOutcome {
    pub output: SynthesizedOutput,
    pub reply: ConversationMessage,
    pub tier: ParseTier,
    /// False when nothing was recovered from the reply and the previous
    /// candidate lists were kept.
    pub replaced: bool,
}

/// Follow-up turns on a synthesized output. Each turn re-asks the model for
/// the full candidate JSON; the output's raw content is never touched.
pub struct RefinementSession {
    provider: Arc<dyn CompletionProvider>,
    db: Database,
    options: CompletionOptions,
}

impl RefinementSession {
    pub fn new(provider: Arc<dyn CompletionProvider>, db: Database, options: CompletionOptions) -> Self {
        Self { provider, db, options }
    }

    #[instrument(skip(self, message, cancel), fields(output_id = %output_id))]
    pub async fn refine(
        &self,
        output_id: &OutputId,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<RefinementOutcome, SynthesisError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SynthesisError::InvalidInput("refinement message is empty".into()));
        }

        let outputs = OutputRepo::new(self.db.clone());
        let output = outputs.get(output_id)?;
        let brainstorm = match &output.brainstorm_id {
            Some(id) => Some(BrainstormRepo::new(self.db.clone()).get(id)?),
            None => None,
        };

        let conversations = ConversationRepo::new(self.db.clone());
        conversations.append_synthesis_message(output_id, MessageRole::User, message)?;
        let history = conversations.synthesis_history(output_id)?;

        let prompt = render_refinement_prompt(brainstorm.as_ref(), &output, &history)?;
        let options = self.options.clone().with_system(SYSTEM_PROMPT);
        let reply = stream_reply(self.provider.as_ref(), &prompt, &options, cancel, |_| {}).await;
        match reply.failure {
            Some(ProviderError::Cancelled) => return Err(SynthesisError::Cancelled),
            Some(e) => return Err(e.into()),
            None => {}
        }

        let parsed = parse_response(&reply.raw);
        let replaced = !parsed.candidates.is_empty();
        let output = if replaced {
            outputs.update_candidates(output_id, &parsed.candidates)?
        } else {
            output
        };
        let reply_message =
            conversations.append_synthesis_message(output_id, MessageRole::Assistant, &reply.raw)?;

        info!(tier = %parsed.tier, replaced, "refinement turn recorded");
        Ok(RefinementOutcome {
            output,
            reply: reply_message,
            tier: parsed.tier,
            replaced,
        })
    }
}

/// Prompt for a refinement turn: the original brainstorm, the current
/// candidate lists and the conversation so far, newest turn last.
pub fn render_refinement_prompt(
    brainstorm: Option<&BrainstormSession>,
    output: &SynthesizedOutput,
    history: &[ConversationMessage],
) -> Result<String, SynthesisError> {
    let current = CandidateSet::from_output(output);
    let candidates = serde_json::json!({
        "extractedSystems": current.extracted_systems,
        "extractedSystemDetails": current.extracted_system_details,
        "suggestedSystems": current.suggested_systems,
        "suggestedSystemDetails": current.suggested_system_details,
    });

    let mut prompt = String::new();
    if let Some(b) = brainstorm {
        let _ = writeln!(prompt, "## Original brainstorm: {}", b.title);
        let _ = writeln!(prompt, "{}", b.content);
        let _ = writeln!(prompt);
    }
    let _ = writeln!(prompt, "## Current candidates");
    let _ = writeln!(prompt, "{}", serde_json::to_string_pretty(&candidates)?);
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Conversation");
    let _ = writeln!(prompt, "{}", render_conversation(history));
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "## Task");
    let _ = write!(
        prompt,
        "Revise the candidates according to the conversation. Reply with the complete JSON object \
         described in your instructions, including candidates that did not change."
    );
    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::candidates::SystemCandidate;
    use keystone_core::models::{NewBrainstorm, SynthesisStatus};
    use keystone_core::tokens::TokenUsage;
    use keystone_llm::mock::{MockProvider, MockResponse};
    use keystone_store::{NewOutput, ProjectRepo};

    fn setup() -> (Database, SynthesizedOutput) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        let brainstorm = BrainstormRepo::new(db.clone())
            .create(
                &project.id,
                NewBrainstorm {
                    title: "Fights".into(),
                    content: "Melee and ranged combat.".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let output = OutputRepo::new(db.clone())
            .create(NewOutput {
                project_id: project.id,
                brainstorm_id: Some(brainstorm.id),
                content: "original raw".into(),
                candidates: CandidateSet {
                    extracted_systems: vec![SystemCandidate::named("Combat")],
                    ..Default::default()
                },
                status: SynthesisStatus::Completed,
                error_message: None,
                provider: "mock".into(),
                model: "mock-model".into(),
                usage: TokenUsage::default(),
            })
            .unwrap();
        (db, output)
    }

    #[tokio::test]
    async fn reply_with_candidates_replaces_lists() {
        let (db, output) = setup();
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text(
            r#"{"extractedSystems":[{"name":"Melee"},{"name":"Ranged"}],"extractedSystemDetails":[]}"#,
        )]));
        let session = RefinementSession::new(provider.clone(), db.clone(), CompletionOptions::default());

        let outcome = session
            .refine(&output.id, "Split combat into melee and ranged", &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.replaced);
        assert_eq!(outcome.tier, ParseTier::Direct);
        assert_eq!(outcome.output.extracted_systems.len(), 2);
        assert_eq!(outcome.output.content, "original raw");

        let prompt = provider.last_prompt().unwrap();
        assert!(prompt.contains("Melee and ranged combat."));
        assert!(prompt.contains("\"Combat\""));
        assert!(prompt.contains("user: Split combat into melee and ranged"));

        let history = ConversationRepo::new(db).synthesis_history(&output.id).unwrap();
        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    }

    #[tokio::test]
    async fn unparseable_reply_keeps_previous_lists() {
        let (db, output) = setup();
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("Could you clarify?")]));
        let session = RefinementSession::new(provider, db.clone(), CompletionOptions::default());

        let outcome = session
            .refine(&output.id, "Make it better", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.replaced);
        assert_eq!(outcome.output.extracted_systems[0].name, "Combat");
        assert_eq!(outcome.reply.content, "Could you clarify?");
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (db, output) = setup();
        let provider = Arc::new(MockProvider::new(vec![]));
        let session = RefinementSession::new(provider.clone(), db, CompletionOptions::default());
        let err = session
            .refine(&output.id, "   ", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidInput(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn provider_failure_surfaces() {
        let (db, output) = setup();
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Error(ProviderError::RateLimited)]));
        let session = RefinementSession::new(provider, db, CompletionOptions::default());
        let err = session
            .refine(&output.id, "Again", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::Provider(ProviderError::RateLimited)));
    }
}
