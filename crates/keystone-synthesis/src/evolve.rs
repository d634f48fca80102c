//! Conversational editing of one persisted system.
//!
//! The model answers in prose and may embed `{"updates": {...}}`. Recognised
//! fields are applied to the system; the slug is never changed.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use keystone_core::errors::ProviderError;
use keystone_core::ids::SystemId;
use keystone_core::models::{
    ConversationMessage, Criticality, Dependency, GameSystem, MessageRole, SystemDetail, SystemStatus,
    SystemUpdate,
};
use keystone_core::provider::{CompletionOptions, CompletionProvider};
use keystone_store::{ConversationRepo, Database, DependencyRepo, SystemRepo};

use crate::error::SynthesisError;
use crate::parse::extract_json_object;
use crate::prompt::render_conversation;
use crate::runner::stream_reply;

pub const EVOLVE_SYSTEM_PROMPT: &str = "You help a game designer evolve one game system. \
Answer conversationally. When the designer asks for a change to the system itself, end your reply \
with a JSON object of the form {\"updates\": {...}} containing only the fields to change. \
Allowed fields: name, purpose, version, status (draft | active | deprecated), \
mvpCriticality (core | important | nice_to_have), description, mechanics, notes. \
Omit the JSON object when nothing should change.";

#[derive(Clone, Debug)]
pub struct EvolveOutcome {
    pub system: GameSystem,
    pub reply: ConversationMessage,
    pub applied: SystemUpdate,
}

/// Recognised updates from a model reply. Anything unrecognised, blank, or
/// of the wrong type is ignored.
pub fn parse_updates(raw: &str) -> SystemUpdate {
    let Some(object) = extract_json_object(raw) else {
        return SystemUpdate::default();
    };
    let Some(Value::Object(updates)) = object.get("updates") else {
        return SystemUpdate::default();
    };

    let text = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| updates.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let update = SystemUpdate {
        name: text(&["name"]),
        purpose: text(&["purpose"]),
        version: text(&["version"]),
        status: text(&["status"]).and_then(|s| SystemStatus::parse_loose(&s)),
        mvp_criticality: text(&["mvpCriticality", "mvp_criticality"]).and_then(|s| Criticality::parse_loose(&s)),
        description: text(&["description"]),
        mechanics: text(&["mechanics"]),
        notes: text(&["notes"]),
    };
    log_ignored(updates);
    update
}

fn log_ignored(updates: &Map<String, Value>) {
    const KNOWN: &[&str] = &[
        "name",
        "purpose",
        "version",
        "status",
        "mvpCriticality",
        "mvp_criticality",
        "description",
        "mechanics",
        "notes",
    ];
    for key in updates.keys().filter(|k| !KNOWN.contains(&k.as_str())) {
        debug!(field = %key, "ignoring unknown update field");
    }
}

pub struct EvolveSession {
    provider: Arc<dyn CompletionProvider>,
    db: Database,
    options: CompletionOptions,
}

impl EvolveSession {
    pub fn new(provider: Arc<dyn CompletionProvider>, db: Database, options: CompletionOptions) -> Self {
        Self { provider, db, options }
    }

    #[instrument(skip(self, message, cancel), fields(system_id = %system_id))]
    pub async fn evolve(
        &self,
        system_id: &SystemId,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<EvolveOutcome, SynthesisError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SynthesisError::InvalidInput("evolve message is empty".into()));
        }

        let systems = SystemRepo::new(self.db.clone());
        let system = systems.get(system_id)?;
        let details = systems.list_details(system_id)?;
        let edges = DependencyRepo::new(self.db.clone()).list_for_system(system_id)?;
        let slugs: HashMap<SystemId, String> = systems
            .list_for_project(&system.project_id)?
            .into_iter()
            .map(|s| (s.id, s.slug))
            .collect();

        let conversations = ConversationRepo::new(self.db.clone());
        conversations.append_evolve_message(system_id, MessageRole::User, message)?;
        let history = conversations.evolve_history(system_id)?;

        let prompt = render_evolve_prompt(&system, &details, &edges, &slugs, &history);
        let options = self.options.clone().with_system(EVOLVE_SYSTEM_PROMPT);
        let reply = stream_reply(self.provider.as_ref(), &prompt, &options, cancel, |_| {}).await;
        match reply.failure {
            Some(ProviderError::Cancelled) => return Err(SynthesisError::Cancelled),
            Some(e) => return Err(e.into()),
            None => {}
        }

        let applied = parse_updates(&reply.raw);
        let system = if applied.is_empty() {
            system
        } else {
            systems.update(system_id, &applied)?
        };
        let reply_message = conversations.append_evolve_message(system_id, MessageRole::Assistant, &reply.raw)?;

        info!(changed = !applied.is_empty(), "evolve turn recorded");
        Ok(EvolveOutcome {
            system,
            reply: reply_message,
            applied,
        })
    }
}

pub fn render_evolve_prompt(
    system: &GameSystem,
    details: &[SystemDetail],
    edges: &[Dependency],
    slugs: &HashMap<SystemId, String>,
    history: &[ConversationMessage],
) -> String {
    let slug_of = |id: &SystemId| slugs.get(id).cloned().unwrap_or_else(|| id.to_string());
    let mut out = String::new();

    let _ = writeln!(out, "## System: {} ({})", system.name, system.slug);
    let _ = writeln!(out, "- version: {}", system.version);
    let _ = writeln!(out, "- status: {}", system.status);
    let _ = writeln!(out, "- mvpCriticality: {}", system.mvp_criticality);
    for (label, value) in [
        ("purpose", &system.purpose),
        ("description", &system.description),
        ("mechanics", &system.mechanics),
        ("notes", &system.notes),
    ] {
        if let Some(value) = value {
            let _ = writeln!(out, "- {label}: {value}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Details");
    if details.is_empty() {
        let _ = writeln!(out, "(none)");
    }
    for d in details {
        let _ = write!(out, "- {} [{}]", d.name, d.detail_type);
        if let Some(spec) = &d.spec {
            let _ = write!(out, ": {spec}");
        }
        out.push('\n');
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Dependencies");
    if edges.is_empty() {
        let _ = writeln!(out, "(none)");
    }
    for e in edges {
        let direction = if e.source_system_id == system.id { "outgoing" } else { "incoming" };
        let _ = writeln!(
            out,
            "- {direction}: {} -[{}]-> {}",
            slug_of(&e.source_system_id),
            e.dependency_type,
            slug_of(&e.target_system_id)
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Conversation");
    let _ = write!(out, "{}", render_conversation(history));
    out
}
