//! Prompt assembly: project context, delta and brainstorm text rendered into
//! one bounded prompt. Output depends only on the inputs.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use keystone_core::ids::BrainstormId;
use keystone_core::models::{BrainstormSession, BrainstormSummary, ConversationMessage, SnapshotContent};

use crate::context::ChangeRecord;

/// Default character budget for the project-context section.
pub const DEFAULT_CONTEXT_BUDGET: usize = 48_000;

/// Instructions sent as the system prompt for every synthesis call.
pub const SYSTEM_PROMPT: &str = "You are a game design assistant for a documentation-first planning tool. \
You read raw brainstorm notes and turn them into structured game systems.\n\n\
Respond with a single JSON object and nothing else. Use exactly these keys:\n\
- \"extractedSystems\": systems clearly described by the brainstorm. Each item: \
{\"name\": string, \"systemSlug\"?: string, \"purpose\"?: string, \"version\"?: string, \
\"mvpCriticality\"?: \"core\" | \"important\" | \"nice_to_have\", \"dependencies\"?: [systemSlug]}\n\
- \"extractedSystemDetails\": mechanics, rules or specs that belong to a system. Each item: \
{\"name\": string, \"detailType\"?: string, \"spec\"?: string, \"targetSystemSlug\"?: string}\n\
- \"suggestedSystems\" (optional): systems the notes imply but do not describe, same shape as extractedSystems.\n\
- \"suggestedSystemDetails\" (optional): same shape as extractedSystemDetails.\n\n\
Reuse the slugs of existing systems when referring to them. Do not repeat systems that already exist \
unless the brainstorm changes them.";

/// How much project context a prompt carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyMode {
    /// Latest snapshot plus the changes since it.
    #[default]
    Rerun,
    /// Full context rebuilt from current state.
    UpdateContext,
}

impl AssemblyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rerun => "rerun",
            Self::UpdateContext => "update_context",
        }
    }
}

impl std::fmt::Display for AssemblyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssemblyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rerun" => Ok(Self::Rerun),
            "update_context" => Ok(Self::UpdateContext),
            other => Err(format!("unknown assembly mode: {other}")),
        }
    }
}

/// Size policy for the context section. The new brainstorm text is never
/// counted against it and never truncated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PromptBudget {
    pub max_context_chars: usize,
}

impl Default for PromptBudget {
    fn default() -> Self {
        Self {
            max_context_chars: DEFAULT_CONTEXT_BUDGET,
        }
    }
}

/// Everything a synthesis prompt is built from.
#[derive(Clone, Copy, Debug)]
pub struct PromptInput<'a> {
    pub mode: AssemblyMode,
    pub context: &'a SnapshotContent,
    pub delta: &'a [ChangeRecord],
    pub brainstorm: &'a BrainstormSession,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssembledPrompt {
    pub mode: AssemblyMode,
    pub system: String,
    pub user: String,
    /// Oldest brainstorm summaries dropped to fit the budget.
    pub history_dropped: usize,
    /// Sections cut with a truncation marker.
    pub truncated_sections: Vec<String>,
}

impl AssembledPrompt {
    pub fn total_chars(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }
}

#[derive(Clone, Debug, Default)]
pub struct PromptAssembler {
    budget: PromptBudget,
}

struct Section {
    title: &'static str,
    body: String,
}

impl Section {
    fn render(&self) -> String {
        format!("### {}\n{}\n", self.title, self.body)
    }
}

impl PromptAssembler {
    pub fn new(budget: PromptBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> PromptBudget {
        self.budget
    }

    pub fn assemble(&self, input: PromptInput<'_>) -> AssembledPrompt {
        let current = &input.brainstorm.id;

        let mut sections = vec![
            Section {
                title: "Existing systems",
                body: render_systems(input.context),
            },
            Section {
                title: "Dependencies",
                body: render_dependencies(input.context),
            },
        ];
        if input.mode == AssemblyMode::Rerun {
            let delta = render_delta(input.delta, current);
            if !delta.is_empty() {
                sections.push(Section {
                    title: "Changes since last snapshot",
                    body: delta,
                });
            }
        }

        let mut history: Vec<String> = input
            .context
            .brainstorms
            .iter()
            .filter(|b| &b.id != current)
            .map(render_history_entry)
            .collect();

        let fixed: usize = sections.iter().map(|s| s.render().chars().count()).sum();
        let history_len = |entries: &[String]| -> usize {
            if entries.is_empty() {
                0
            } else {
                history_header().chars().count() + entries.iter().map(|e| e.chars().count()).sum::<usize>()
            }
        };

        let mut history_dropped = 0;
        while !history.is_empty() && fixed + history_len(&history) > self.budget.max_context_chars {
            history.remove(0);
            history_dropped += 1;
        }
        if !history.is_empty() {
            sections.push(Section {
                title: "Brainstorm history",
                body: history.concat().trim_end().to_string(),
            });
        }

        let mut remaining = self.budget.max_context_chars;
        let mut truncated_sections = Vec::new();
        let mut context = String::new();
        for section in &sections {
            let rendered = section.render();
            let len = rendered.chars().count();
            if len <= remaining {
                remaining -= len;
                context.push_str(&rendered);
                continue;
            }
            if let Some(cut) = truncate_to_fit(&rendered, remaining) {
                context.push_str(&cut);
            }
            remaining = 0;
            truncated_sections.push(section.title.to_string());
        }

        let mut user = String::new();
        let _ = writeln!(user, "## Mode: {}", input.mode);
        let _ = writeln!(user);
        let _ = writeln!(user, "## Project context");
        user.push_str(&context);
        let _ = writeln!(user);
        let _ = writeln!(user, "## New brainstorm: {}", input.brainstorm.title);
        let _ = writeln!(user, "{}", input.brainstorm.content);
        let _ = writeln!(user);
        let _ = writeln!(user, "## Task");
        let _ = write!(
            user,
            "Extract game systems and system details from the new brainstorm, taking the project context into account. \
             Reply with the JSON object described in your instructions."
        );

        AssembledPrompt {
            mode: input.mode,
            system: SYSTEM_PROMPT.to_string(),
            user,
            history_dropped,
            truncated_sections,
        }
    }
}

fn history_header() -> String {
    Section {
        title: "Brainstorm history",
        body: String::new(),
    }
    .render()
}

fn render_systems(content: &SnapshotContent) -> String {
    if content.systems.is_empty() {
        return "(none)".to_string();
    }
    let mut out = String::new();
    for s in &content.systems {
        let _ = write!(
            out,
            "- {} ({}) [{}, {}, {}]",
            s.name, s.slug, s.status, s.mvp_criticality, s.version
        );
        if let Some(purpose) = &s.purpose {
            let _ = write!(out, ": {purpose}");
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn render_dependencies(content: &SnapshotContent) -> String {
    if content.dependencies.is_empty() {
        return "(none)".to_string();
    }
    content
        .dependencies
        .iter()
        .map(|d| format!("- {} -[{}]-> {}", d.source_slug, d.dependency_type, d.target_slug))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_delta(delta: &[ChangeRecord], current: &BrainstormId) -> String {
    delta
        .iter()
        .filter(|c| !matches!(c, ChangeRecord::BrainstormAdded { brainstorm_id, .. } if brainstorm_id == current))
        .map(|c| c.describe())
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_history_entry(summary: &BrainstormSummary) -> String {
    format!(
        "- [{}] {} ({}): {}\n",
        summary.created_at, summary.title, summary.source, summary.excerpt
    )
}

/// Render conversation turns oldest first as `role: content` blocks.
pub fn render_conversation(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Cut `text` to at most `max_chars` characters and append a marker with the
/// original and kept sizes. Text within the limit is returned unchanged.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n[truncated: {total} chars -> {max_chars} chars]")
}

/// Truncated `text` plus marker and trailing newline, at most `budget`
/// characters in total. `None` when not even the marker fits.
fn truncate_to_fit(text: &str, budget: usize) -> Option<String> {
    let total = text.chars().count();
    let overhead = format!("\n[truncated: {total} chars -> {budget} chars]\n").chars().count();
    let keep = budget.checked_sub(overhead).filter(|&k| k > 0)?;
    let mut cut = truncate_chars(text, keep);
    cut.push('\n');
    Some(cut)
}
