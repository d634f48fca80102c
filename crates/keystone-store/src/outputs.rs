use rusqlite::Connection;
use tracing::instrument;

use keystone_core::candidates::{DetailCandidate, SystemCandidate};
use keystone_core::ids::{BrainstormId, OutputId, ProjectId};
use keystone_core::models::{SynthesisStatus, SynthesizedOutput};
use keystone_core::tokens::TokenUsage;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, project_id, brainstorm_id, content, extracted_systems, \
                       extracted_system_details, suggested_systems, suggested_system_details, \
                       status, error_message, provider, model, prompt_tokens, completion_tokens, \
                       created_at, updated_at";

/// Candidate lists parsed from one model reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CandidateSet {
    pub extracted_systems: Vec<SystemCandidate>,
    pub extracted_system_details: Vec<DetailCandidate>,
    pub suggested_systems: Vec<SystemCandidate>,
    pub suggested_system_details: Vec<DetailCandidate>,
}

impl CandidateSet {
    pub fn from_output(output: &SynthesizedOutput) -> Self {
        Self {
            extracted_systems: output.extracted_systems.clone(),
            extracted_system_details: output.extracted_system_details.clone(),
            suggested_systems: output.suggested_systems.clone(),
            suggested_system_details: output.suggested_system_details.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extracted_systems.is_empty()
            && self.extracted_system_details.is_empty()
            && self.suggested_systems.is_empty()
            && self.suggested_system_details.is_empty()
    }
}

/// Fields for recording a finished synthesis run.
#[derive(Clone, Debug)]
pub struct NewOutput {
    pub project_id: ProjectId,
    pub brainstorm_id: Option<BrainstormId>,
    pub content: String,
    pub candidates: CandidateSet,
    pub status: SynthesisStatus,
    pub error_message: Option<String>,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Synthesized outputs. Raw `content` is written once at creation and never
/// updated; later changes only touch candidate lists and status.
pub struct OutputRepo {
    db: Database,
}

impl OutputRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(project_id = %new.project_id, status = %new.status))]
    pub fn create(&self, new: NewOutput) -> Result<SynthesizedOutput, StoreError> {
        self.db.with_conn(|conn| {
            let now = row_helpers::now_timestamp();
            let output = SynthesizedOutput {
                id: OutputId::new(),
                project_id: new.project_id,
                brainstorm_id: new.brainstorm_id,
                content: new.content,
                extracted_systems: new.candidates.extracted_systems,
                extracted_system_details: new.candidates.extracted_system_details,
                suggested_systems: new.candidates.suggested_systems,
                suggested_system_details: new.candidates.suggested_system_details,
                status: new.status,
                error_message: new.error_message,
                provider: new.provider,
                model: new.model,
                usage: new.usage,
                created_at: now.clone(),
                updated_at: now,
            };
            conn.execute(
                &format!(
                    "INSERT INTO synthesized_outputs ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                rusqlite::params![
                    output.id.as_str(),
                    output.project_id.as_str(),
                    output.brainstorm_id.as_ref().map(|id| id.as_str()),
                    output.content,
                    serde_json::to_string(&output.extracted_systems)?,
                    serde_json::to_string(&output.extracted_system_details)?,
                    serde_json::to_string(&output.suggested_systems)?,
                    serde_json::to_string(&output.suggested_system_details)?,
                    output.status.as_str(),
                    output.error_message,
                    output.provider,
                    output.model,
                    output.usage.prompt_tokens,
                    output.usage.completion_tokens,
                    output.created_at,
                    output.updated_at,
                ],
            )?;
            Ok(output)
        })
    }

    #[instrument(skip(self), fields(output_id = %id))]
    pub fn get(&self, id: &OutputId) -> Result<SynthesizedOutput, StoreError> {
        self.db.with_conn(|conn| get(conn, id))
    }

    /// Outputs for a project, newest first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list_for_project(&self, project_id: &ProjectId) -> Result<Vec<SynthesizedOutput>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM synthesized_outputs WHERE project_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_output(row)?);
            }
            Ok(results)
        })
    }

    /// Replace all four candidate lists.
    #[instrument(skip(self, candidates), fields(output_id = %id))]
    pub fn update_candidates(
        &self,
        id: &OutputId,
        candidates: &CandidateSet,
    ) -> Result<SynthesizedOutput, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE synthesized_outputs
                 SET extracted_systems = ?1, extracted_system_details = ?2,
                     suggested_systems = ?3, suggested_system_details = ?4, updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    serde_json::to_string(&candidates.extracted_systems)?,
                    serde_json::to_string(&candidates.extracted_system_details)?,
                    serde_json::to_string(&candidates.suggested_systems)?,
                    serde_json::to_string(&candidates.suggested_system_details)?,
                    row_helpers::now_timestamp(),
                    id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("synthesized output {id}")));
            }
            get(conn, id)
        })
    }

    #[instrument(skip(self), fields(output_id = %id, status = %status))]
    pub fn set_status(&self, id: &OutputId, status: SynthesisStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| set_status(conn, id, status))
    }
}

pub fn get(conn: &Connection, id: &OutputId) -> Result<SynthesizedOutput, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM synthesized_outputs WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_output(row),
        None => Err(StoreError::NotFound(format!("synthesized output {id}"))),
    }
}

pub fn set_status(conn: &Connection, id: &OutputId, status: SynthesisStatus) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE synthesized_outputs SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![status.as_str(), row_helpers::now_timestamp(), id.as_str()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("synthesized output {id}")));
    }
    Ok(())
}

fn row_to_output(row: &rusqlite::Row<'_>) -> Result<SynthesizedOutput, StoreError> {
    const T: &str = "synthesized_outputs";
    let extracted: String = row_helpers::get(row, 4, T, "extracted_systems")?;
    let extracted_details: String = row_helpers::get(row, 5, T, "extracted_system_details")?;
    let suggested: String = row_helpers::get(row, 6, T, "suggested_systems")?;
    let suggested_details: String = row_helpers::get(row, 7, T, "suggested_system_details")?;
    let status: String = row_helpers::get(row, 8, T, "status")?;

    Ok(SynthesizedOutput {
        id: OutputId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        brainstorm_id: row_helpers::get_opt::<String>(row, 2, T, "brainstorm_id")?
            .map(BrainstormId::from_raw),
        content: row_helpers::get(row, 3, T, "content")?,
        extracted_systems: row_helpers::parse_json(&extracted, T, "extracted_systems")?,
        extracted_system_details: row_helpers::parse_json(&extracted_details, T, "extracted_system_details")?,
        suggested_systems: row_helpers::parse_json(&suggested, T, "suggested_systems")?,
        suggested_system_details: row_helpers::parse_json(&suggested_details, T, "suggested_system_details")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        error_message: row_helpers::get_opt(row, 9, T, "error_message")?,
        provider: row_helpers::get(row, 10, T, "provider")?,
        model: row_helpers::get(row, 11, T, "model")?,
        usage: TokenUsage::new(
            row_helpers::get(row, 12, T, "prompt_tokens")?,
            row_helpers::get(row, 13, T, "completion_tokens")?,
        ),
        created_at: row_helpers::get(row, 14, T, "created_at")?,
        updated_at: row_helpers::get(row, 15, T, "updated_at")?,
    })
}
