use tracing::instrument;

use keystone_core::ids::{BrainstormId, ProjectId};
use keystone_core::models::{BrainstormSession, BrainstormSource, NewBrainstorm};

use crate::database::Database;
use crate::error::StoreError;
use crate::projects;
use crate::row_helpers;

const COLUMNS: &str =
    "id, project_id, title, source, content, author, tags, source_thread_refs, created_at";

/// Brainstorm sessions are immutable once captured; there is no update call.
pub struct BrainstormRepo {
    db: Database,
}

impl BrainstormRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(project_id = %project_id, title = %new.title))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        new: NewBrainstorm,
    ) -> Result<BrainstormSession, StoreError> {
        self.db.with_conn(|conn| {
            projects::get(conn, project_id)?;

            let session = BrainstormSession {
                id: BrainstormId::new(),
                project_id: project_id.clone(),
                title: new.title,
                source: new.source.unwrap_or(BrainstormSource::Manual),
                content: new.content,
                author: new.author,
                tags: new.tags,
                source_thread_refs: new.source_thread_refs,
                created_at: row_helpers::now_timestamp(),
            };
            conn.execute(
                &format!("INSERT INTO brainstorm_sessions ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                rusqlite::params![
                    session.id.as_str(),
                    session.project_id.as_str(),
                    session.title,
                    session.source.as_str(),
                    session.content,
                    session.author,
                    serde_json::to_string(&session.tags)?,
                    serde_json::to_string(&session.source_thread_refs)?,
                    session.created_at,
                ],
            )?;
            Ok(session)
        })
    }

    #[instrument(skip(self), fields(brainstorm_id = %id))]
    pub fn get(&self, id: &BrainstormId) -> Result<BrainstormSession, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM brainstorm_sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_brainstorm(row),
                None => Err(StoreError::NotFound(format!("brainstorm {id}"))),
            }
        })
    }

    /// All sessions for a project, oldest first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list_for_project(&self, project_id: &ProjectId) -> Result<Vec<BrainstormSession>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM brainstorm_sessions WHERE project_id = ?1 ORDER BY created_at, rowid"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_brainstorm(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_brainstorm(row: &rusqlite::Row<'_>) -> Result<BrainstormSession, StoreError> {
    const T: &str = "brainstorm_sessions";
    let source: String = row_helpers::get(row, 3, T, "source")?;
    let tags: String = row_helpers::get(row, 6, T, "tags")?;
    let refs: String = row_helpers::get(row, 7, T, "source_thread_refs")?;

    Ok(BrainstormSession {
        id: BrainstormId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        title: row_helpers::get(row, 2, T, "title")?,
        source: row_helpers::parse_enum(&source, T, "source")?,
        content: row_helpers::get(row, 4, T, "content")?,
        author: row_helpers::get_opt(row, 5, T, "author")?,
        tags: row_helpers::parse_json(&tags, T, "tags")?,
        source_thread_refs: row_helpers::parse_json(&refs, T, "source_thread_refs")?,
        created_at: row_helpers::get(row, 8, T, "created_at")?,
    })
}
