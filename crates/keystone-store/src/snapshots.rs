use rusqlite::Connection;
use tracing::instrument;

use keystone_core::ids::{BrainstormId, OutputId, ProjectId, SnapshotId};
use keystone_core::models::{ContextSnapshot, SnapshotContent, SnapshotTrigger};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str =
    "id, project_id, trigger_kind, content, synthesized_output_id, brainstorm_id, created_at";

/// Optional provenance for a snapshot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotLinks {
    pub synthesized_output_id: Option<OutputId>,
    pub brainstorm_id: Option<BrainstormId>,
}

/// Append-only store of context snapshots. Newest wins; rows are never updated.
pub struct SnapshotRepo {
    db: Database,
}

impl SnapshotRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content, links), fields(project_id = %project_id, trigger = %trigger))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        trigger: SnapshotTrigger,
        content: &SnapshotContent,
        links: SnapshotLinks,
    ) -> Result<ContextSnapshot, StoreError> {
        self.db
            .with_conn(|conn| insert(conn, project_id, trigger, content, links))
    }

    #[instrument(skip(self), fields(snapshot_id = %id))]
    pub fn get(&self, id: &SnapshotId) -> Result<ContextSnapshot, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM context_snapshots WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_snapshot(row),
                None => Err(StoreError::NotFound(format!("snapshot {id}"))),
            }
        })
    }

    /// Most recent snapshot for a project; ties on `created_at` go to the
    /// later insert.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn latest(&self, project_id: &ProjectId) -> Result<Option<ContextSnapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM context_snapshots WHERE project_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_snapshot(row)?)),
                None => Ok(None),
            }
        })
    }

    /// All snapshots for a project, newest first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list(&self, project_id: &ProjectId) -> Result<Vec<ContextSnapshot>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM context_snapshots WHERE project_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_snapshot(row)?);
            }
            Ok(results)
        })
    }
}

pub fn insert(
    conn: &Connection,
    project_id: &ProjectId,
    trigger: SnapshotTrigger,
    content: &SnapshotContent,
    links: SnapshotLinks,
) -> Result<ContextSnapshot, StoreError> {
    let snapshot = ContextSnapshot {
        id: SnapshotId::new(),
        project_id: project_id.clone(),
        trigger,
        content: content.clone(),
        synthesized_output_id: links.synthesized_output_id,
        brainstorm_id: links.brainstorm_id,
        created_at: row_helpers::now_timestamp(),
    };
    conn.execute(
        &format!("INSERT INTO context_snapshots ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        rusqlite::params![
            snapshot.id.as_str(),
            snapshot.project_id.as_str(),
            snapshot.trigger.as_str(),
            serde_json::to_string(&snapshot.content)?,
            snapshot.synthesized_output_id.as_ref().map(|id| id.as_str()),
            snapshot.brainstorm_id.as_ref().map(|id| id.as_str()),
            snapshot.created_at,
        ],
    )?;
    Ok(snapshot)
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<ContextSnapshot, StoreError> {
    const T: &str = "context_snapshots";
    let trigger: String = row_helpers::get(row, 2, T, "trigger_kind")?;
    let content: String = row_helpers::get(row, 3, T, "content")?;

    Ok(ContextSnapshot {
        id: SnapshotId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        trigger: row_helpers::parse_enum(&trigger, T, "trigger_kind")?,
        content: row_helpers::parse_json(&content, T, "content")?,
        synthesized_output_id: row_helpers::get_opt::<String>(row, 4, T, "synthesized_output_id")?
            .map(OutputId::from_raw),
        brainstorm_id: row_helpers::get_opt::<String>(row, 5, T, "brainstorm_id")?
            .map(BrainstormId::from_raw),
        created_at: row_helpers::get(row, 6, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use keystone_core::ids::SystemId;
    use keystone_core::models::{Criticality, SystemStatus, SystemSummary};

    fn setup() -> (SnapshotRepo, ProjectId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        (SnapshotRepo::new(db), project.id)
    }

    fn content_with(slug: &str) -> SnapshotContent {
        SnapshotContent {
            systems: vec![SystemSummary {
                id: SystemId::new(),
                slug: slug.into(),
                name: slug.into(),
                purpose: None,
                version: "v0.1".into(),
                status: SystemStatus::Draft,
                mvp_criticality: Criticality::Important,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn latest_is_none_without_snapshots() {
        let (repo, project_id) = setup();
        assert!(repo.latest(&project_id).unwrap().is_none());
    }

    #[test]
    fn latest_returns_newest() {
        let (repo, project_id) = setup();
        repo.create(&project_id, SnapshotTrigger::Initial, &content_with("a"), SnapshotLinks::default())
            .unwrap();
        let second = repo
            .create(&project_id, SnapshotTrigger::Manual, &content_with("b"), SnapshotLinks::default())
            .unwrap();

        let latest = repo.latest(&project_id).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.content.systems[0].slug, "b");
        assert_eq!(repo.list(&project_id).unwrap().len(), 2);
    }

    #[test]
    fn content_and_links_round_trip() {
        let (repo, project_id) = setup();
        let output_id = OutputId::new();
        let snapshot = repo
            .create(
                &project_id,
                SnapshotTrigger::Synthesis,
                &content_with("combat"),
                SnapshotLinks {
                    synthesized_output_id: Some(output_id.clone()),
                    brainstorm_id: None,
                },
            )
            .unwrap();
        let fetched = repo.get(&snapshot.id).unwrap();
        assert_eq!(fetched, snapshot);
        assert_eq!(fetched.synthesized_output_id, Some(output_id));
    }

    #[test]
    fn get_missing_is_not_found() {
        let (repo, _) = setup();
        assert!(repo.get(&SnapshotId::from_raw("snap_x")).unwrap_err().is_not_found());
    }
}
