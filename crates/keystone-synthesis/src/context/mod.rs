//! Project state rendered for prompting: full snapshots and deltas.

mod delta;

pub use delta::{compute_delta, ChangeRecord};

use tracing::{debug, instrument};

use keystone_core::ids::{ProjectId, SnapshotId};
use keystone_core::models::{BrainstormSession, BrainstormSummary, ContextSnapshot, SnapshotContent};
use keystone_store::{BrainstormRepo, Database, DependencyRepo, ProjectRepo, SnapshotRepo, SystemRepo};

use crate::error::SynthesisError;

/// Characters of brainstorm content kept in a summary excerpt.
pub const EXCERPT_CHARS: usize = 280;

/// Reads project state and turns it into snapshot content or change records.
/// Pure reads; nothing is written.
#[derive(Clone)]
pub struct ContextBuilder {
    db: Database,
}

impl ContextBuilder {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current state of a project: systems sorted by slug, dependencies
    /// resolved to slugs, brainstorm summaries oldest first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn build_full_context(&self, project_id: &ProjectId) -> Result<SnapshotContent, SynthesisError> {
        ProjectRepo::new(self.db.clone()).get(project_id)?;

        let systems = SystemRepo::new(self.db.clone())
            .list_for_project(project_id)?
            .iter()
            .map(|s| s.summary())
            .collect();
        let dependencies = DependencyRepo::new(self.db.clone()).list_summaries(project_id)?;
        let brainstorms = BrainstormRepo::new(self.db.clone())
            .list_for_project(project_id)?
            .iter()
            .map(summarize_brainstorm)
            .collect();

        Ok(SnapshotContent {
            systems,
            dependencies,
            brainstorms,
        })
    }

    /// Changes since `snapshot` was taken. The snapshot must belong to the
    /// project.
    #[instrument(skip(self, snapshot), fields(project_id = %project_id, snapshot_id = %snapshot.id))]
    pub fn build_delta_since_snapshot(
        &self,
        project_id: &ProjectId,
        snapshot: &ContextSnapshot,
    ) -> Result<Vec<ChangeRecord>, SynthesisError> {
        ProjectRepo::new(self.db.clone()).get(project_id)?;
        if &snapshot.project_id != project_id {
            return Err(SynthesisError::NotFound(format!(
                "snapshot {} in project {project_id}",
                snapshot.id
            )));
        }

        let systems = SystemRepo::new(self.db.clone()).list_for_project(project_id)?;
        let dependencies = DependencyRepo::new(self.db.clone()).list_for_project(project_id)?;
        let brainstorms = BrainstormRepo::new(self.db.clone()).list_for_project(project_id)?;

        let changes = compute_delta(snapshot, &systems, &dependencies, &brainstorms);
        debug!(changes = changes.len(), "delta computed");
        Ok(changes)
    }

    /// Same as [`Self::build_delta_since_snapshot`], loading the snapshot by id.
    pub fn build_delta_since_snapshot_id(
        &self,
        project_id: &ProjectId,
        snapshot_id: &SnapshotId,
    ) -> Result<Vec<ChangeRecord>, SynthesisError> {
        let snapshot = SnapshotRepo::new(self.db.clone()).get(snapshot_id)?;
        self.build_delta_since_snapshot(project_id, &snapshot)
    }
}

pub fn summarize_brainstorm(session: &BrainstormSession) -> BrainstormSummary {
    BrainstormSummary {
        id: session.id.clone(),
        title: session.title.clone(),
        source: session.source,
        created_at: session.created_at.clone(),
        excerpt: excerpt(&session.content),
    }
}

pub fn excerpt(content: &str) -> String {
    content.chars().take(EXCERPT_CHARS).collect()
}
