use tracing::{info, instrument};

use keystone_core::ids::ProjectId;
use keystone_core::models::{ContextSnapshot, SnapshotContent, SnapshotTrigger};
use keystone_store::{Database, SnapshotLinks, SnapshotRepo};

use crate::context::ContextBuilder;
use crate::error::SynthesisError;

/// Append-only snapshot recording on top of the store, with a one-step
/// `capture` that builds the full context first.
#[derive(Clone)]
pub struct SnapshotService {
    db: Database,
    builder: ContextBuilder,
}

impl SnapshotService {
    pub fn new(db: Database) -> Self {
        Self {
            builder: ContextBuilder::new(db.clone()),
            db,
        }
    }

    #[instrument(skip(self, content, links), fields(project_id = %project_id, trigger = %trigger))]
    pub fn record(
        &self,
        project_id: &ProjectId,
        trigger: SnapshotTrigger,
        content: &SnapshotContent,
        links: SnapshotLinks,
    ) -> Result<ContextSnapshot, SynthesisError> {
        let snapshot = SnapshotRepo::new(self.db.clone()).create(project_id, trigger, content, links)?;
        info!(
            snapshot_id = %snapshot.id,
            systems = snapshot.content.systems.len(),
            "snapshot recorded"
        );
        Ok(snapshot)
    }

    pub fn latest(&self, project_id: &ProjectId) -> Result<Option<ContextSnapshot>, SynthesisError> {
        Ok(SnapshotRepo::new(self.db.clone()).latest(project_id)?)
    }

    /// Build the full context now and record it.
    pub fn capture(
        &self,
        project_id: &ProjectId,
        trigger: SnapshotTrigger,
        links: SnapshotLinks,
    ) -> Result<ContextSnapshot, SynthesisError> {
        let content = self.builder.build_full_context(project_id)?;
        self.record(project_id, trigger, &content, links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::models::NewSystem;
    use keystone_store::{ProjectRepo, SystemRepo};

    #[test]
    fn capture_then_latest() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        SystemRepo::new(db.clone())
            .create(
                &project.id,
                NewSystem { name: "Combat".into(), slug: "combat".into(), ..Default::default() },
            )
            .unwrap();

        let service = SnapshotService::new(db);
        assert!(service.latest(&project.id).unwrap().is_none());

        let first = service
            .capture(&project.id, SnapshotTrigger::Initial, SnapshotLinks::default())
            .unwrap();
        assert_eq!(first.content.systems.len(), 1);

        let second = service
            .record(&project.id, SnapshotTrigger::Manual, &SnapshotContent::default(), SnapshotLinks::default())
            .unwrap();
        let latest = service.latest(&project.id).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(latest.content.systems.is_empty());
    }

    #[test]
    fn capture_missing_project_is_not_found() {
        let service = SnapshotService::new(Database::in_memory().unwrap());
        let err = service
            .capture(&ProjectId::from_raw("proj_none"), SnapshotTrigger::Manual, SnapshotLinks::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
