use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use keystone_core::ids::{DependencyId, ProjectId, SystemId};
use keystone_core::models::{Dependency, DependencySummary, DependencyType};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str =
    "id, project_id, source_system_id, target_system_id, dependency_type, description, created_at";

/// Directed edges between game systems. Cycles are not checked.
pub struct DependencyRepo {
    db: Database,
}

impl DependencyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, description), fields(source = %source, target = %target, kind = %dependency_type))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        source: &SystemId,
        target: &SystemId,
        dependency_type: DependencyType,
        description: Option<&str>,
    ) -> Result<Dependency, StoreError> {
        self.db.with_conn(|conn| {
            insert(conn, project_id, source, target, dependency_type, description)
        })
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list_for_project(&self, project_id: &ProjectId) -> Result<Vec<Dependency>, StoreError> {
        self.db.with_conn(|conn| list_for_project(conn, project_id))
    }

    /// Edges where the system is either endpoint.
    #[instrument(skip(self), fields(system_id = %system_id))]
    pub fn list_for_system(&self, system_id: &SystemId) -> Result<Vec<Dependency>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM dependencies
                 WHERE source_system_id = ?1 OR target_system_id = ?1
                 ORDER BY created_at, rowid"
            ))?;
            let mut rows = stmt.query([system_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_dependency(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list_summaries(&self, project_id: &ProjectId) -> Result<Vec<DependencySummary>, StoreError> {
        self.db.with_conn(|conn| list_summaries(conn, project_id))
    }
}

/// Insert an edge. An identical (source, target, type) triple is a
/// [`StoreError::Conflict`].
pub fn insert(
    conn: &Connection,
    project_id: &ProjectId,
    source: &SystemId,
    target: &SystemId,
    dependency_type: DependencyType,
    description: Option<&str>,
) -> Result<Dependency, StoreError> {
    let dependency = Dependency {
        id: DependencyId::new(),
        project_id: project_id.clone(),
        source_system_id: source.clone(),
        target_system_id: target.clone(),
        dependency_type,
        description: description.map(str::to_string),
        created_at: row_helpers::now_timestamp(),
    };
    conn.execute(
        &format!("INSERT INTO dependencies ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        rusqlite::params![
            dependency.id.as_str(),
            dependency.project_id.as_str(),
            dependency.source_system_id.as_str(),
            dependency.target_system_id.as_str(),
            dependency.dependency_type.as_str(),
            dependency.description,
            dependency.created_at,
        ],
    )
    .map_err(|e| match StoreError::from(e) {
        StoreError::Conflict(_) => StoreError::Conflict(format!(
            "dependency {source} -> {target} ({dependency_type}) already exists"
        )),
        other => other,
    })?;
    Ok(dependency)
}

pub fn exists(
    conn: &Connection,
    source: &SystemId,
    target: &SystemId,
    dependency_type: DependencyType,
) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM dependencies
             WHERE source_system_id = ?1 AND target_system_id = ?2 AND dependency_type = ?3",
            [source.as_str(), target.as_str(), dependency_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn list_for_project(conn: &Connection, project_id: &ProjectId) -> Result<Vec<Dependency>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM dependencies WHERE project_id = ?1 ORDER BY created_at, rowid"
    ))?;
    let mut rows = stmt.query([project_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_dependency(row)?);
    }
    Ok(results)
}

/// Project edges resolved to slugs, sorted by (source slug, target slug, type).
pub fn list_summaries(conn: &Connection, project_id: &ProjectId) -> Result<Vec<DependencySummary>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT d.id, s.slug, t.slug, d.dependency_type
         FROM dependencies d
         JOIN game_systems s ON s.id = d.source_system_id
         JOIN game_systems t ON t.id = d.target_system_id
         WHERE d.project_id = ?1
         ORDER BY s.slug, t.slug, d.dependency_type",
    )?;
    let mut rows = stmt.query([project_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        const T: &str = "dependencies";
        let kind: String = row_helpers::get(row, 3, T, "dependency_type")?;
        results.push(DependencySummary {
            id: DependencyId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
            source_slug: row_helpers::get(row, 1, T, "source_slug")?,
            target_slug: row_helpers::get(row, 2, T, "target_slug")?,
            dependency_type: row_helpers::parse_enum(&kind, T, "dependency_type")?,
        });
    }
    Ok(results)
}

fn row_to_dependency(row: &rusqlite::Row<'_>) -> Result<Dependency, StoreError> {
    const T: &str = "dependencies";
    let kind: String = row_helpers::get(row, 4, T, "dependency_type")?;
    Ok(Dependency {
        id: DependencyId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        source_system_id: SystemId::from_raw(row_helpers::get::<String>(row, 2, T, "source_system_id")?),
        target_system_id: SystemId::from_raw(row_helpers::get::<String>(row, 3, T, "target_system_id")?),
        dependency_type: row_helpers::parse_enum(&kind, T, "dependency_type")?,
        description: row_helpers::get_opt(row, 5, T, "description")?,
        created_at: row_helpers::get(row, 6, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use crate::systems::SystemRepo;
    use keystone_core::models::{GameSystem, NewSystem};

    struct Fixture {
        db: Database,
        project_id: ProjectId,
        combat: GameSystem,
        health: GameSystem,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let project_id = ProjectRepo::new(db.clone()).create("Test", None).unwrap().id;
        let systems = SystemRepo::new(db.clone());
        let mk = |name: &str, slug: &str| NewSystem {
            name: name.into(),
            slug: slug.into(),
            ..Default::default()
        };
        let combat = systems.create(&project_id, mk("Combat", "combat")).unwrap();
        let health = systems.create(&project_id, mk("Health", "health")).unwrap();
        Fixture { db, project_id, combat, health }
    }

    #[test]
    fn create_and_list() {
        let f = setup();
        let repo = DependencyRepo::new(f.db.clone());
        let dep = repo
            .create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Requires, None)
            .unwrap();
        assert!(dep.id.as_str().starts_with("dep_"));

        let all = repo.list_for_project(&f.project_id).unwrap();
        assert_eq!(all, vec![dep]);
    }

    #[test]
    fn identical_triple_conflicts_but_other_type_allowed() {
        let f = setup();
        let repo = DependencyRepo::new(f.db.clone());
        repo.create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Requires, None)
            .unwrap();
        let err = repo
            .create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Requires, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        repo.create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Triggers, None)
            .unwrap();
        assert_eq!(repo.list_for_project(&f.project_id).unwrap().len(), 2);
    }

    #[test]
    fn cycles_are_allowed() {
        let f = setup();
        let repo = DependencyRepo::new(f.db.clone());
        repo.create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Requires, None)
            .unwrap();
        repo.create(&f.project_id, &f.health.id, &f.combat.id, DependencyType::Requires, None)
            .unwrap();
        assert_eq!(repo.list_for_system(&f.combat.id).unwrap().len(), 2);
    }

    #[test]
    fn summaries_resolve_slugs() {
        let f = setup();
        let repo = DependencyRepo::new(f.db.clone());
        repo.create(&f.project_id, &f.health.id, &f.combat.id, DependencyType::Enhances, None)
            .unwrap();
        repo.create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Requires, None)
            .unwrap();

        let summaries = repo.list_summaries(&f.project_id).unwrap();
        let pairs: Vec<_> = summaries
            .iter()
            .map(|s| (s.source_slug.as_str(), s.target_slug.as_str()))
            .collect();
        assert_eq!(pairs, vec![("combat", "health"), ("health", "combat")]);
    }

    #[test]
    fn exists_matches_exact_triple() {
        let f = setup();
        let repo = DependencyRepo::new(f.db.clone());
        repo.create(&f.project_id, &f.combat.id, &f.health.id, DependencyType::Requires, None)
            .unwrap();
        f.db.with_conn(|conn| {
            assert!(exists(conn, &f.combat.id, &f.health.id, DependencyType::Requires)?);
            assert!(!exists(conn, &f.health.id, &f.combat.id, DependencyType::Requires)?);
            assert!(!exists(conn, &f.combat.id, &f.health.id, DependencyType::Enhances)?);
            Ok(())
        })
        .unwrap();
    }
}
