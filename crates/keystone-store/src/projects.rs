use tracing::instrument;

use keystone_core::ids::ProjectId;
use keystone_core::models::Project;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, description))]
    pub fn create(&self, name: &str, description: Option<&str>) -> Result<Project, StoreError> {
        self.db.with_conn(|conn| {
            let project = Project {
                id: ProjectId::new(),
                name: name.to_string(),
                description: description.map(str::to_string),
                created_at: row_helpers::now_timestamp(),
            };
            conn.execute(
                "INSERT INTO projects (id, name, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    project.id.as_str(),
                    project.name,
                    project.description,
                    project.created_at
                ],
            )?;
            Ok(project)
        })
    }

    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<Project, StoreError> {
        self.db.with_conn(|conn| get(conn, id))
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Project>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at FROM projects ORDER BY created_at, rowid",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_project(row)?);
            }
            Ok(results)
        })
    }
}

pub fn get(conn: &rusqlite::Connection, id: &ProjectId) -> Result<Project, StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, name, description, created_at FROM projects WHERE id = ?1")?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_project(row),
        None => Err(StoreError::NotFound(format!("project {id}"))),
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<Project, StoreError> {
    Ok(Project {
        id: ProjectId::from_raw(row_helpers::get::<String>(row, 0, "projects", "id")?),
        name: row_helpers::get(row, 1, "projects", "name")?,
        description: row_helpers::get_opt(row, 2, "projects", "description")?,
        created_at: row_helpers::get(row, 3, "projects", "created_at")?,
    })
}
