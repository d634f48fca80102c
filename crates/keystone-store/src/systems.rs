use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};

use keystone_core::ids::{DetailId, ProjectId, SystemId};
use keystone_core::models::{
    GameSystem, NewSystem, SystemDetail, SystemUpdate, DEFAULT_DETAIL_TYPE, DEFAULT_SYSTEM_VERSION,
};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const COLUMNS: &str = "id, project_id, name, slug, purpose, version, status, mvp_criticality, \
                       description, mechanics, notes, created_at, updated_at";

/// Game systems and their details.
///
/// The free functions take a bare connection so callers can compose them
/// inside a [`Database::with_tx`] transaction; the repo methods wrap them for
/// one-shot use.
pub struct SystemRepo {
    db: Database,
}

impl SystemRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(project_id = %project_id, slug = %new.slug))]
    pub fn create(&self, project_id: &ProjectId, new: NewSystem) -> Result<GameSystem, StoreError> {
        self.db.with_conn(|conn| insert(conn, project_id, new))
    }

    #[instrument(skip(self), fields(system_id = %id))]
    pub fn get(&self, id: &SystemId) -> Result<GameSystem, StoreError> {
        self.db.with_conn(|conn| get(conn, id))
    }

    /// All systems of a project, sorted by slug.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list_for_project(&self, project_id: &ProjectId) -> Result<Vec<GameSystem>, StoreError> {
        self.db.with_conn(|conn| list_for_project(conn, project_id))
    }

    #[instrument(skip(self, update), fields(system_id = %id))]
    pub fn update(&self, id: &SystemId, update: &SystemUpdate) -> Result<GameSystem, StoreError> {
        self.db.with_conn(|conn| apply_update(conn, id, update))
    }

    #[instrument(skip(self, spec), fields(system_id = %system_id))]
    pub fn add_detail(
        &self,
        system_id: &SystemId,
        name: &str,
        detail_type: Option<&str>,
        spec: Option<&str>,
    ) -> Result<SystemDetail, StoreError> {
        self.db
            .with_conn(|conn| insert_detail(conn, system_id, name, detail_type, spec))
    }

    #[instrument(skip(self), fields(system_id = %system_id))]
    pub fn list_details(&self, system_id: &SystemId) -> Result<Vec<SystemDetail>, StoreError> {
        self.db.with_conn(|conn| list_details(conn, system_id))
    }
}

/// Insert a system. The caller is responsible for choosing a unique slug; a
/// duplicate within the project surfaces as [`StoreError::Conflict`].
pub fn insert(conn: &Connection, project_id: &ProjectId, new: NewSystem) -> Result<GameSystem, StoreError> {
    let now = row_helpers::now_timestamp();
    let system = GameSystem {
        id: SystemId::new(),
        project_id: project_id.clone(),
        name: new.name,
        slug: new.slug,
        purpose: new.purpose,
        version: new.version.unwrap_or_else(|| DEFAULT_SYSTEM_VERSION.to_string()),
        status: new.status.unwrap_or_default(),
        mvp_criticality: new.mvp_criticality.unwrap_or_default(),
        description: new.description,
        mechanics: new.mechanics,
        notes: new.notes,
        created_at: now.clone(),
        updated_at: now,
    };

    conn.execute(
        &format!(
            "INSERT INTO game_systems ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        rusqlite::params![
            system.id.as_str(),
            system.project_id.as_str(),
            system.name,
            system.slug,
            system.purpose,
            system.version,
            system.status.as_str(),
            system.mvp_criticality.as_str(),
            system.description,
            system.mechanics,
            system.notes,
            system.created_at,
            system.updated_at,
        ],
    )
    .map_err(|e| match StoreError::from(e) {
        StoreError::Conflict(_) => StoreError::Conflict(format!(
            "system slug '{}' already exists in project {project_id}",
            system.slug
        )),
        other => other,
    })?;

    debug!(system_id = %system.id, slug = %system.slug, "system created");
    Ok(system)
}

pub fn get(conn: &Connection, id: &SystemId) -> Result<GameSystem, StoreError> {
    find(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("system {id}")))
}

pub fn find(conn: &Connection, id: &SystemId) -> Result<Option<GameSystem>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM game_systems WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_system(row)?)),
        None => Ok(None),
    }
}

pub fn list_for_project(conn: &Connection, project_id: &ProjectId) -> Result<Vec<GameSystem>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM game_systems WHERE project_id = ?1 ORDER BY slug"
    ))?;
    let mut rows = stmt.query([project_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_system(row)?);
    }
    Ok(results)
}

pub fn slug_exists(conn: &Connection, project_id: &ProjectId, slug: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM game_systems WHERE project_id = ?1 AND slug = ?2",
            [project_id.as_str(), slug],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Apply a partial update. The slug is never touched. An empty update
/// leaves `updated_at` unchanged.
pub fn apply_update(conn: &Connection, id: &SystemId, update: &SystemUpdate) -> Result<GameSystem, StoreError> {
    let mut system = get(conn, id)?;
    if update.is_empty() {
        return Ok(system);
    }

    if let Some(name) = &update.name {
        system.name = name.clone();
    }
    if let Some(purpose) = &update.purpose {
        system.purpose = Some(purpose.clone());
    }
    if let Some(version) = &update.version {
        system.version = version.clone();
    }
    if let Some(status) = update.status {
        system.status = status;
    }
    if let Some(criticality) = update.mvp_criticality {
        system.mvp_criticality = criticality;
    }
    if let Some(description) = &update.description {
        system.description = Some(description.clone());
    }
    if let Some(mechanics) = &update.mechanics {
        system.mechanics = Some(mechanics.clone());
    }
    if let Some(notes) = &update.notes {
        system.notes = Some(notes.clone());
    }
    system.updated_at = row_helpers::now_timestamp();

    conn.execute(
        "UPDATE game_systems
         SET name = ?1, purpose = ?2, version = ?3, status = ?4, mvp_criticality = ?5,
             description = ?6, mechanics = ?7, notes = ?8, updated_at = ?9
         WHERE id = ?10",
        rusqlite::params![
            system.name,
            system.purpose,
            system.version,
            system.status.as_str(),
            system.mvp_criticality.as_str(),
            system.description,
            system.mechanics,
            system.notes,
            system.updated_at,
            system.id.as_str(),
        ],
    )?;
    Ok(system)
}

pub fn insert_detail(
    conn: &Connection,
    system_id: &SystemId,
    name: &str,
    detail_type: Option<&str>,
    spec: Option<&str>,
) -> Result<SystemDetail, StoreError> {
    let detail = SystemDetail {
        id: DetailId::new(),
        system_id: system_id.clone(),
        name: name.to_string(),
        detail_type: detail_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_DETAIL_TYPE)
            .to_string(),
        spec: spec.map(str::to_string),
        created_at: row_helpers::now_timestamp(),
    };
    conn.execute(
        "INSERT INTO system_details (id, system_id, name, detail_type, spec, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            detail.id.as_str(),
            detail.system_id.as_str(),
            detail.name,
            detail.detail_type,
            detail.spec,
            detail.created_at,
        ],
    )?;
    Ok(detail)
}

pub fn list_details(conn: &Connection, system_id: &SystemId) -> Result<Vec<SystemDetail>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, system_id, name, detail_type, spec, created_at
         FROM system_details WHERE system_id = ?1 ORDER BY created_at, rowid",
    )?;
    let mut rows = stmt.query([system_id.as_str()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        const T: &str = "system_details";
        results.push(SystemDetail {
            id: DetailId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
            system_id: SystemId::from_raw(row_helpers::get::<String>(row, 1, T, "system_id")?),
            name: row_helpers::get(row, 2, T, "name")?,
            detail_type: row_helpers::get(row, 3, T, "detail_type")?,
            spec: row_helpers::get_opt(row, 4, T, "spec")?,
            created_at: row_helpers::get(row, 5, T, "created_at")?,
        });
    }
    Ok(results)
}

fn row_to_system(row: &rusqlite::Row<'_>) -> Result<GameSystem, StoreError> {
    const T: &str = "game_systems";
    let status: String = row_helpers::get(row, 6, T, "status")?;
    let criticality: String = row_helpers::get(row, 7, T, "mvp_criticality")?;

    Ok(GameSystem {
        id: SystemId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, T, "project_id")?),
        name: row_helpers::get(row, 2, T, "name")?,
        slug: row_helpers::get(row, 3, T, "slug")?,
        purpose: row_helpers::get_opt(row, 4, T, "purpose")?,
        version: row_helpers::get(row, 5, T, "version")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        mvp_criticality: row_helpers::parse_enum(&criticality, T, "mvp_criticality")?,
        description: row_helpers::get_opt(row, 8, T, "description")?,
        mechanics: row_helpers::get_opt(row, 9, T, "mechanics")?,
        notes: row_helpers::get_opt(row, 10, T, "notes")?,
        created_at: row_helpers::get(row, 11, T, "created_at")?,
        updated_at: row_helpers::get(row, 12, T, "updated_at")?,
    })
}
