/// SQL DDL for the keystone-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS brainstorm_sessions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    title TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'manual',
    content TEXT NOT NULL,
    author TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    source_thread_refs TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS synthesized_outputs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    brainstorm_id TEXT REFERENCES brainstorm_sessions(id),
    content TEXT NOT NULL,
    extracted_systems TEXT NOT NULL DEFAULT '[]',
    extracted_system_details TEXT NOT NULL DEFAULT '[]',
    suggested_systems TEXT NOT NULL DEFAULT '[]',
    suggested_system_details TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context_snapshots (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    trigger_kind TEXT NOT NULL,
    content TEXT NOT NULL,
    synthesized_output_id TEXT,
    brainstorm_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS game_systems (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    purpose TEXT,
    version TEXT NOT NULL DEFAULT 'v0.1',
    status TEXT NOT NULL DEFAULT 'draft',
    mvp_criticality TEXT NOT NULL DEFAULT 'important',
    description TEXT,
    mechanics TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (project_id, slug)
);

CREATE TABLE IF NOT EXISTS system_details (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL REFERENCES game_systems(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    detail_type TEXT NOT NULL DEFAULT 'mechanic',
    spec TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dependencies (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    source_system_id TEXT NOT NULL REFERENCES game_systems(id) ON DELETE CASCADE,
    target_system_id TEXT NOT NULL REFERENCES game_systems(id) ON DELETE CASCADE,
    dependency_type TEXT NOT NULL DEFAULT 'requires',
    description TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (source_system_id, target_system_id, dependency_type)
);

CREATE TABLE IF NOT EXISTS synthesis_messages (
    id TEXT PRIMARY KEY,
    output_id TEXT NOT NULL REFERENCES synthesized_outputs(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_evolve_messages (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL REFERENCES game_systems(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_brainstorms_project ON brainstorm_sessions(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_outputs_project ON synthesized_outputs(project_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_project ON context_snapshots(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_systems_project ON game_systems(project_id);
CREATE INDEX IF NOT EXISTS idx_details_system ON system_details(system_id);
CREATE INDEX IF NOT EXISTS idx_dependencies_project ON dependencies(project_id);
CREATE INDEX IF NOT EXISTS idx_synthesis_messages_output ON synthesis_messages(output_id, created_at);
CREATE INDEX IF NOT EXISTS idx_evolve_messages_system ON system_evolve_messages(system_id, created_at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
