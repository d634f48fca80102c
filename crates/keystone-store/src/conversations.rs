use rusqlite::Connection;
use tracing::instrument;

use keystone_core::ids::{MessageId, OutputId, SystemId};
use keystone_core::models::{ConversationMessage, MessageRole};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Which conversation a message thread belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Thread {
    Synthesis,
    Evolve,
}

impl Thread {
    fn table(self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis_messages",
            Self::Evolve => "system_evolve_messages",
        }
    }

    fn owner_column(self) -> &'static str {
        match self {
            Self::Synthesis => "output_id",
            Self::Evolve => "system_id",
        }
    }
}

/// Ordered conversation turns for refinement (per synthesized output) and
/// evolve chats (per game system).
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content), fields(output_id = %output_id, role = %role))]
    pub fn append_synthesis_message(
        &self,
        output_id: &OutputId,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, StoreError> {
        self.db
            .with_conn(|conn| append(conn, Thread::Synthesis, output_id.as_str(), role, content))
    }

    #[instrument(skip(self), fields(output_id = %output_id))]
    pub fn synthesis_history(&self, output_id: &OutputId) -> Result<Vec<ConversationMessage>, StoreError> {
        self.db
            .with_conn(|conn| history(conn, Thread::Synthesis, output_id.as_str()))
    }

    #[instrument(skip(self, content), fields(system_id = %system_id, role = %role))]
    pub fn append_evolve_message(
        &self,
        system_id: &SystemId,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage, StoreError> {
        self.db
            .with_conn(|conn| append(conn, Thread::Evolve, system_id.as_str(), role, content))
    }

    #[instrument(skip(self), fields(system_id = %system_id))]
    pub fn evolve_history(&self, system_id: &SystemId) -> Result<Vec<ConversationMessage>, StoreError> {
        self.db
            .with_conn(|conn| history(conn, Thread::Evolve, system_id.as_str()))
    }
}

fn append(
    conn: &Connection,
    thread: Thread,
    owner_id: &str,
    role: MessageRole,
    content: &str,
) -> Result<ConversationMessage, StoreError> {
    let message = ConversationMessage {
        id: MessageId::new(),
        role,
        content: content.to_string(),
        created_at: row_helpers::now_timestamp(),
    };
    conn.execute(
        &format!(
            "INSERT INTO {} (id, {}, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            thread.table(),
            thread.owner_column()
        ),
        rusqlite::params![
            message.id.as_str(),
            owner_id,
            message.role.as_str(),
            message.content,
            message.created_at,
        ],
    )?;
    Ok(message)
}

fn history(conn: &Connection, thread: Thread, owner_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
    let table = thread.table();
    let mut stmt = conn.prepare(&format!(
        "SELECT id, role, content, created_at FROM {table} WHERE {} = ?1 ORDER BY created_at, rowid",
        thread.owner_column()
    ))?;
    let mut rows = stmt.query([owner_id])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let role: String = row_helpers::get(row, 1, table, "role")?;
        results.push(ConversationMessage {
            id: MessageId::from_raw(row_helpers::get::<String>(row, 0, table, "id")?),
            role: row_helpers::parse_enum(&role, table, "role")?,
            content: row_helpers::get(row, 2, table, "content")?,
            created_at: row_helpers::get(row, 3, table, "created_at")?,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::{CandidateSet, NewOutput, OutputRepo};
    use crate::projects::ProjectRepo;
    use crate::systems::SystemRepo;
    use keystone_core::models::{NewSystem, SynthesisStatus};
    use keystone_core::tokens::TokenUsage;

    #[test]
    fn synthesis_thread_ordered() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        let output = OutputRepo::new(db.clone())
            .create(NewOutput {
                project_id: project.id.clone(),
                brainstorm_id: None,
                content: "raw".into(),
                candidates: CandidateSet::default(),
                status: SynthesisStatus::Completed,
                error_message: None,
                provider: "mock".into(),
                model: "mock-model".into(),
                usage: TokenUsage::default(),
            })
            .unwrap();

        let repo = ConversationRepo::new(db);
        repo.append_synthesis_message(&output.id, MessageRole::User, "add stamina")
            .unwrap();
        repo.append_synthesis_message(&output.id, MessageRole::Assistant, "{}")
            .unwrap();

        let history = repo.synthesis_history(&output.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[test]
    fn evolve_threads_are_per_system() {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Test", None).unwrap();
        let systems = SystemRepo::new(db.clone());
        let mk = |slug: &str| NewSystem {
            name: slug.into(),
            slug: slug.into(),
            ..Default::default()
        };
        let combat = systems.create(&project.id, mk("combat")).unwrap();
        let health = systems.create(&project.id, mk("health")).unwrap();

        let repo = ConversationRepo::new(db);
        repo.append_evolve_message(&combat.id, MessageRole::User, "bump version")
            .unwrap();
        repo.append_evolve_message(&health.id, MessageRole::User, "add regen")
            .unwrap();

        let combat_history = repo.evolve_history(&combat.id).unwrap();
        assert_eq!(combat_history.len(), 1);
        assert_eq!(combat_history[0].content, "bump version");
        assert!(repo.synthesis_history(&OutputId::from_raw("syn_none")).unwrap().is_empty());
    }
}
