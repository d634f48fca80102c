pub mod brainstorms;
pub mod conversations;
pub mod database;
pub mod dependencies;
pub mod error;
pub mod outputs;
pub mod projects;
pub mod row_helpers;
pub mod schema;
pub mod snapshots;
pub mod systems;

pub use brainstorms::BrainstormRepo;
pub use conversations::ConversationRepo;
pub use database::Database;
pub use dependencies::DependencyRepo;
pub use error::StoreError;
pub use outputs::{CandidateSet, NewOutput, OutputRepo};
pub use projects::ProjectRepo;
pub use snapshots::{SnapshotLinks, SnapshotRepo};
pub use systems::SystemRepo;
