pub mod candidates;
pub mod errors;
pub mod ids;
pub mod models;
pub mod provider;
pub mod security;
pub mod stream;
pub mod tokens;
