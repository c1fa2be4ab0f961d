//! Shared building blocks: errors, domain types, collaborator traits

pub mod channels;
pub mod errors;
pub mod retry;
pub mod traits;
pub mod types;
