//! Firebase Realtime Database persistence for ledgers and the event log

mod store;

pub use store::{pair_key, FirebaseStore};
