//! Paper-trading collaborators
//!
//! Used for `--paper` runs, when exchange credentials are missing, and as
//! fakes in tests.

mod exchange;
mod market;
mod policy;
mod sentiment;
mod store;

pub use exchange::PaperExchange;
pub use market::RandomWalkMarket;
pub use policy::{MomentumPolicy, MOMENTUM_VERSION};
pub use sentiment::StaticSentimentSource;
pub use store::InMemoryStore;
