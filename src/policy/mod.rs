//! Policy adapter around the black-box RL model
//!
//! The adapter owns everything the model itself is not trusted with:
//! scaling inputs into the ranges the model was trained on, validating
//! whatever comes back, and picking up newly published model versions
//! between cycles without a restart.

mod adapter;
pub mod http;
mod normalizer;

pub use adapter::{validate_output, PolicyAdapter, PolicyDecision, ReloadHandle};
pub use http::HttpPolicyClient;
pub use normalizer::StateNormalizer;
