//! Client module - generative-model boundary.

mod llm_client;

pub use llm_client::*;
