//! Content-safety moderation
//!
//! An ordered chain of checkers applied twice per request: to the user
//! message before retrieval and to the full generated text before it
//! is committed to history.

pub mod rules;
pub mod openai;
pub mod chain;

pub use rules::RuleGuard;
pub use openai::OpenAiModerator;
pub use chain::ModeratorChain;
