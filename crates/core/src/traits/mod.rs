//! Trait seams between the pipeline and its collaborators

pub mod retriever;
pub mod inference;
pub mod moderator;
pub mod history;
pub mod keystore;

pub use retriever::{Retriever, RetrieveOptions, MetadataFilter, FilterOp, HealthStatus};
pub use inference::{InferenceClient, TokenStream};
pub use moderator::{Moderator, Direction, Verdict};
pub use history::HistoryStore;
pub use keystore::{ApiKeyStore, PromptStore, UserStore};
