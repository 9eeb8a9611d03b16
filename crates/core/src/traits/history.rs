//! Conversation history capability set

use async_trait::async_trait;

use crate::chat::Role;
use crate::error::Result;
use crate::session::{SessionInfo, StoredMessage};

/// Session-scoped, bounded message persistence.
///
/// `append` and `append_turn` serialize writes per session so ordinals
/// stay strictly monotonic; writes to different sessions run in
/// parallel. When the per-session cap is exceeded the oldest
/// non-system messages are dropped first.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Append one message, returning its ordinal.
    async fn append(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        blocked: bool,
    ) -> Result<u64>;

    /// Append a user message and the final assistant message
    /// atomically: both are stored or neither is.
    async fn append_turn(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
        assistant_blocked: bool,
    ) -> Result<(u64, u64)>;

    /// Last `limit` messages in ordinal order.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Delete every message in the session.
    async fn clear(&self, session_id: &str) -> Result<()>;

    /// Drop oldest non-system messages beyond `keep_last`. Returns the
    /// number of messages removed.
    async fn prune(&self, session_id: &str, keep_last: usize) -> Result<usize>;

    /// Session summary, if the session exists.
    async fn info(&self, session_id: &str) -> Result<Option<SessionInfo>>;
}
