//! In-memory store variants
//!
//! Same traits as the SQLite stores, backed by maps. Used by tests and
//! by `persistence.backend = "memory"` deployments, where history does
//! not survive restarts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use orbit_core::{
    ApiKeyRecord, ApiKeyStore, HistoryStore, KeyBinding, PromptStore, Result, Role, SessionInfo,
    StoredMessage, SystemPrompt,
};

use crate::keys::generate_token;

/// In-memory API key + prompt store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
    prompts: RwLock<HashMap<String, SystemPrompt>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryKeyStore {
    async fn create_key(
        &self,
        client_name: &str,
        adapter_name: &str,
        system_prompt_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<ApiKeyRecord> {
        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            token: generate_token(),
            client_name: client_name.to_string(),
            adapter_name: adapter_name.to_string(),
            system_prompt_id: system_prompt_id.map(String::from),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
            notes: notes.map(String::from),
        };
        self.keys.write().insert(record.token.clone(), record.clone());
        Ok(record)
    }

    async fn resolve(&self, token: &str) -> Result<Option<KeyBinding>> {
        Ok(self.keys.read().get(token).map(KeyBinding::from))
    }

    async fn get(&self, token: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self.keys.read().get(token).cloned())
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>> {
        let mut records: Vec<_> = self.keys.read().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn rename(&self, token: &str, client_name: &str) -> Result<bool> {
        Ok(self
            .keys
            .write()
            .get_mut(token)
            .map(|r| r.client_name = client_name.to_string())
            .is_some())
    }

    async fn deactivate(&self, token: &str) -> Result<bool> {
        Ok(self.keys.write().get_mut(token).map(|r| r.active = false).is_some())
    }

    async fn delete(&self, token: &str) -> Result<bool> {
        Ok(self.keys.write().remove(token).is_some())
    }

    async fn touch_last_used(&self, token: &str) -> Result<()> {
        if let Some(record) = self.keys.write().get_mut(token) {
            record.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl PromptStore for MemoryKeyStore {
    async fn create(&self, name: &str, text: &str) -> Result<SystemPrompt> {
        let prompt = SystemPrompt::new(uuid::Uuid::new_v4().to_string(), name, text);
        self.prompts.write().insert(prompt.id.clone(), prompt.clone());
        Ok(prompt)
    }

    async fn get(&self, id: &str) -> Result<Option<SystemPrompt>> {
        Ok(self.prompts.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<SystemPrompt>> {
        let mut prompts: Vec<_> = self.prompts.read().values().cloned().collect();
        prompts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(prompts)
    }

    async fn update(&self, id: &str, text: &str) -> Result<Option<SystemPrompt>> {
        let mut prompts = self.prompts.write();
        Ok(prompts.get_mut(id).map(|p| {
            p.apply_update(text);
            p.clone()
        }))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.prompts.write().remove(id).is_some())
    }

    async fn associate(&self, token: &str, prompt_id: &str) -> Result<bool> {
        if !self.prompts.read().contains_key(prompt_id) {
            return Ok(false);
        }
        Ok(self
            .keys
            .write()
            .get_mut(token)
            .map(|r| r.system_prompt_id = Some(prompt_id.to_string()))
            .is_some())
    }
}

struct MemorySession {
    info: SessionInfo,
    messages: Vec<StoredMessage>,
    next_ordinal: u64,
}

/// In-memory history store with the same per-session serialization
/// guarantees as the SQLite variant.
pub struct MemoryHistoryStore {
    sessions: DashMap<String, Arc<Mutex<MemorySession>>>,
    max_messages: usize,
}

impl MemoryHistoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self { sessions: DashMap::new(), max_messages }
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<MemorySession>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                Arc::new(Mutex::new(MemorySession {
                    info: SessionInfo {
                        session_id: session_id.to_string(),
                        created_at: now,
                        last_activity_at: now,
                        message_count: 0,
                    },
                    messages: Vec::new(),
                    next_ordinal: 1,
                }))
            })
            .clone()
    }

    fn push(session: &mut MemorySession, role: Role, content: &str, blocked: bool, cap: usize) -> u64 {
        let ordinal = session.next_ordinal;
        session.next_ordinal += 1;
        session.messages.push(StoredMessage {
            session_id: session.info.session_id.clone(),
            ordinal,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            token_estimate: Some(orbit_core::estimate_tokens(content) as u32),
            blocked,
        });
        session.info.last_activity_at = Utc::now();
        session.info.message_count = session.messages.len() as u64;

        while session.messages.len() > cap {
            if let Some(idx) = session.messages.iter().position(|m| m.role != Role::System) {
                session.messages.remove(idx);
            } else {
                break;
            }
        }
        session.info.message_count = session.messages.len() as u64;
        ordinal
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, session_id: &str, role: Role, content: &str, blocked: bool) -> Result<u64> {
        let session = self.session(session_id);
        let mut guard = session.lock().await;
        Ok(Self::push(&mut guard, role, content, blocked, self.max_messages))
    }

    async fn append_turn(
        &self,
        session_id: &str,
        user_content: &str,
        assistant_content: &str,
        assistant_blocked: bool,
    ) -> Result<(u64, u64)> {
        let session = self.session(session_id);
        let mut guard = session.lock().await;
        let user = Self::push(&mut guard, Role::User, user_content, false, self.max_messages);
        let assistant = Self::push(
            &mut guard,
            Role::Assistant,
            assistant_content,
            assistant_blocked,
            self.max_messages,
        );
        Ok((user, assistant))
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = session.lock().await;
        let start = guard.messages.len().saturating_sub(limit);
        Ok(guard.messages[start..].to_vec())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        if let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) {
            let mut guard = session.lock().await;
            guard.messages.clear();
            guard.info.message_count = 0;
        }
        Ok(())
    }

    async fn prune(&self, session_id: &str, keep_last: usize) -> Result<usize> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            return Ok(0);
        };
        let mut guard = session.lock().await;
        let mut removed = 0usize;
        while guard.messages.len() > keep_last {
            if let Some(idx) = guard.messages.iter().position(|m| m.role != Role::System) {
                guard.messages.remove(idx);
                removed += 1;
            } else {
                break;
            }
        }
        guard.info.message_count = guard.messages.len() as u64;
        Ok(removed)
    }

    async fn info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        let guard = session.lock().await;
        Ok(Some(guard.info.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_key_roundtrip() {
        let store = MemoryKeyStore::new();
        let record = store.create_key("client", "qa-sql", None, None).await.unwrap();
        assert!(store.resolve(&record.token).await.unwrap().unwrap().active);

        store.deactivate(&record.token).await.unwrap();
        assert!(!store.resolve(&record.token).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_memory_history_cap() {
        let store = MemoryHistoryStore::new(3);
        for i in 1..=5 {
            store.append("s1", Role::User, &format!("m{i}"), false).await.unwrap();
        }
        let messages = store.recent("s1", 10).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "m3");
        // Ordinals keep climbing past dropped messages
        assert_eq!(messages[2].ordinal, 5);
    }

    #[tokio::test]
    async fn test_memory_turn_append() {
        let store = MemoryHistoryStore::new(10);
        let (u, a) = store.append_turn("s1", "q", "a", true).await.unwrap();
        assert_eq!((u, a), (1, 2));
        let messages = store.recent("s1", 10).await.unwrap();
        assert!(messages[1].blocked);
    }
}
