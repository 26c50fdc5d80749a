use std::sync::Arc;

use conduit_core::types::{ConversationId, SessionId};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::types::{SessionMetadata, UsageUpdate};

/// Gives each conversation a stable sessionId, resolving concurrent
/// first-touch races without duplicate creation.
///
/// State mirrors spec.md §4.6 exactly: a conversationId→sessionId map, a
/// sessionId→metadata map, and a pending-creation map so concurrent
/// first-touch callers for the same conversation join a single creation
/// rather than racing. The teacher persists this in SQLite
/// (`INSERT OR IGNORE` + read-back); since session metadata is explicitly
/// process-local here, the same race-free guarantee is built from
/// `DashMap::entry()` atomicity plus a `Notify` for joiners instead.
pub struct SessionRegistry {
    mappings: DashMap<ConversationId, SessionId>,
    metadata: DashMap<SessionId, SessionMetadata>,
    pending: DashMap<ConversationId, Arc<Notify>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mappings: DashMap::new(),
            metadata: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    /// Return the existing sessionId for `conversation_id`, or create one.
    /// At most one creation path runs to completion per conversationId;
    /// all concurrent callers observe the same sessionId.
    pub async fn get_or_create(
        &self,
        agent_id: Option<String>,
        user_id: Option<String>,
        conversation_id: &ConversationId,
    ) -> Result<SessionId> {
        if conversation_id.is_empty() {
            return Err(SessionError::EmptyConversationId);
        }

        loop {
            if let Some(existing) = self.mappings.get(conversation_id) {
                return Ok(existing.clone());
            }

            // Try to become the creator by registering a pending handle.
            // DashMap::entry() on the pending map is the atomicity boundary:
            // only one concurrent caller observes `Entry::Vacant` here.
            let became_creator = {
                use dashmap::mapref::entry::Entry;
                match self.pending.entry(conversation_id.clone()) {
                    Entry::Occupied(_) => false,
                    Entry::Vacant(vac) => {
                        vac.insert(Arc::new(Notify::new()));
                        true
                    }
                }
            };

            if !became_creator {
                // Join the in-flight creation: wait for it to publish the
                // mapping, then loop back to read it.
                if let Some(notify) = self.pending.get(conversation_id).map(|e| e.clone()) {
                    notify.notified().await;
                }
                continue;
            }

            let session_id: SessionId = conversation_id.clone();
            self.metadata
                .insert(session_id.clone(), SessionMetadata::new(agent_id, user_id));
            self.mappings.insert(conversation_id.clone(), session_id.clone());

            if let Some((_, notify)) = self.pending.remove(conversation_id) {
                notify.notify_waiters();
            }

            debug!(conversation_id = %conversation_id, "session created");
            return Ok(session_id);
        }
    }

    pub fn update_metadata(&self, session_id: &SessionId, usage: UsageUpdate) -> Result<()> {
        let mut entry = self
            .metadata
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                conversation_id: session_id.to_string(),
            })?;
        entry.apply_usage(usage);
        Ok(())
    }

    pub fn get_session_id(&self, conversation_id: &ConversationId) -> Option<SessionId> {
        self.mappings.get(conversation_id).map(|e| e.clone())
    }

    pub fn get_metadata(&self, session_id: &SessionId) -> Option<SessionMetadata> {
        self.metadata.get(session_id).map(|e| e.clone())
    }

    /// Delete the mapping and metadata for `conversation_id`. Callers are
    /// responsible for also deleting the conversation's `HistoryStore`
    /// rows; this registry only owns the in-memory mapping.
    pub fn archive(&self, conversation_id: &ConversationId) {
        if let Some((_, session_id)) = self.mappings.remove(conversation_id) {
            self.metadata.remove(&session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.metadata.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn empty_conversation_id_is_rejected() {
        let registry = SessionRegistry::new();
        let result = registry
            .get_or_create(None, None, &ConversationId::new(""))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn repeated_calls_return_the_same_session_id() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::new("c1");
        let s1 = registry.get_or_create(None, None, &conv).await.unwrap();
        let s2 = registry.get_or_create(None, None, &conv).await.unwrap();
        assert_eq!(s1, s2);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_touch_converges_on_one_session_and_count() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::new("c-race");
        let creations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let conv = conv.clone();
            let creations = creations.clone();
            handles.push(tokio::spawn(async move {
                let before = registry.session_count();
                let sid = registry.get_or_create(None, None, &conv).await.unwrap();
                if before == 0 {
                    creations.fetch_add(1, Ordering::SeqCst);
                }
                sid
            }));
        }

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn update_metadata_bumps_counters() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::new("c1");
        let sid = registry.get_or_create(None, None, &conv).await.unwrap();
        registry
            .update_metadata(
                &sid,
                UsageUpdate {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            )
            .unwrap();
        let meta = registry.get_metadata(&sid).unwrap();
        assert_eq!(meta.message_count, 1);
        assert_eq!(meta.total_tokens, 15);
    }

    #[tokio::test]
    async fn archive_removes_mapping_and_metadata() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::new("c1");
        registry.get_or_create(None, None, &conv).await.unwrap();
        registry.archive(&conv);
        assert!(registry.get_session_id(&conv).is_none());
        assert_eq!(registry.session_count(), 0);
    }
}
