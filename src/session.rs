//! Conversation state for stateful provider protocols.
//!
//! The store is keyed by an opaque conversation string chosen by the
//! caller. Lifecycle is the caller's problem: nothing here expires or
//! evicts. Concurrent writers to the same key are last-writer-wins.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// What the gateway remembers between turns of one conversation.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    /// Handle for protocols where the provider stores the history.
    pub previous_response_id: Option<String>,
    /// Tool-call ids issued so far, oldest first.
    #[serde(default)]
    pub tool_history: Vec<String>,
}

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<ConversationState>;
    fn put(&self, key: &str, state: ConversationState);
    fn delete(&self, key: &str);
}

/// Reference in-process implementation.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, ConversationState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, key: &str) -> Option<ConversationState> {
        match self.sessions.read() {
            Ok(sessions) => sessions.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn put(&self, key: &str, state: ConversationState) {
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(key.to_string(), state);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key.to_string(), state);
            }
        }
    }

    fn delete(&self, key: &str) {
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.remove(key);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(key);
            }
        }
    }
}
