//! # Message Multiplexer
//!
//! Routes inbound messages to the handler registered for their tag. A
//! handler inspects the message and returns a [`ForwardingPolicy`] telling
//! the node what to do next:
//!
//! | Policy | Effect |
//! |--------|--------|
//! | `Ignore` | Nothing further |
//! | `Broadcast` | Relay to every peer except the sender |
//! | `Disconnect` | Close and remove the sender |
//!
//! Messages with no registered handler are ignored.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::peer::Peer;
use crate::protocol::Tag;

/// A message received from a peer and handed to the reader pool.
#[derive(Clone)]
pub struct IncomingMessage {
    pub sender: Arc<Peer>,
    pub tag: Tag,
    pub data: Arc<[u8]>,
    pub received_at: SystemTime,
}

impl std::fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("sender", &self.sender.id())
            .field("tag", &self.tag)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingPolicy {
    Ignore,
    Disconnect,
    Broadcast,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &IncomingMessage) -> ForwardingPolicy;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&IncomingMessage) -> ForwardingPolicy + Send + Sync,
{
    async fn handle(&self, message: &IncomingMessage) -> ForwardingPolicy {
        self(message)
    }
}

#[derive(Clone)]
pub struct TaggedMessageHandler {
    pub tag: Tag,
    pub handler: Arc<dyn MessageHandler>,
}

impl TaggedMessageHandler {
    pub fn new(tag: Tag, handler: Arc<dyn MessageHandler>) -> Self {
        Self { tag, handler }
    }

    /// Wrap a synchronous closure.
    pub fn from_fn<F>(tag: Tag, f: F) -> Self
    where
        F: Fn(&IncomingMessage) -> ForwardingPolicy + Send + Sync + 'static,
    {
        Self::new(tag, Arc::new(f))
    }
}

#[derive(Default)]
pub struct Multiplexer {
    handlers: RwLock<HashMap<Tag, Arc<dyn MessageHandler>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handlers; a later registration for the same tag wins.
    pub fn register_handlers(&self, handlers: impl IntoIterator<Item = TaggedMessageHandler>) {
        let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for h in handlers {
            map.insert(h.tag, h.handler);
        }
    }

    /// Remove every handler except those for `keep`.
    pub fn clear_handlers(&self, keep: &[Tag]) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tag, _| keep.contains(tag));
    }

    pub fn has_handler(&self, tag: Tag) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&tag)
    }

    pub async fn handle(&self, message: &IncomingMessage) -> ForwardingPolicy {
        // Clone out of the lock; handlers may run for a long time.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.tag)
            .cloned();
        match handler {
            Some(h) => h.handle(message).await,
            None => ForwardingPolicy::Ignore,
        }
    }
}
