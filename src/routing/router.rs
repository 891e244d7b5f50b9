//! Handler registration and lookup.
//!
//! # Responsibilities
//! - Store registered handlers per normalized path, tagged by phase
//! - Resolve a request path to its handler entry
//! - Publish table updates atomically to in-flight dispatches
//!
//! # Design Decisions
//! - One entry per path holds both phases; the longest registered entry
//!   covering a path wins for both phases, so an entry registered for one
//!   phase shadows shorter prefixes for the other
//! - Early handlers of an entry keep registration order; a normal handler
//!   registered again replaces the previous one
//! - Readers load an immutable snapshot (lock-free); writers copy, modify
//!   and swap, so no lookup sees a half-applied update

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::http::message::ServerMessage;
use crate::net::connection::ClientContext;
use crate::routing::matcher::{candidate_prefixes, RouteKey};

/// Signature of a handler callback.
///
/// State the handler needs travels in the closure's captures; it is dropped
/// once the handler is removed and no dispatch still holds it.
pub type HandlerFn = dyn Fn(&ServerMessage, &ClientContext) + Send + Sync;

/// When a handler runs relative to body reading and normal dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Runs right after the request head is parsed; may answer early.
    Early,
    /// Produces the response once the body has been read.
    Normal,
}

/// A registered callback.
#[derive(Clone)]
pub struct Handler {
    callback: Arc<HandlerFn>,
}

impl Handler {
    /// Wrap a callback for registration.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&ServerMessage, &ClientContext) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Run the callback for one message.
    pub fn invoke(&self, message: &ServerMessage, context: &ClientContext) {
        (self.callback)(message, context)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

/// Handlers registered for one path.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    key: RouteKey,
    early: Vec<Handler>,
    normal: Option<Handler>,
}

impl HandlerEntry {
    fn new(key: RouteKey) -> Self {
        Self {
            key,
            early: Vec::new(),
            normal: None,
        }
    }

    /// Registration path; `None` for the catch-all entry.
    pub fn path(&self) -> Option<&str> {
        self.key.as_path()
    }

    /// Early handlers in registration order.
    pub fn early_handlers(&self) -> &[Handler] {
        &self.early
    }

    /// The normal handler, if one is registered for this path.
    pub fn normal_handler(&self) -> Option<&Handler> {
        self.normal.as_ref()
    }

    fn add(&mut self, phase: Phase, handler: Handler) {
        match phase {
            Phase::Early => self.early.push(handler),
            Phase::Normal => self.normal = Some(handler),
        }
    }
}

/// Immutable snapshot of all registrations.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    entries: HashMap<String, HandlerEntry>,
    catch_all: Option<HandlerEntry>,
}

impl HandlerTable {
    /// Entry responsible for `path`: the longest registered prefix, then the
    /// catch-all. Requests for `*` only ever resolve to a `*` registration.
    pub fn lookup(&self, path: &str) -> Option<&HandlerEntry> {
        candidate_prefixes(path)
            .into_iter()
            .find_map(|candidate| self.entries.get(candidate))
            .or(self.catch_all.as_ref())
            .filter(|entry| entry.key.matches(path))
    }

    /// Number of registered paths, catch-all included.
    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.catch_all.is_some())
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, key: RouteKey, phase: Phase, handler: Handler) {
        let entry = match key.as_path() {
            None => self.catch_all.get_or_insert_with(|| HandlerEntry::new(RouteKey::CatchAll)),
            Some(path) => self
                .entries
                .entry(path.to_string())
                .or_insert_with(|| HandlerEntry::new(key.clone())),
        };
        entry.add(phase, handler);
    }

    fn remove(&mut self, key: &RouteKey) -> bool {
        match key.as_path() {
            None => self.catch_all.take().is_some(),
            Some(path) => self.entries.remove(path).is_some(),
        }
    }
}

/// Path-indexed handler registry shared by every connection of a server.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    table: ArcSwap<HandlerTable>,
}

impl HandlerRegistry {
    /// Registry with an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `path` (`None` = catch-all) in `phase`.
    pub fn add(&self, path: Option<&str>, phase: Phase, handler: Handler) {
        let key = RouteKey::parse(path);
        self.table.rcu(|current| {
            let mut next = HandlerTable::clone(current);
            next.insert(key.clone(), phase, handler.clone());
            next
        });
        tracing::debug!(path = ?key.as_path(), ?phase, "Handler registered");
    }

    /// Remove every handler registered for `path`. Returns whether any was.
    pub fn remove(&self, path: Option<&str>) -> bool {
        let key = RouteKey::parse(path);
        let mut removed = false;
        self.table.rcu(|current| {
            let mut next = HandlerTable::clone(current);
            removed = next.remove(&key);
            next
        });
        tracing::debug!(path = ?key.as_path(), removed, "Handler removed");
        removed
    }

    /// Current table; stays valid while later updates are published.
    pub fn snapshot(&self) -> Arc<HandlerTable> {
        self.table.load_full()
    }
}
