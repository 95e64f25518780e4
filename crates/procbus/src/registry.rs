//! Handler registry: who handles and who watches each message name.
//!
//! Handlers live in an id-keyed arena; install and watch lists only hold ids.
//! Removing a handler is a single pass over the lists, and a chain that was
//! snapshotted before the removal keeps running on its own copy.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::handler::{Handler, HandlerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// A supervised worker process.
    Module,
    /// An in-process callback registered by the embedding application.
    Inline,
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub name: String,
    pub kind: HandlerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// One link of a handler chain, detached from the registry.
#[derive(Clone)]
pub struct ChainLink {
    pub id: HandlerId,
    pub handler: Arc<dyn Handler>,
}

struct Entry {
    handler: Arc<dyn Handler>,
    kind: HandlerKind,
}

#[derive(Debug, Clone, Copy)]
struct Installed {
    id: HandlerId,
    priority: i64,
}

#[derive(Default)]
pub struct Registry {
    next_id: HandlerId,
    handlers: HashMap<HandlerId, Entry>,
    installs: HashMap<String, Vec<Installed>>,
    watchers: HashMap<String, Vec<HandlerId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a fresh id without registering anything yet.
    pub fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, id: HandlerId, handler: Arc<dyn Handler>, kind: HandlerKind) {
        self.handlers.insert(id, Entry { handler, kind });
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>, kind: HandlerKind) -> HandlerId {
        let id = self.allocate_id();
        self.insert(id, handler, kind);
        id
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn kind(&self, id: HandlerId) -> Option<HandlerKind> {
        self.handlers.get(&id).map(|e| e.kind)
    }

    /// Insert or re-prioritize `id` for `name`; the list stays sorted by
    /// ascending priority, ties in insertion order.
    pub fn install(&mut self, name: &str, id: HandlerId, priority: i64) {
        if !self.contains(id) {
            tracing::warn!(%name, id, "Install for unknown handler ignored");
            return;
        }
        let list = self.installs.entry(name.to_string()).or_default();
        match list.iter_mut().find(|i| i.id == id) {
            Some(existing) => existing.priority = priority,
            None => list.push(Installed { id, priority }),
        }
        list.sort_by_key(|i| i.priority);
    }

    /// Returns whether an entry was removed.
    pub fn uninstall(&mut self, name: &str, id: HandlerId) -> bool {
        let Some(list) = self.installs.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|i| i.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.installs.remove(name);
        }
        self.release_inline(id);
        removed
    }

    /// First inline handler installed for `name`, in chain order.
    pub fn first_inline(&self, name: &str) -> Option<HandlerId> {
        self.installs
            .get(name)?
            .iter()
            .find(|i| self.kind(i.id) == Some(HandlerKind::Inline))
            .map(|i| i.id)
    }

    /// Idempotent: a handler watches a name at most once.
    pub fn watch(&mut self, name: &str, id: HandlerId) {
        if !self.contains(id) {
            tracing::warn!(%name, id, "Watch for unknown handler ignored");
            return;
        }
        let list = self.watchers.entry(name.to_string()).or_default();
        if !list.contains(&id) {
            list.push(id);
        }
    }

    pub fn unwatch(&mut self, name: &str, id: HandlerId) -> bool {
        let Some(list) = self.watchers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| *w != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.watchers.remove(name);
        }
        self.release_inline(id);
        removed
    }

    /// Drop `id` from every install and watch list and from the arena.
    pub fn unsubscribe(&mut self, id: HandlerId) {
        for list in self.installs.values_mut() {
            list.retain(|i| i.id != id);
        }
        self.installs.retain(|_, list| !list.is_empty());
        for list in self.watchers.values_mut() {
            list.retain(|w| *w != id);
        }
        self.watchers.retain(|_, list| !list.is_empty());
        self.handlers.remove(&id);
    }

    /// Snapshot of the handler chain for `name`, in priority order.
    pub fn chain(&self, name: &str) -> Vec<ChainLink> {
        self.installs
            .get(name)
            .map(|list| {
                list.iter()
                    .filter_map(|i| self.link(i.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of the watchers for `name`.
    pub fn watchers(&self, name: &str) -> Vec<ChainLink> {
        self.watchers
            .get(name)
            .map(|list| list.iter().filter_map(|id| self.link(*id)).collect())
            .unwrap_or_default()
    }

    pub fn installs_info(&self, name: &str) -> Vec<HandlerInfo> {
        self.installs
            .get(name)
            .map(|list| {
                list.iter()
                    .filter_map(|i| self.info(i.id, Some(i.priority)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn watchers_info(&self, name: &str) -> Vec<HandlerInfo> {
        self.watchers
            .get(name)
            .map(|list| list.iter().filter_map(|id| self.info(*id, None)).collect())
            .unwrap_or_default()
    }

    /// Names that currently have at least one handler installed.
    pub fn messages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.installs.keys().cloned().collect();
        names.sort();
        names
    }

    fn link(&self, id: HandlerId) -> Option<ChainLink> {
        self.handlers.get(&id).map(|e| ChainLink {
            id,
            handler: Arc::clone(&e.handler),
        })
    }

    fn info(&self, id: HandlerId, priority: Option<i64>) -> Option<HandlerInfo> {
        self.handlers.get(&id).map(|e| HandlerInfo {
            id,
            name: e.handler.name(),
            kind: e.kind,
            priority,
        })
    }

    // Inline callbacks only exist through their installs/watches.
    fn release_inline(&mut self, id: HandlerId) {
        if self.kind(id) != Some(HandlerKind::Inline) {
            return;
        }
        let referenced = self.installs.values().any(|l| l.iter().any(|i| i.id == id))
            || self.watchers.values().any(|l| l.contains(&id));
        if !referenced {
            self.handlers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FnHandler, HandlerError};
    use crate::message::Message;

    fn inline(label: &str) -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(label, |m: Message| async move {
            Ok::<_, HandlerError>(m)
        }))
    }

    fn names(reg: &Registry, name: &str) -> Vec<String> {
        reg.chain(name).iter().map(|l| l.handler.name()).collect()
    }

    #[test]
    fn install_sorts_by_priority_with_stable_ties() {
        let mut reg = Registry::new();
        let a = reg.register(inline("a"), HandlerKind::Module);
        let b = reg.register(inline("b"), HandlerKind::Module);
        let c = reg.register(inline("c"), HandlerKind::Module);

        reg.install("job", a, 50);
        reg.install("job", b, 10);
        reg.install("job", c, 50);
        assert_eq!(names(&reg, "job"), ["b", "a", "c"]);
    }

    #[test]
    fn reinstall_updates_priority_in_place() {
        let mut reg = Registry::new();
        let a = reg.register(inline("a"), HandlerKind::Module);
        let b = reg.register(inline("b"), HandlerKind::Module);
        reg.install("job", a, 1);
        reg.install("job", b, 2);

        reg.install("job", a, 3);
        assert_eq!(names(&reg, "job"), ["b", "a"]);
        assert_eq!(reg.installs_info("job").len(), 2);
        assert_eq!(reg.installs_info("job")[1].priority, Some(3));
    }

    #[test]
    fn first_inline_skips_modules() {
        let mut reg = Registry::new();
        let m = reg.register(inline("mod"), HandlerKind::Module);
        let i = reg.register(inline("host"), HandlerKind::Inline);
        reg.install("job", m, 1);
        reg.install("job", i, 2);

        assert_eq!(reg.first_inline("job"), Some(i));
        assert!(reg.uninstall("job", i));
        assert_eq!(reg.first_inline("job"), None);
        // inline entry is gone once nothing references it
        assert!(!reg.contains(i));
        assert!(reg.contains(m));
    }

    #[test]
    fn watch_is_idempotent_and_unwatch_symmetric() {
        let mut reg = Registry::new();
        let w = reg.register(inline("w"), HandlerKind::Module);
        reg.watch("evt", w);
        reg.watch("evt", w);
        assert_eq!(reg.watchers("evt").len(), 1);

        assert!(reg.unwatch("evt", w));
        assert!(reg.watchers("evt").is_empty());
        assert!(!reg.unwatch("evt", w));
    }

    #[test]
    fn unsubscribe_removes_every_reference() {
        let mut reg = Registry::new();
        let a = reg.register(inline("a"), HandlerKind::Module);
        let b = reg.register(inline("b"), HandlerKind::Module);
        reg.install("x", a, 1);
        reg.install("y", a, 1);
        reg.install("y", b, 2);
        reg.watch("x", a);

        let snapshot = reg.chain("y");
        reg.unsubscribe(a);

        assert_eq!(reg.messages(), ["y"]);
        assert_eq!(names(&reg, "y"), ["b"]);
        assert!(reg.watchers("x").is_empty());
        assert!(!reg.contains(a));
        // a chain taken earlier is unaffected
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut reg = Registry::new();
        reg.install("x", 42, 1);
        reg.watch("x", 42);
        assert!(reg.messages().is_empty());
        assert!(reg.watchers_info("x").is_empty());
    }
}
