//! The domain orchestration tree.
//!
//! Domains host the periodic callback contexts. A synchronous domain is
//! ticked by its parent (before- or after-tagged); an asynchronous domain
//! owns its own thread and is only started and stopped. The registry is an
//! explicit object passed to whoever needs to look up a peer domain by
//! name; there are no global tables.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

/// Index into a `DomainRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Synchronous,
    Asynchronous,
}

/// Whether a child domain ticks before or after its parent's own tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOrder {
    BeforeParentTick,
    AfterParentTick,
}

/// Lifecycle of a domain: `init` once, then repeated `tick` (synchronous)
/// or a thread loop of ticks (asynchronous), then `cleanup`.
pub trait DomainHandler: Send {
    fn init(&mut self) {}
    fn tick(&mut self) {}
    fn cleanup(&mut self) {}
}

struct DomainNode {
    name: String,
    kind: DomainKind,
    #[allow(dead_code)]
    parent: Option<DomainId>,
    children: Vec<(DomainId, TickOrder)>,
    /// Present for synchronous domains and stopped asynchronous ones;
    /// moved into the thread while an asynchronous domain runs.
    handler: Option<Box<dyn DomainHandler>>,
    /// Asynchronous runtime state.
    period: Duration,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Box<dyn DomainHandler>>>,
}

pub struct DomainRegistry {
    nodes: Vec<DomainNode>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Add a synchronous domain under `parent` (or as a root).
    pub fn add(
        &mut self,
        name: impl Into<String>,
        parent: Option<DomainId>,
        order: TickOrder,
        handler: Box<dyn DomainHandler>,
    ) -> DomainId {
        self.insert(name.into(), DomainKind::Synchronous, parent, order, handler, Duration::ZERO)
    }

    /// Add an asynchronous domain that ticks on its own thread every
    /// `period` once started.
    pub fn add_async(
        &mut self,
        name: impl Into<String>,
        parent: Option<DomainId>,
        handler: Box<dyn DomainHandler>,
        period: Duration,
    ) -> DomainId {
        self.insert(
            name.into(),
            DomainKind::Asynchronous,
            parent,
            TickOrder::AfterParentTick,
            handler,
            period,
        )
    }

    fn insert(
        &mut self,
        name: String,
        kind: DomainKind,
        parent: Option<DomainId>,
        order: TickOrder,
        handler: Box<dyn DomainHandler>,
        period: Duration,
    ) -> DomainId {
        let id = DomainId(self.nodes.len() as u32);
        self.nodes.push(DomainNode {
            name,
            kind,
            parent,
            children: Vec::new(),
            handler: Some(handler),
            period,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        });
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(parent.0 as usize) {
                node.children.push((id, order));
            }
        }
        id
    }

    pub fn find(&self, name: &str) -> Option<DomainId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(|i| DomainId(i as u32))
    }

    pub fn kind(&self, id: DomainId) -> Option<DomainKind> {
        self.nodes.get(id.0 as usize).map(|n| n.kind)
    }

    /// Initialize every domain whose handler is present (synchronous
    /// domains; asynchronous handlers init inside their own thread).
    pub fn init(&mut self) {
        for node in &mut self.nodes {
            if node.kind == DomainKind::Synchronous {
                if let Some(h) = node.handler.as_mut() {
                    h.init();
                }
            }
        }
    }

    /// Tick a domain: before-tagged synchronous children first, then the
    /// node's own handler, then after-tagged synchronous children.
    /// Asynchronous children are never ticked from here.
    pub fn tick(&mut self, id: DomainId) {
        let children = match self.nodes.get(id.0 as usize) {
            Some(node) => node.children.clone(),
            None => return,
        };

        for &(child, order) in &children {
            if order == TickOrder::BeforeParentTick && self.is_sync(child) {
                self.tick(child);
            }
        }

        if let Some(node) = self.nodes.get_mut(id.0 as usize) {
            if let Some(h) = node.handler.as_mut() {
                h.tick();
            }
        }

        for &(child, order) in &children {
            if order == TickOrder::AfterParentTick && self.is_sync(child) {
                self.tick(child);
            }
        }
    }

    fn is_sync(&self, id: DomainId) -> bool {
        self.kind(id) == Some(DomainKind::Synchronous)
    }

    /// Start every asynchronous domain's thread.
    pub fn start(&mut self) {
        for node in &mut self.nodes {
            if node.kind != DomainKind::Asynchronous || node.thread.is_some() {
                continue;
            }
            let Some(mut handler) = node.handler.take() else {
                continue;
            };
            node.stop.store(false, Ordering::Release);
            let stop = node.stop.clone();
            let period = node.period;
            let thread = thread::Builder::new()
                .name(format!("domain-{}", node.name))
                .spawn(move || {
                    handler.init();
                    while !stop.load(Ordering::Acquire) {
                        handler.tick();
                        thread::sleep(period);
                    }
                    handler.cleanup();
                    handler
                });
            match thread {
                Ok(t) => node.thread = Some(t),
                Err(e) => warn!("failed to start domain thread '{}': {}", node.name, e),
            }
        }
    }

    /// Stop every asynchronous domain and join its thread. Handlers are
    /// returned to their nodes so the tree can be restarted.
    pub fn stop(&mut self) {
        for node in &mut self.nodes {
            node.stop.store(true, Ordering::Release);
        }
        for node in &mut self.nodes {
            if let Some(thread) = node.thread.take() {
                match thread.join() {
                    Ok(handler) => node.handler = Some(handler),
                    Err(_) => warn!("domain thread '{}' panicked", node.name),
                }
            }
        }
    }

    /// Run `cleanup` on every synchronous handler, leaves first.
    pub fn cleanup(&mut self) {
        for node in self.nodes.iter_mut().rev() {
            if node.kind == DomainKind::Synchronous {
                if let Some(h) = node.handler.as_mut() {
                    h.cleanup();
                }
            }
        }
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DomainHandler for Recorder {
        fn tick(&mut self) {
            self.log.lock().unwrap().push(self.label);
        }
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn DomainHandler> {
        Box::new(Recorder {
            label,
            log: log.clone(),
        })
    }

    #[test]
    fn tick_order_respects_before_and_after_tags() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = DomainRegistry::new();
        let root = reg.add("root", None, TickOrder::AfterParentTick, recorder("root", &log));
        reg.add("pre", Some(root), TickOrder::BeforeParentTick, recorder("pre", &log));
        reg.add("post", Some(root), TickOrder::AfterParentTick, recorder("post", &log));

        reg.tick(root);
        assert_eq!(*log.lock().unwrap(), vec!["pre", "root", "post"]);
    }

    #[test]
    fn async_children_are_not_ticked_by_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = DomainRegistry::new();
        let root = reg.add("root", None, TickOrder::AfterParentTick, recorder("root", &log));
        reg.add_async("bg", Some(root), recorder("bg", &log), Duration::from_millis(1));

        reg.tick(root);
        assert_eq!(*log.lock().unwrap(), vec!["root"]);
    }

    #[test]
    fn async_domain_runs_on_its_own_thread() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = DomainRegistry::new();
        reg.add_async("bg", None, recorder("bg", &log), Duration::from_millis(1));

        reg.start();
        std::thread::sleep(Duration::from_millis(20));
        reg.stop();

        let ticks = log.lock().unwrap().len();
        assert!(ticks > 0);

        // Stopped handler is returned; the tree can restart.
        reg.start();
        std::thread::sleep(Duration::from_millis(10));
        reg.stop();
        assert!(log.lock().unwrap().len() > ticks);
    }

    #[test]
    fn find_looks_up_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = DomainRegistry::new();
        let root = reg.add("root", None, TickOrder::AfterParentTick, recorder("root", &log));
        assert_eq!(reg.find("root"), Some(root));
        assert_eq!(reg.find("missing"), None);
    }
}
