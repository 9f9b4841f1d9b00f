//! Message bus: graph-gated delivery between agents, plus a global observer
//! side channel. Grounded on the teacher's `ipc::event::EventBroadcaster`
//! (a cheap-clone wrapper around `tokio::sync::broadcast` whose `publish`
//! swallows the send `Result` — a receiver-less send is not an error).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::model::{CommunicationGraph, Message};

const CHANNEL_CAPACITY: usize = 1024;

type HandlerId = u64;

/// A live subscription. Dropping it (or calling [`Unsubscribe::cancel`])
/// removes the handler.
pub struct Unsubscribe {
    bus: MessageBus,
    agent_id: Option<String>,
    handler_id: HandlerId,
}

impl Unsubscribe {
    pub fn cancel(self) {
        if let Some(agent_id) = &self.agent_id {
            self.bus.remove_agent_handler(agent_id, self.handler_id);
        } else {
            self.bus.remove_global_handler(self.handler_id);
        }
    }
}

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct Inner {
    graph: CommunicationGraph,
    global: HashMap<HandlerId, Handler>,
    per_agent: HashMap<String, HashMap<HandlerId, Handler>>,
    /// Every agent that has ever subscribed, for broadcast fan-out even if
    /// their handler map is momentarily empty.
    known_agents: HashMap<String, ()>,
}

/// Cheap-clone handle shared across the orchestrator; mirrors the teacher's
/// `EventBroadcaster` clone-cheap design.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<RwLock<Inner>>,
    next_id: Arc<AtomicU64>,
    /// Observer tap used by tests/UI fan-out that want a `Receiver` rather
    /// than a closure handler.
    tap: broadcast::Sender<Message>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            tap,
        }
    }

    pub fn tap(&self) -> broadcast::Receiver<Message> {
        self.tap.subscribe()
    }

    fn alloc_id(&self) -> HandlerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self, agent_id: impl Into<String>, handler: impl Fn(&Message) + Send + Sync + 'static) -> Unsubscribe {
        let agent_id = agent_id.into();
        let id = self.alloc_id();
        let mut inner = self.inner.write().expect("bus lock poisoned");
        inner
            .per_agent
            .entry(agent_id.clone())
            .or_default()
            .insert(id, Arc::new(handler));
        inner.known_agents.insert(agent_id.clone(), ());
        Unsubscribe {
            bus: self.clone(),
            agent_id: Some(agent_id),
            handler_id: id,
        }
    }

    pub fn subscribe_all(&self, handler: impl Fn(&Message) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.alloc_id();
        let mut inner = self.inner.write().expect("bus lock poisoned");
        inner.global.insert(id, Arc::new(handler));
        Unsubscribe {
            bus: self.clone(),
            agent_id: None,
            handler_id: id,
        }
    }

    fn remove_agent_handler(&self, agent_id: &str, id: HandlerId) {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        if let Some(handlers) = inner.per_agent.get_mut(agent_id) {
            handlers.remove(&id);
        }
    }

    fn remove_global_handler(&self, id: HandlerId) {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        inner.global.remove(&id);
    }

    pub fn can_communicate(&self, from: &str, to: &str) -> bool {
        let inner = self.inner.read().expect("bus lock poisoned");
        inner.graph.can_communicate(from, to)
    }

    pub fn update_graph(&self, graph: CommunicationGraph) {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        inner.graph = graph;
    }

    /// Delivers `message` to global handlers first (unconditionally), then
    /// to per-agent handlers subject to the CommunicationGraph. A handler
    /// panicking would otherwise poison delivery to the rest; each handler
    /// call is isolated via `catch_unwind` so one bad observer cannot break
    /// delivery to the others.
    pub fn publish(&self, message: Message) {
        let _ = self.tap.send(message.clone());

        let inner = self.inner.read().expect("bus lock poisoned");
        for handler in inner.global.values() {
            invoke(handler, &message);
        }

        match &message.to_agent_id {
            Some(to) => {
                if inner.graph.can_communicate(&message.from_agent_id, to) {
                    if let Some(handlers) = inner.per_agent.get(to) {
                        for handler in handlers.values() {
                            invoke(handler, &message);
                        }
                    }
                }
            }
            None => {
                for (agent_id, handlers) in &inner.per_agent {
                    if agent_id == &message.from_agent_id {
                        continue;
                    }
                    if inner.graph.can_communicate(&message.from_agent_id, agent_id) {
                        for handler in handlers.values() {
                            invoke(handler, &message);
                        }
                    }
                }
            }
        }
    }
}

fn invoke(handler: &Handler, message: &Message) {
    let handler = handler.clone();
    let message = message.clone();
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&message))) {
        tracing::error!(?panic, "message bus handler panicked, isolating");
    }
}
