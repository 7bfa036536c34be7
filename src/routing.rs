//! Instance routing: bounded route memory, the 5-way resolver, and the
//! output-channel chooser.

use crate::state::StateStore;
use crate::{AgentType, InstanceKey, RouteHint};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const MESSAGE_ROUTE_CAP: usize = 4000;
const CONVERSATION_ROUTE_CAP: usize = 2000;
const PROMPT_MEMORY_CAP: usize = 2000;

/// A remembered `(project, instance, agent type)` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub project: String,
    pub instance_id: String,
    pub agent_type: AgentType,
}

/// HashMap with FIFO eviction at a fixed cap.
struct BoundedMap<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    cap: usize,
}

impl<V> BoundedMap<V> {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }
}

/// Bounded maps remembering where recent messages were routed. The router
/// writes after every dispatch; the resolver, poller, and hook server read.
pub struct RouteMemory {
    by_message: Mutex<BoundedMap<Route>>,
    by_conversation: Mutex<BoundedMap<Route>>,
    last_prompt: Mutex<BoundedMap<String>>,
}

impl RouteMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_message: Mutex::new(BoundedMap::new(MESSAGE_ROUTE_CAP)),
            by_conversation: Mutex::new(BoundedMap::new(CONVERSATION_ROUTE_CAP)),
            last_prompt: Mutex::new(BoundedMap::new(PROMPT_MEMORY_CAP)),
        })
    }

    pub fn remember_message(&self, message_id: &str, route: Route) {
        self.by_message
            .lock()
            .expect("route memory")
            .insert(message_id.to_string(), route);
    }

    pub fn remember_conversation(&self, conversation_key: &str, route: Route) {
        self.by_conversation
            .lock()
            .expect("route memory")
            .insert(conversation_key.to_string(), route);
    }

    pub fn route_for_message(&self, message_id: &str) -> Option<Route> {
        self.by_message
            .lock()
            .expect("route memory")
            .get(message_id)
            .cloned()
    }

    pub fn route_for_conversation(&self, conversation_key: &str) -> Option<Route> {
        self.by_conversation
            .lock()
            .expect("route memory")
            .get(conversation_key)
            .cloned()
    }

    /// Remember the prompt text an instance last dispatched, for `/retry`.
    pub fn remember_prompt(&self, key: &InstanceKey, prompt: &str) {
        self.last_prompt
            .lock()
            .expect("route memory")
            .insert(key.to_string(), prompt.to_string());
    }

    pub fn last_prompt(&self, key: &InstanceKey) -> Option<String> {
        self.last_prompt
            .lock()
            .expect("route memory")
            .get(&key.to_string())
            .cloned()
    }
}

/// How a route was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Mapped,
    ReplyMemory,
    ConversationMemory,
    ChannelMapping,
    Primary,
}

/// Context carried by an inbound message or event.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub reply_to_message_id: Option<String>,
    pub conversation_key: Option<String>,
    pub thread_id: Option<String>,
    pub route_channel_id: Option<String>,
}

/// What the resolver needs to find an instance.
#[derive(Debug, Clone)]
pub struct RouteQuery {
    pub agent_type: AgentType,
    pub project_name: String,
    pub channel_id: String,
    pub message_id: Option<String>,
    pub mapped_instance_id: Option<String>,
    pub context: RouteContext,
}

/// A resolved route plus its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub route: Route,
    pub source: RouteSource,
}

impl ResolvedRoute {
    /// The informational reaction shown for this route, if any. Replies and
    /// threads point at their origin; a non-thread conversation match came
    /// from route memory.
    pub fn hint(&self, context: &RouteContext) -> Option<RouteHint> {
        match self.source {
            RouteSource::ReplyMemory => Some(RouteHint::Reply),
            RouteSource::ConversationMemory => {
                if context.conversation_key.is_some()
                    && context.conversation_key == context.thread_id
                {
                    Some(RouteHint::Thread)
                } else {
                    Some(RouteHint::Memory)
                }
            }
            RouteSource::Mapped | RouteSource::ChannelMapping | RouteSource::Primary => None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.route.project.clone(), self.route.instance_id.clone())
    }
}

/// Deterministic instance lookup. Precedence, first non-empty wins:
/// mapped instance id, reply memory, conversation memory, channel mapping,
/// primary instance for the agent type.
pub struct RouteResolver {
    store: Arc<dyn StateStore>,
    memory: Arc<RouteMemory>,
}

impl RouteResolver {
    pub fn new(store: Arc<dyn StateStore>, memory: Arc<RouteMemory>) -> Arc<Self> {
        Arc::new(Self { store, memory })
    }

    pub fn resolve(&self, query: &RouteQuery) -> Option<ResolvedRoute> {
        // (1) Explicit mapping from the messaging layer.
        if let Some(mapped) = query
            .mapped_instance_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            if let Some(instance) = self.store.instance(&query.project_name, mapped) {
                return Some(ResolvedRoute {
                    route: Route {
                        project: query.project_name.clone(),
                        instance_id: mapped.to_string(),
                        agent_type: instance.agent_type,
                    },
                    source: RouteSource::Mapped,
                });
            }
        }

        // (2) Route memory by the replied-to message.
        if let Some(reply_to) = query
            .context
            .reply_to_message_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            if let Some(route) = self.memory.route_for_message(reply_to) {
                return Some(ResolvedRoute {
                    route,
                    source: RouteSource::ReplyMemory,
                });
            }
        }

        // (3) Route memory by conversation key.
        if let Some(conversation) = query
            .context
            .conversation_key
            .as_deref()
            .filter(|key| !key.is_empty())
        {
            if let Some(route) = self.memory.route_for_conversation(conversation) {
                return Some(ResolvedRoute {
                    route,
                    source: RouteSource::ConversationMemory,
                });
            }
        }

        // (4) Channel mapping on the project.
        let route_channel = query
            .context
            .route_channel_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&query.channel_id);
        if let Some(project) = self.store.project(&query.project_name) {
            if let Some((instance_id, instance)) = project.instance_for_channel(route_channel) {
                return Some(ResolvedRoute {
                    route: Route {
                        project: query.project_name.clone(),
                        instance_id: instance_id.to_string(),
                        agent_type: instance.agent_type,
                    },
                    source: RouteSource::ChannelMapping,
                });
            }

            // (5) Primary instance for the agent type.
            if let Some((instance_id, instance)) = project.primary_for(query.agent_type) {
                return Some(ResolvedRoute {
                    route: Route {
                        project: query.project_name.clone(),
                        instance_id: instance_id.to_string(),
                        agent_type: instance.agent_type,
                    },
                    source: RouteSource::Primary,
                });
            }
        }

        None
    }
}

/// Pick the destination channel for agent output.
///
/// With exactly one pending turn the reply follows the turn (a follow-up
/// posted in a thread gets its reply in the thread); with a backlog the
/// output goes to the instance's default channel so interleaved turns don't
/// land in the wrong thread.
pub fn output_route(
    default_channel: Option<&str>,
    pending_channel: Option<&str>,
    pending_depth: usize,
) -> Option<String> {
    let chosen = if pending_depth > 1 {
        default_channel.or(pending_channel)
    } else {
        pending_channel.or(default_channel)
    };
    chosen
        .filter(|channel| !channel.is_empty())
        .map(str::to_string)
}
