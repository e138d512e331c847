//! In-process broker
//!
//! Every publish is routed under one lock, so each subscriber observes
//! messages in global publish order. Fire-and-forget deliveries can be
//! dropped at a configurable rate to exercise loss handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pnsim_core::{SimError, SimResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{Connector, Delivery, Inbox, InboxSender, Qos, TopicFilter, Transport};

/// Broker behaviour
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    /// Loss rate of fire-and-forget deliveries (0.0 - 1.0)
    pub loss_rate: f64,
    /// Seed of the loss generator
    pub seed: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            seed: 0,
        }
    }
}

impl BrokerConfig {
    /// Drop a share of fire-and-forget deliveries
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate: loss_rate.clamp(0.0, 1.0),
            seed,
        }
    }
}

/// Broker counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct Session {
    sender: InboxSender,
    subscriptions: Vec<(TopicFilter, Qos)>,
}

struct BrokerState {
    sessions: HashMap<String, Session>,
    rng: StdRng,
    loss_rate: f64,
    stats: BrokerStats,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &str, qos: Qos) {
        self.stats.published += 1;
        let mut ids: Vec<&String> = self.sessions.keys().collect();
        ids.sort();
        let mut targets = Vec::new();
        for id in ids {
            let session = &self.sessions[id];
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| filter.matches(topic))
                .map(|(_, sub)| qos.effective(*sub))
                .max();
            if let Some(granted) = granted {
                targets.push((id.clone(), granted));
            }
        }
        for (id, granted) in targets {
            if granted == Qos::AtMostOnce && self.rng.gen::<f64>() < self.loss_rate {
                self.stats.dropped += 1;
                trace!(client = %id, topic, "delivery dropped");
                continue;
            }
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.to_string(),
                qos: granted,
            };
            let sent = self
                .sessions
                .get(&id)
                .map(|s| s.sender.send(delivery).is_ok())
                .unwrap_or(false);
            if sent {
                self.stats.delivered += 1;
            }
        }
    }
}

/// Topic broker living inside the process
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState {
                sessions: HashMap::new(),
                rng: StdRng::seed_from_u64(config.seed),
                loss_rate: config.loss_rate,
                stats: BrokerStats::default(),
            })),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats.clone()
    }

    /// Connected client ids, sorted
    pub fn clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Publish without a session, as an external tool would
    pub fn inject(&self, topic: &str, payload: &str, qos: Qos) {
        self.state.lock().route(topic, payload, qos);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryBroker {
    fn connect(&self, client_id: &str) -> SimResult<(Arc<dyn Transport>, Inbox)> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(client_id) {
            return Err(SimError::DuplicateClient(client_id.to_string()));
        }
        let (sender, inbox) = mpsc::unbounded_channel();
        state.sessions.insert(
            client_id.to_string(),
            Session {
                sender,
                subscriptions: Vec::new(),
            },
        );
        debug!(client = %client_id, "client connected");
        let client = MemoryClient {
            id: client_id.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(client), inbox))
    }
}

/// Session handle of a `MemoryBroker` client
pub struct MemoryClient {
    id: String,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> SimResult<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SimError::Disconnected);
        }
        let mut state = self.state.lock();
        state
            .sessions
            .get_mut(&self.id)
            .map(f)
            .ok_or(SimError::Disconnected)
    }
}

impl Transport for MemoryClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self, filter: &str, qos: Qos) -> SimResult<()> {
        let filter = TopicFilter::parse(filter)?;
        self.with_session(|session| {
            session.subscriptions.retain(|(f, _)| f != &filter);
            session.subscriptions.push((filter, qos));
        })
    }

    fn unsubscribe(&self, filter: &str) -> SimResult<()> {
        self.with_session(|session| session.subscriptions.retain(|(f, _)| f.as_str() != filter))
    }

    fn publish(&self, topic: &str, payload: &str, qos: Qos) -> SimResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SimError::Disconnected);
        }
        self.state.lock().route(topic, payload, qos);
        Ok(())
    }

    fn close(&self) -> SimResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.lock().sessions.remove(&self.id);
        debug!(client = %self.id, "client disconnected");
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.state.lock().sessions.remove(&self.id);
        }
    }
}
