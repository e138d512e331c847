//! Scripted remote peer
//!
//! A `ScriptedPeer` plays a remote node without running any net: it announces
//! the nets it claims, accepts every port request aimed at them and records
//! the control traffic and token deliveries it observes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pnsim_core::{private_topic, SimError, SimResult, Token, Topic, CONTROL_TOPIC};
use pnsim_transport::{Connector, Delivery, Inbox, Qos, Transport};
use pnsim_wire::{decode_tokens, encode_tokens, ControlMessage, DirectoryAction};
use tracing::{debug, trace};

/// Token batch seen by a scripted peer
#[derive(Clone, Debug, PartialEq)]
pub struct Received {
    pub topic: Topic,
    pub tokens: Vec<Token>,
    pub at: Instant,
}

#[derive(Default)]
struct PeerLog {
    data: Vec<Received>,
    control: Vec<String>,
}

struct Responder {
    id: String,
    nets: Vec<String>,
    transport: Arc<dyn Transport>,
    log: Arc<Mutex<PeerLog>>,
}

impl Responder {
    fn run(self, mut inbox: Inbox) {
        while let Some(delivery) = inbox.blocking_recv() {
            if let Err(e) = self.handle(delivery) {
                debug!(peer = %self.id, error = %e, "peer reply failed");
            }
        }
    }

    fn handle(&self, delivery: Delivery) -> SimResult<()> {
        let broadcast = delivery.topic == CONTROL_TOPIC;
        if broadcast || delivery.topic == private_topic(&self.id) {
            self.log.lock().control.push(delivery.payload.clone());
            return self.on_control(&delivery.payload, broadcast);
        }
        let topic = Topic::parse(&delivery.topic)?;
        match decode_tokens(&delivery.payload) {
            Ok(tokens) => self.log.lock().data.push(Received {
                topic,
                tokens,
                at: Instant::now(),
            }),
            Err(e) => trace!(peer = %self.id, error = %e, "undecodable payload"),
        }
        Ok(())
    }

    fn on_control(&self, payload: &str, broadcast: bool) -> SimResult<()> {
        let Ok(message) = ControlMessage::parse(payload) else {
            return Ok(());
        };
        match message {
            ControlMessage::Request(request) if self.nets.contains(&request.target.net) => {
                self.publish(CONTROL_TOPIC, &ControlMessage::ack(&request))?;
                self.publish(CONTROL_TOPIC, &ControlMessage::success(&request))
            }
            ControlMessage::Update {
                action: DirectoryAction::UpdateNets,
                node,
                ..
            } if broadcast && node != self.id => {
                let reply = ControlMessage::Update {
                    action: DirectoryAction::UpdateNets,
                    node: self.id.clone(),
                    nets: self.nets.clone(),
                };
                self.publish(&private_topic(&node), &reply)
            }
            _ => Ok(()),
        }
    }

    fn publish(&self, topic: &str, message: &ControlMessage) -> SimResult<()> {
        self.transport
            .publish(topic, &message.to_string(), Qos::ExactlyOnce)
    }
}

/// Stand-in remote node
pub struct ScriptedPeer {
    id: String,
    nets: Vec<String>,
    transport: Arc<dyn Transport>,
    log: Arc<Mutex<PeerLog>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptedPeer {
    /// Connect as `id`, claiming `nets`; nothing is announced yet
    pub fn connect(connector: &dyn Connector, id: &str, nets: &[&str]) -> SimResult<Self> {
        let (transport, inbox) = connector.connect(id)?;
        transport.subscribe(CONTROL_TOPIC, Qos::ExactlyOnce)?;
        transport.subscribe(&private_topic(id), Qos::ExactlyOnce)?;
        for net in nets {
            transport.subscribe(&Topic::net_filter(net), Qos::ExactlyOnce)?;
        }
        let nets: Vec<String> = nets.iter().map(|n| n.to_string()).collect();
        let log = Arc::new(Mutex::new(PeerLog::default()));
        let responder = Responder {
            id: id.to_string(),
            nets: nets.clone(),
            transport: transport.clone(),
            log: log.clone(),
        };
        let reader = thread::Builder::new()
            .name(format!("pnsim-peer-{}", id))
            .spawn(move || responder.run(inbox))
            .map_err(|e| SimError::Io(e.to_string()))?;
        Ok(ScriptedPeer {
            id: id.to_string(),
            nets,
            transport,
            log,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Broadcast the claimed nets
    pub fn announce(&self) -> SimResult<()> {
        let message = ControlMessage::Update {
            action: DirectoryAction::UpdateNets,
            node: self.id.clone(),
            nets: self.nets.clone(),
        };
        self.transport
            .publish(CONTROL_TOPIC, &message.to_string(), Qos::ExactlyOnce)
    }

    /// Send tokens to a place, as an output port would
    pub fn publish(&self, topic: &Topic, tokens: &[Token]) -> SimResult<()> {
        self.transport
            .publish(&topic.to_string(), &encode_tokens(tokens), Qos::ExactlyOnce)
    }

    /// Publish a raw control payload
    pub fn control(&self, payload: &str) -> SimResult<()> {
        self.transport.publish(CONTROL_TOPIC, payload, Qos::ExactlyOnce)
    }

    pub fn received(&self) -> Vec<Received> {
        self.log.lock().data.clone()
    }

    /// Every token delivered to `topic`, in arrival order
    pub fn tokens_on(&self, topic: &Topic) -> Vec<Token> {
        self.log
            .lock()
            .data
            .iter()
            .filter(|r| &r.topic == topic)
            .flat_map(|r| r.tokens.iter().cloned())
            .collect()
    }

    pub fn control_log(&self) -> Vec<String> {
        self.log.lock().control.clone()
    }

    /// Poll until at least `count` deliveries arrived
    pub fn wait_for_data(&self, count: usize, timeout: Duration) -> bool {
        poll(timeout, || self.log.lock().data.len() >= count)
    }

    /// Poll until a control payload satisfies `predicate`
    pub fn wait_for_control(&self, timeout: Duration, predicate: impl Fn(&str) -> bool) -> bool {
        poll(timeout, || self.log.lock().control.iter().any(|c| predicate(c)))
    }

    /// Disconnect and stop the reader thread
    pub fn close(&self) -> SimResult<()> {
        self.transport.close()?;
        if let Some(reader) = self.reader.lock().take() {
            if reader.join().is_err() {
                return Err(SimError::Io(format!("peer {} reader panicked", self.id)));
            }
        }
        Ok(())
    }
}

impl Drop for ScriptedPeer {
    fn drop(&mut self) {
        let _ = self.transport.close();
    }
}

/// Re-check `condition` every few milliseconds until it holds or `timeout` passes
pub fn poll(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
