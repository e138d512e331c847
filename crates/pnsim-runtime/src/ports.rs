//! Port broker client
//!
//! Bridges the port roles of local places to the transport. Remote roles
//! are negotiated over the `control` topic:
//!
//! 1. Every node announces its nets with `U, update_nets`.
//! 2. A port whose peer net is known sends `R`; the owner replies `A` on
//!    receipt and `S` (or `F`) once the place is configured.
//! 3. Requests and publishes aimed at a net nobody announced yet wait in a
//!    per-net backlog and are replayed in order when the net shows up.
//!
//! The node counts as ready once every sent request got both replies.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pnsim_core::{private_topic, PortRole, SimError, SimResult, Token, Topic, CONTROL_TOPIC};
use pnsim_transport::{Connector, Delivery, Inbox, Qos, Transport};
use pnsim_wire::{
    decode_tokens, encode_tokens, ControlMessage, DirectoryAction, PortAction, PortRequest,
};
use tracing::{debug, error, info, trace, warn};

/// Node-side operations the broker client calls back into
pub trait PortHost: Send + Sync {
    fn has_place(&self, target: &Topic) -> bool;

    /// Give a local place a port role; `destination` is set for outputs
    fn bind_port(&self, target: &Topic, role: PortRole, destination: Option<&Topic>)
        -> SimResult<()>;

    /// Deposit tokens into a local input place and re-run its net
    fn deliver(&self, topic: &Topic, tokens: Vec<Token>) -> SimResult<()>;

    /// Negotiation progressed; readiness may have changed
    fn ports_changed(&self);

    /// Tear the node down
    fn fail(&self, error: SimError);
}

/// Broker client behaviour
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerOptions {
    /// Drop publishes to unknown nets instead of queueing them
    pub detached: bool,
    /// Re-publish interval of unacknowledged requests
    pub request_retry: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            detached: true,
            request_retry: Duration::from_secs(2),
        }
    }
}

/// Outbound work held until its net is announced
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BacklogEntry {
    Request(PortRequest),
    Publish { topic: Topic, payload: String },
}

#[derive(Debug)]
struct PendingRequest {
    request: PortRequest,
    acked: bool,
    succeeded: bool,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    /// Sent requests by wire form
    pending: HashMap<String, PendingRequest>,
    /// Replies still expected, two per request
    outstanding: usize,
    /// Remote net -> owning node
    directory: HashMap<String, String>,
    peers: HashSet<String>,
    backlog: HashMap<String, VecDeque<BacklogEntry>>,
    closed: bool,
}

impl Bookkeeping {
    fn backlogged_requests(&self) -> usize {
        self.backlog
            .values()
            .flatten()
            .filter(|entry| matches!(entry, BacklogEntry::Request(_)))
            .count()
    }
}

fn role_for(action: PortAction) -> PortRole {
    match action {
        PortAction::SetInput => PortRole::Input,
        PortAction::SetOutput => PortRole::Output,
    }
}

/// Control-plane and data-plane client of one node
pub struct PortBrokerClient {
    id: String,
    nets: Vec<String>,
    transport: Arc<dyn Transport>,
    host: Weak<dyn PortHost>,
    options: BrokerOptions,
    state: Mutex<Bookkeeping>,
    /// Orders outbound requests and publishes against backlog replay;
    /// taken before `state`
    outbound: Mutex<()>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl PortBrokerClient {
    /// Open a session for `id`, subscribe and start the delivery thread
    pub fn connect(
        id: &str,
        nets: Vec<String>,
        connector: &dyn Connector,
        host: Weak<dyn PortHost>,
        options: BrokerOptions,
    ) -> SimResult<Arc<Self>> {
        let (transport, inbox) = connector.connect(id)?;
        transport.subscribe(CONTROL_TOPIC, Qos::ExactlyOnce)?;
        transport.subscribe(&private_topic(id), Qos::ExactlyOnce)?;
        for net in &nets {
            transport.subscribe(&Topic::net_filter(net), Qos::ExactlyOnce)?;
        }

        let client = Arc::new(PortBrokerClient {
            id: id.to_string(),
            nets,
            transport,
            host,
            options,
            state: Mutex::new(Bookkeeping::default()),
            outbound: Mutex::new(()),
            delivery: Mutex::new(None),
        });
        let weak = Arc::downgrade(&client);
        let handle = thread::Builder::new()
            .name(format!("pnsim-delivery-{}", id))
            .spawn(move || delivery_loop(weak, inbox))
            .map_err(|e| SimError::Io(e.to_string()))?;
        *client.delivery.lock() = Some(handle);

        info!(node = %client.id, nets = ?client.nets, "broker client connected");
        Ok(client)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nets(&self) -> &[String] {
        &self.nets
    }

    /// Every port request was applied: none waits in the backlog and
    /// every sent one got its `A` and `S`
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.outstanding == 0 && state.backlogged_requests() == 0
    }

    /// Replies still expected, counting two for every backlogged request
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.outstanding + 2 * state.backlogged_requests()
    }

    /// Known remote nets and their owners
    pub fn directory(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .directory
            .iter()
            .map(|(net, node)| (net.clone(), node.clone()))
            .collect()
    }

    /// Entries waiting for `net` to be announced
    pub fn backlog(&self, net: &str) -> Vec<BacklogEntry> {
        self.state
            .lock()
            .backlog
            .get(net)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Broadcast the nets hosted here
    pub fn announce(&self) -> SimResult<()> {
        self.publish_control(&self.directory_update(DirectoryAction::UpdateNets))
    }

    /// Configure a remote (or local) place
    ///
    /// Local targets are applied directly, known remote targets are sent,
    /// unknown ones wait in the backlog.
    pub fn request(&self, request: PortRequest) -> SimResult<()> {
        if self.nets.contains(&request.target.net) {
            return self.apply_locally(&request);
        }
        let _order = self.outbound.lock();
        {
            let mut state = self.state.lock();
            if !state.directory.contains_key(&request.target.net) {
                debug!(node = %self.id, request = %request, "target net unknown, request queued");
                state
                    .backlog
                    .entry(request.target.net.clone())
                    .or_default()
                    .push_back(BacklogEntry::Request(request));
                return Ok(());
            }
        }
        self.send(request)
    }

    /// Re-publish requests still waiting for their `A`
    pub fn retry_unacknowledged(&self) -> SimResult<usize> {
        let now = Instant::now();
        let due: Vec<PortRequest> = {
            let mut state = self.state.lock();
            state
                .pending
                .values_mut()
                .filter(|p| !p.acked && now.duration_since(p.sent_at) >= self.options.request_retry)
                .map(|p| {
                    p.sent_at = now;
                    p.request.clone()
                })
                .collect()
        };
        for request in &due {
            debug!(node = %self.id, request = %request, "request re-sent");
            self.publish_control(&ControlMessage::Request(request.clone()))?;
        }
        Ok(due.len())
    }

    /// Route tokens leaving an output place
    pub fn topic_publish(&self, topic: &Topic, tokens: Vec<Token>) -> SimResult<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        if self.nets.contains(&topic.net) {
            if let Err(e) = self.host()?.deliver(topic, tokens) {
                warn!(node = %self.id, topic = %topic, error = %e, "local tokens dropped");
            }
            return Ok(());
        }
        let payload = encode_tokens(&tokens);
        let _order = self.outbound.lock();
        {
            let mut state = self.state.lock();
            if state.closed {
                debug!(node = %self.id, topic = %topic, "client closed, publish dropped");
                return Ok(());
            }
            if !state.directory.contains_key(&topic.net) {
                if self.options.detached {
                    debug!(node = %self.id, topic = %topic, "net unknown, publish dropped");
                } else {
                    debug!(node = %self.id, topic = %topic, "net unknown, publish queued");
                    state
                        .backlog
                        .entry(topic.net.clone())
                        .or_default()
                        .push_back(BacklogEntry::Publish {
                            topic: topic.clone(),
                            payload,
                        });
                }
                return Ok(());
            }
        }
        trace!(node = %self.id, topic = %topic, payload = %payload, "publish");
        self.transport
            .publish(&topic.to_string(), &payload, Qos::ExactlyOnce)
    }

    /// Withdraw our nets, report unserved work and disconnect
    pub fn close(&self) -> SimResult<()> {
        let (backlog, pending) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.outstanding = 0;
            (
                std::mem::take(&mut state.backlog),
                std::mem::take(&mut state.pending),
            )
        };
        if let Err(e) = self.publish_control(&self.directory_update(DirectoryAction::RemoveNets)) {
            debug!(node = %self.id, error = %e, "remove notice not sent");
        }
        for (net, entries) in backlog {
            for entry in entries {
                warn!(node = %self.id, net = %net, entry = ?entry, "backlog entry left unserved");
            }
        }
        for (raw, entry) in pending {
            warn!(node = %self.id, request = %raw, acked = entry.acked, "request left unserved");
        }

        self.transport.close()?;
        let handle = self.delivery.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(node = %self.id, "delivery thread panicked");
            }
        }
        info!(node = %self.id, "broker client closed");
        Ok(())
    }

    fn host(&self) -> SimResult<Arc<dyn PortHost>> {
        self.host.upgrade().ok_or(SimError::Killed)
    }

    fn fail(&self, error: SimError) {
        if let Some(host) = self.host.upgrade() {
            host.fail(error);
        }
    }

    fn directory_update(&self, action: DirectoryAction) -> ControlMessage {
        ControlMessage::Update {
            action,
            node: self.id.clone(),
            nets: self.nets.clone(),
        }
    }

    fn publish_control(&self, message: &ControlMessage) -> SimResult<()> {
        trace!(node = %self.id, message = %message, "control out");
        self.transport
            .publish(CONTROL_TOPIC, &message.to_string(), Qos::ExactlyOnce)
    }

    fn apply_locally(&self, request: &PortRequest) -> SimResult<()> {
        let destination = request.destination();
        if request.action == PortAction::SetOutput && destination.is_none() {
            return Err(SimError::InvalidTopic(request.source.clone()));
        }
        debug!(node = %self.id, request = %request, "local port wiring");
        self.host()?
            .bind_port(&request.target, role_for(request.action), destination.as_ref())
    }

    fn send(&self, request: PortRequest) -> SimResult<()> {
        let key = request.to_string();
        {
            let mut state = self.state.lock();
            if state.pending.contains_key(&key) {
                return Ok(());
            }
            state.pending.insert(
                key.clone(),
                PendingRequest {
                    request: request.clone(),
                    acked: false,
                    succeeded: false,
                    sent_at: Instant::now(),
                },
            );
            state.outstanding += 2;
        }
        debug!(node = %self.id, request = %key, "request sent");
        self.publish_control(&ControlMessage::Request(request))
    }

    fn replay(&self, entry: BacklogEntry) -> SimResult<()> {
        match entry {
            BacklogEntry::Request(request) => {
                debug!(node = %self.id, request = %request, "backlog request replayed");
                self.send(request)
            }
            BacklogEntry::Publish { topic, payload } => {
                debug!(node = %self.id, topic = %topic, "backlog publish replayed");
                self.transport
                    .publish(&topic.to_string(), &payload, Qos::ExactlyOnce)
            }
        }
    }

    fn handle(&self, delivery: Delivery) {
        if delivery.topic == CONTROL_TOPIC {
            self.handle_control(&delivery.payload, true);
        } else if delivery.topic == private_topic(&self.id) {
            self.handle_control(&delivery.payload, false);
        } else {
            self.handle_data(&delivery.topic, &delivery.payload);
        }
    }

    fn handle_control(&self, payload: &str, broadcast: bool) {
        let message = match ControlMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                error!(node = %self.id, payload, "malformed control message");
                self.fail(e);
                return;
            }
        };
        trace!(node = %self.id, message = %message, "control in");
        let handled = match message {
            ControlMessage::Request(request) => self.serve(request),
            ControlMessage::Ack(raw) => {
                self.confirm(&raw, false);
                Ok(())
            }
            ControlMessage::Success(raw) => {
                self.confirm(&raw, true);
                Ok(())
            }
            ControlMessage::Failure { request, reason } => {
                self.on_failure(request, reason);
                Ok(())
            }
            ControlMessage::Update { action, node, nets } => {
                self.on_update(action, node, nets, broadcast)
            }
        };
        match handled {
            Ok(()) => {}
            Err(SimError::Disconnected) => {
                debug!(node = %self.id, "control reply dropped, client closed")
            }
            Err(e) => warn!(node = %self.id, error = %e, "control message not handled"),
        }
    }

    /// Apply a request aimed at one of our places
    fn serve(&self, request: PortRequest) -> SimResult<()> {
        if !self.nets.contains(&request.target.net) {
            return Ok(());
        }
        let host = self.host()?;
        let raw = request.to_string();
        if !host.has_place(&request.target) {
            warn!(node = %self.id, request = %raw, "request for unknown place");
            return self.publish_control(&ControlMessage::failure(raw, "unknown place"));
        }
        self.publish_control(&ControlMessage::ack(&request))?;

        let applied = match (request.action, request.destination()) {
            (PortAction::SetInput, _) => host.bind_port(&request.target, PortRole::Input, None),
            (PortAction::SetOutput, Some(destination)) => {
                host.bind_port(&request.target, PortRole::Output, Some(&destination))
            }
            (PortAction::SetOutput, None) => Err(SimError::InvalidTopic(request.source.clone())),
        };
        match applied {
            Ok(()) => {
                debug!(node = %self.id, request = %raw, "request served");
                self.publish_control(&ControlMessage::success(&request))
            }
            Err(e) => {
                warn!(node = %self.id, request = %raw, error = %e, "request refused");
                self.publish_control(&ControlMessage::failure(raw, e.to_string()))
            }
        }
    }

    /// Record an `A` (or an `S` when `applied`) for one of our requests
    fn confirm(&self, raw: &str, applied: bool) {
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.pending.get_mut(raw) else {
                trace!(node = %self.id, request = raw, "reply for untracked request");
                return;
            };
            let flag = if applied {
                &mut entry.succeeded
            } else {
                &mut entry.acked
            };
            if *flag {
                return;
            }
            *flag = true;
            let done = entry.acked && entry.succeeded;
            if done {
                state.pending.remove(raw);
            }
            state.outstanding = state.outstanding.saturating_sub(1);
            state.outstanding == 0
        };
        if ready {
            info!(node = %self.id, "all port requests confirmed");
        }
        if let Some(host) = self.host.upgrade() {
            host.ports_changed();
        }
    }

    fn on_failure(&self, request: String, reason: Option<String>) {
        let tracked = self.state.lock().pending.remove(&request).is_some();
        if !tracked {
            trace!(node = %self.id, request = %request, "failure for untracked request ignored");
            return;
        }
        let reason = reason.unwrap_or_else(|| "unspecified".to_string());
        error!(node = %self.id, request = %request, reason = %reason, "request refused by peer");
        self.fail(SimError::RemoteFailure { request, reason });
    }

    fn on_update(
        &self,
        action: DirectoryAction,
        node: String,
        nets: Vec<String>,
        broadcast: bool,
    ) -> SimResult<()> {
        if node == self.id {
            return Ok(());
        }
        match action {
            DirectoryAction::UpdateNets => {
                // New traffic for these nets waits until the backlog is out
                let _order = self.outbound.lock();
                let (replay, reply) = {
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    if state.closed {
                        return Ok(());
                    }
                    let new_peer = state.peers.insert(node.clone());
                    let mut replay = Vec::new();
                    for net in &nets {
                        state.directory.insert(net.clone(), node.clone());
                        if let Some(entries) = state.backlog.remove(net) {
                            replay.extend(entries);
                        }
                    }
                    (replay, broadcast && new_peer)
                };
                info!(node = %self.id, peer = %node, nets = ?nets, "peer nets known");
                if reply {
                    // Late joiners learn about us without a new broadcast
                    let update = self.directory_update(DirectoryAction::UpdateNets);
                    self.transport.publish(
                        &private_topic(&node),
                        &update.to_string(),
                        Qos::ExactlyOnce,
                    )?;
                }
                for entry in replay {
                    self.replay(entry)?;
                }
            }
            DirectoryAction::RemoveNets => {
                {
                    let mut state = self.state.lock();
                    for net in &nets {
                        if state.directory.get(net) == Some(&node) {
                            state.directory.remove(net);
                        }
                    }
                    state.peers.remove(&node);
                }
                info!(node = %self.id, peer = %node, nets = ?nets, "peer nets removed");
            }
        }
        Ok(())
    }

    fn handle_data(&self, topic: &str, payload: &str) {
        let topic = match Topic::parse(topic) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(node = %self.id, error = %e, "inbound tokens on invalid topic dropped");
                return;
            }
        };
        if !self.nets.contains(&topic.net) {
            return;
        }
        let tokens = match decode_tokens(payload) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(node = %self.id, topic = %topic, error = %e, "undecodable tokens dropped");
                return;
            }
        };
        let Some(host) = self.host.upgrade() else {
            return;
        };
        trace!(node = %self.id, topic = %topic, count = tokens.len(), "tokens in");
        if let Err(e) = host.deliver(&topic, tokens) {
            warn!(node = %self.id, topic = %topic, error = %e, "inbound tokens dropped");
        }
    }
}

fn delivery_loop(client: Weak<PortBrokerClient>, mut inbox: Inbox) {
    while let Some(delivery) = inbox.blocking_recv() {
        let Some(client) = client.upgrade() else {
            break;
        };
        client.handle(delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnsim_transport::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHost {
        nets: Vec<String>,
        places: Vec<Topic>,
        bound: Mutex<Vec<(Topic, PortRole, Option<Topic>)>>,
        delivered: Mutex<Vec<(Topic, Vec<Token>)>>,
        failures: Mutex<Vec<SimError>>,
        changes: AtomicUsize,
    }

    impl FakeHost {
        fn with_places(places: &[&str]) -> Arc<Self> {
            let places: Vec<Topic> = places.iter().map(|p| Topic::parse(p).unwrap()).collect();
            let mut nets: Vec<String> = places.iter().map(|t| t.net.clone()).collect();
            nets.dedup();
            Arc::new(FakeHost {
                nets,
                places,
                ..Default::default()
            })
        }
    }

    impl PortHost for FakeHost {
        fn has_place(&self, target: &Topic) -> bool {
            self.places.contains(target)
        }

        fn bind_port(
            &self,
            target: &Topic,
            role: PortRole,
            destination: Option<&Topic>,
        ) -> SimResult<()> {
            self.bound
                .lock()
                .push((target.clone(), role, destination.cloned()));
            Ok(())
        }

        fn deliver(&self, topic: &Topic, tokens: Vec<Token>) -> SimResult<()> {
            self.delivered.lock().push((topic.clone(), tokens));
            Ok(())
        }

        fn ports_changed(&self) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn fail(&self, error: SimError) {
            self.failures.lock().push(error);
        }
    }

    fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn recv(inbox: &mut Inbox) -> Delivery {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(delivery) = inbox.try_recv() {
                return delivery;
            }
            assert!(Instant::now() < deadline, "no delivery");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn control_payloads(inbox: &mut Inbox, count: usize) -> Vec<String> {
        let mut out = Vec::new();
        while out.len() < count {
            let d = recv(inbox);
            if d.topic == CONTROL_TOPIC {
                out.push(d.payload);
            }
        }
        out
    }

    fn client(
        broker: &MemoryBroker,
        id: &str,
        host: &Arc<FakeHost>,
        detached: bool,
    ) -> Arc<PortBrokerClient> {
        let weak: Weak<dyn PortHost> = Arc::downgrade(host) as Weak<dyn PortHost>;
        PortBrokerClient::connect(
            id,
            host.nets.clone(),
            broker,
            weak,
            BrokerOptions {
                detached,
                request_retry: Duration::from_millis(50),
            },
        )
        .unwrap()
    }

    fn observer(broker: &MemoryBroker) -> (Arc<dyn Transport>, Inbox) {
        let (transport, inbox) = broker.connect("observer").unwrap();
        transport.subscribe("#", Qos::ExactlyOnce).unwrap();
        (transport, inbox)
    }

    #[test]
    fn test_announce() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["room/Q gain", "heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        c.announce().unwrap();
        assert_eq!(
            control_payloads(&mut inbox, 1),
            vec!["U, update_nets, sim-1, room&heater"]
        );
    }

    #[test]
    fn test_unknown_net_request_is_backlogged_and_replayed() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);

        let request = PortRequest::set_input(Topic::new("room", "Q gain"));
        c.request(request.clone()).unwrap();
        assert_eq!(c.backlog("room"), vec![BacklogEntry::Request(request.clone())]);
        assert!(!c.is_ready());
        assert_eq!(c.outstanding(), 2);

        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        let seen = control_payloads(&mut inbox, 2);
        assert_eq!(seen[1], "R, set_input, room/Q gain, /");
        eventually("replay", || c.backlog("room").is_empty());
        assert_eq!(c.outstanding(), 2);
        assert_eq!(c.directory().get("room").map(String::as_str), Some("sim-2"));

        let raw = request.to_string();
        broker.inject("control", &format!("A, {}", raw), Qos::ExactlyOnce);
        broker.inject("control", &format!("A, {}", raw), Qos::ExactlyOnce);
        eventually("ack", || c.outstanding() == 1);
        broker.inject("control", &format!("S, {}", raw), Qos::ExactlyOnce);
        eventually("success", || c.is_ready());
        assert!(host.changes.load(Ordering::SeqCst) >= 2);
        assert!(host.failures.lock().is_empty());
    }

    #[test]
    fn test_new_peer_gets_private_directory() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["heater/Q out"]);
        let _c = client(&broker, "sim-1", &host, true);

        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        let reply = loop {
            let d = recv(&mut inbox);
            if d.topic == "private/sim-2" {
                break d.payload;
            }
        };
        assert_eq!(reply, "U, update_nets, sim-1, heater");
    }

    #[test]
    fn test_serve_request() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["room/Q gain", "room/T out"]);
        let _c = client(&broker, "sim-2", &host, true);

        broker.inject("control", "R, set_input, room/Q gain, /", Qos::ExactlyOnce);
        let seen = control_payloads(&mut inbox, 3);
        assert_eq!(seen[1], "A, R, set_input, room/Q gain, /");
        assert_eq!(seen[2], "S, R, set_input, room/Q gain, /");

        broker.inject(
            "control",
            "R, set_output, room/T out, heater/T in",
            Qos::ExactlyOnce,
        );
        let seen = control_payloads(&mut inbox, 3);
        assert_eq!(seen[1], "A, R, set_output, room/T out, heater/T in");
        assert_eq!(seen[2], "S, R, set_output, room/T out, heater/T in");
        let bound = host.bound.lock().clone();
        assert_eq!(
            bound,
            vec![
                (Topic::new("room", "Q gain"), PortRole::Input, None),
                (
                    Topic::new("room", "T out"),
                    PortRole::Output,
                    Some(Topic::new("heater", "T in"))
                ),
            ]
        );
    }

    #[test]
    fn test_unknown_place_gets_failure() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["room/Q gain"]);
        let _c = client(&broker, "sim-2", &host, true);

        broker.inject("control", "R, set_input, room/Nope, /", Qos::ExactlyOnce);
        let seen = control_payloads(&mut inbox, 2);
        assert_eq!(seen[1], "F, R, set_input, room/Nope, / - unknown place");
        assert!(host.bound.lock().is_empty());
    }

    #[test]
    fn test_requests_for_other_nets_are_ignored() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["room/Q gain"]);
        let c = client(&broker, "sim-2", &host, true);
        broker.inject("control", "R, set_input, kitchen/Q gain, /", Qos::ExactlyOnce);
        broker.inject("control", "U, update_nets, sim-9, kitchen", Qos::ExactlyOnce);
        eventually("directory", || c.directory().contains_key("kitchen"));
        assert!(host.bound.lock().is_empty());
    }

    #[test]
    fn test_malformed_control_is_fatal() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["room/Q gain"]);
        let _c = client(&broker, "sim-1", &host, true);
        broker.inject("control", "X, what", Qos::ExactlyOnce);
        eventually("failure", || !host.failures.lock().is_empty());
        assert!(matches!(
            host.failures.lock()[0],
            SimError::MalformedControl(_)
        ));
    }

    #[test]
    fn test_failure_only_fatal_for_own_requests() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        eventually("directory", || c.directory().contains_key("room"));

        broker.inject(
            "control",
            "F, R, set_input, kitchen/x, / - unknown place",
            Qos::ExactlyOnce,
        );
        c.request(PortRequest::set_input(Topic::new("room", "Nope")))
            .unwrap();
        broker.inject(
            "control",
            "F, R, set_input, room/Nope, / - unknown place",
            Qos::ExactlyOnce,
        );
        eventually("failure", || !host.failures.lock().is_empty());
        let failures = host.failures.lock().clone();
        assert_eq!(
            failures,
            vec![SimError::RemoteFailure {
                request: "R, set_input, room/Nope, /".into(),
                reason: "unknown place".into()
            }]
        );
    }

    #[test]
    fn test_duplicate_requests_not_resent() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        eventually("directory", || c.directory().contains_key("room"));
        let request = PortRequest::set_input(Topic::new("room", "Q gain"));
        c.request(request.clone()).unwrap();
        c.request(request).unwrap();
        assert_eq!(c.outstanding(), 2);
    }

    #[test]
    fn test_retry_unacknowledged() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        eventually("directory", || c.directory().contains_key("room"));
        c.request(PortRequest::set_input(Topic::new("room", "Q gain")))
            .unwrap();
        assert_eq!(c.retry_unacknowledged().unwrap(), 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(c.retry_unacknowledged().unwrap(), 1);
        broker.inject(
            "control",
            "A, R, set_input, room/Q gain, /",
            Qos::ExactlyOnce,
        );
        eventually("ack", || c.outstanding() == 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(c.retry_unacknowledged().unwrap(), 0);
    }

    #[test]
    fn test_local_request_short_circuits() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["room/Q gain", "heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        c.request(PortRequest::set_output(
            Topic::new("heater", "Q out"),
            &Topic::new("room", "Q gain"),
        ))
        .unwrap();
        assert!(c.is_ready());
        assert_eq!(
            host.bound.lock().clone(),
            vec![(
                Topic::new("heater", "Q out"),
                PortRole::Output,
                Some(Topic::new("room", "Q gain"))
            )]
        );
        c.topic_publish(&Topic::new("room", "Q gain"), vec![Token::from(1.5)])
            .unwrap();
        assert_eq!(
            host.delivered.lock().clone(),
            vec![(Topic::new("room", "Q gain"), vec![Token::from(1.5)])]
        );
        assert_eq!(broker.stats().published, 0);
    }

    #[test]
    fn test_detached_drops_unknown_publish() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        c.topic_publish(&Topic::new("room", "Q gain"), vec![Token::from(2)])
            .unwrap();
        assert!(c.backlog("room").is_empty());
        assert_eq!(broker.stats().published, 0);
    }

    #[test]
    fn test_attached_replays_publish_in_order() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, false);

        c.request(PortRequest::set_input(Topic::new("room", "Q gain")))
            .unwrap();
        c.topic_publish(&Topic::new("room", "Q gain"), vec![Token::from(1), Token::from(2)])
            .unwrap();
        assert_eq!(c.backlog("room").len(), 2);

        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        let mut seen = Vec::new();
        while seen.len() < 3 {
            let d = recv(&mut inbox);
            if !d.topic.starts_with("private/") {
                seen.push((d.topic, d.payload));
            }
        }
        assert_eq!(
            seen[1],
            ("control".to_string(), "R, set_input, room/Q gain, /".to_string())
        );
        assert_eq!(seen[2], ("room/Q gain".to_string(), "int:1&int:2".to_string()));
    }

    #[test]
    fn test_replay_precedes_concurrent_publish() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, false);
        let gain = Topic::new("room", "Q gain");
        for i in 1..=3i64 {
            c.topic_publish(&gain, vec![Token::from(i)]).unwrap();
        }

        let publisher = {
            let c = c.clone();
            let gain = gain.clone();
            thread::spawn(move || {
                let mut after_announce = 0;
                while after_announce < 20 {
                    if c.directory().contains_key("room") {
                        after_announce += 1;
                    }
                    c.topic_publish(&gain, vec![Token::from(100i64)]).unwrap();
                    thread::sleep(Duration::from_micros(200));
                }
            })
        };
        broker.inject("control", "U, update_nets, sim-2, room", Qos::ExactlyOnce);
        publisher.join().unwrap();

        let mut data = Vec::new();
        while data.len() < 4 {
            let d = recv(&mut inbox);
            if d.topic == "room/Q gain" {
                data.push(d.payload);
            }
        }
        assert_eq!(data, vec!["int:1", "int:2", "int:3", "int:100"]);
        assert!(c.backlog("room").is_empty());
    }

    #[test]
    fn test_inbound_tokens_delivered() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["room/Q gain"]);
        let _c = client(&broker, "sim-2", &host, true);
        broker.inject("room/Q gain", "float:1.5&float:2.0", Qos::ExactlyOnce);
        broker.inject("room/Q gain", "float:oops", Qos::ExactlyOnce);
        broker.inject("room/Q gain", "int:3", Qos::ExactlyOnce);
        eventually("delivery", || host.delivered.lock().len() == 2);
        let delivered = host.delivered.lock().clone();
        assert_eq!(delivered[0].1, vec![Token::from(1.5), Token::from(2.0)]);
        assert_eq!(delivered[1].1, vec![Token::from(3)]);
        assert!(host.failures.lock().is_empty());
    }

    #[test]
    fn test_remove_nets_forgets_peer() {
        let broker = MemoryBroker::new();
        let host = FakeHost::with_places(&["heater/Q out"]);
        let c = client(&broker, "sim-1", &host, true);
        broker.inject("control", "U, update_nets, sim-2, room&kitchen", Qos::ExactlyOnce);
        eventually("directory", || c.directory().len() == 2);
        broker.inject("control", "U, remove_nets, sim-2, room", Qos::ExactlyOnce);
        eventually("removal", || c.directory().len() == 1);
        assert!(c.directory().contains_key("kitchen"));
    }

    #[test]
    fn test_close_publishes_remove_notice() {
        let broker = MemoryBroker::new();
        let (_obs, mut inbox) = observer(&broker);
        let host = FakeHost::with_places(&["room/Q gain"]);
        let c = client(&broker, "sim-2", &host, true);
        c.close().unwrap();
        c.close().unwrap();
        assert_eq!(
            control_payloads(&mut inbox, 1),
            vec!["U, remove_nets, sim-2, room"]
        );
        assert_eq!(broker.clients(), vec!["observer".to_string()]);
    }
}
