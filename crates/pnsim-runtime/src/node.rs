//! PNSim Node - Event loop and net execution
//!
//! A node owns a set of nets, a scheduler of actions and a broker client.
//! The event loop runs on its own thread and hands every due action to a
//! short-lived worker; executions of one net are serialised by its lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use pnsim_core::{PetriNet, PortRole, RunReport, SimError, SimResult, Token, Topic};
use pnsim_time::{Deadline, Scheduler, SimClock, When};
use pnsim_transport::Connector;
use pnsim_wire::PortRequest;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::{BrokerOptions, NodeConfig, PortBrokerClient, PortHost, Shutdown, WakeSignal};

/// Scheduled work
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// Fire the net until quiescence
    ExecuteNet(String),
    /// Release the oldest binding held by a timed transition
    Unblock { net: String, transition: String },
}

impl Action {
    pub fn net(&self) -> &str {
        match self {
            Action::ExecuteNet(net) | Action::Unblock { net, .. } => net,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ExecuteNet(net) => write!(f, "execute({})", net),
            Action::Unblock { net, transition } => write!(f, "unblock({}, {})", net, transition),
        }
    }
}

/// Node lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Constructed,
    /// Ports negotiated, clock started
    Configured,
    Running,
    /// Stopping; workers and broker are being shut down
    Draining,
    Terminated,
}

impl NodeState {
    pub fn name(self) -> &'static str {
        match self {
            NodeState::Constructed => "constructed",
            NodeState::Configured => "configured",
            NodeState::Running => "running",
            NodeState::Draining => "draining",
            NodeState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct NetSlot {
    net: PetriNet,
    rng: StdRng,
}

/// Per-net seed derived from the node seed
fn net_seed(seed: u64, net: &str) -> u64 {
    net.bytes().fold(0xcbf2_9ce4_8422_2325 ^ seed, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Simulation node
pub struct SimNode {
    id: String,
    config: NodeConfig,
    connector: Arc<dyn Connector>,
    nets: RwLock<BTreeMap<String, Arc<Mutex<NetSlot>>>>,
    scheduler: Scheduler<Action>,
    clock: RwLock<Option<SimClock>>,
    state: Mutex<NodeState>,
    wake: Arc<WakeSignal>,
    shutdown: Shutdown,
    broker: RwLock<Option<Arc<PortBrokerClient>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    failure: Mutex<Option<SimError>>,
    this: Weak<SimNode>,
}

impl SimNode {
    pub fn new(config: NodeConfig, connector: Arc<dyn Connector>) -> SimResult<Arc<Self>> {
        config.validate()?;
        let id = config.resolve_node_id();
        let wake = Arc::new(WakeSignal::new());
        let node = Arc::new_cyclic(|this| SimNode {
            id,
            config,
            connector,
            nets: RwLock::new(BTreeMap::new()),
            scheduler: Scheduler::new(),
            clock: RwLock::new(None),
            state: Mutex::new(NodeState::Constructed),
            shutdown: Shutdown::new(wake.clone()),
            wake,
            broker: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
            event_loop: Mutex::new(None),
            failure: Mutex::new(None),
            this: this.clone(),
        });
        info!(node = %node.id, detached = node.config.detached, "node created");
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// First fatal error, if the node failed
    pub fn failure(&self) -> Option<SimError> {
        self.failure.lock().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn clock(&self) -> Option<SimClock> {
        *self.clock.read()
    }

    pub fn net_names(&self) -> Vec<String> {
        self.nets.read().keys().cloned().collect()
    }

    pub fn broker(&self) -> Option<Arc<PortBrokerClient>> {
        self.broker.read().clone()
    }

    /// Register a net and plan its first execution
    pub fn add_net(&self, net: PetriNet) -> SimResult<()> {
        self.expect_state(NodeState::Constructed)?;
        let name = net.name().to_string();
        {
            let mut nets = self.nets.write();
            if nets.contains_key(&name) {
                return Err(SimError::DuplicateNet(name));
            }
            let rng = match self.config.seed {
                Some(seed) => StdRng::seed_from_u64(net_seed(seed, &name)),
                None => StdRng::from_entropy(),
            };
            nets.insert(name.clone(), Arc::new(Mutex::new(NetSlot { net, rng })));
        }
        self.scheduler
            .plan(When::Now, Action::ExecuteNet(name.clone()), 0);
        debug!(node = %self.id, net = %name, "net added");
        Ok(())
    }

    /// Inspect a net under its lock
    pub fn with_net<R>(&self, name: &str, f: impl FnOnce(&PetriNet) -> R) -> SimResult<R> {
        let slot = self.slot(name)?;
        let guard = slot.lock();
        Ok(f(&guard.net))
    }

    pub fn marking(&self, name: &str) -> SimResult<BTreeMap<String, Vec<Token>>> {
        self.with_net(name, PetriNet::marking)
    }

    /// Plan an action at any lifecycle stage
    pub fn plan(&self, action: Action, when: When, priority: i32) {
        self.scheduler.plan(when, action, priority);
        self.wake.notify();
    }

    /// Plan an action on the running clock
    pub fn schedule(&self, action: Action, when: When, priority: i32) -> SimResult<()> {
        self.check_schedulable(when)?;
        self.scheduler.plan(when, action, priority);
        self.wake.notify();
        Ok(())
    }

    /// Schedule `action`, dropping an identical entry planned for the same
    /// time first; entries of `action` at other times stay planned
    pub fn update_time(&self, action: Action, when: When, priority: i32) -> SimResult<()> {
        self.check_schedulable(when)?;
        self.scheduler.remove(when, &action, priority);
        self.scheduler.plan(when, action, priority);
        self.wake.notify();
        Ok(())
    }

    fn check_schedulable(&self, when: When) -> SimResult<()> {
        if !self.scheduler.is_started() {
            return Err(SimError::NotStarted);
        }
        match when {
            When::After(offset) if offset.is_zero() => Err(SimError::NonPositiveTime),
            _ => Ok(()),
        }
    }

    /// Prepare nets, negotiate ports and start the clock
    ///
    /// `run_for` of `None` runs until killed.
    pub fn setup(&self, run_for: Option<Duration>) -> SimResult<()> {
        self.expect_state(NodeState::Constructed)?;
        if matches!(run_for, Some(d) if d.is_zero()) {
            return Err(SimError::NonPositiveEndTime);
        }
        if let Err(e) = self.negotiate() {
            error!(node = %self.id, error = %e, "setup failed");
            self.record_failure(e.clone());
            self.teardown();
            return Err(e);
        }
        let clock = SimClock::start(run_for)?;
        *self.clock.write() = Some(clock);
        self.scheduler.start(clock.start_instant())?;
        self.set_state(NodeState::Configured);
        info!(node = %self.id, run_for = ?run_for, "node configured");
        Ok(())
    }

    /// Spawn the event loop
    pub fn start(&self) -> SimResult<()> {
        self.expect_state(NodeState::Configured)?;
        let node = self.arc()?;
        self.set_state(NodeState::Running);
        let handle = thread::Builder::new()
            .name(format!("pnsim-node-{}", self.id))
            .spawn(move || node.event_loop())
            .map_err(|e| SimError::Io(e.to_string()))?;
        *self.event_loop.lock() = Some(handle);
        info!(node = %self.id, "node started");
        Ok(())
    }

    /// Setup, start and wait for the end
    pub fn run(&self, run_for: Option<Duration>) -> SimResult<()> {
        self.setup(run_for)?;
        self.start()?;
        self.join()
    }

    /// Wait for the event loop; returns the failure that stopped the node, if any
    pub fn join(&self) -> SimResult<()> {
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.record_failure(SimError::Io("event loop panicked".into()));
            }
        }
        match self.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn kill(&self) {
        if self.shutdown.trigger() {
            info!(node = %self.id, "kill requested");
        }
    }

    /// Record a fatal error and stop
    pub fn fail(&self, error: SimError) {
        error!(node = %self.id, error = %error, "node failed");
        self.record_failure(error);
        self.kill();
    }

    /// Fire `name` until no transition is enabled and flush its output ports
    pub fn execute_net(&self, name: &str) -> SimResult<RunReport> {
        let slot = self.slot(name)?;
        let clock = self.clock();
        let (report, outputs) = {
            let mut guard = slot.lock();
            let NetSlot { net, rng } = &mut *guard;
            let shutdown = &self.shutdown;
            let should_stop =
                || shutdown.is_triggered() || clock.map(|c| c.is_over()).unwrap_or(false);
            let report = net.run(rng, &should_stop)?;
            let outputs = net.drain_outputs();
            if self.config.debug {
                debug!(node = %self.id, net = %name, marking = %net, "marking");
            }
            (report, outputs)
        };
        if !report.fired.is_empty() {
            debug!(node = %self.id, net = %name, fired = report.fired.len(), "net executed");
        }

        for timer in &report.timers {
            self.schedule_unblock(name, &timer.transition, timer.after)?;
        }
        let broker = self.broker();
        for (topics, tokens) in outputs {
            for topic in topics {
                let topic = Topic::parse(&topic)?;
                match &broker {
                    Some(broker) => broker.topic_publish(&topic, tokens.clone())?,
                    None => debug!(node = %self.id, topic = %topic, "no broker, tokens dropped"),
                }
            }
        }
        self.wake.notify();
        Ok(report)
    }

    fn unblock(&self, name: &str, transition: &str) -> SimResult<()> {
        let slot = self.slot(name)?;
        let again = {
            let mut guard = slot.lock();
            let index = guard.net.transition_index(transition).ok_or_else(|| {
                SimError::UnknownTransition {
                    net: name.to_string(),
                    transition: transition.to_string(),
                }
            })?;
            guard.net.unblock(index)?
        };
        if let Some(after) = again {
            self.schedule_unblock(name, transition, after)?;
        }
        self.update_time(Action::ExecuteNet(name.to_string()), When::Now, 0)
    }

    fn schedule_unblock(&self, net: &str, transition: &str, after: Duration) -> SimResult<()> {
        let elapsed = self
            .clock()
            .map(|c| c.elapsed())
            .ok_or(SimError::NotStarted)?;
        self.schedule(
            Action::Unblock {
                net: net.to_string(),
                transition: transition.to_string(),
            },
            When::After(elapsed + after),
            0,
        )
    }

    fn negotiate(&self) -> SimResult<()> {
        let slots: Vec<(String, Arc<Mutex<NetSlot>>)> = self
            .nets
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();
        for (_, slot) in &slots {
            slot.lock().net.prepare()?;
        }

        let host: Weak<dyn PortHost> = self.this.clone();
        let broker = PortBrokerClient::connect(
            &self.id,
            slots.iter().map(|(name, _)| name.clone()).collect(),
            self.connector.as_ref(),
            host,
            BrokerOptions {
                detached: self.config.detached,
                request_retry: self.config.request_retry,
            },
        )?;
        *self.broker.write() = Some(broker.clone());
        broker.announce()?;

        for (name, slot) in &slots {
            let ports = slot.lock().net.ports().to_vec();
            for port in ports {
                let local = Topic::new(name.clone(), port.place.clone());
                let request = match port.direction {
                    PortRole::Output => PortRequest::set_input(port.topic),
                    PortRole::Input => PortRequest::set_output(port.topic, &local),
                    PortRole::Unbound => continue,
                };
                broker.request(request)?;
            }
        }
        self.wait_net_ports(&broker)
    }

    /// Block until every sent request is confirmed or the port timeout expires
    fn wait_net_ports(&self, broker: &PortBrokerClient) -> SimResult<()> {
        let started = Instant::now();
        let deadline = started + self.config.port_timeout;
        loop {
            if self.shutdown.is_triggered() {
                return Err(self.failure().unwrap_or(SimError::Killed));
            }
            let seen = self.wake.generation();
            if broker.is_ready() {
                debug!(
                    node = %self.id,
                    waited = %humantime::format_duration(started.elapsed()),
                    "ports configured"
                );
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SimError::PortNegotiationTimeout {
                    waited: now - started,
                    pending: broker.outstanding(),
                });
            }
            broker.retry_unacknowledged()?;
            let wait = (deadline - now).min(self.config.request_retry);
            self.wake.wait_since(seen, Some(wait));
        }
    }

    fn event_loop(self: Arc<Self>) {
        let Some(clock) = self.clock() else {
            self.fail(SimError::NotStarted);
            self.teardown();
            return;
        };
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let seen = self.wake.generation();
            let now = Instant::now();
            match self.scheduler.peek_next_deadline() {
                Some(Deadline::Now) => self.dispatch_next(now),
                Some(Deadline::At(at)) => {
                    if clock.is_over_at(now) {
                        info!(node = %self.id, "end time reached");
                        break;
                    }
                    if at <= now {
                        self.dispatch_next(now);
                    } else {
                        let until_due = at - now;
                        let wait = clock
                            .remaining(now)
                            .map_or(until_due, |left| left.min(until_due));
                        self.wake.wait_since(seen, Some(wait));
                    }
                }
                Some(Deadline::Never) | None => {
                    self.prune_workers();
                    if clock.is_over_at(now) {
                        info!(node = %self.id, "end time reached");
                        break;
                    }
                    self.wake.wait_since(seen, clock.remaining(now));
                }
            }
        }
        self.teardown();
    }

    fn dispatch_next(&self, now: Instant) {
        let Some((deadline, action)) = self.scheduler.pop_next() else {
            return;
        };
        let late = deadline.lateness(now);
        if late > self.config.drift_tolerance {
            warn!(
                node = %self.id,
                action = %action,
                late = %humantime::format_duration(late),
                "scheduling drift"
            );
        }
        debug!(node = %self.id, action = %action, "dispatch");
        let Ok(node) = self.arc() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name(format!("pnsim-worker-{}", self.id))
            .spawn(move || {
                let result = match &action {
                    Action::ExecuteNet(net) => node.execute_net(net).map(|_| ()),
                    Action::Unblock { net, transition } => node.unblock(net, transition),
                };
                if let Err(e) = result {
                    node.fail(e);
                }
                node.wake.notify();
            });
        match spawned {
            Ok(handle) => self.workers.lock().push(handle),
            Err(e) => self.fail(SimError::Io(e.to_string())),
        }
    }

    fn prune_workers(&self) {
        self.workers.lock().retain(|worker| !worker.is_finished());
    }

    /// Join workers, close the broker client and terminate
    fn teardown(&self) {
        {
            let mut state = self.state.lock();
            if *state == NodeState::Terminated {
                return;
            }
            *state = NodeState::Draining;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current && worker.join().is_err() {
                warn!(node = %self.id, "worker panicked");
            }
        }
        let broker = self.broker.write().take();
        if let Some(broker) = broker {
            if let Err(e) = broker.close() {
                warn!(node = %self.id, error = %e, "broker client close failed");
            }
        }
        self.set_state(NodeState::Terminated);
        self.wake.notify();
        info!(node = %self.id, "node terminated");
    }

    fn arc(&self) -> SimResult<Arc<SimNode>> {
        self.this.upgrade().ok_or(SimError::Killed)
    }

    fn slot(&self, name: &str) -> SimResult<Arc<Mutex<NetSlot>>> {
        self.nets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::UnknownNet(name.to_string()))
    }

    fn expect_state(&self, expected: NodeState) -> SimResult<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(SimError::InvalidState {
                expected: expected.name(),
                actual: actual.name(),
            })
        }
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    fn record_failure(&self, error: SimError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

impl PortHost for SimNode {
    fn has_place(&self, target: &Topic) -> bool {
        self.with_net(&target.net, |net| net.place(&target.place).is_some())
            .unwrap_or(false)
    }

    fn bind_port(
        &self,
        target: &Topic,
        role: PortRole,
        destination: Option<&Topic>,
    ) -> SimResult<()> {
        let slot = self.slot(&target.net)?;
        let mut guard = slot.lock();
        match (role, destination) {
            (PortRole::Input, _) => guard.net.accept_input(&target.place)?,
            (PortRole::Output, Some(destination)) => {
                guard.net.accept_output(&target.place, destination)?
            }
            (PortRole::Output, None) => return Err(SimError::InvalidTopic(target.to_string())),
            (PortRole::Unbound, _) => return Ok(()),
        }
        debug!(node = %self.id, place = %target, role = %role, "port bound");
        Ok(())
    }

    fn deliver(&self, topic: &Topic, tokens: Vec<Token>) -> SimResult<()> {
        let slot = self.slot(&topic.net)?;
        {
            let mut guard = slot.lock();
            let role = guard
                .net
                .place(&topic.place)
                .map(|place| place.role())
                .ok_or_else(|| SimError::UnknownPlace {
                    net: topic.net.clone(),
                    place: topic.place.clone(),
                })?;
            if role != PortRole::Input {
                return Err(SimError::NotAnInputPort {
                    net: topic.net.clone(),
                    place: topic.place.clone(),
                });
            }
            guard.net.deposit(&topic.place, tokens)?;
        }
        if self.scheduler.is_started() {
            self.update_time(Action::ExecuteNet(topic.net.clone()), When::Now, 0)?;
        }
        Ok(())
    }

    fn ports_changed(&self) {
        self.wake.notify();
    }

    fn fail(&self, error: SimError) {
        SimNode::fail(self, error);
    }
}
