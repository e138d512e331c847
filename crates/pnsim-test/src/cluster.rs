//! Multi-node harness
//!
//! A `Cluster` runs several `SimNode`s against one `MemoryBroker`. Setup
//! runs on one thread per node because a node blocks there until its
//! peers have answered its port requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pnsim_core::{PetriNet, SimError, SimResult, Token};
use pnsim_runtime::{NodeConfig, SimNode};
use pnsim_transport::{BrokerConfig, MemoryBroker};
use tracing::info;

/// Harness configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Template applied to every node; ids are assigned per node
    pub node: NodeConfig,
    pub broker: BrokerConfig,
    /// Length of each run
    pub run_for: Duration,
}

impl ClusterConfig {
    /// Short run on a reliable broker
    pub fn minimal() -> Self {
        ClusterConfig {
            node: NodeConfig::testing(),
            broker: BrokerConfig::default(),
            run_for: Duration::from_millis(300),
        }
    }

    /// Longer run, for timed models
    pub fn standard() -> Self {
        ClusterConfig {
            run_for: Duration::from_secs(1),
            ..Self::minimal()
        }
    }

    /// Publishes to unknown nets wait in the backlog
    pub fn attached() -> Self {
        let mut config = Self::minimal();
        config.node.detached = false;
        config
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::minimal()
    }
}

/// Outcome of a cluster run
#[derive(Debug, Default)]
pub struct ClusterReport {
    /// Final result of each node, by id
    pub results: BTreeMap<String, SimResult<()>>,
    /// Final marking of every net, by net name
    pub markings: BTreeMap<String, BTreeMap<String, Vec<Token>>>,
}

impl ClusterReport {
    pub fn all_ok(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    /// First failure, in node id order
    pub fn first_error(&self) -> Option<&SimError> {
        self.results.values().find_map(|r| r.as_ref().err())
    }

    pub fn tokens(&self, net: &str, place: &str) -> Vec<Token> {
        self.markings
            .get(net)
            .and_then(|m| m.get(place))
            .cloned()
            .unwrap_or_default()
    }
}

/// Nodes sharing one in-process broker
pub struct Cluster {
    config: ClusterConfig,
    broker: MemoryBroker,
    nodes: Vec<Arc<SimNode>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let broker = MemoryBroker::with_config(config.broker.clone());
        Cluster {
            config,
            broker,
            nodes: Vec::new(),
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn nodes(&self) -> &[Arc<SimNode>] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Arc<SimNode>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Add a node hosting `nets`, configured from the cluster template
    pub fn add_node(&mut self, id: &str, nets: Vec<PetriNet>) -> SimResult<Arc<SimNode>> {
        let config = self.config.node.clone().with_node_id(id);
        self.add_node_with(config, nets)
    }

    pub fn add_node_with(&mut self, config: NodeConfig, nets: Vec<PetriNet>) -> SimResult<Arc<SimNode>> {
        let node = SimNode::new(config, Arc::new(self.broker.clone()))?;
        for net in nets {
            node.add_net(net)?;
        }
        self.nodes.push(node.clone());
        Ok(node)
    }

    /// Set up every node concurrently, then start them all
    ///
    /// Nodes whose setup fails are left terminated; the first setup error is
    /// returned after the others were started.
    pub fn start(&self) -> SimResult<()> {
        let run_for = Some(self.config.run_for);
        let setups: Vec<SimResult<()>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .nodes
                .iter()
                .map(|node| scope.spawn(move || node.setup(run_for)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(SimError::Io("setup thread panicked".into())))
                })
                .collect()
        });
        let mut first_error = None;
        for (node, setup) in self.nodes.iter().zip(setups) {
            match setup {
                Ok(()) => node.start()?,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(nodes = self.nodes.len(), "cluster started");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait for every node and collect results and markings
    pub fn join(&self) -> ClusterReport {
        let mut report = ClusterReport::default();
        for node in &self.nodes {
            report.results.insert(node.id().to_string(), node.join());
            for net in node.net_names() {
                if let Ok(marking) = node.marking(&net) {
                    report.markings.insert(net, marking);
                }
            }
        }
        report
    }

    pub fn kill_all(&self) {
        for node in &self.nodes {
            node.kill();
        }
    }

    /// Start, then wait for the end of the run
    pub fn run(&self) -> SimResult<ClusterReport> {
        self.start()?;
        Ok(self.join())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nets;
    use pnsim_runtime::NodeState;

    #[test]
    fn test_config_presets() {
        assert!(ClusterConfig::minimal().node.detached);
        assert!(!ClusterConfig::attached().node.detached);
        assert!(ClusterConfig::standard().run_for > ClusterConfig::minimal().run_for);
    }

    #[test]
    fn test_single_node_cluster() {
        let mut cluster = Cluster::new(ClusterConfig::minimal());
        let thermostat = nets::thermostat("boiler", 20.0, 0.5).unwrap();
        let node = cluster.add_node("sim-1", vec![thermostat]).unwrap();
        assert_eq!(cluster.node("sim-1").map(|n| n.id()), Some("sim-1"));
        let report = cluster.run().unwrap();
        assert!(report.all_ok());
        assert_eq!(report.tokens("boiler", "Setpoint"), vec![Token::from(20.0)]);
        assert_eq!(node.state(), NodeState::Terminated);
        assert!(cluster.broker().clients().is_empty());
    }

    #[test]
    fn test_duplicate_node_id_fails_setup() {
        let mut cluster = Cluster::new(ClusterConfig::minimal());
        cluster
            .add_node("sim-1", vec![nets::heater("a", 1.0).unwrap()])
            .unwrap();
        cluster
            .add_node("sim-1", vec![nets::heater("b", 1.0).unwrap()])
            .unwrap();
        assert_eq!(
            cluster.start(),
            Err(SimError::DuplicateClient("sim-1".into()))
        );
        let report = cluster.join();
        assert_eq!(report.results.len(), 1);
    }
}
