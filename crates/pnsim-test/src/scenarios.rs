//! End-to-end scenarios
//!
//! Each scenario wires sample nets onto nodes and scripted peers, runs them
//! to the end of their clock and hands back what was observed.

use std::time::Duration;

use pnsim_core::{Pattern, PetriNet, Place, SimResult, Token, Topic, Transition};
use tracing::info;

use crate::{nets, Cluster, ClusterConfig, ClusterReport, Received, ScriptedPeer};

/// Heat delivered per demand
pub const HEATER_POWER: f64 = 0.5;

/// Heater and room exchanging demands and heat until the room reaches `target`
///
/// With `distributed` each net gets its own node and every token crosses
/// the broker; otherwise both nets share one node.
pub fn heating_loop(distributed: bool, start: f64, target: f64) -> SimResult<ClusterReport> {
    let mut cluster = Cluster::new(ClusterConfig::minimal());
    let heater = nets::heater("heater", HEATER_POWER)?;
    let room = nets::room("room", "heater", start, target)?;
    if distributed {
        cluster.add_node("sim-heater", vec![heater])?;
        cluster.add_node("sim-room", vec![room])?;
    } else {
        cluster.add_node("sim-house", vec![heater, room])?;
    }
    let report = cluster.run()?;
    info!(distributed, ok = report.all_ok(), "heating loop finished");
    Ok(report)
}

/// Delay line publishing each released token to a scripted peer
///
/// Returns the deliveries in arrival order.
pub fn timed_delivery(timeout: Duration, tokens: &[i64]) -> SimResult<Vec<Received>> {
    let mut config = ClusterConfig::minimal();
    config.run_for = timeout * (tokens.len() as u32 + 1) + Duration::from_millis(100);
    let mut cluster = Cluster::new(config);
    let peer = ScriptedPeer::connect(cluster.broker(), "peer", &["sink"])?;
    let mut line = nets::delay_line("line", timeout, tokens)?;
    line.add_remote_output("Done", "sink/in")?;
    cluster.add_node("sim-line", vec![line])?;
    let report = cluster.run()?;
    peer.close()?;
    match report.first_error() {
        Some(e) => Err(e.clone()),
        None => Ok(peer.received()),
    }
}

/// Weather generator feeding a display peer with one measurement per `period`
pub fn weather_feed(period: Duration, run_for: Duration, seed: u64) -> SimResult<Vec<Token>> {
    let mut config = ClusterConfig::minimal();
    config.run_for = run_for;
    config.node.seed = Some(seed);
    let mut cluster = Cluster::new(config);
    let display = ScriptedPeer::connect(cluster.broker(), "display", &["display"])?;
    let mut weather = nets::weather_generator("weather", period, 5.0, 15.0)?;
    weather.add_remote_output("Measurement", "display/outside")?;
    cluster.add_node("sim-weather", vec![weather])?;
    let report = cluster.run()?;
    display.close()?;
    match report.first_error() {
        Some(e) => Err(e.clone()),
        None => Ok(display.tokens_on(&Topic::new("display", "outside"))),
    }
}

/// Net moving tokens from an `in` port to an `out` port
pub fn relay(name: &str) -> SimResult<PetriNet> {
    let mut net = PetriNet::new(name);
    net.add_place(Place::new("in"))?;
    net.add_place(Place::new("out"))?;
    net.add_transition(
        Transition::new("forward")
            .input("in", Pattern::var("x"))
            .output("out", Pattern::var("x")),
    )?;
    Ok(net)
}

/// Seeded run of a probabilistic net, returning its final `Measurement`
pub fn seeded_measurements(seed: u64, samples: usize) -> SimResult<Vec<Token>> {
    let mut config = ClusterConfig::minimal();
    config.node.seed = Some(seed);
    config.run_for = Duration::from_millis(100);
    let mut cluster = Cluster::new(config);
    let mut weather = nets::weather_generator("weather", Duration::from_secs(60), 5.0, 15.0)?;
    let raw: Vec<Token> = (0..samples)
        .map(|i| Token::from(10.0 + i as f64 * 0.01))
        .collect();
    weather.deposit("Temperature_raw", raw)?;
    cluster.add_node("sim-weather", vec![weather])?;
    let report = cluster.run()?;
    match report.first_error() {
        Some(e) => Err(e.clone()),
        None => Ok(report.tokens("weather", "Measurement")),
    }
}
