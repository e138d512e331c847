//! Petri nets: structure, preparation and execution
//!
//! A net owns its places and transitions plus the registry of remote port
//! bindings. Execution scans transitions in firing order (priority key,
//! then declaration order), fires the first binding of the first enabled
//! transition and restarts the scan, until nothing is enabled.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, trace};

use crate::{
    Binding, Extension, Firing, FiringPolicy, GroupMember, MultiSet, Place, PortRole, SimError, SimResult,
    Token, Topic, Transition, TransitionView, Unblocked,
};

/// Slack accepted when validating probability groups
pub const PROBABILITY_TOLERANCE: f64 = 1e-3;

/// Remote port registered on a net
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortBinding {
    pub place: String,
    pub direction: PortRole,
    pub topic: Topic,
}

/// One firing, as recorded by `PetriNet::run`
#[derive(Clone, Debug, PartialEq)]
pub struct FiredStep {
    pub transition: String,
    pub binding: Binding,
}

/// Unblock requested by a timed transition
#[derive(Clone, Debug, PartialEq)]
pub struct TimerRequest {
    pub transition: String,
    pub after: Duration,
}

/// Outcome of one execution of a net
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub fired: Vec<FiredStep>,
    pub timers: Vec<TimerRequest>,
    /// Execution stopped by the caller before quiescence
    pub interrupted: bool,
}

/// A named collection of places and transitions
#[derive(Clone, Debug)]
pub struct PetriNet {
    name: String,
    places: Vec<Place>,
    place_index: HashMap<String, usize>,
    transitions: Vec<Transition>,
    transition_index: HashMap<String, usize>,
    ports: Vec<PortBinding>,
    order: Vec<usize>,
    prepared: bool,
}

impl PetriNet {
    pub fn new(name: impl Into<String>) -> Self {
        PetriNet {
            name: name.into(),
            places: Vec::new(),
            place_index: HashMap::new(),
            transitions: Vec::new(),
            transition_index: HashMap::new(),
            ports: Vec::new(),
            order: Vec::new(),
            prepared: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_place(&mut self, place: Place) -> SimResult<()> {
        if self.place_index.contains_key(place.name()) {
            return Err(SimError::DuplicatePlace {
                net: self.name.clone(),
                place: place.name().to_string(),
            });
        }
        self.place_index
            .insert(place.name().to_string(), self.places.len());
        self.places.push(place);
        Ok(())
    }

    pub fn add_transition(&mut self, transition: Transition) -> SimResult<usize> {
        if self.transition_index.contains_key(transition.name()) {
            return Err(SimError::DuplicateTransition {
                net: self.name.clone(),
                transition: transition.name().to_string(),
            });
        }
        for arc in transition.inputs().iter().chain(transition.outputs()) {
            self.place_position(&arc.place)?;
        }
        if let Some(arc) = transition.inputs().iter().find(|a| !a.pattern.is_matchable()) {
            return Err(SimError::InvalidPattern(format!(
                "input {} of {} contains an expression",
                arc.pattern,
                transition.name()
            )));
        }
        let index = self.transitions.len();
        self.transition_index
            .insert(transition.name().to_string(), index);
        self.transitions.push(transition);
        self.prepared = false;
        Ok(index)
    }

    pub fn place(&self, name: &str) -> Option<&Place> {
        self.place_index.get(name).map(|&i| &self.places[i])
    }

    pub fn place_mut(&mut self, name: &str) -> Option<&mut Place> {
        self.place_index.get(name).map(|&i| &mut self.places[i])
    }

    pub fn places(&self) -> impl Iterator<Item = &Place> {
        self.places.iter()
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn transition(&self, index: usize) -> Option<&Transition> {
        self.transitions.get(index)
    }

    pub fn transition_index(&self, name: &str) -> Option<usize> {
        self.transition_index.get(name).copied()
    }

    /// Snapshot of every place's tokens, in ascending order
    pub fn marking(&self) -> BTreeMap<String, Vec<Token>> {
        self.places
            .iter()
            .map(|p| (p.name().to_string(), p.tokens().iter().cloned().collect()))
            .collect()
    }

    fn place_position(&self, name: &str) -> SimResult<usize> {
        self.place_index
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownPlace {
                net: self.name.clone(),
                place: name.to_string(),
            })
    }

    fn transition_at(&self, index: usize) -> SimResult<&Transition> {
        self.transitions
            .get(index)
            .ok_or_else(|| SimError::UnknownTransition {
                net: self.name.clone(),
                transition: format!("#{}", index),
            })
    }

    /// Publish `place` to `topic` (`<net>/<place>` of the receiving side)
    pub fn add_remote_output(&mut self, place: &str, topic: &str) -> SimResult<()> {
        let topic = Topic::parse(topic)?;
        let index = self.place_position(place)?;
        self.places[index].add_output_topic(topic.to_string())?;
        self.register_port(place, PortRole::Output, topic);
        Ok(())
    }

    /// Feed `place` from the output place addressed by `topic`
    pub fn add_remote_input(&mut self, place: &str, topic: &str) -> SimResult<()> {
        let topic = Topic::parse(topic)?;
        let index = self.place_position(place)?;
        self.places[index].add_input_topic(topic.to_string())?;
        self.register_port(place, PortRole::Input, topic);
        Ok(())
    }

    fn register_port(&mut self, place: &str, direction: PortRole, topic: Topic) {
        let binding = PortBinding {
            place: place.to_string(),
            direction,
            topic,
        };
        if !self.ports.contains(&binding) {
            self.ports.push(binding);
        }
    }

    pub fn ports(&self) -> &[PortBinding] {
        &self.ports
    }

    /// Make `place` an input port on behalf of a remote request
    pub fn accept_input(&mut self, place: &str) -> SimResult<()> {
        let index = self.place_position(place)?;
        self.places[index].set_role(PortRole::Input)
    }

    /// Make `place` publish to `target` on behalf of a remote request
    pub fn accept_output(&mut self, place: &str, target: &Topic) -> SimResult<()> {
        let index = self.place_position(place)?;
        self.places[index].add_output_topic(target.to_string())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Validate the net and resolve firing order and probability groups
    ///
    /// Everything is recomputed from the declared structure, so preparing
    /// twice yields the same result.
    pub fn prepare(&mut self) -> SimResult<()> {
        for t in &self.transitions {
            if t.inputs().is_empty() {
                return Err(SimError::NoInputArcs(t.name().to_string()));
            }
            if let Some(variable) = t.unbound_output_variables().into_iter().next() {
                return Err(SimError::UnboundOutputVariable {
                    transition: t.name().to_string(),
                    variable,
                });
            }
        }

        for group in self.neighbour_groups()? {
            let members = self.resolve_group(&group)?;
            for &i in &group {
                if let FiringPolicy::Probabilistic(policy) = self.transitions[i].policy_mut() {
                    policy.set_group(members.clone());
                }
            }
        }

        for (index, t) in self.transitions.iter_mut().enumerate() {
            let input_places = t.input_places();
            let name = t.name().to_string();
            if let Some(extension) = t.policy_mut().as_extension_mut() {
                extension.prepare(&TransitionView {
                    name: &name,
                    index,
                    input_places: &input_places,
                })?;
            }
        }

        let mut order: Vec<usize> = (0..self.transitions.len()).collect();
        order.sort_by_key(|&i| (self.transitions[i].priority_key(), i));
        self.order = order;
        self.prepared = true;
        debug!(net = %self.name, transitions = self.transitions.len(), "net prepared");
        Ok(())
    }

    /// Transitive closure of declared neighbour relations
    fn neighbour_groups(&self) -> SimResult<Vec<Vec<usize>>> {
        let mut parent: Vec<usize> = (0..self.transitions.len()).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        for (i, t) in self.transitions.iter().enumerate() {
            let FiringPolicy::Probabilistic(policy) = t.policy() else {
                continue;
            };
            for neighbour in policy.neighbours() {
                let j = self
                    .transition_index(neighbour)
                    .filter(|&j| self.transitions[j].is_probabilistic())
                    .ok_or_else(|| SimError::InvalidNeighbour {
                        transition: t.name().to_string(),
                        neighbour: neighbour.clone(),
                    })?;
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, t) in self.transitions.iter().enumerate() {
            if t.is_probabilistic() {
                let root = find(&mut parent, i);
                groups.entry(root).or_default().push(i);
            }
        }
        Ok(groups.into_values().collect())
    }

    fn resolve_group(&self, group: &[usize]) -> SimResult<Vec<GroupMember>> {
        let first = &self.transitions[group[0]];
        let places = first.input_places();
        for &i in &group[1..] {
            if self.transitions[i].input_places() != places {
                return Err(SimError::NeighbourPlacesMismatch {
                    transition: first.name().to_string(),
                    neighbour: self.transitions[i].name().to_string(),
                });
            }
        }

        let declared: Vec<Option<f64>> = group
            .iter()
            .map(|&i| match self.transitions[i].policy() {
                FiringPolicy::Probabilistic(p) => p.declared(),
                _ => None,
            })
            .collect();
        let total: f64 = declared.iter().flatten().sum();
        let unset = declared.iter().filter(|d| d.is_none()).count();
        let names = || {
            group
                .iter()
                .map(|&i| self.transitions[i].name())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let overflow = total > 1.0 + PROBABILITY_TOLERANCE
            || (unset > 0 && total > 1.0 - PROBABILITY_TOLERANCE);
        if overflow {
            return Err(SimError::ProbabilityOverflow {
                group: names(),
                total,
            });
        }
        if unset == 0 && total < 1.0 - PROBABILITY_TOLERANCE {
            return Err(SimError::ProbabilityShortfall {
                group: names(),
                total,
            });
        }

        let share = if unset > 0 {
            (1.0 - total) / unset as f64
        } else {
            0.0
        };
        Ok(group
            .iter()
            .zip(declared)
            .map(|(&i, d)| GroupMember {
                transition: i,
                name: self.transitions[i].name().to_string(),
                probability: d.unwrap_or(share),
            })
            .collect())
    }

    /// Transition indices in firing order
    pub fn firing_order(&self) -> &[usize] {
        &self.order
    }

    /// All enabling bindings of a transition, sorted
    pub fn modes(&self, index: usize) -> SimResult<Vec<Binding>> {
        let t = self.transition_at(index)?;
        let mut found = BTreeSet::new();
        self.search(t, 0, Binding::new(), &mut found)?;
        Ok(found.into_iter().collect())
    }

    fn search(
        &self,
        t: &Transition,
        arc: usize,
        binding: Binding,
        found: &mut BTreeSet<Binding>,
    ) -> SimResult<()> {
        let Some(input) = t.inputs().get(arc) else {
            if self.accepts(t, &binding)? {
                found.insert(binding);
            }
            return Ok(());
        };
        let place = &self.places[self.place_position(&input.place)?];
        for token in place.tokens().distinct() {
            if let Some(extended) = input.pattern.match_token(token, &binding) {
                self.search(t, arc + 1, extended, found)?;
            }
        }
        Ok(())
    }

    /// Tokens a binding consumes, grouped per place
    fn consumption(&self, t: &Transition, binding: &Binding) -> SimResult<Vec<(usize, MultiSet)>> {
        let mut per_place: BTreeMap<usize, MultiSet> = BTreeMap::new();
        for input in t.inputs() {
            let position = self.place_position(&input.place)?;
            per_place
                .entry(position)
                .or_default()
                .add(input.pattern.flow(binding)?);
        }
        Ok(per_place.into_iter().collect())
    }

    fn accepts(&self, t: &Transition, binding: &Binding) -> SimResult<bool> {
        if let Some(guard) = t.guard_ref() {
            if !guard.check(binding) {
                return Ok(false);
            }
        }
        Ok(self
            .consumption(t, binding)?
            .iter()
            .all(|(p, needed)| self.places[*p].tokens().contains_all(needed)))
    }

    pub fn is_enabled(&self, index: usize, binding: &Binding) -> SimResult<bool> {
        let t = self.transition_at(index)?;
        self.accepts(t, binding)
    }

    /// Consume the binding's inputs and hand it to the transition's policy
    pub fn fire(
        &mut self,
        index: usize,
        binding: Binding,
        rng: &mut dyn RngCore,
    ) -> SimResult<Option<TimerRequest>> {
        let t = self.transition_at(index)?;
        if !self.accepts(t, &binding)? {
            return Err(SimError::NotEnabled(format!("{} for {}", t.name(), binding)));
        }
        let consumed = self.consumption(t, &binding)?;
        for (position, tokens) in consumed {
            let place = self.places[position].tokens_mut();
            for token in tokens.iter() {
                place.remove(token);
            }
        }

        let name = self.transitions[index].name().to_string();
        match self.transitions[index].policy_mut().fire(binding, rng) {
            Firing::Deposit(binding) => {
                self.produce(index, &binding)?;
                Ok(None)
            }
            Firing::Redirect {
                transition,
                binding,
            } => {
                trace!(net = %self.name, from = %name, to = transition, "probabilistic choice");
                self.produce(transition, &binding)?;
                Ok(None)
            }
            Firing::Schedule(after) => Ok(Some(TimerRequest {
                transition: name,
                after,
            })),
            Firing::Queued => Ok(None),
        }
    }

    /// Deposit the outputs of `index` under `binding`
    fn produce(&mut self, index: usize, binding: &Binding) -> SimResult<()> {
        let t = self.transition_at(index)?;
        let mut produced = Vec::with_capacity(t.outputs().len());
        for output in t.outputs() {
            let position = self.place_position(&output.place)?;
            produced.push((position, output.pattern.flow(binding)?));
        }
        for (position, token) in produced {
            self.places[position].add(token)?;
        }
        Ok(())
    }

    /// Fire until no transition is enabled or `should_stop` returns true
    pub fn run(
        &mut self,
        rng: &mut dyn RngCore,
        should_stop: &dyn Fn() -> bool,
    ) -> SimResult<RunReport> {
        if !self.prepared {
            self.prepare()?;
        }
        let mut report = RunReport::default();
        'scan: loop {
            if should_stop() {
                report.interrupted = true;
                break;
            }
            for position in 0..self.order.len() {
                let index = self.order[position];
                if let Some(binding) = self.modes(index)?.into_iter().next() {
                    let transition = self.transitions[index].name().to_string();
                    debug!(net = %self.name, transition = %transition, binding = %binding, "firing");
                    let timer = self.fire(index, binding.clone(), rng)?;
                    report.fired.push(FiredStep {
                        transition,
                        binding,
                    });
                    report.timers.extend(timer);
                    continue 'scan;
                }
            }
            break;
        }
        Ok(report)
    }

    /// Release the oldest binding held by a timed transition
    ///
    /// Returns the delay of the next unblock when more bindings wait.
    pub fn unblock(&mut self, index: usize) -> SimResult<Option<Duration>> {
        let name = self.transition_at(index)?.name().to_string();
        let FiringPolicy::Timed(policy) = self.transitions[index].policy_mut() else {
            return Err(SimError::NotTimed(name));
        };
        match policy.unblock() {
            Some(Unblocked { binding, again }) => {
                debug!(net = %self.name, transition = %name, binding = %binding, "unblocked");
                self.produce(index, &binding)?;
                Ok(again)
            }
            None => Ok(None),
        }
    }

    /// Add inbound tokens to a place
    pub fn deposit(&mut self, place: &str, tokens: Vec<Token>) -> SimResult<()> {
        let position = self.place_position(place)?;
        self.places[position].add_all(tokens)
    }

    /// Empty every output port that holds tokens
    pub fn drain_outputs(&mut self) -> Vec<(Vec<String>, Vec<Token>)> {
        self.places
            .iter_mut()
            .filter(|p| {
                p.role() == PortRole::Output && !p.output_topics().is_empty() && !p.tokens().is_empty()
            })
            .map(|p| {
                let topics = p.output_topics().to_vec();
                (topics, p.tokens_mut().drain())
            })
            .collect()
    }
}

impl fmt::Display for PetriNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "net {}", self.name)?;
        for place in &self.places {
            let tokens: Vec<String> = place.tokens().iter().map(Token::to_string).collect();
            write!(f, "  {} = {{{}}}", place.name(), tokens.join(", "))?;
            if place.role() != PortRole::Unbound {
                write!(f, " [{}]", place.role())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
