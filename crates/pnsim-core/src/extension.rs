//! Firing policies attached to transitions
//!
//! A transition fires under exactly one policy: immediate deposit, a
//! timed hold, or a probabilistic choice among neighbours. Priority is an
//! ordering key that composes with any of them.
//!
//! Policies are invoked after the input tokens were removed and decide
//! where and when the outputs are deposited.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use rand::{Rng, RngCore};

use crate::{Binding, SimError, SimResult};

/// Kind of an attached extension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Timed,
    Probabilistic,
    Priority,
}

impl ExtensionKind {
    pub fn name(self) -> &'static str {
        match self {
            ExtensionKind::Timed => "timed",
            ExtensionKind::Probabilistic => "probabilistic",
            ExtensionKind::Priority => "priority",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a policy decided for one binding
#[derive(Clone, Debug, PartialEq)]
pub enum Firing {
    /// Deposit the firing transition's outputs now
    Deposit(Binding),
    /// Deposit the outputs of another transition of the group
    Redirect { transition: usize, binding: Binding },
    /// Binding held; an unblock must be scheduled after the delay
    Schedule(Duration),
    /// Binding held behind an unblock that is already scheduled
    Queued,
}

/// Read-only view of a transition handed to `Extension::prepare`
#[derive(Clone, Copy, Debug)]
pub struct TransitionView<'a> {
    pub name: &'a str,
    pub index: usize,
    pub input_places: &'a [String],
}

/// Capability interface of firing policies
pub trait Extension {
    fn kind(&self) -> ExtensionKind;

    /// Validate against the owning transition once the net is complete
    fn prepare(&mut self, view: &TransitionView<'_>) -> SimResult<()>;

    /// Decide the fate of a binding whose inputs were already consumed
    fn fire(&mut self, binding: Binding, rng: &mut dyn RngCore) -> Firing;
}

/// Ordering key; stores `100 - declared` so lower values drain first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const MAX: u8 = 100;

    pub fn new(declared: u8) -> SimResult<Self> {
        if declared > Self::MAX {
            return Err(SimError::PriorityOutOfRange(declared));
        }
        Ok(Priority(Self::MAX - declared))
    }

    pub fn declared(self) -> u8 {
        Self::MAX - self.0
    }

    /// Sort key used for the firing order
    pub fn key(self) -> u8 {
        self.0
    }
}

/// State of a timed transition
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TimedState {
    #[default]
    Idle,
    /// An unblock is scheduled; bindings wait in FIFO order
    Waiting(VecDeque<Binding>),
}

/// Result of one unblock event
#[derive(Clone, Debug, PartialEq)]
pub struct Unblocked {
    pub binding: Binding,
    /// Delay of the next unblock while bindings remain queued
    pub again: Option<Duration>,
}

/// Holds bindings and releases one per timeout interval
#[derive(Clone, Debug, PartialEq)]
pub struct TimedPolicy {
    timeout: Duration,
    state: TimedState,
}

impl TimedPolicy {
    pub fn new(timeout: Duration) -> SimResult<Self> {
        if timeout.is_zero() {
            return Err(SimError::InvalidTimeout(format!("{:?}", timeout)));
        }
        Ok(TimedPolicy {
            timeout,
            state: TimedState::Idle,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> &TimedState {
        &self.state
    }

    pub fn queued(&self) -> usize {
        match &self.state {
            TimedState::Idle => 0,
            TimedState::Waiting(queue) => queue.len(),
        }
    }

    /// Release the oldest binding
    pub fn unblock(&mut self) -> Option<Unblocked> {
        let TimedState::Waiting(queue) = &mut self.state else {
            return None;
        };
        let binding = queue.pop_front()?;
        let again = if queue.is_empty() {
            self.state = TimedState::Idle;
            None
        } else {
            Some(self.timeout)
        };
        Some(Unblocked { binding, again })
    }
}

impl Extension for TimedPolicy {
    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Timed
    }

    fn prepare(&mut self, _view: &TransitionView<'_>) -> SimResult<()> {
        Ok(())
    }

    fn fire(&mut self, binding: Binding, _rng: &mut dyn RngCore) -> Firing {
        match &mut self.state {
            TimedState::Idle => {
                self.state = TimedState::Waiting(VecDeque::from([binding]));
                Firing::Schedule(self.timeout)
            }
            TimedState::Waiting(queue) => {
                queue.push_back(binding);
                Firing::Queued
            }
        }
    }
}

/// One member of a resolved neighbour group
#[derive(Clone, Debug, PartialEq)]
pub struct GroupMember {
    pub transition: usize,
    pub name: String,
    pub probability: f64,
}

/// Mutually exclusive choice among neighbour transitions
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbabilisticPolicy {
    declared: Option<f64>,
    neighbours: Vec<String>,
    group: Vec<GroupMember>,
}

impl ProbabilisticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probability(probability: f64) -> SimResult<Self> {
        let mut policy = Self::new();
        policy.set_probability("", probability)?;
        Ok(policy)
    }

    pub fn set_probability(&mut self, transition: &str, probability: f64) -> SimResult<()> {
        if let Some(value) = self.declared {
            return Err(SimError::ProbabilityAlreadySet {
                transition: transition.to_string(),
                value,
            });
        }
        if !(0.0..=1.0).contains(&probability) {
            return Err(SimError::ProbabilityOutOfRange(probability));
        }
        self.declared = Some(probability);
        Ok(())
    }

    pub fn add_neighbour(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.neighbours.contains(&name) {
            self.neighbours.push(name);
        }
    }

    /// Probability as declared by the user
    pub fn declared(&self) -> Option<f64> {
        self.declared
    }

    /// Neighbours named directly on this transition
    pub fn neighbours(&self) -> &[String] {
        &self.neighbours
    }

    /// Resolved group, in declaration order, including this transition
    pub fn group(&self) -> &[GroupMember] {
        &self.group
    }

    /// Probability after the group's remainder was distributed
    pub fn resolved(&self, index: usize) -> Option<f64> {
        self.group
            .iter()
            .find(|m| m.transition == index)
            .map(|m| m.probability)
    }

    pub(crate) fn set_group(&mut self, group: Vec<GroupMember>) {
        self.group = group;
    }

    /// Member whose cumulative bracket contains `sample`
    pub fn select(&self, sample: f64) -> Option<usize> {
        let (last, rest) = self.group.split_last()?;
        let mut cumulative = 0.0;
        for member in rest {
            cumulative += member.probability;
            if sample < cumulative {
                return Some(member.transition);
            }
        }
        Some(last.transition)
    }
}

impl Extension for ProbabilisticPolicy {
    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Probabilistic
    }

    fn prepare(&mut self, view: &TransitionView<'_>) -> SimResult<()> {
        if self.group.iter().any(|m| m.transition == view.index) {
            Ok(())
        } else {
            Err(SimError::InvalidNeighbour {
                transition: view.name.to_string(),
                neighbour: view.name.to_string(),
            })
        }
    }

    fn fire(&mut self, binding: Binding, rng: &mut dyn RngCore) -> Firing {
        let sample: f64 = rng.gen();
        match self.select(sample) {
            Some(transition) => Firing::Redirect {
                transition,
                binding,
            },
            None => Firing::Deposit(binding),
        }
    }
}

/// Policy attached to a transition
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FiringPolicy {
    #[default]
    Immediate,
    Timed(TimedPolicy),
    Probabilistic(ProbabilisticPolicy),
}

impl FiringPolicy {
    pub fn kind(&self) -> Option<ExtensionKind> {
        self.as_extension().map(Extension::kind)
    }

    pub fn as_extension(&self) -> Option<&dyn Extension> {
        match self {
            FiringPolicy::Immediate => None,
            FiringPolicy::Timed(policy) => Some(policy),
            FiringPolicy::Probabilistic(policy) => Some(policy),
        }
    }

    pub fn as_extension_mut(&mut self) -> Option<&mut dyn Extension> {
        match self {
            FiringPolicy::Immediate => None,
            FiringPolicy::Timed(policy) => Some(policy),
            FiringPolicy::Probabilistic(policy) => Some(policy),
        }
    }

    pub fn fire(&mut self, binding: Binding, rng: &mut dyn RngCore) -> Firing {
        match self.as_extension_mut() {
            Some(extension) => extension.fire(binding, rng),
            None => Firing::Deposit(binding),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn b(n: i64) -> Binding {
        Binding::new().with("x", n)
    }

    #[test]
    fn test_priority_inverted() {
        let high = Priority::new(90).unwrap();
        let low = Priority::new(10).unwrap();
        assert!(high.key() < low.key());
        assert_eq!(high.declared(), 90);
        assert_eq!(Priority::new(101), Err(SimError::PriorityOutOfRange(101)));
    }

    #[test]
    fn test_timed_state_machine() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut timed = TimedPolicy::new(Duration::from_secs(5)).unwrap();

        assert_eq!(timed.fire(b(0), &mut rng), Firing::Schedule(Duration::from_secs(5)));
        assert_eq!(timed.fire(b(1), &mut rng), Firing::Queued);
        assert_eq!(timed.fire(b(2), &mut rng), Firing::Queued);
        assert_eq!(timed.queued(), 3);

        let first = timed.unblock().unwrap();
        assert_eq!(first.binding, b(0));
        assert_eq!(first.again, Some(Duration::from_secs(5)));
        assert_eq!(timed.unblock().unwrap().binding, b(1));

        let last = timed.unblock().unwrap();
        assert_eq!(last.binding, b(2));
        assert_eq!(last.again, None);
        assert_eq!(timed.state(), &TimedState::Idle);
        assert!(timed.unblock().is_none());
    }

    #[test]
    fn test_timed_rejects_zero() {
        assert!(matches!(
            TimedPolicy::new(Duration::ZERO),
            Err(SimError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_probability_validation() {
        assert_eq!(
            ProbabilisticPolicy::with_probability(1.5),
            Err(SimError::ProbabilityOutOfRange(1.5))
        );
        let mut p = ProbabilisticPolicy::with_probability(0.3).unwrap();
        assert!(matches!(
            p.set_probability("rain", 0.2),
            Err(SimError::ProbabilityAlreadySet { .. })
        ));
    }

    #[test]
    fn test_select_last_absorbs_remainder() {
        let mut p = ProbabilisticPolicy::new();
        p.set_group(vec![
            GroupMember { transition: 0, name: "a".into(), probability: 0.25 },
            GroupMember { transition: 3, name: "b".into(), probability: 0.25 },
            GroupMember { transition: 5, name: "c".into(), probability: 0.4999 },
        ]);
        assert_eq!(p.select(0.1), Some(0));
        assert_eq!(p.select(0.3), Some(3));
        assert_eq!(p.select(0.6), Some(5));
        assert_eq!(p.select(0.99999), Some(5));
    }
}
