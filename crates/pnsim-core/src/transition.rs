//! Transitions and their construction

use std::time::Duration;

use crate::{
    ExtensionKind, FiringPolicy, Guard, Pattern, Priority, ProbabilisticPolicy, SimError,
    SimResult, TimedPolicy,
};

/// Arc between a place and a transition
#[derive(Clone, Debug)]
pub struct Inscription {
    pub place: String,
    pub pattern: Pattern,
}

/// A guarded rule consuming and producing tokens
#[derive(Clone, Debug)]
pub struct Transition {
    name: String,
    guard: Option<Guard>,
    inputs: Vec<Inscription>,
    outputs: Vec<Inscription>,
    policy: FiringPolicy,
    priority: Option<Priority>,
}

impl Transition {
    pub fn new(name: impl Into<String>) -> Self {
        Transition {
            name: name.into(),
            guard: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            policy: FiringPolicy::Immediate,
            priority: None,
        }
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Shorthand for a labelled guard closure
    pub fn when<F>(self, label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&crate::Binding) -> bool + Send + Sync + 'static,
    {
        self.guard(Guard::new(label, predicate))
    }

    pub fn input(mut self, place: impl Into<String>, pattern: Pattern) -> Self {
        self.inputs.push(Inscription {
            place: place.into(),
            pattern,
        });
        self
    }

    pub fn output(mut self, place: impl Into<String>, pattern: Pattern) -> Self {
        self.outputs.push(Inscription {
            place: place.into(),
            pattern,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> SimResult<Self> {
        self.set_timeout(timeout)?;
        Ok(self)
    }

    pub fn with_probability(mut self, probability: f64) -> SimResult<Self> {
        self.set_probability(probability)?;
        Ok(self)
    }

    pub fn with_neighbour(mut self, neighbour: impl Into<String>) -> SimResult<Self> {
        self.add_neighbour(neighbour)?;
        Ok(self)
    }

    pub fn with_priority(mut self, priority: u8) -> SimResult<Self> {
        self.set_priority(priority)?;
        Ok(self)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> SimResult<()> {
        if let Some(existing) = self.policy.kind() {
            return Err(self.conflict(existing, ExtensionKind::Timed));
        }
        self.policy = FiringPolicy::Timed(TimedPolicy::new(timeout)?);
        Ok(())
    }

    pub fn set_probability(&mut self, probability: f64) -> SimResult<()> {
        let name = self.name.clone();
        self.probabilistic()?.set_probability(&name, probability)
    }

    pub fn add_neighbour(&mut self, neighbour: impl Into<String>) -> SimResult<()> {
        let neighbour = neighbour.into();
        let own = neighbour == self.name;
        let policy = self.probabilistic()?;
        if !own {
            policy.add_neighbour(neighbour);
        }
        Ok(())
    }

    pub fn set_priority(&mut self, priority: u8) -> SimResult<()> {
        if self.priority.is_some() {
            return Err(self.conflict(ExtensionKind::Priority, ExtensionKind::Priority));
        }
        self.priority = Some(Priority::new(priority)?);
        Ok(())
    }

    fn probabilistic(&mut self) -> SimResult<&mut ProbabilisticPolicy> {
        if let FiringPolicy::Timed(_) = self.policy {
            return Err(self.conflict(ExtensionKind::Timed, ExtensionKind::Probabilistic));
        }
        if let FiringPolicy::Immediate = self.policy {
            self.policy = FiringPolicy::Probabilistic(ProbabilisticPolicy::new());
        }
        match &mut self.policy {
            FiringPolicy::Probabilistic(policy) => Ok(policy),
            _ => Err(SimError::InvalidState {
                expected: "probabilistic",
                actual: "immediate",
            }),
        }
    }

    fn conflict(&self, existing: ExtensionKind, requested: ExtensionKind) -> SimError {
        SimError::ConflictingExtension {
            transition: self.name.clone(),
            existing: existing.name(),
            requested: requested.name(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guard_ref(&self) -> Option<&Guard> {
        self.guard.as_ref()
    }

    pub fn inputs(&self) -> &[Inscription] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Inscription] {
        &self.outputs
    }

    pub fn policy(&self) -> &FiringPolicy {
        &self.policy
    }

    pub(crate) fn policy_mut(&mut self) -> &mut FiringPolicy {
        &mut self.policy
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Firing-order key; transitions without a priority sort first
    pub fn priority_key(&self) -> u8 {
        self.priority.map(Priority::key).unwrap_or(0)
    }

    /// Distinct input place names, sorted
    pub fn input_places(&self) -> Vec<String> {
        let mut places: Vec<String> = self.inputs.iter().map(|i| i.place.clone()).collect();
        places.sort();
        places.dedup();
        places
    }

    /// Output variables not bound by any input pattern
    pub fn unbound_output_variables(&self) -> Vec<String> {
        let bound: Vec<&str> = self
            .inputs
            .iter()
            .flat_map(|i| i.pattern.variables())
            .collect();
        let mut missing = Vec::new();
        for output in &self.outputs {
            for var in output.pattern.variables() {
                if !bound.contains(&var) && !missing.iter().any(|m: &String| m == var) {
                    missing.push(var.to_string());
                }
            }
        }
        missing
    }

    pub fn is_timed(&self) -> bool {
        matches!(self.policy, FiringPolicy::Timed(_))
    }

    pub fn is_probabilistic(&self) -> bool {
        matches!(self.policy, FiringPolicy::Probabilistic(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Binding, Token};

    #[test]
    fn test_timed_and_probabilistic_exclusive() {
        let timed = Transition::new("cool")
            .with_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            timed.clone().with_probability(0.5),
            Err(SimError::ConflictingExtension { existing: "timed", requested: "probabilistic", .. })
        ));
        assert!(matches!(
            timed.with_timeout(Duration::from_secs(1)),
            Err(SimError::ConflictingExtension { existing: "timed", requested: "timed", .. })
        ));

        let prob = Transition::new("rain").with_probability(0.2).unwrap();
        assert!(matches!(
            prob.with_timeout(Duration::from_secs(1)),
            Err(SimError::ConflictingExtension { existing: "probabilistic", .. })
        ));
    }

    #[test]
    fn test_priority_composes_with_timed() {
        let t = Transition::new("heat")
            .with_priority(80)
            .unwrap()
            .with_timeout(Duration::from_millis(10))
            .unwrap();
        assert!(t.is_timed());
        assert_eq!(t.priority_key(), 20);
        assert!(matches!(t.with_priority(5), Err(SimError::ConflictingExtension { .. })));
    }

    #[test]
    fn test_priority_only_fires_immediately() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;

        let mut t = Transition::new("hold").with_priority(10).unwrap();
        assert_eq!(t.policy().kind(), None);
        assert!(t.policy().as_extension().is_none());
        let mut rng = StdRng::seed_from_u64(3);
        let binding = Binding::new().with("x", 1i64);
        assert_eq!(
            t.policy_mut().fire(binding.clone(), &mut rng),
            crate::Firing::Deposit(binding)
        );
        // a firing policy can still be added next to the priority
        t.set_probability(0.5).unwrap();
        assert_eq!(t.policy().kind(), Some(ExtensionKind::Probabilistic));
        assert_eq!(t.priority().map(Priority::declared), Some(10));
    }

    #[test]
    fn test_neighbour_makes_probabilistic() {
        let t = Transition::new("sun").with_neighbour("rain").unwrap();
        assert!(t.is_probabilistic());
        match t.policy() {
            FiringPolicy::Probabilistic(p) => assert_eq!(p.neighbours(), ["rain"]),
            other => panic!("unexpected policy {:?}", other),
        }
    }

    #[test]
    fn test_unbound_output_variables() {
        let t = Transition::new("t")
            .input("a", Pattern::var("x"))
            .output("b", Pattern::tuple([Pattern::var("x"), Pattern::var("y")]))
            .output("c", Pattern::expr("x+1", |b: &Binding| Ok(Token::from(b.int("x")? + 1))));
        assert_eq!(t.unbound_output_variables(), vec!["y".to_string()]);
    }
}
