//! Phase-transition state machines shared by cycle and death models.
//!
//! A [`PhaseModel`] is an ordered list of phases plus, per phase, the outgoing links in
//! registration order. Agents carry only a [`PhaseState`] pointing at the model they
//! currently follow, so switching from a cycle model into a death model is a matter of
//! replacing that state. The state also holds the agent's own copy of the link rates,
//! which can be tuned per agent without touching the shared model.

use rand::Rng;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use thiserror::Error;

new_key_type! {
    /// Stable handle for a phase model registered in a catalog.
    pub struct ModelId;
}

/// Relative slack applied when comparing elapsed time against a fixed duration.
const FIXED_DURATION_EPSILON: f64 = 1e-9;

/// Hook invoked with the agent and the current time step.
pub type PhaseHook<A> = fn(&mut A, f64);
/// Predicate that vetoes a link while it returns true.
pub type ArrestPredicate<A> = fn(&A, f64) -> bool;

/// Errors raised while assembling a phase model.
#[derive(Debug, Error, PartialEq)]
pub enum PhaseModelError {
    #[error("phase model `{model}` has no phase named `{phase}`")]
    UnknownPhase { model: String, phase: String },
    #[error("phase index {index} is out of range for model `{model}`")]
    PhaseOutOfRange { model: String, index: usize },
    #[error("phase model `{model}` has a negative or non-finite rate on {from} -> {to}")]
    InvalidRate {
        model: String,
        from: usize,
        to: usize,
    },
    #[error("phase model `{0}` has no phases")]
    Empty(String),
}

/// Per-agent position inside a phase model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub model: ModelId,
    pub current: usize,
    pub elapsed: f64,
    /// Link rates indexed by source phase, then link order. Links missing from the
    /// table run at the model's rate.
    #[serde(default)]
    rates: Vec<Vec<f64>>,
}

impl PhaseState {
    /// Fresh state at `phase` of `model` with no elapsed time and no rates of its own.
    #[must_use]
    pub const fn start(model: ModelId, phase: usize) -> Self {
        Self {
            model,
            current: phase,
            elapsed: 0.0,
            rates: Vec::new(),
        }
    }

    /// This agent's rate for link `link` out of phase `from`, if it carries one.
    #[must_use]
    pub fn rate(&self, from: usize, link: usize) -> Option<f64> {
        self.rates.get(from)?.get(link).copied()
    }

    /// Override one link rate for this agent only. Returns false if the link is not in
    /// the table or the rate is negative or non-finite.
    pub fn set_rate(&mut self, from: usize, link: usize, rate: f64) -> bool {
        if !rate.is_finite() || rate < 0.0 {
            return false;
        }
        match self.rates.get_mut(from).and_then(|links| links.get_mut(link)) {
            Some(slot) => {
                *slot = rate;
                true
            }
            None => false,
        }
    }
}

impl Default for PhaseState {
    fn default() -> Self {
        Self::start(ModelId::default(), 0)
    }
}

/// Anything that can be driven through a [`PhaseModel`].
pub trait PhaseAgent {
    fn phase_state(&self) -> &PhaseState;
    fn phase_state_mut(&mut self) -> &mut PhaseState;
    fn flag_for_division(&mut self);
    fn flag_for_removal(&mut self);
}

/// Named state inside a model.
#[derive(Debug, Clone)]
pub struct Phase<A> {
    pub name: String,
    pub entry: Option<PhaseHook<A>>,
    pub division_at_exit: bool,
    pub removal_at_exit: bool,
}

/// How a link decides it is ready to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkTiming {
    /// Fires with probability `rate * dt` each step.
    Stochastic,
    /// Fires once the phase has lasted `1 / rate`.
    FixedDuration,
}

/// Directed transition between two phases.
#[derive(Debug, Clone)]
pub struct PhaseLink<A> {
    pub to: usize,
    pub rate: f64,
    pub timing: LinkTiming,
    pub arrest: Option<ArrestPredicate<A>>,
    pub exit: Option<PhaseHook<A>>,
}

impl<A> PhaseLink<A> {
    /// Deterministic residence time for fixed-duration links.
    #[must_use]
    pub fn duration(&self) -> f64 {
        residence_time(self.rate)
    }

    const fn is_fixed(&self) -> bool {
        matches!(self.timing, LinkTiming::FixedDuration)
    }
}

fn residence_time(rate: f64) -> f64 {
    if rate > 0.0 { 1.0 / rate } else { f64::INFINITY }
}

/// Result of one [`PhaseModel::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Stayed,
    Transitioned { from: usize, to: usize },
    /// The agent left a removal phase and was flagged instead of transitioning.
    Removed { from: usize },
}

/// Reusable cycle or death model.
#[derive(Debug, Clone)]
pub struct PhaseModel<A> {
    name: String,
    phases: Vec<Phase<A>>,
    links: Vec<Vec<PhaseLink<A>>>,
    default_phase: usize,
}

impl<A: PhaseAgent> PhaseModel<A> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
            links: Vec::new(),
            default_phase: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a phase and return its index.
    pub fn add_phase(&mut self, name: impl Into<String>) -> usize {
        self.phases.push(Phase {
            name: name.into(),
            entry: None,
            division_at_exit: false,
            removal_at_exit: false,
        });
        self.links.push(Vec::new());
        self.phases.len() - 1
    }

    /// Register a link; earlier links on the same phase take priority.
    pub fn add_link(
        &mut self,
        from: usize,
        to: usize,
        rate: f64,
        timing: LinkTiming,
    ) -> Result<&mut PhaseLink<A>, PhaseModelError> {
        self.check_phase(from)?;
        self.check_phase(to)?;
        if !rate.is_finite() || rate < 0.0 {
            return Err(PhaseModelError::InvalidRate {
                model: self.name.clone(),
                from,
                to,
            });
        }
        let links = &mut self.links[from];
        links.push(PhaseLink {
            to,
            rate,
            timing,
            arrest: None,
            exit: None,
        });
        let last = links.len() - 1;
        Ok(&mut links[last])
    }

    pub fn phase_mut(&mut self, index: usize) -> Result<&mut Phase<A>, PhaseModelError> {
        self.check_phase(index)?;
        Ok(&mut self.phases[index])
    }

    pub fn set_default_phase(&mut self, index: usize) -> Result<(), PhaseModelError> {
        self.check_phase(index)?;
        self.default_phase = index;
        Ok(())
    }

    #[must_use]
    pub const fn default_phase(&self) -> usize {
        self.default_phase
    }

    #[must_use]
    pub fn phases(&self) -> &[Phase<A>] {
        &self.phases
    }

    #[must_use]
    pub fn phase(&self, index: usize) -> Option<&Phase<A>> {
        self.phases.get(index)
    }

    /// State at `phase` carrying a private copy of every link rate.
    #[must_use]
    pub fn start_state(&self, id: ModelId, phase: usize) -> PhaseState {
        PhaseState {
            rates: self
                .links
                .iter()
                .map(|links| links.iter().map(|link| link.rate).collect())
                .collect(),
            ..PhaseState::start(id, phase)
        }
    }

    /// Position of the first link from `from` to `to`.
    #[must_use]
    pub fn link_index(&self, from: usize, to: usize) -> Option<usize> {
        self.links_from(from).iter().position(|link| link.to == to)
    }

    /// Outgoing links of `phase` in registration order.
    #[must_use]
    pub fn links_from(&self, phase: usize) -> &[PhaseLink<A>] {
        self.links.get(phase).map_or(&[], Vec::as_slice)
    }

    /// Look a phase up by name.
    pub fn phase_index(&self, name: &str) -> Result<usize, PhaseModelError> {
        self.phases
            .iter()
            .position(|phase| phase.name == name)
            .ok_or_else(|| PhaseModelError::UnknownPhase {
                model: self.name.clone(),
                phase: name.to_owned(),
            })
    }

    /// Checks that the model can be driven.
    pub fn validate(&self) -> Result<(), PhaseModelError> {
        if self.phases.is_empty() {
            return Err(PhaseModelError::Empty(self.name.clone()));
        }
        self.check_phase(self.default_phase)
    }

    /// Advance `agent` by `dt`.
    ///
    /// Fixed-duration links take precedence: if any leave the current phase, only they
    /// are considered. Otherwise stochastic links are drawn in registration order and
    /// the first that fires and is not arrested wins.
    pub fn advance<R: Rng + ?Sized>(&self, agent: &mut A, rng: &mut R, dt: f64) -> PhaseOutcome {
        if dt <= 0.0 || dt.is_nan() {
            return PhaseOutcome::Stayed;
        }
        let current = agent.phase_state().current;
        let Some(links) = self.links.get(current) else {
            return PhaseOutcome::Stayed;
        };
        agent.phase_state_mut().elapsed += dt;
        if links.is_empty() {
            return PhaseOutcome::Stayed;
        }

        let fixed_only = links.iter().any(PhaseLink::is_fixed);
        for (index, link) in links.iter().enumerate() {
            if link.is_fixed() != fixed_only {
                continue;
            }
            if link.arrest.is_some_and(|arrest| arrest(agent, dt)) {
                continue;
            }
            let rate = agent.phase_state().rate(current, index).unwrap_or(link.rate);
            let ready = match link.timing {
                LinkTiming::FixedDuration => {
                    let duration = residence_time(rate);
                    agent.phase_state().elapsed
                        >= duration - FIXED_DURATION_EPSILON * duration.max(1.0)
                }
                LinkTiming::Stochastic => rng.random::<f64>() < rate * dt,
            };
            if !ready {
                continue;
            }
            return self.fire(agent, current, link, dt);
        }
        PhaseOutcome::Stayed
    }

    fn fire(&self, agent: &mut A, from: usize, link: &PhaseLink<A>, dt: f64) -> PhaseOutcome {
        let leaving = &self.phases[from];
        if let Some(exit) = link.exit {
            exit(agent, dt);
        }
        if leaving.division_at_exit {
            agent.flag_for_division();
        }
        if leaving.removal_at_exit {
            agent.flag_for_removal();
            return PhaseOutcome::Removed { from };
        }
        let state = agent.phase_state_mut();
        state.current = link.to;
        state.elapsed = 0.0;
        if let Some(entry) = self.phases[link.to].entry {
            entry(agent, dt);
        }
        PhaseOutcome::Transitioned { from, to: link.to }
    }

    fn check_phase(&self, index: usize) -> Result<(), PhaseModelError> {
        if index < self.phases.len() {
            Ok(())
        } else {
            Err(PhaseModelError::PhaseOutOfRange {
                model: self.name.clone(),
                index,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    #[derive(Debug, Default)]
    struct Walker {
        state: PhaseState,
        divisions: u32,
        removals: u32,
        entries: u32,
        locked: bool,
    }

    impl PhaseAgent for Walker {
        fn phase_state(&self) -> &PhaseState {
            &self.state
        }
        fn phase_state_mut(&mut self) -> &mut PhaseState {
            &mut self.state
        }
        fn flag_for_division(&mut self) {
            self.divisions += 1;
        }
        fn flag_for_removal(&mut self) {
            self.removals += 1;
        }
    }

    fn count_entry(walker: &mut Walker, _dt: f64) {
        walker.entries += 1;
    }

    fn locked(walker: &Walker, _dt: f64) -> bool {
        walker.locked
    }

    fn two_phase(rate: f64, timing: LinkTiming) -> PhaseModel<Walker> {
        let mut model = PhaseModel::new("two");
        let a = model.add_phase("a");
        let b = model.add_phase("b");
        model.add_link(a, b, rate, timing).expect("link");
        model.add_link(b, a, rate, timing).expect("link");
        model.phase_mut(b).expect("phase").entry = Some(count_entry);
        model.phase_mut(b).expect("phase").division_at_exit = true;
        model
    }

    #[test]
    fn zero_dt_is_a_no_op() {
        let model = two_phase(1.0, LinkTiming::Stochastic);
        let mut walker = Walker::default();
        walker.state.elapsed = 3.0;
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(model.advance(&mut walker, &mut rng, 0.0), PhaseOutcome::Stayed);
        }
        assert_eq!(walker.state.current, 0);
        assert_eq!(walker.state.elapsed, 3.0);
        assert_eq!(walker.entries, 0);
    }

    #[test]
    fn fixed_duration_fires_exactly_on_time() {
        let model = two_phase(1.0 / 30.0, LinkTiming::FixedDuration);
        let mut walker = Walker::default();
        let mut rng = SmallRng::seed_from_u64(2);
        for step in 1..=29 {
            assert_eq!(
                model.advance(&mut walker, &mut rng, 1.0),
                PhaseOutcome::Stayed,
                "fired early at step {step}"
            );
        }
        assert_eq!(walker.state.elapsed, 29.0);
        assert_eq!(
            model.advance(&mut walker, &mut rng, 1.0),
            PhaseOutcome::Transitioned { from: 0, to: 1 }
        );
        assert_eq!(walker.state.elapsed, 0.0);
        assert_eq!(walker.entries, 1);
    }

    #[test]
    fn fixed_duration_tolerates_accumulated_rounding() {
        let model = two_phase(1.0 / 30.0, LinkTiming::FixedDuration);
        let mut walker = Walker::default();
        let mut rng = SmallRng::seed_from_u64(3);
        let mut fired_at = None;
        for step in 1..=400 {
            if model.advance(&mut walker, &mut rng, 0.1) != PhaseOutcome::Stayed {
                fired_at = Some(step);
                break;
            }
        }
        assert_eq!(fired_at, Some(300));
    }

    #[test]
    fn division_flag_raised_when_leaving_flagged_phase() {
        let model = two_phase(1.0, LinkTiming::FixedDuration);
        let mut walker = Walker::default();
        let mut rng = SmallRng::seed_from_u64(4);
        model.advance(&mut walker, &mut rng, 1.0);
        assert_eq!(walker.divisions, 0);
        model.advance(&mut walker, &mut rng, 1.0);
        assert_eq!(walker.divisions, 1);
        assert_eq!(walker.state.current, 0);
    }

    #[test]
    fn removal_phase_flags_instead_of_transitioning() {
        let mut model: PhaseModel<Walker> = PhaseModel::new("death");
        let dying = model.add_phase("dying");
        let gone = model.add_phase("gone");
        model
            .add_link(dying, gone, 0.5, LinkTiming::FixedDuration)
            .expect("link");
        model.phase_mut(dying).expect("phase").removal_at_exit = true;
        model.phase_mut(gone).expect("phase").entry = Some(count_entry);

        let mut walker = Walker::default();
        let mut rng = SmallRng::seed_from_u64(5);
        assert_eq!(model.advance(&mut walker, &mut rng, 1.0), PhaseOutcome::Stayed);
        assert_eq!(
            model.advance(&mut walker, &mut rng, 1.0),
            PhaseOutcome::Removed { from: dying }
        );
        assert_eq!(walker.removals, 1);
        assert_eq!(walker.state.current, dying);
        assert_eq!(walker.entries, 0);
    }

    #[test]
    fn arrest_vetoes_a_ready_link() {
        let mut model = two_phase(1.0, LinkTiming::FixedDuration);
        model.add_link(0, 1, 1.0, LinkTiming::FixedDuration).expect("link");
        model.links[0][0].arrest = Some(locked);
        model.links[0][1].arrest = Some(locked);

        let mut walker = Walker {
            locked: true,
            ..Walker::default()
        };
        let mut rng = SmallRng::seed_from_u64(6);
        for _ in 0..5 {
            assert_eq!(model.advance(&mut walker, &mut rng, 1.0), PhaseOutcome::Stayed);
        }
        assert_eq!(walker.state.elapsed, 5.0);
        walker.locked = false;
        assert_eq!(
            model.advance(&mut walker, &mut rng, 1.0),
            PhaseOutcome::Transitioned { from: 0, to: 1 }
        );
    }

    #[test]
    fn absorbing_phase_only_accumulates_time() {
        let mut model: PhaseModel<Walker> = PhaseModel::new("sink");
        model.add_phase("only");
        let mut walker = Walker::default();
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(model.advance(&mut walker, &mut rng, 0.5), PhaseOutcome::Stayed);
        }
        assert_eq!(walker.state.elapsed, 5.0);
    }

    #[test]
    fn stochastic_links_respect_registration_order() {
        let mut model: PhaseModel<Walker> = PhaseModel::new("fork");
        let root = model.add_phase("root");
        let left = model.add_phase("left");
        let right = model.add_phase("right");
        model.add_link(root, left, 1.0, LinkTiming::Stochastic).expect("link");
        model.add_link(root, right, 1.0, LinkTiming::Stochastic).expect("link");

        let mut rng = SmallRng::seed_from_u64(8);
        for _ in 0..50 {
            let mut walker = Walker::default();
            assert_eq!(
                model.advance(&mut walker, &mut rng, 1.0),
                PhaseOutcome::Transitioned { from: root, to: left }
            );
        }
    }

    #[test]
    fn per_agent_rates_leave_siblings_alone() {
        let model = two_phase(1.0 / 30.0, LinkTiming::FixedDuration);
        let start = model.start_state(ModelId::default(), 0);
        let mut fast = Walker {
            state: start.clone(),
            ..Walker::default()
        };
        let mut sibling = Walker {
            state: start,
            ..Walker::default()
        };
        let link = model.link_index(0, 1).expect("link");
        assert!(fast.state.set_rate(0, link, 1.0 / 5.0));
        assert!(!fast.state.set_rate(0, 7, 1.0));
        assert!(!fast.state.set_rate(0, link, -1.0));

        let mut rng = SmallRng::seed_from_u64(9);
        for _ in 0..5 {
            model.advance(&mut fast, &mut rng, 1.0);
            model.advance(&mut sibling, &mut rng, 1.0);
        }
        assert_eq!(fast.state.current, 1);
        assert_eq!(sibling.state.current, 0);
        assert_eq!(sibling.state.rate(0, link), Some(1.0 / 30.0));
        assert_eq!(model.links_from(0)[link].rate, 1.0 / 30.0);
    }

    #[test]
    fn zero_agent_rate_parks_a_stochastic_link() {
        let model = two_phase(1.0, LinkTiming::Stochastic);
        let mut walker = Walker {
            state: model.start_state(ModelId::default(), 0),
            ..Walker::default()
        };
        assert!(walker.state.set_rate(0, 0, 0.0));
        let mut rng = SmallRng::seed_from_u64(10);
        for _ in 0..100 {
            assert_eq!(model.advance(&mut walker, &mut rng, 1.0), PhaseOutcome::Stayed);
        }
    }

    #[test]
    fn builder_rejects_bad_references() {
        let mut model: PhaseModel<Walker> = PhaseModel::new("bad");
        let only = model.add_phase("only");
        assert_eq!(
            model.add_link(only, 3, 1.0, LinkTiming::Stochastic).unwrap_err(),
            PhaseModelError::PhaseOutOfRange {
                model: "bad".into(),
                index: 3
            }
        );
        assert!(model.add_link(only, only, -1.0, LinkTiming::Stochastic).is_err());
        assert!(model.phase_index("missing").is_err());
        assert_eq!(model.phase_index("only"), Ok(0));
        assert!(PhaseModel::<Walker>::new("empty").validate().is_err());
    }
}
