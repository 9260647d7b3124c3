//! Target selection for work redistribution.
//!
//! [`Planner`] assigns items one at a time, charging [`ITEM_COST`] to the
//! chosen target so later picks in the same batch see the updated load.

use mender_core::{AssignmentStrategy, TeamMember, WorkItem};

/// Simulated load added to a target for each assigned item.
pub const ITEM_COST: f64 = 10.0;

/// Least-loaded only considers targets with more spare capacity than this.
pub const LEAST_LOADED_MIN_CAPACITY: f64 = 10.0;

const SKILL_WEIGHT: f64 = 0.7;
const CAPACITY_WEIGHT: f64 = 0.3;

/// A receiving actor with its simulated load.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub member: TeamMember,
    pub workload: f64,
    pub capacity: f64,
}

impl Candidate {
    pub fn new(member: TeamMember) -> Self {
        Self {
            workload: member.current_workload,
            capacity: member.capacity(),
            member,
        }
    }

    /// Whether one more item keeps capacity at or above zero.
    pub fn can_take_item(&self) -> bool {
        self.capacity - ITEM_COST >= 0.0
    }

    /// Fraction of `required` skills this candidate has, case-insensitive.
    pub fn skill_match(&self, required: &[String]) -> f64 {
        if required.is_empty() {
            return 0.0;
        }
        let matched = required
            .iter()
            .filter(|skill| {
                self.member
                    .skills
                    .iter()
                    .any(|have| have.eq_ignore_ascii_case(skill))
            })
            .count();
        ratio(matched, required.len())
    }

    /// `0.7 * skill match + 0.3 * capacity / 100`.
    pub fn skill_score(&self, required: &[String]) -> f64 {
        weighted_score(self.skill_match(required), self.capacity)
    }
}

fn weighted_score(skill_match: f64, capacity: f64) -> f64 {
    SKILL_WEIGHT * skill_match + CAPACITY_WEIGHT * (capacity / 100.0)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    part as f64 / whole as f64
}

/// Stateful picker for one redistribution batch.
#[derive(Debug)]
pub struct Planner {
    strategy: AssignmentStrategy,
    candidates: Vec<Candidate>,
    cursor: usize,
}

impl Planner {
    /// Candidates are ordered by spare capacity, largest first.
    pub fn new(strategy: AssignmentStrategy, members: Vec<TeamMember>) -> Self {
        let mut candidates: Vec<Candidate> = members.into_iter().map(Candidate::new).collect();
        candidates.sort_by(|a, b| b.capacity.total_cmp(&a.capacity));
        Self {
            strategy,
            candidates,
            cursor: 0,
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Choose a target for `item` and charge it. `None` when nobody can take it.
    pub fn assign(&mut self, item: &WorkItem) -> Option<&TeamMember> {
        let index = match self.strategy {
            AssignmentStrategy::RoundRobin => self.pick_round_robin(),
            AssignmentStrategy::LeastLoaded => self.pick_least_loaded(),
            AssignmentStrategy::SkillBased if item.required_skills.is_empty() => {
                self.pick_least_loaded()
            }
            AssignmentStrategy::SkillBased => self.pick_skill_based(&item.required_skills),
        }?;

        let chosen = &mut self.candidates[index];
        chosen.capacity -= ITEM_COST;
        chosen.workload += ITEM_COST;
        Some(&chosen.member)
    }

    fn pick_round_robin(&mut self) -> Option<usize> {
        let len = self.candidates.len();
        for step in 0..len {
            let index = (self.cursor + step) % len;
            if self.candidates[index].can_take_item() {
                self.cursor = (index + 1) % len;
                return Some(index);
            }
        }
        None
    }

    fn pick_least_loaded(&self) -> Option<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.capacity > LEAST_LOADED_MIN_CAPACITY && c.can_take_item())
            .min_by(|(_, a), (_, b)| a.workload.total_cmp(&b.workload))
            .map(|(i, _)| i)
    }

    fn pick_skill_based(&self, required: &[String]) -> Option<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.can_take_item())
            .map(|(i, c)| (i, c.skill_score(required)))
            // Stable on ties: the earlier (higher-capacity) candidate wins.
            .fold(None, |best: Option<(usize, f64)>, (i, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((i, score)),
            })
            .map(|(i, _)| i)
    }
}
