//! Contact-driven events between neighbors: phagocytosis, attack, fusion and springs.
//!
//! Each cell proposes events against a read-only snapshot in parallel. Proposals that
//! touch another cell are then committed one at a time in handle order, which is
//! where competing claims on the same target are settled.

use crate::cell::{Cell, Interactions};
use crate::container::CellContainer;
use crate::rng::{Stream, agent_rng};
use crate::{AgentHandle, Tick};
use rand::Rng;
use rayon::prelude::*;
use std::collections::HashSet;

/// Event proposed by one cell toward a neighbor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interaction {
    Phagocytose {
        eater: AgentHandle,
        target: AgentHandle,
    },
    Fuse {
        survivor: AgentHandle,
        target: AgentHandle,
    },
    Attack {
        attacker: AgentHandle,
        target: AgentHandle,
        damage: f64,
        duration: f64,
    },
    Attach(AgentHandle, AgentHandle),
    Detach(AgentHandle, AgentHandle),
}

/// What the commit actually applied.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InteractionTally {
    pub ingested: usize,
    pub fused: usize,
    pub attacks: usize,
    pub damage_delivered: f64,
    pub attachments_formed: usize,
}

fn chance<R: Rng + ?Sized>(rng: &mut R, probability: f64) -> bool {
    probability > 0.0 && rng.random::<f64>() < probability
}

/// Events one cell would like to carry out this step.
pub fn propose<R: Rng + ?Sized>(
    cell: &Cell,
    cells: &[Cell],
    rng: &mut R,
    dt: f64,
) -> Vec<Interaction> {
    let mut proposals = Vec::new();
    if cell.is_dead() || cell.flags.removal_pending || !cell.flags.active {
        return proposals;
    }
    let me = cell.handle;
    let rates = &cell.phenotype.interactions;
    let mechanics = &cell.phenotype.mechanics;

    for &neighbor in &cell.state.neighbors {
        let Some(other) = cells.get(neighbor.0) else {
            continue;
        };
        if other.flags.removal_pending {
            continue;
        }
        if other.is_dead() {
            if chance(rng, rates.dead_phagocytosis_rate * dt) {
                proposals.push(Interaction::Phagocytose {
                    eater: me,
                    target: neighbor,
                });
            }
            continue;
        }

        let kind = other.type_id;
        if chance(rng, Interactions::rate_toward(&rates.live_phagocytosis_rates, kind) * dt) {
            proposals.push(Interaction::Phagocytose {
                eater: me,
                target: neighbor,
            });
        } else if chance(rng, Interactions::rate_toward(&rates.attack_rates, kind) * dt) {
            proposals.push(Interaction::Attack {
                attacker: me,
                target: neighbor,
                damage: rates.damage_rate * dt,
                duration: dt,
            });
        } else if chance(rng, Interactions::rate_toward(&rates.fusion_rates, kind) * dt) {
            proposals.push(Interaction::Fuse {
                survivor: me,
                target: neighbor,
            });
        }

        if !cell.state.spring_attachments.contains(&neighbor)
            && chance(rng, mechanics.attachment_rate * dt)
        {
            proposals.push(Interaction::Attach(me, neighbor));
        }
    }

    for &partner in &cell.state.spring_attachments {
        if chance(rng, mechanics.detachment_rate * dt) {
            proposals.push(Interaction::Detach(me, partner));
        }
    }
    proposals
}

/// Parallel proposal pass; output is ordered by proposing handle.
pub(crate) fn gather(cells: &[Cell], seed: u64, tick: Tick, dt: f64) -> Vec<Interaction> {
    cells
        .par_iter()
        .map(|cell| {
            if cell.state.neighbors.is_empty() && cell.state.spring_attachments.is_empty() {
                return Vec::new();
            }
            let mut rng = agent_rng(seed, tick, cell.handle, Stream::Interactions);
            propose(cell, cells, &mut rng, dt)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

/// Apply proposals in order. A cell that has been ingested or fused away takes no
/// further part, as actor or target.
pub fn commit(container: &mut CellContainer, proposals: &[Interaction]) -> InteractionTally {
    let mut tally = InteractionTally::default();
    let mut consumed: HashSet<AgentHandle> = HashSet::new();
    let gone = |container: &CellContainer, consumed: &HashSet<AgentHandle>, h: AgentHandle| {
        consumed.contains(&h)
            || container
                .get(h)
                .is_none_or(|cell| cell.flags.removal_pending)
    };

    for proposal in proposals {
        match *proposal {
            Interaction::Phagocytose { eater, target }
            | Interaction::Fuse {
                survivor: eater,
                target,
            } => {
                if eater == target
                    || gone(container, &consumed, eater)
                    || gone(container, &consumed, target)
                {
                    continue;
                }
                let fuse = matches!(proposal, Interaction::Fuse { .. });
                absorb(container.cells_mut(), eater, target, fuse);
                consumed.insert(target);
                if fuse {
                    tally.fused += 1;
                } else {
                    tally.ingested += 1;
                }
            }
            Interaction::Attack {
                attacker,
                target,
                damage,
                duration,
            } => {
                if gone(container, &consumed, attacker) || gone(container, &consumed, target) {
                    continue;
                }
                if let Some(cell) = container.get_mut(target) {
                    cell.state.damage += damage;
                }
                if let Some(cell) = container.get_mut(attacker) {
                    cell.state.total_attack_time += duration;
                }
                tally.attacks += 1;
                tally.damage_delivered += damage;
            }
            Interaction::Attach(a, b) => {
                if !gone(container, &consumed, a)
                    && !gone(container, &consumed, b)
                    && container.attach_springs(a, b)
                {
                    tally.attachments_formed += 1;
                }
            }
            Interaction::Detach(a, b) => container.detach_springs(a, b),
        }
    }
    tally
}

fn pair_mut(cells: &mut [Cell], a: AgentHandle, b: AgentHandle) -> (&mut Cell, &mut Cell) {
    if a.0 < b.0 {
        let (low, high) = cells.split_at_mut(b.0);
        (&mut low[a.0], &mut high[0])
    } else {
        let (low, high) = cells.split_at_mut(a.0);
        (&mut high[0], &mut low[b.0])
    }
}

/// Move the target's mass, substrates and conserved data into `survivor` and flag the
/// target for removal.
fn absorb(cells: &mut [Cell], survivor: AgentHandle, target: AgentHandle, fuse: bool) {
    let (keeper, eaten) = pair_mut(cells, survivor, target);

    if fuse {
        let kept = keeper.phenotype.volume.total;
        let joined = eaten.phenotype.volume.total;
        if kept + joined > 0.0 {
            keeper.position = (keeper.position * kept + eaten.position * joined) / (kept + joined);
        }
        keeper.state.nuclei += eaten.state.nuclei;
    }

    keeper.phenotype.volume.absorb(&eaten.phenotype.volume);
    eaten.phenotype.volume.multiply_by_ratio(0.0);
    keeper.radius = keeper.phenotype.volume.radius();

    let incoming = &mut eaten.phenotype.secretion.internalized;
    for (amount, extra) in keeper
        .phenotype
        .secretion
        .internalized
        .iter_mut()
        .zip(incoming.iter())
    {
        *amount += extra;
    }
    incoming.fill(0.0);

    keeper.custom.absorb_conserved(&eaten.custom);
    eaten.custom.clear_conserved();
    eaten.flags.removal_pending = true;
}
