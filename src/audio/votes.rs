use std::collections::HashSet;
use tracing::{debug, info};

use crate::UserId;

/// Resultado de un voto de skip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// El umbral se alcanzó; el track debe saltarse
    Skip,
    /// Faltan votos; tally actual y umbral requerido
    Pending { votes: usize, required: usize },
}

/// Tally de consenso para saltar el track actual.
///
/// Ligado a exactamente un track en reproducción; el reproductor lo resetea
/// una vez por transición de track. El umbral es
/// `max(skips_required, ceil(skip_ratio * oyentes_elegibles))`.
#[derive(Debug)]
pub struct SkipVoteTracker {
    voters: HashSet<UserId>,
    skips_required: usize,
    skip_ratio: f64,
}

impl SkipVoteTracker {
    pub fn new(skips_required: usize, skip_ratio: f64) -> Self {
        Self {
            voters: HashSet::new(),
            skips_required,
            skip_ratio,
        }
    }

    /// Registra un voto y evalúa el umbral.
    ///
    /// Votar dos veces no cuenta doble. Un voto con `bypass` (solicitante
    /// del track o identidad autorizada) salta de inmediato sin tally.
    pub fn cast_vote(
        &mut self,
        voter: UserId,
        eligible_listeners: usize,
        bypass: bool,
    ) -> VoteOutcome {
        if bypass {
            info!("⏭️ Voto con bypass de {}, skip inmediato", voter);
            return VoteOutcome::Skip;
        }

        self.voters.insert(voter);
        let required = self.required(eligible_listeners);
        let votes = self.voters.len();

        if votes >= required {
            info!("⏭️ Umbral de skip alcanzado ({}/{})", votes, required);
            VoteOutcome::Skip
        } else {
            debug!("🗳️ Voto de {} registrado ({}/{})", voter, votes, required);
            VoteOutcome::Pending { votes, required }
        }
    }

    /// Umbral requerido para el número de oyentes dado
    pub fn required(&self, eligible_listeners: usize) -> usize {
        let by_ratio = (self.skip_ratio * eligible_listeners as f64).ceil() as usize;
        self.skips_required.max(by_ratio)
    }

    pub fn votes(&self) -> usize {
        self.voters.len()
    }

    /// Descarta el tally; se invoca una vez por cambio de track
    pub fn reset(&mut self) {
        self.voters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_max_of_floor_and_ratio() {
        // SkipsRequired=4, SkipRatio=0.5, 10 oyentes -> umbral 5
        let mut tracker = SkipVoteTracker::new(4, 0.5);
        for i in 0..4 {
            let outcome = tracker.cast_vote(UserId(i), 10, false);
            assert_eq!(
                outcome,
                VoteOutcome::Pending {
                    votes: i as usize + 1,
                    required: 5
                }
            );
        }
        assert_eq!(tracker.cast_vote(UserId(4), 10, false), VoteOutcome::Skip);
    }

    #[test]
    fn test_skips_required_floor_dominates_small_channels() {
        // Con 2 oyentes el ratio pediría 1, pero el mínimo fijo es 4
        let mut tracker = SkipVoteTracker::new(4, 0.5);
        assert_eq!(tracker.required(2), 4);
        assert_eq!(
            tracker.cast_vote(UserId(1), 2, false),
            VoteOutcome::Pending {
                votes: 1,
                required: 4
            }
        );
    }

    #[test]
    fn test_duplicate_votes_do_not_count() {
        let mut tracker = SkipVoteTracker::new(2, 0.0);
        tracker.cast_vote(UserId(1), 5, false);
        let outcome = tracker.cast_vote(UserId(1), 5, false);
        assert_eq!(
            outcome,
            VoteOutcome::Pending {
                votes: 1,
                required: 2
            }
        );
        assert_eq!(tracker.cast_vote(UserId(2), 5, false), VoteOutcome::Skip);
    }

    #[test]
    fn test_bypass_skips_regardless_of_tally() {
        let mut tracker = SkipVoteTracker::new(10, 1.0);
        assert_eq!(tracker.cast_vote(UserId(9), 50, true), VoteOutcome::Skip);
        assert_eq!(tracker.votes(), 0);
    }

    #[test]
    fn test_reset_clears_tally() {
        let mut tracker = SkipVoteTracker::new(2, 0.0);
        tracker.cast_vote(UserId(1), 5, false);
        tracker.reset();
        assert_eq!(tracker.votes(), 0);
        assert_eq!(
            tracker.cast_vote(UserId(2), 5, false),
            VoteOutcome::Pending {
                votes: 1,
                required: 2
            }
        );
    }

    #[test]
    fn test_ratio_ceil_rounds_up() {
        // 0.5 * 3 = 1.5 -> 2 requeridos
        let tracker = SkipVoteTracker::new(1, 0.5);
        assert_eq!(tracker.required(3), 2);
    }
}
