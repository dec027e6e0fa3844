//! Fallback placement for nodes whose stored coordinates cannot be trusted.
//!
//! A loader creates one [`PositionRecovery`] per load call, feeds it every
//! valid node position in row order via [`PositionRecovery::observe`], and asks
//! it for a placement whenever a row is corrupt. Recovered placements are
//! recorded too, so two corrupt nodes in the same load do not land on the same
//! cell while grid candidates remain.

use rand::Rng;

use crate::models::Position;

pub const GRID_COLUMNS: usize = 5;
pub const GRID_CANDIDATES: usize = 100;
pub const GRID_SPACING: f64 = 250.0;
/// A candidate is occupied when a placed node sits inside this box centered on it.
pub const OCCUPIED_WIDTH: f64 = 200.0;
pub const OCCUPIED_HEIGHT: f64 = 100.0;
/// Upper bound (exclusive) of the random fallback area on both axes.
pub const FALLBACK_EXTENT: f64 = 1_000.0;

#[derive(Debug, Clone, Default)]
pub struct PositionRecovery {
    placed: Vec<Position>,
}

impl PositionRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_placed(placed: impl IntoIterator<Item = Position>) -> Self {
        Self {
            placed: placed.into_iter().collect(),
        }
    }

    pub fn observe(&mut self, position: Position) {
        self.placed.push(position);
    }

    pub fn placed(&self) -> &[Position] {
        &self.placed
    }

    pub fn recover(&mut self) -> Position {
        self.recover_with(&mut rand::rng())
    }

    pub fn recover_with<R: Rng>(&mut self, rng: &mut R) -> Position {
        let position = self.first_free_cell().unwrap_or_else(|| {
            Position::new(
                rng.random_range(0.0..FALLBACK_EXTENT),
                rng.random_range(0.0..FALLBACK_EXTENT),
            )
        });
        self.placed.push(position);
        position
    }

    fn first_free_cell(&self) -> Option<Position> {
        (0..GRID_CANDIDATES)
            .map(grid_cell)
            .find(|candidate| !self.is_occupied(candidate))
    }

    fn is_occupied(&self, candidate: &Position) -> bool {
        self.placed.iter().any(|placed| {
            (placed.x - candidate.x).abs() < OCCUPIED_WIDTH / 2.0
                && (placed.y - candidate.y).abs() < OCCUPIED_HEIGHT / 2.0
        })
    }
}

fn grid_cell(index: usize) -> Position {
    let column = (index % GRID_COLUMNS) as f64;
    let row = (index / GRID_COLUMNS) as f64;
    Position::new(column * GRID_SPACING, row * GRID_SPACING)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::collection::vec;
    use proptest::prelude::{prop_assert, proptest};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    proptest! {
        #[test]
        fn recovery_only_uses_free_grid_cells(
            observed in vec((-200.0..1_400.0f64, -200.0..3_000.0f64), 0..40),
            recoveries in 1..30usize,
        ) {
            let mut recovery = PositionRecovery::with_placed(
                observed.iter().map(|&(x, y)| Position::new(x, y)),
            );
            let mut rng = StdRng::seed_from_u64(11);
            for _ in 0..recoveries {
                let before = recovery.placed().to_vec();
                let position = recovery.recover_with(&mut rng);

                // Each placed node blocks at most one cell, so the grid never runs out here.
                prop_assert!((0..GRID_CANDIDATES).map(grid_cell).any(|cell| cell == position));
                prop_assert!(before.iter().all(|placed| {
                    (placed.x - position.x).abs() >= OCCUPIED_WIDTH / 2.0
                        || (placed.y - position.y).abs() >= OCCUPIED_HEIGHT / 2.0
                }), "recovered position overlaps a placed node");
            }
        }
    }

    #[test]
    fn first_recovery_uses_origin_cell() {
        let mut recovery = PositionRecovery::new();
        assert_eq!(recovery.recover(), Position::new(0.0, 0.0));
        assert_eq!(recovery.recover(), Position::new(250.0, 0.0));
    }

    #[test]
    fn recovery_wraps_after_five_columns() {
        let mut recovery = PositionRecovery::new();
        let placed = (0..6).map(|_| recovery.recover()).collect::<Vec<_>>();
        assert_eq!(placed[4], Position::new(1_000.0, 0.0));
        assert_eq!(placed[5], Position::new(0.0, 250.0));
    }

    #[test]
    fn observed_nodes_block_nearby_cells() {
        let mut recovery = PositionRecovery::new();
        recovery.observe(Position::new(40.0, 20.0));
        recovery.observe(Position::new(260.0, -30.0));
        assert_eq!(recovery.recover(), Position::new(500.0, 0.0));
    }

    #[test]
    fn nodes_outside_the_box_do_not_block() {
        let mut recovery = PositionRecovery::with_placed([Position::new(0.0, 60.0)]);
        assert_eq!(recovery.recover(), Position::new(0.0, 0.0));
    }

    #[test]
    fn recovered_positions_are_distinct_while_cells_remain() {
        let mut recovery = PositionRecovery::new();
        let mut seen = HashSet::new();
        for _ in 0..GRID_CANDIDATES {
            let position = recovery.recover();
            assert!(seen.insert((position.x as i64, position.y as i64)));
        }
    }

    #[test]
    fn saturated_grid_falls_back_to_random_area() {
        let mut recovery =
            PositionRecovery::with_placed((0..GRID_CANDIDATES).map(grid_cell).collect::<Vec<_>>());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let position = recovery.recover_with(&mut rng);
            assert!((0.0..FALLBACK_EXTENT).contains(&position.x));
            assert!((0.0..FALLBACK_EXTENT).contains(&position.y));
        }
        assert_eq!(recovery.placed().len(), GRID_CANDIDATES + 20);
    }
}
