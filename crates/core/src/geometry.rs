//! Tile budget and tile grid decisions.

use crate::model::{ModelId, Precision};

/// Pixels of tile edge per declared GB of VRAM.
const PIXELS_PER_GB: f64 = 100.0;
/// Full precision uses roughly 40% more memory than half; keep 3/5 of the edge.
const FULL_PRECISION_RATIO: (u64, u64) = (3, 5);

/// Maximum tile edge in pixels for the given memory ceiling.
///
/// A heuristic, not a measured memory model. Never returns less than 1.
pub fn tile_budget(vram_gb: f64, vram_multiplier: f64, model: ModelId, precision: Precision) -> u32 {
    let raw = (PIXELS_PER_GB * vram_gb * vram_multiplier).floor();
    let mut budget = if raw.is_finite() && raw >= 1.0 {
        raw.min(f64::from(u32::MAX)) as u64
    } else {
        0
    };

    if model.is_lightweight() {
        budget *= 2;
    }
    if precision == Precision::Full {
        let (num, den) = FULL_PRECISION_RATIO;
        budget = budget * num / den;
    }

    u32::try_from(budget).unwrap_or(u32::MAX).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl TileGrid {
    pub const SINGLE: TileGrid = TileGrid {
        tiles_x: 1,
        tiles_y: 1,
    };

    pub fn count(self) -> u32 {
        self.tiles_x * self.tiles_y
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingDecision {
    pub needs_tiling: bool,
    pub grid: TileGrid,
}

/// Decides whether a `width × height` unit fits in one tile of edge `budget`.
///
/// The decision compares areas: a unit whose pixel count is at most
/// `budget²` is processed whole. Otherwise the grid is
/// `ceil(width / budget) × ceil(height / budget)`, which always holds at
/// least `ceil(width·height / budget²)` tiles.
pub fn need_tiling(width: u32, height: u32, budget: u32) -> TilingDecision {
    let budget = budget.max(1);
    let area = u64::from(width) * u64::from(height);
    let budget_area = u64::from(budget) * u64::from(budget);

    if area <= budget_area {
        return TilingDecision {
            needs_tiling: false,
            grid: TileGrid::SINGLE,
        };
    }

    TilingDecision {
        needs_tiling: true,
        grid: TileGrid {
            tiles_x: width.div_ceil(budget).max(1),
            tiles_y: height.div_ceil(budget).max(1),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_scales_with_vram_and_multiplier() {
        assert_eq!(tile_budget(8.0, 1.0, ModelId::RealEsrganX4, Precision::Half), 800);
        assert_eq!(tile_budget(12.0, 1.0, ModelId::RealEsrganX4, Precision::Half), 1200);
        assert_eq!(tile_budget(8.0, 0.5, ModelId::RealEsrganX4, Precision::Half), 400);
    }

    #[test]
    fn lightweight_models_double_and_full_precision_shrinks() {
        assert_eq!(
            tile_budget(8.0, 1.0, ModelId::RealEsrGeneralX4, Precision::Half),
            1600
        );
        assert_eq!(tile_budget(8.0, 1.0, ModelId::RealEsrganX4, Precision::Full), 480);
        assert_eq!(
            tile_budget(3.0, 1.0, ModelId::RealEsrGeneralX4, Precision::Full),
            360
        );
    }

    #[test]
    fn budget_never_drops_below_one() {
        assert_eq!(tile_budget(0.0, 1.0, ModelId::RealEsrganX4, Precision::Half), 1);
        assert_eq!(tile_budget(1.0, 0.001, ModelId::RealEsrganX4, Precision::Full), 1);
        assert_eq!(tile_budget(f64::NAN, 1.0, ModelId::RealEsrganX4, Precision::Half), 1);
    }

    #[test]
    fn four_thousand_by_three_thousand_at_1200_is_four_by_three() {
        let decision = need_tiling(4000, 3000, 1200);
        assert!(decision.needs_tiling);
        assert_eq!(
            decision.grid,
            TileGrid {
                tiles_x: 4,
                tiles_y: 3
            }
        );
    }

    #[test]
    fn unit_at_or_under_budget_area_is_not_tiled() {
        assert_eq!(
            need_tiling(1200, 1200, 1200),
            TilingDecision {
                needs_tiling: false,
                grid: TileGrid::SINGLE
            }
        );
        // wide but small in area
        assert!(!need_tiling(2000, 100, 1200).needs_tiling);
        assert!(!need_tiling(1, 1, 1).needs_tiling);
    }

    #[test]
    fn grid_covers_area_ratio_whenever_tiling() {
        let budgets = [1u32, 3, 7, 64, 500];
        let sizes = [1u32, 2, 5, 63, 64, 65, 333, 1024, 4001];

        for &budget in &budgets {
            for &w in &sizes {
                for &h in &sizes {
                    let decision = need_tiling(w, h, budget);
                    let area = u64::from(w) * u64::from(h);
                    let budget_area = u64::from(budget) * u64::from(budget);

                    if area > budget_area {
                        assert!(decision.needs_tiling, "{w}x{h} at {budget}");
                        assert!(
                            u64::from(decision.grid.count()) >= area.div_ceil(budget_area),
                            "{w}x{h} at {budget} gave {:?}",
                            decision.grid
                        );
                    } else {
                        assert!(!decision.needs_tiling, "{w}x{h} at {budget}");
                        assert_eq!(decision.grid, TileGrid::SINGLE);
                    }
                }
            }
        }
    }

    #[test]
    fn zero_budget_is_treated_as_one() {
        let decision = need_tiling(3, 2, 0);
        assert_eq!(decision.grid, TileGrid { tiles_x: 3, tiles_y: 2 });
    }
}
