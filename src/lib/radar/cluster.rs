use chrono::{DateTime, Utc};
use log::trace;

use super::grid::GRID_SIZE;
use super::{ClusteredObject, InterpolationData, VehicleSide};

/// Points are gathered up to this many grid steps away from the strongest one
const WINDOW_STEPS: f64 = 3.;

/// Where a side looks for a vehicle and how strong and large it must be.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterBounds {
    pub max_abs_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_strength: f64,
    pub min_cluster_size: usize,
}

impl ClusterBounds {
    pub fn for_side(side: VehicleSide) -> Self {
        match side {
            VehicleSide::Right => ClusterBounds {
                max_abs_x: 2.,
                min_y: 0.25,
                max_y: 4.5,
                min_strength: 200.,
                min_cluster_size: 5,
            },
            VehicleSide::Left => ClusterBounds {
                max_abs_x: 2.,
                min_y: 0.5,
                max_y: 10.,
                min_strength: 75.,
                min_cluster_size: 1,
            },
        }
    }

    fn accepts(&self, p: &InterpolationData) -> bool {
        !p.strength.is_nan()
            && p.x.abs() < self.max_abs_x
            && p.y > self.min_y
            && p.y < self.max_y
            && p.strength > self.min_strength
    }

    /// Strength a point next to the maximum needs to count
    pub fn sensitivity(&self) -> f64 {
        self.min_strength * 0.5
    }
}

/// Finds at most one vehicle per packet for one side of the vehicle.
#[derive(Clone, Debug)]
pub struct Clusterer {
    side: VehicleSide,
    bounds: ClusterBounds,
}

impl Clusterer {
    pub fn new(side: VehicleSide) -> Self {
        Clusterer {
            side,
            bounds: ClusterBounds::for_side(side),
        }
    }

    pub fn with_bounds(side: VehicleSide, bounds: ClusterBounds) -> Self {
        Clusterer { side, bounds }
    }

    pub fn side(&self) -> VehicleSide {
        self.side
    }

    pub fn bounds(&self) -> &ClusterBounds {
        &self.bounds
    }

    ///
    /// Clusters the interpolated grid of one packet around its strongest
    /// point. `input` is the full query grid in grid order, the step sizes
    /// are taken from it.
    ///
    /// The cluster position is that of the last point gathered (in grid
    /// order), not the centroid; downstream matching is tuned to this.
    ///
    pub fn cluster(
        &self,
        input: &[InterpolationData],
        time: DateTime<Utc>,
    ) -> Option<ClusteredObject> {
        if input.len() <= GRID_SIZE {
            return None;
        }
        let dx = (input[GRID_SIZE].x - input[0].x).abs();
        let dy = (input[1].y - input[0].y).abs();

        let candidates: Vec<&InterpolationData> =
            input.iter().filter(|p| self.bounds.accepts(p)).collect();
        let first = *candidates.first()?;
        let max = candidates
            .iter()
            .copied()
            .fold(first, |max, p| if p.strength > max.strength { p } else { max });

        let sensitivity = self.bounds.sensitivity();
        let (min_x, max_x) = (max.x - dx * WINDOW_STEPS, max.x + dx * WINDOW_STEPS);
        let (min_y, max_y) = (max.y - dy * WINDOW_STEPS, max.y + dy * WINDOW_STEPS);
        let kept: Vec<&InterpolationData> = candidates
            .iter()
            .copied()
            .filter(|p| {
                p.x >= min_x
                    && p.x <= max_x
                    && p.y >= min_y
                    && p.y <= max_y
                    && p.strength >= sensitivity
            })
            .collect();

        trace!(
            "{} side: {} candidates, max {:.0} at ({:.2}, {:.2}), {} kept",
            self.side,
            candidates.len(),
            max.strength,
            max.x,
            max.y,
            kept.len()
        );
        if kept.len() < self.bounds.min_cluster_size {
            return None;
        }

        let (last, total) = kept
            .iter()
            .fold((kept[0], 0.), |(_, total), p| (*p, total + p.strength));

        Some(ClusteredObject {
            x: last.x,
            y: last.y,
            time,
            side: self.side,
            mean_strength: total / kept.len() as f64,
            point_count: kept.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radar::grid::QueryGrid;
    use crate::radar::heatmap::AzimuthHeatmapProcessor;
    use crate::radar::testdata;

    fn empty_grid(query: &QueryGrid) -> Vec<InterpolationData> {
        query
            .points()
            .map(|p| InterpolationData::new(p.x, p.y, f64::NAN))
            .collect()
    }

    fn set(grid: &mut [InterpolationData], query: &QueryGrid, i: usize, j: usize, strength: f64) {
        grid[query.index(i, j)].strength = strength;
    }

    fn time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_650_000_000, 0).unwrap()
    }

    #[test]
    fn minimum_cluster_size_boundary() {
        let query = QueryGrid::new();
        let clusterer = Clusterer::new(VehicleSide::Right);
        let (i, j) = (100, 33); // x 0.06, y 1.99

        let mut grid = empty_grid(&query);
        set(&mut grid, &query, i, j, 1000.);
        set(&mut grid, &query, i - 1, j, 300.);
        set(&mut grid, &query, i, j - 1, 300.);
        set(&mut grid, &query, i, j + 2, 300.);
        // Qualifies on its own but is too far from the maximum
        set(&mut grid, &query, i + 10, j, 900.);
        assert!(clusterer.cluster(&grid, time()).is_none());

        set(&mut grid, &query, i + 1, j, 300.);
        let cluster = clusterer.cluster(&grid, time()).unwrap();
        assert_eq!(cluster.point_count, 5);
        assert_eq!(cluster.side, VehicleSide::Right);
        assert_eq!(cluster.time, time());
        assert!((cluster.mean_strength - 440.).abs() < 1e-9);
        // Position of the last kept point in grid order
        assert_eq!(cluster.x, query.xs()[i + 1]);
        assert_eq!(cluster.y, query.ys()[j]);
    }

    #[test]
    fn points_outside_window_are_ignored() {
        let query = QueryGrid::new();
        let clusterer = Clusterer::new(VehicleSide::Right);
        let (i, j) = (100, 40);

        let mut grid = empty_grid(&query);
        set(&mut grid, &query, i, j, 5000.);
        set(&mut grid, &query, i - 2, j, 300.);
        set(&mut grid, &query, i + 2, j + 2, 300.);
        set(&mut grid, &query, i, j - 2, 300.);
        set(&mut grid, &query, i - 2, j + 2, 300.);
        set(&mut grid, &query, i + 4, j, 300.);
        set(&mut grid, &query, i, j + 4, 300.);

        let cluster = clusterer.cluster(&grid, time()).unwrap();
        assert_eq!(cluster.point_count, 5);
    }

    #[test]
    fn side_bounds() {
        let query = QueryGrid::new();
        let left = Clusterer::new(VehicleSide::Left);
        let right = Clusterer::new(VehicleSide::Right);

        // y 7.96, beyond the near side
        let mut grid = empty_grid(&query);
        set(&mut grid, &query, 100, 132, 80.);
        let cluster = left.cluster(&grid, time()).unwrap();
        assert_eq!(cluster.point_count, 1);
        assert_eq!(cluster.side, VehicleSide::Left);
        assert_eq!(cluster.mean_strength, 80.);
        assert!(right.cluster(&grid, time()).is_none());

        // x 2.11 is outside both
        let mut grid = empty_grid(&query);
        set(&mut grid, &query, 117, 50, 5000.);
        assert!(left.cluster(&grid, time()).is_none());
        assert!(right.cluster(&grid, time()).is_none());

        // too weak for the left side
        let mut grid = empty_grid(&query);
        set(&mut grid, &query, 100, 132, 75.);
        assert!(left.cluster(&grid, time()).is_none());
    }

    #[test]
    fn custom_bounds() {
        let query = QueryGrid::new();
        let bounds = ClusterBounds {
            min_cluster_size: 2,
            ..ClusterBounds::for_side(VehicleSide::Left)
        };
        let clusterer = Clusterer::with_bounds(VehicleSide::Left, bounds);
        assert_eq!(clusterer.side(), VehicleSide::Left);
        assert_eq!(clusterer.bounds().sensitivity(), 37.5);

        let mut grid = empty_grid(&query);
        set(&mut grid, &query, 100, 132, 80.);
        assert!(clusterer.cluster(&grid, time()).is_none());
        set(&mut grid, &query, 100, 133, 90.);
        assert_eq!(clusterer.cluster(&grid, time()).unwrap().point_count, 2);
    }

    #[test]
    fn short_input() {
        let clusterer = Clusterer::new(VehicleSide::Left);
        let grid = vec![InterpolationData::new(0., 1., 500.); GRID_SIZE];
        assert!(clusterer.cluster(&grid, time()).is_none());
    }

    #[test]
    fn zero_heatmap_has_no_clusters() {
        let mut processor = AzimuthHeatmapProcessor::new();
        let points = processor
            .process(&testdata::heatmap_bytes(&vec![0; 4096]))
            .unwrap();
        assert!(Clusterer::new(VehicleSide::Left).cluster(&points, time()).is_none());
        assert!(Clusterer::new(VehicleSide::Right).cluster(&points, time()).is_none());
    }

    #[test]
    fn target_straight_ahead() {
        let mut processor = AzimuthHeatmapProcessor::new();
        let samples = testdata::broadside_target(1000, 35..=45);
        let points = processor.process(&testdata::heatmap_bytes(&samples)).unwrap();

        let cluster = Clusterer::new(VehicleSide::Right)
            .cluster(&points, time())
            .unwrap();
        assert!(cluster.x.abs() < 1.);
        assert!(cluster.y > 1.2 && cluster.y < 2.4, "{}", cluster);
        assert!(cluster.point_count >= 5);
        assert!(cluster.mean_strength >= 1500.);
    }
}
