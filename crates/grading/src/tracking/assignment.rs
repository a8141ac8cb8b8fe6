/// Pairwise Euclidean distances, objects as rows and detections as columns.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl DistanceMatrix {
    pub fn between(objects: &[[f32; 2]], detections: &[[f32; 2]]) -> Self {
        let data = objects
            .iter()
            .flat_map(|o| {
                detections.iter().map(move |d| {
                    let dx = (o[0] - d[0]) as f64;
                    let dy = (o[1] - d[1]) as f64;
                    dx.hypot(dy)
                })
            })
            .collect();
        Self {
            rows: objects.len(),
            cols: detections.len(),
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// `(distance, row, col)` in row-major order
    pub fn entries(&self) -> impl Iterator<Item = (f64, usize, usize)> + '_ {
        self.data
            .iter()
            .enumerate()
            .map(|(i, &d)| (d, i / self.cols, i % self.cols))
    }
}

/// Matches tracked objects (rows) to detections (columns).
pub trait AssignmentStrategy {
    /// Matched `(row, col)` pairs. No row or column appears twice, and no pair
    /// is further apart than `max_distance`.
    fn assign(&self, distances: &DistanceMatrix, max_distance: f64) -> Vec<(usize, usize)>;
}

/// Smallest remaining distance first. Not a globally optimal matching; equal
/// distances resolve in row-major order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyAssignment;

impl AssignmentStrategy for GreedyAssignment {
    fn assign(&self, distances: &DistanceMatrix, max_distance: f64) -> Vec<(usize, usize)> {
        let mut entries: Vec<(f64, usize, usize)> = distances.entries().collect();
        // Stable sort keeps row-major order among ties
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_rows = vec![false; distances.rows()];
        let mut used_cols = vec![false; distances.cols()];
        let mut pairs = Vec::new();

        for (distance, row, col) in entries {
            if distance > max_distance {
                break;
            }
            if used_rows[row] || used_cols[col] {
                continue;
            }
            used_rows[row] = true;
            used_cols[col] = true;
            pairs.push((row, col));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_takes_smallest_first() {
        let objects = [[0.0, 0.0], [10.0, 0.0]];
        let detections = [[9.0, 0.0], [1.0, 0.0]];
        let matrix = DistanceMatrix::between(&objects, &detections);
        assert_eq!(matrix.get(0, 1), 1.0);

        let pairs = GreedyAssignment.assign(&matrix, 50.0);
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn test_greedy_is_not_optimal() {
        // (0,1) + (1,0) totals 4.5; greedy grabs (0,0) first and ends at 6.5
        let objects = [[0.0, 0.0], [3.0, 0.0]];
        let detections = [[1.0, 0.0], [-2.5, 0.0]];
        let pairs = GreedyAssignment.assign(&DistanceMatrix::between(&objects, &detections), 50.0);
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_ties_resolve_row_major() {
        let objects = [[0.0, 0.0], [0.0, 0.0]];
        let detections = [[3.0, 4.0]];
        let pairs = GreedyAssignment.assign(&DistanceMatrix::between(&objects, &detections), 50.0);
        assert_eq!(pairs, vec![(0, 0)]);
    }

    #[test]
    fn test_cutoff_is_inclusive() {
        let matrix = DistanceMatrix::between(&[[0.0, 0.0]], &[[30.0, 40.0]]);
        assert_eq!(GreedyAssignment.assign(&matrix, 50.0), vec![(0, 0)]);
        assert!(GreedyAssignment.assign(&matrix, 49.9).is_empty());
    }
}
