//! Persistent ids for items moving through the camera's field of view.
//!
//! Each frame the tracker matches detection centroids against the last known
//! centroid of every live object. Matching goes through an
//! [`AssignmentStrategy`]; the default [`GreedyAssignment`] picks the
//! smallest remaining distance first. Objects unseen for more than
//! `max_disappeared` frames are dropped, and ids are never handed out twice.

pub mod assignment;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use assignment::{AssignmentStrategy, DistanceMatrix, GreedyAssignment};

use crate::types::ClassificationResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Largest centroid jump, in pixels, still matched to the same object
    pub max_distance: f64,
    /// Consecutive missed frames an object survives
    pub max_disappeared: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_distance: 50.0,
            max_disappeared: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub id: u64,
    pub last_centroid: [f32; 2],
    pub frames_since_seen: u32,
}

pub struct IdentityTracker<A = GreedyAssignment> {
    config: TrackerConfig,
    assignment: A,
    objects: BTreeMap<u64, TrackedObject>,
    next_id: u64,
}

impl Default for IdentityTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_assignment(config, GreedyAssignment)
    }
}

impl<A: AssignmentStrategy> IdentityTracker<A> {
    pub fn with_assignment(config: TrackerConfig, assignment: A) -> Self {
        Self {
            config,
            assignment,
            objects: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Match this frame's detection centroids. Returns `object id -> detection index`
    /// for every detection, newly registered ones included.
    pub fn update(&mut self, centroids: &[[f32; 2]]) -> BTreeMap<u64, usize> {
        let mut assigned = BTreeMap::new();

        let ids: Vec<u64> = self.objects.keys().copied().collect();
        let known: Vec<[f32; 2]> = self.objects.values().map(|o| o.last_centroid).collect();

        let mut matched_objects = vec![false; ids.len()];
        let mut matched_detections = vec![false; centroids.len()];

        if !ids.is_empty() && !centroids.is_empty() {
            let distances = DistanceMatrix::between(&known, centroids);
            for (row, col) in self.assignment.assign(&distances, self.config.max_distance) {
                let id = ids[row];
                if let Some(object) = self.objects.get_mut(&id) {
                    object.last_centroid = centroids[col];
                    object.frames_since_seen = 0;
                }
                matched_objects[row] = true;
                matched_detections[col] = true;
                assigned.insert(id, col);
            }
        }

        for (row, &id) in ids.iter().enumerate() {
            if matched_objects[row] {
                continue;
            }
            let Some(object) = self.objects.get_mut(&id) else {
                continue;
            };
            object.frames_since_seen += 1;
            if object.frames_since_seen > self.config.max_disappeared {
                info!(id, frames = object.frames_since_seen, "Object evicted");
                self.objects.remove(&id);
            }
        }

        for (col, centroid) in centroids.iter().enumerate() {
            if !matched_detections[col] {
                let id = self.register(*centroid);
                assigned.insert(id, col);
            }
        }

        debug!(
            detections = centroids.len(),
            live = self.objects.len(),
            "Tracker updated"
        );
        assigned
    }

    /// [`update`](Self::update) with the centroids of a frame's results
    pub fn update_results(&mut self, results: &[ClassificationResult]) -> BTreeMap<u64, usize> {
        let centroids: Vec<[f32; 2]> = results.iter().map(|r| r.features.centroid).collect();
        self.update(&centroids)
    }

    fn register(&mut self, centroid: [f32; 2]) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.objects.insert(
            id,
            TrackedObject {
                id,
                last_centroid: centroid,
                frames_since_seen: 0,
            },
        );
        info!(id, x = centroid[0], y = centroid[1], "Object registered");
        id
    }

    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_registers_from_zero() {
        let mut tracker = IdentityTracker::default();
        let ids = tracker.update(&[[10.0, 10.0], [100.0, 10.0]]);
        assert_eq!(ids, BTreeMap::from([(0, 0), (1, 1)]));
    }

    #[test]
    fn test_id_is_stable_under_small_motion() {
        let mut tracker = IdentityTracker::default();
        for step in 0..20 {
            let x = 10.0 + step as f32 * 30.0;
            let ids = tracker.update(&[[x, 50.0]]);
            assert_eq!(ids, BTreeMap::from([(0, 0)]), "step {step}");
        }
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_jump_beyond_max_distance_gets_new_id() {
        let mut tracker = IdentityTracker::default();
        tracker.update(&[[0.0, 0.0]]);
        let ids = tracker.update(&[[200.0, 0.0]]);
        assert_eq!(ids, BTreeMap::from([(1, 0)]));
        assert_eq!(tracker.get(0).unwrap().frames_since_seen, 1);
    }

    #[test]
    fn test_eviction_never_reuses_ids() {
        let config = TrackerConfig {
            max_distance: 50.0,
            max_disappeared: 3,
        };
        let mut tracker = IdentityTracker::new(config);
        tracker.update(&[[40.0, 40.0]]);

        for _ in 0..3 {
            assert!(tracker.update(&[]).is_empty());
            assert!(tracker.get(0).is_some());
        }
        tracker.update(&[]);
        assert!(tracker.get(0).is_none());

        let ids = tracker.update(&[[40.0, 40.0]]);
        assert_eq!(ids, BTreeMap::from([(1, 0)]));
    }

    #[test]
    fn test_matched_object_resets_counter() {
        let mut tracker = IdentityTracker::default();
        tracker.update(&[[0.0, 0.0]]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.get(0).unwrap().frames_since_seen, 2);

        tracker.update(&[[5.0, 5.0]]);
        let object = tracker.get(0).unwrap();
        assert_eq!(object.frames_since_seen, 0);
        assert_eq!(object.last_centroid, [5.0, 5.0]);
    }
}
