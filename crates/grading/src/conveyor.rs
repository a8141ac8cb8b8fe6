use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::PixelRect;

/// Horizontal band of the frame in which items are graded and counted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisZone {
    pub start_x: f32,
    pub end_x: f32,
}

impl Default for AnalysisZone {
    fn default() -> Self {
        Self {
            start_x: 200.0,
            end_x: 600.0,
        }
    }
}

impl AnalysisZone {
    /// Whether the bbox centre lies in `[start_x, end_x]`.
    pub fn contains(&self, bbox: &PixelRect) -> bool {
        let [cx, _] = bbox.center();
        (self.start_x..=self.end_x).contains(&cx)
    }
}

/// Counts each tracked id once, the first time it crosses into the zone.
#[derive(Debug, Clone, Default)]
pub struct ZoneCounter {
    zone: AnalysisZone,
    counted: BTreeSet<u64>,
}

impl ZoneCounter {
    pub fn new(zone: AnalysisZone) -> Self {
        Self {
            zone,
            counted: BTreeSet::new(),
        }
    }

    pub fn zone(&self) -> &AnalysisZone {
        &self.zone
    }

    pub fn should_count(&mut self, object_id: u64, bbox: &PixelRect) -> bool {
        if self.counted.contains(&object_id) || !self.zone.contains(bbox) {
            return false;
        }
        self.counted.insert(object_id)
    }

    pub fn counted(&self) -> usize {
        self.counted.len()
    }

    pub fn reset(&mut self) {
        self.counted.clear();
    }
}
