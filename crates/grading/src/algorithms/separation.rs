use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::{
    distance_transform::euclidean_squared_distance_transform,
    region_labelling::{Connectivity, connected_components},
};
use tracing::debug;

use crate::{
    config::{MorphologySettings, SeparationMode, SpeciesConfig, WatershedSettings},
    error::Result,
    traits::InstanceSeparator,
    types::{BACKGROUND_LABEL, BOUNDARY_LABEL, Frame, InstanceSet, LabelMap},
};

type FloodQueue = BinaryHeap<Reverse<(u64, u64, u32, u32)>>;

const NEIGHBORS_8: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

#[inline]
fn offset(x: u32, y: u32, d: (i32, i32), width: u32, height: u32) -> Option<(u32, u32)> {
    let nx = x as i64 + d.0 as i64;
    let ny = y as i64 + d.1 as i64;
    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
        None
    } else {
        Some((nx as u32, ny as u32))
    }
}

/// Area filter shared by both strategies.
#[derive(Debug, Clone, Copy)]
pub struct AreaFilter {
    pub min_area: u32,
    pub max_area: Option<u32>,
}

impl AreaFilter {
    pub fn accepts(&self, area: u32) -> bool {
        area >= self.min_area && self.max_area.is_none_or(|max| area <= max)
    }
}

impl From<&MorphologySettings> for AreaFilter {
    fn from(settings: &MorphologySettings) -> Self {
        Self {
            min_area: settings.min_area,
            max_area: settings.max_area,
        }
    }
}

/// Build the separator selected by the configuration.
pub fn separator_for(mode: SeparationMode, config: &SpeciesConfig) -> Box<dyn InstanceSeparator> {
    let area = AreaFilter::from(config.morphology());
    match mode {
        SeparationMode::Watershed => Box::new(WatershedSeparator::new(*config.watershed(), area)),
        SeparationMode::Contour => Box::new(ContourSeparator::new(area)),
    }
}

/// Fill every background region that is not 4-connected to the image border.
pub fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let inverted = GrayImage::from_fn(width, height, |x, y| {
        if mask.get_pixel(x, y)[0] == 0 { Luma([255]) } else { Luma([0]) }
    });
    let regions = connected_components(&inverted, Connectivity::Four, Luma([0u8]));

    let mut outside = HashSet::new();
    for (x, y, px) in regions.enumerate_pixels() {
        let on_border = x == 0 || y == 0 || x + 1 == width || y + 1 == height;
        if on_border && px[0] != 0 {
            outside.insert(px[0]);
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let label = regions.get_pixel(x, y)[0];
        if label != 0 && outside.contains(&label) { Luma([0]) } else { Luma([255]) }
    })
}

/// External-contour separation: each hole-filled 8-connected region is one item
#[derive(Debug, Clone)]
pub struct ContourSeparator {
    pub area: AreaFilter,
}

impl ContourSeparator {
    pub fn new(area: AreaFilter) -> Self {
        Self { area }
    }
}

impl InstanceSeparator for ContourSeparator {
    fn separate(&self, mask: &GrayImage, _frame: &Frame) -> Result<InstanceSet> {
        let filled = fill_holes(mask);
        let labels = connected_components(&filled, Connectivity::Eight, Luma([0u8]));

        let mut instances = InstanceSet::from_labels(labels);
        instances.retain(|m| self.area.accepts(m.pixel_count));

        debug!(instances = instances.len(), "Contour separation");
        Ok(instances)
    }
}

/// Marker-controlled watershed on the distance transform of the mask
#[derive(Debug, Clone)]
pub struct WatershedSeparator {
    pub settings: WatershedSettings,
    pub area: AreaFilter,
}

impl WatershedSeparator {
    pub fn new(settings: WatershedSettings, area: AreaFilter) -> Self {
        Self { settings, area }
    }

    /// Euclidean distance of every foreground pixel to the nearest background pixel.
    fn distance_map(mask: &GrayImage) -> ImageBuffer<Luma<f64>, Vec<f64>> {
        let background = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            if mask.get_pixel(x, y)[0] == 0 { Luma([255]) } else { Luma([0]) }
        });

        let mut dist = euclidean_squared_distance_transform(&background);
        for px in dist.pixels_mut() {
            // A mask with no background at all has no finite distances
            px[0] = if px[0].is_finite() { px[0].sqrt() } else { 0.0 };
        }
        dist
    }

    /// Seed markers: thresholded distance peaks, merged when their centroids
    /// are closer than `min_distance`, plus one seed per unseeded component.
    fn markers(&self, mask: &GrayImage, dist: &ImageBuffer<Luma<f64>, Vec<f64>>) -> LabelMap {
        let (width, height) = mask.dimensions();
        let max_dist = dist.pixels().map(|p| p[0]).fold(0.0f64, f64::max);
        let threshold = self.settings.distance_threshold_rel * max_dist;

        let seed_mask = GrayImage::from_fn(width, height, |x, y| {
            let d = dist.get_pixel(x, y)[0];
            if mask.get_pixel(x, y)[0] != 0 && d > threshold {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let seeds = connected_components(&seed_mask, Connectivity::Eight, Luma([0u8]));
        let components = connected_components(mask, Connectivity::Eight, Luma([0u8]));

        // Per raw seed label: (sum_x, sum_y, count, component)
        let seed_count = seeds.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
        let mut stats = vec![(0.0f64, 0.0f64, 0u32, 0u32); seed_count + 1];
        for (x, y, px) in seeds.enumerate_pixels() {
            let s = px[0] as usize;
            if s != 0 {
                stats[s].0 += x as f64;
                stats[s].1 += y as f64;
                stats[s].2 += 1;
                stats[s].3 = components.get_pixel(x, y)[0];
            }
        }

        // Union seeds of the same component whose centroids are too close
        let mut parent: Vec<usize> = (0..=seed_count).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let centroid = |s: usize| {
            let (sx, sy, n, _) = stats[s];
            (sx / n as f64, sy / n as f64)
        };
        for a in 1..=seed_count {
            if stats[a].2 == 0 {
                continue;
            }
            for b in (a + 1)..=seed_count {
                if stats[b].2 == 0 || stats[a].3 != stats[b].3 {
                    continue;
                }
                let (ax, ay) = centroid(a);
                let (bx, by) = centroid(b);
                if (ax - bx).hypot(ay - by) < self.settings.min_distance {
                    let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
                    if ra != rb {
                        parent[rb.max(ra)] = ra.min(rb);
                    }
                }
            }
        }

        // Dense marker ids in row-major order of first appearance
        let mut marker_of_root = vec![0u32; seed_count + 1];
        let mut next_marker = 1u32;
        let mut markers = LabelMap::new(width, height);
        for (x, y, px) in seeds.enumerate_pixels() {
            let s = px[0] as usize;
            if s == 0 {
                continue;
            }
            let root = find(&mut parent, s);
            if marker_of_root[root] == 0 {
                marker_of_root[root] = next_marker;
                next_marker += 1;
            }
            markers.put_pixel(x, y, Luma([marker_of_root[root]]));
        }

        // Components without any seed get one at their distance maximum
        let component_count = components.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
        let mut seeded = vec![false; component_count + 1];
        let mut peak: Vec<Option<(u32, u32, f64)>> = vec![None; component_count + 1];
        for (x, y, px) in components.enumerate_pixels() {
            let c = px[0] as usize;
            if c == 0 {
                continue;
            }
            if markers.get_pixel(x, y)[0] != 0 {
                seeded[c] = true;
            }
            let d = dist.get_pixel(x, y)[0];
            if peak[c].is_none_or(|(_, _, best)| d > best) {
                peak[c] = Some((x, y, d));
            }
        }
        for c in 1..=component_count {
            if let (false, Some((x, y, _))) = (seeded[c], peak[c]) {
                markers.put_pixel(x, y, Luma([next_marker]));
                next_marker += 1;
            }
        }

        markers
    }

    /// Priority flood from the markers over `max - dist`, restricted to the mask.
    /// Pixels reached by two different labels become boundary pixels.
    fn flood(
        mask: &GrayImage,
        dist: &ImageBuffer<Luma<f64>, Vec<f64>>,
        mut labels: LabelMap,
    ) -> LabelMap {
        let (width, height) = mask.dimensions();
        let max_dist = dist.pixels().map(|p| p[0]).fold(0.0f64, f64::max);
        let idx = |x: u32, y: u32| y as usize * width as usize + x as usize;
        let mut queued = vec![false; width as usize * height as usize];

        // Min-heap on (elevation bits, insertion order); elevation is non-negative
        let mut heap: FloodQueue = BinaryHeap::new();
        let mut order = 0u64;
        let mut push = |heap: &mut FloodQueue, queued: &mut [bool], x: u32, y: u32| {
            queued[idx(x, y)] = true;
            let elevation = (max_dist - dist.get_pixel(x, y)[0]).max(0.0);
            heap.push(Reverse((elevation.to_bits(), order, x, y)));
            order += 1;
        };

        for y in 0..height {
            for x in 0..width {
                if labels.get_pixel(x, y)[0] == BACKGROUND_LABEL {
                    continue;
                }
                for d in NEIGHBORS_8 {
                    if let Some((nx, ny)) = offset(x, y, d, width, height) {
                        if mask.get_pixel(nx, ny)[0] != 0
                            && labels.get_pixel(nx, ny)[0] == BACKGROUND_LABEL
                            && !queued[idx(nx, ny)]
                        {
                            push(&mut heap, &mut queued, nx, ny);
                        }
                    }
                }
            }
        }

        while let Some(Reverse((_, _, x, y))) = heap.pop() {
            let mut label = BACKGROUND_LABEL;
            let mut conflict = false;
            for d in NEIGHBORS_8 {
                if let Some((nx, ny)) = offset(x, y, d, width, height) {
                    let n = labels.get_pixel(nx, ny)[0];
                    if n == BACKGROUND_LABEL || n == BOUNDARY_LABEL {
                        continue;
                    }
                    if label == BACKGROUND_LABEL {
                        label = n;
                    } else if label != n {
                        conflict = true;
                    }
                }
            }

            if conflict || label == BACKGROUND_LABEL {
                labels.put_pixel(x, y, Luma([BOUNDARY_LABEL]));
                continue;
            }

            labels.put_pixel(x, y, Luma([label]));
            for d in NEIGHBORS_8 {
                if let Some((nx, ny)) = offset(x, y, d, width, height) {
                    if mask.get_pixel(nx, ny)[0] != 0
                        && labels.get_pixel(nx, ny)[0] == BACKGROUND_LABEL
                        && !queued[idx(nx, ny)]
                    {
                        push(&mut heap, &mut queued, nx, ny);
                    }
                }
            }
        }

        labels
    }
}

impl InstanceSeparator for WatershedSeparator {
    fn separate(&self, mask: &GrayImage, _frame: &Frame) -> Result<InstanceSet> {
        let (width, height) = mask.dimensions();
        if !mask.pixels().any(|p| p[0] != 0) {
            return Ok(InstanceSet::empty(width, height));
        }

        let dist = Self::distance_map(mask);
        let markers = self.markers(mask, &dist);
        let labels = Self::flood(mask, &dist, markers);

        let mut instances = InstanceSet::from_labels(labels);
        instances.retain(|m| self.area.accepts(m.pixel_count));

        debug!(instances = instances.len(), "Watershed separation");
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use imageproc::drawing::draw_filled_circle_mut;

    fn no_filter() -> AreaFilter {
        AreaFilter {
            min_area: 1,
            max_area: None,
        }
    }

    fn blank_frame(mask: &GrayImage) -> Frame {
        Frame::new(RgbImage::new(mask.width(), mask.height()))
    }

    #[test]
    fn test_fill_holes_keeps_border_background() {
        let mut mask = GrayImage::new(9, 9);
        for y in 2..7 {
            for x in 2..7 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        mask.put_pixel(4, 4, Luma([0]));

        let filled = fill_holes(&mask);
        assert_eq!(filled.get_pixel(4, 4)[0], 255);
        assert_eq!(filled.get_pixel(0, 0)[0], 0);
        assert_eq!(filled.get_pixel(8, 4)[0], 0);
    }

    #[test]
    fn test_fill_holes_leaves_open_notch() {
        let mut mask = GrayImage::new(9, 9);
        for y in 2..7 {
            for x in 2..7 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        for y in 2..=4 {
            mask.put_pixel(4, y, Luma([0]));
        }

        let filled = fill_holes(&mask);
        assert_eq!(filled.get_pixel(4, 4)[0], 0);
        assert_eq!(filled.get_pixel(4, 2)[0], 0);
        assert_eq!(filled.get_pixel(3, 3)[0], 255);
    }

    #[test]
    fn test_fill_holes_ignores_diagonal_leaks() {
        let mut mask = GrayImage::new(5, 5);
        for (x, y) in [(1, 0), (0, 1), (2, 1), (1, 2)] {
            mask.put_pixel(x, y, Luma([255]));
        }

        // (1, 1) only touches the outside through the corner at (0, 0)
        let filled = fill_holes(&mask);
        assert_eq!(filled.get_pixel(1, 1)[0], 255);
        assert_eq!(filled.get_pixel(0, 0)[0], 0);
        assert_eq!(filled.get_pixel(3, 3)[0], 0);
    }

    #[test]
    fn test_contour_ring_with_island_is_one_instance() {
        let mut mask = GrayImage::new(60, 60);
        draw_filled_circle_mut(&mut mask, (30, 30), 20, Luma([255]));
        draw_filled_circle_mut(&mut mask, (30, 30), 10, Luma([0]));
        draw_filled_circle_mut(&mut mask, (30, 30), 3, Luma([255]));

        let set = ContourSeparator::new(no_filter())
            .separate(&mask, &blank_frame(&mask))
            .unwrap();
        assert_eq!(set.len(), 1);
        // Hole is filled
        assert_eq!(set.labels().get_pixel(30, 24)[0], set.instances()[0].label);
    }

    #[test]
    fn test_contour_area_filter() {
        let mut mask = GrayImage::new(80, 40);
        draw_filled_circle_mut(&mut mask, (15, 20), 10, Luma([255]));
        draw_filled_circle_mut(&mut mask, (60, 20), 3, Luma([255]));

        let area = AreaFilter {
            min_area: 100,
            max_area: None,
        };
        let set = ContourSeparator::new(area)
            .separate(&mask, &blank_frame(&mask))
            .unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.instances()[0].bounds.x < 40);
    }

    #[test]
    fn test_watershed_empty_mask() {
        let mask = GrayImage::new(20, 20);
        let separator = WatershedSeparator::new(WatershedSettings::default(), no_filter());
        assert!(separator.separate(&mask, &blank_frame(&mask)).unwrap().is_empty());
    }

    #[test]
    fn test_watershed_splits_touching_disks() {
        let mut mask = GrayImage::new(160, 100);
        draw_filled_circle_mut(&mut mask, (50, 50), 30, Luma([255]));
        draw_filled_circle_mut(&mut mask, (106, 50), 30, Luma([255]));

        let separator = WatershedSeparator::new(WatershedSettings::default(), no_filter());
        let set = separator.separate(&mask, &blank_frame(&mask)).unwrap();
        assert_eq!(set.len(), 2);

        let total = mask.pixels().filter(|p| p[0] != 0).count() as f64;
        for instance in set.instances() {
            let share = instance.pixel_count as f64 / total;
            assert!((0.4..=0.6).contains(&share), "share {share}");
        }
    }

    #[test]
    fn test_watershed_keeps_single_disk_whole() {
        let mut mask = GrayImage::new(100, 100);
        draw_filled_circle_mut(&mut mask, (50, 50), 25, Luma([255]));

        let separator = WatershedSeparator::new(WatershedSettings::default(), no_filter());
        let set = separator.separate(&mask, &blank_frame(&mask)).unwrap();
        assert_eq!(set.len(), 1);
        let total = mask.pixels().filter(|p| p[0] != 0).count() as u32;
        assert_eq!(set.instances()[0].pixel_count, total);
    }

    #[test]
    fn test_watershed_seeds_every_component() {
        // A thin blob never reaches the global distance threshold
        let mut mask = GrayImage::new(120, 60);
        draw_filled_circle_mut(&mut mask, (30, 30), 25, Luma([255]));
        for x in 80..110 {
            for y in 28..32 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }

        let separator = WatershedSeparator::new(WatershedSettings::default(), no_filter());
        let set = separator.separate(&mask, &blank_frame(&mask)).unwrap();
        assert_eq!(set.len(), 2);
    }
}
