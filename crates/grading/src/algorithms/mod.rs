pub mod calibration;
pub mod classification;
pub mod defects;
pub mod features;
pub mod preprocessing;
pub mod segmentation;
pub mod separation;

pub use calibration::*;
pub use classification::classify;
pub use defects::{DefectKind, DefectRegion};
pub use features::FeatureExtractor;
pub use preprocessing::*;
pub use segmentation::{clean, segment};
pub use separation::*;
