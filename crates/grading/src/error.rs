use thiserror::Error;

#[derive(Error, Debug)]
pub enum GradingError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Problems found while validating a species configuration.
///
/// All of these are raised at load time; a `SpeciesConfig` that exists has
/// passed every check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Size band '{label}' is inverted: min {min} >= max {max}")]
    InvertedBand { label: String, min: f64, max: f64 },

    #[error("Size bands '{first}' and '{second}' overlap")]
    OverlappingBands { first: String, second: String },

    #[error("Color '{color}' has no HSV boxes")]
    EmptyColor { color: String },

    #[error("Hue range of '{color}' is out of bounds: [{min}, {max}] (hue is 0-180)")]
    InvalidHueRange { color: String, min: u8, max: u8 },

    #[error("{channel} range of '{color}' is inverted: [{min}, {max}]")]
    InvalidChannelRange {
        color: String,
        channel: char,
        min: u8,
        max: u8,
    },

    #[error("Rule '{rule}' has an unknown key '{key}'")]
    UnknownRuleKey { rule: &'static str, key: String },

    #[error("Rule '{rule}' references color '{color}' which has no HSV range")]
    UnknownColor { rule: &'static str, color: String },

    #[error("Invalid kernel size for {name}: {value} (must be odd and >= 3)")]
    InvalidKernel { name: &'static str, value: u32 },

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, GradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts_and_displays() {
        let err: GradingError = ConfigError::MissingKey("hsv_ranges").into();
        assert!(matches!(err, GradingError::Config(ConfigError::MissingKey("hsv_ranges"))));
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Missing required key: hsv_ranges"
        );
    }

    #[test]
    fn test_json_errors_surface_as_serialization() {
        let err: GradingError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, GradingError::Serialization(_)));
    }
}
