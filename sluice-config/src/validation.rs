use thiserror::Error;

use crate::models::CoreConfig;

/// Hard configuration errors that make the pipeline unsafe to start.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("ingest.max_file_size must be non-zero")]
    ZeroMaxFileSize,
    #[error("ingest.max_retries must be non-zero")]
    ZeroMaxRetries,
    #[error("priority value {value} ({name}) is not covered by any band")]
    UnbandedPriority { name: String, value: u32 },
    #[error("sampling band {0} does not name a configured priority range")]
    UnknownSamplingBand(String),
    #[error("score thresholds must be ordered high to low")]
    UnorderedScoreThresholds,
    #[error("score threshold names an unknown priority {0}")]
    UnknownThresholdPriority(String),
    #[error("missing required priority name {0}")]
    MissingPriority(&'static str),
}

pub fn validate(config: &CoreConfig) -> Result<(), ConfigGuardRailError> {
    if config.ingest.max_file_size == 0 {
        return Err(ConfigGuardRailError::ZeroMaxFileSize);
    }
    if config.ingest.max_retries == 0 {
        return Err(ConfigGuardRailError::ZeroMaxRetries);
    }

    // The ingester resolves these two by name.
    for required in ["low", "medium"] {
        if !config.priorities.values.contains_key(required) {
            return Err(ConfigGuardRailError::MissingPriority(required));
        }
    }

    for (name, value) in &config.priorities.values {
        if config.priorities.band_of(*value).is_none() {
            return Err(ConfigGuardRailError::UnbandedPriority {
                name: name.clone(),
                value: *value,
            });
        }
    }

    for band in config.ingest.sampling_at.keys() {
        if !config.priorities.ranges.contains_key(band) {
            return Err(ConfigGuardRailError::UnknownSamplingBand(
                band.clone(),
            ));
        }
    }

    let thresholds = &config.priorities.score_thresholds;
    if thresholds
        .windows(2)
        .any(|pair| pair[0].threshold <= pair[1].threshold)
    {
        return Err(ConfigGuardRailError::UnorderedScoreThresholds);
    }
    for entry in thresholds {
        if !config.priorities.values.contains_key(&entry.name) {
            return Err(ConfigGuardRailError::UnknownThresholdPriority(
                entry.name.clone(),
            ));
        }
    }

    Ok(())
}
