//! Catalogue of setting keys.
//!
//! Settings are (env, key) rows in the store. Keys are assembled here so a
//! typo cannot split a setting across two spellings.

/// Target rows per batch for the batch planner.
pub const COMPASS_BATCH_SIZE: &str = "compass_batch_size";

/// Rows per upstream result page.
pub const COMPASS_PAGE_SIZE: &str = "compass_page_size";

/// Upstream requests per second (token-bucket refill rate).
pub const API_THROTTLE_REQUESTS_PER_SECOND: &str = "api_throttle_requests_per_second";

/// Upstream burst capacity (token-bucket size).
pub const API_THROTTLE_BURST_SIZE: &str = "api_throttle_burst_size";

/// Parallel detectors per execution wave.
pub const DETECTOR_PARALLELISM: &str = "detector_parallelism";

/// Enable toggle for one detector: `detector_<name>_enabled`.
pub fn detector_enabled_key(detector: &str) -> String {
    format!("detector_{detector}_enabled")
}

/// Threshold setting for one detector: `detector_<name>_<threshold>`.
///
/// JSON-typed threshold settings may carry a hierarchical
/// `{global, overrides}` shape resolved by the config resolver.
pub fn detector_threshold_key(detector: &str, threshold: &str) -> String {
    format!("detector_{detector}_{threshold}")
}
