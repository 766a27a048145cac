//! Shared AWS SDK setup.
//!
//! Credentials come from the SDK's default provider chain (environment,
//! profile, container or instance role). The region comes from the service
//! configuration when set, otherwise from that same chain.

use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Region;
use tracing::debug;

/// Load SDK settings for one region; an empty region defers to the environment.
pub async fn sdk_config(region: &str) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if !region.is_empty() {
        loader = loader.region(Region::new(region.to_string()));
    }

    let config = loader.load().await;
    debug!(region = ?config.region(), "AWS SDK configuration loaded");
    config
}

/// Fixed settings without touching the environment, for client construction in tests.
#[cfg(test)]
pub fn static_sdk_config(region: &str) -> SdkConfig {
    SdkConfig::builder()
        .region(Region::new(region.to_string()))
        .behavior_version(BehaviorVersion::latest())
        .build()
}
