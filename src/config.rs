use bevy::prelude::*;
use serde::{Deserialize, Serialize};

/// tunables for the stream layer. insert before adding the plugin to
/// override the defaults.
#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// bound of the cross-thread inbox; producers wait when it is full.
    pub inbox_capacity: usize,
    /// inbox messages applied per frame, to avoid long frames on bursty streams.
    pub max_inbox_per_frame: usize,
    /// keep the raw payload on each reasoning step.
    pub keep_raw_payloads: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 2048,
            max_inbox_per_frame: 512,
            keep_raw_payloads: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: StreamConfig = serde_json::from_str(r#"{ "max_inbox_per_frame": 8 }"#).unwrap();
        assert_eq!(cfg.max_inbox_per_frame, 8);
        assert_eq!(cfg.inbox_capacity, 2048);
        assert!(cfg.keep_raw_payloads);
    }
}
