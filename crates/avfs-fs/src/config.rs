use std::time::Duration;

/// Configuration for mounting an archive.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Volume label reported to the OS.
    pub volume_label: String,
    /// How long front ends may cache attributes and lookups.
    pub attr_ttl: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            volume_label: "AVFS".to_string(),
            attr_ttl: Duration::from_secs(1),
        }
    }
}
