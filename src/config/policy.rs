use serde::{Deserialize, Serialize};

/// Restic section of a volume resource policy, applied on top of the
/// provider's own env and flags for a single backup.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResticConfig {
    /// Exclude patterns; absolute ones are anchored to the backup root
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Additional `KEY=VALUE` entries for the restic environment
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl ResticConfig {
    pub fn is_empty(&self) -> bool {
        self.excludes.is_empty() && self.env.is_empty() && self.extra_flags.is_empty()
    }
}
