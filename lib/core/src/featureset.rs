use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Separator used in persisted ledger keys; may not appear in a feature set name.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Which channels of an image a feature set is computed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRule {
    /// Computed independently for every channel of the image.
    EveryChannel,
    /// Computed only on the listed channel indices.
    Channels(Vec<u64>),
}

impl ChannelRule {
    pub fn applies_to(&self, channel: u64) -> bool {
        match self {
            ChannelRule::EveryChannel => true,
            ChannelRule::Channels(channels) => channels.contains(&channel),
        }
    }

    /// Channels this rule selects on an image with `size_c` channels.
    pub fn channels_for(&self, size_c: u64) -> Vec<u64> {
        match self {
            ChannelRule::EveryChannel => (0..size_c).collect(),
            ChannelRule::Channels(channels) => {
                channels.iter().copied().filter(|c| *c < size_c).collect()
            }
        }
    }
}

/// A named family of feature vectors with a fixed width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub name: String,
    pub width: usize,
    pub channels: ChannelRule,
}

impl FeatureSet {
    pub fn new(name: impl Into<String>, width: usize, channels: ChannelRule) -> Self {
        Self {
            name: name.into(),
            width,
            channels,
        }
    }

    /// Check a vector length against the set's width.
    pub fn check_width(&self, actual: usize) -> Result<()> {
        if actual != self.width {
            return Err(Error::InvalidDimension {
                expected: self.width,
                actual,
            });
        }
        Ok(())
    }
}

/// The feature sets enabled on this deployment. The first entry is the default.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureSetRegistry {
    sets: Vec<FeatureSet>,
}

impl FeatureSetRegistry {
    pub fn new(sets: Vec<FeatureSet>) -> Result<Self> {
        if sets.is_empty() {
            return Err(Error::InvalidConfig("no feature sets configured".to_string()));
        }
        for (i, set) in sets.iter().enumerate() {
            if set.name.is_empty() || set.name.contains(KEY_SEPARATOR) {
                return Err(Error::InvalidConfig(format!(
                    "invalid feature set name {:?}",
                    set.name
                )));
            }
            if set.width == 0 {
                return Err(Error::InvalidConfig(format!(
                    "feature set {} has zero width",
                    set.name
                )));
            }
            if sets[..i].iter().any(|other| other.name == set.name) {
                return Err(Error::InvalidConfig(format!(
                    "feature set {} configured twice",
                    set.name
                )));
            }
        }
        Ok(Self { sets })
    }

    /// Look up a feature set by name, case-insensitively.
    pub fn get(&self, name: &str) -> Result<&FeatureSet> {
        self.sets
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::NotFound(format!("feature set {}", name)))
    }

    pub fn default_set(&self) -> &FeatureSet {
        &self.sets[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureSet> {
        self.sets.iter()
    }
}

impl Default for FeatureSetRegistry {
    fn default() -> Self {
        Self {
            sets: vec![
                FeatureSet::new("slf33", 161, ChannelRule::EveryChannel),
                FeatureSet::new("slf34", 173, ChannelRule::Channels(vec![0])),
            ],
        }
    }
}
