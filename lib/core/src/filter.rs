// Post-fusion membership filters over host metadata
use crate::{ImageInfo, Locator};
use serde::{Deserialize, Serialize};

pub trait Filter: Send + Sync {
    fn matches(&self, locator: &Locator, info: &ImageInfo) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    /// Image owned by one of the listed users.
    OwnerIn(Vec<u64>),
    /// Image linked into at least one of the listed containers.
    ContainerIn(Vec<u64>),
    /// Features computed on this channel index.
    ChannelIndex(u64),
    /// Features computed on a channel with this name.
    ChannelName(String),
    And(Vec<FilterCondition>),
    Or(Vec<FilterCondition>),
    Not(Box<FilterCondition>),
}

impl FilterCondition {
    fn matches_condition(condition: &FilterCondition, locator: &Locator, info: &ImageInfo) -> bool {
        match condition {
            FilterCondition::OwnerIn(owners) => owners.contains(&info.owner_id),
            FilterCondition::ContainerIn(containers) => info
                .container_ids
                .iter()
                .any(|c| containers.contains(c)),
            FilterCondition::ChannelIndex(channel) => locator.channel == *channel,
            FilterCondition::ChannelName(name) => usize::try_from(locator.channel)
                .ok()
                .and_then(|c| info.channel_names.get(c))
                .map(|n| n == name)
                .unwrap_or(false),
            FilterCondition::And(conditions) => conditions
                .iter()
                .all(|c| Self::matches_condition(c, locator, info)),
            FilterCondition::Or(conditions) => conditions
                .iter()
                .any(|c| Self::matches_condition(c, locator, info)),
            FilterCondition::Not(condition) => !Self::matches_condition(condition, locator, info),
        }
    }
}

impl Filter for FilterCondition {
    fn matches(&self, locator: &Locator, info: &ImageInfo) -> bool {
        Self::matches_condition(self, locator, info)
    }
}
