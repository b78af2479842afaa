//! Protection groups and recovery plans

use super::account::AccountContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// How a protection group picks its resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResourceSelector {
    /// Fixed list of resource ids
    Explicit(BTreeSet<String>),
    /// Every source server carrying all of these tags, resolved at use time
    Tags(BTreeMap<String, String>),
}

impl ResourceSelector {
    /// Whether the selector can never match anything
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Explicit(ids) => ids.is_empty(),
            Self::Tags(tags) => tags.is_empty(),
        }
    }

    /// Whether a server with `tags` is selected; explicit selectors never match by tag
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Explicit(_) => false,
            Self::Tags(wanted) => wanted.iter().all(|(k, v)| tags.get(k) == Some(v)),
        }
    }
}

/// Named, reusable set of protected resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionGroup {
    /// Group ID
    pub id: Uuid,
    /// Group name
    pub name: String,
    /// Region the resources replicate into
    pub region: String,
    /// Account the resources live in; `None` for the orchestrator's own
    pub account: Option<AccountContext>,
    /// Resource selection
    pub selector: ResourceSelector,
    /// Optimistic-concurrency version, managed by the store
    pub version: u64,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl ProtectionGroup {
    /// Create new protection group
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        account: Option<AccountContext>,
        selector: ResourceSelector,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            region: region.into(),
            account,
            selector,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One wave of a recovery plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveDefinition {
    /// Position of the wave; waves run in index order
    pub wave_index: usize,
    /// Group recovered by this wave
    pub protection_group_id: Uuid,
    /// Require an operator resume before launching
    #[serde(default)]
    pub pause_before_wave: bool,
    /// Explicit predecessor waves
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl WaveDefinition {
    /// Wave with no pause and no explicit predecessors
    pub fn new(wave_index: usize, protection_group_id: Uuid) -> Self {
        Self {
            wave_index,
            protection_group_id,
            pause_before_wave: false,
            depends_on: Vec::new(),
        }
    }

    /// Builder: pause before this wave
    pub fn with_pause(mut self) -> Self {
        self.pause_before_wave = true;
        self
    }

    /// Builder: add explicit predecessors
    pub fn depending_on(mut self, predecessors: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(predecessors);
        self
    }
}

/// Ordered sequence of waves over protection groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Plan ID
    pub id: Uuid,
    /// Plan name
    pub name: String,
    /// Default account for groups that carry none
    pub account: Option<AccountContext>,
    /// Waves
    pub waves: Vec<WaveDefinition>,
    /// Optimistic-concurrency version, managed by the store
    pub version: u64,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl RecoveryPlan {
    /// Create new recovery plan
    pub fn new(
        name: impl Into<String>,
        account: Option<AccountContext>,
        waves: Vec<WaveDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            account,
            waves,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Groups referenced by any wave
    pub fn protection_group_ids(&self) -> BTreeSet<Uuid> {
        self.waves.iter().map(|w| w.protection_group_id).collect()
    }

    /// Whether any wave recovers `group_id`
    pub fn references_group(&self, group_id: Uuid) -> bool {
        self.waves.iter().any(|w| w.protection_group_id == group_id)
    }
}
