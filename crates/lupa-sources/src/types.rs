use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Administrative family a source belongs to.
pub enum SourceFamily {
    Federal,
    State,
    Portal,
    Tce,
}

impl SourceFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Federal => "federal",
            Self::State => "state",
            Self::Portal => "portal",
            Self::Tce => "tce",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Class of data a source advertises.
pub enum Capability {
    Contracts,
    Servants,
    Expenses,
    Biddings,
    Geographic,
    HealthData,
    EducationData,
    Sanctions,
    Agreements,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contracts => "contracts",
            Self::Servants => "servants",
            Self::Expenses => "expenses",
            Self::Biddings => "biddings",
            Self::Geographic => "geographic",
            Self::HealthData => "health_data",
            Self::EducationData => "education_data",
            Self::Sanctions => "sanctions",
            Self::Agreements => "agreements",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Immutable configuration for one declared source. Health lives in the
/// registry, not here.
pub struct Source {
    pub id: String,
    pub family: SourceFamily,
    pub capabilities: BTreeSet<Capability>,
    pub base_endpoint: String,
    /// Lower is preferred. Ties resolve by lexicographic id for
    /// reproducible traces.
    pub priority: u32,
    /// Two-letter state code for regional sources, empty for national ones.
    #[serde(default)]
    pub region: String,
}

impl Source {
    pub fn advertises(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Constraints narrowing a capability resolution.
pub struct SourceFilters {
    #[serde(default)]
    pub families: Vec<SourceFamily>,
    #[serde(default)]
    pub region: Option<String>,
}

impl SourceFilters {
    pub fn matches(&self, source: &Source) -> bool {
        if !self.families.is_empty() && !self.families.contains(&source.family) {
            return false;
        }
        if let Some(region) = self.region.as_deref() {
            // National sources always satisfy a regional constraint.
            if !source.region.is_empty() && !source.region.eq_ignore_ascii_case(region) {
                return false;
            }
        }
        true
    }
}
