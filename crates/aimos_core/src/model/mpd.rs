//! BTSM node (MPD) and edge model.
//!
//! # Responsibility
//! - Describe governed workload nodes and the directed relations between them.
//! - Carry the bitemporal interval every row is versioned by.
//!
//! # Invariants
//! - `tt_start <= tt_end` and `vt_start <= vt_end` whenever the end is set.
//! - Lifecycle only moves forward: `draft -> active -> retired`.
//! - Edge identity is `(source_id, target_id, relation, tt_start)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const RELATION_DEPENDS_ON: &str = "depends_on";
pub const RELATION_MANAGER_OF: &str = "manager_of";

/// Which time axis a temporal query reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDimension {
    /// When the fact was recorded.
    Transaction,
    /// When the fact holds in the modeled world.
    #[default]
    Valid,
}

impl TimeDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Valid => "valid",
        }
    }
}

/// Transaction-time and valid-time interval of one row.
///
/// Both axes are half-open `[start, end)`; a missing end means still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitemporal {
    pub tt_start: DateTime<Utc>,
    #[serde(default)]
    pub tt_end: Option<DateTime<Utc>>,
    pub vt_start: DateTime<Utc>,
    #[serde(default)]
    pub vt_end: Option<DateTime<Utc>>,
}

impl Bitemporal {
    /// Interval recorded and valid from `at`, open on both axes.
    pub fn open_at(at: DateTime<Utc>) -> Self {
        Self {
            tt_start: at,
            tt_end: None,
            vt_start: at,
            vt_end: None,
        }
    }

    pub fn now() -> Self {
        Self::open_at(Utc::now())
    }

    pub fn start(&self, dimension: TimeDimension) -> DateTime<Utc> {
        match dimension {
            TimeDimension::Transaction => self.tt_start,
            TimeDimension::Valid => self.vt_start,
        }
    }

    pub fn end(&self, dimension: TimeDimension) -> Option<DateTime<Utc>> {
        match dimension {
            TimeDimension::Transaction => self.tt_end,
            TimeDimension::Valid => self.vt_end,
        }
    }

    /// `start <= at < end`, with an open end treated as +infinity.
    pub fn contains(&self, dimension: TimeDimension, at: DateTime<Utc>) -> bool {
        self.start(dimension) <= at && self.end(dimension).map_or(true, |end| at < end)
    }

    /// Overlap with the half-open window `[from, to)`.
    pub fn overlaps(&self, dimension: TimeDimension, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start(dimension) < to && self.end(dimension).map_or(true, |end| end > from)
    }

    /// Open on the valid-time axis.
    pub fn is_open(&self) -> bool {
        self.vt_end.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(tt_end) = self.tt_end {
            if tt_end < self.tt_start {
                return Err(format!(
                    "tt_end {tt_end} precedes tt_start {}",
                    self.tt_start
                ));
            }
        }
        if let Some(vt_end) = self.vt_end {
            if vt_end < self.vt_start {
                return Err(format!(
                    "vt_end {vt_end} precedes vt_start {}",
                    self.vt_start
                ));
            }
        }
        Ok(())
    }
}

/// Node lifecycle state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Draft,
    Active,
    Retired,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }

    /// Staying put or moving forward is allowed; moving back is not.
    pub fn can_transition_to(self, next: Self) -> bool {
        next >= self
    }
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named KPI with its target expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kpi {
    pub name: String,
    pub target: String,
}

/// Governed component/workload descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpdNode {
    pub mpd_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub manager_of: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
    #[serde(default)]
    pub budgets: Vec<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub kpis: Vec<Kpi>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub witness: Option<String>,
    /// Cap on open `depends_on` edges from this node; 0 means unlimited.
    #[serde(default)]
    pub max_dependency_degree: u32,
    #[serde(flatten)]
    pub interval: Bitemporal,
}

impl MpdNode {
    /// Draft node recorded and valid from now.
    pub fn new(mpd_id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            mpd_id: mpd_id.into(),
            node_type: node_type.into(),
            purpose: String::new(),
            capabilities: Vec::new(),
            interfaces: Vec::new(),
            manager_of: Vec::new(),
            depends_on: Vec::new(),
            policy_pack_ids: Vec::new(),
            budgets: Vec::new(),
            owners: Vec::new(),
            links: Vec::new(),
            kpis: Vec::new(),
            lifecycle: Lifecycle::Draft,
            witness: None,
            max_dependency_degree: 0,
            interval: Bitemporal::now(),
        }
    }

    pub fn with_policies<I, S>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy_pack_ids = policies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_max_dependency_degree(mut self, degree: u32) -> Self {
        self.max_dependency_degree = degree;
        self
    }

    pub fn with_interval(mut self, interval: Bitemporal) -> Self {
        self.interval = interval;
        self
    }
}

/// Directed relation label. Known relations get their own variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EdgeRelation {
    DependsOn,
    ManagerOf,
    Other(String),
}

impl EdgeRelation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DependsOn => RELATION_DEPENDS_ON,
            Self::ManagerOf => RELATION_MANAGER_OF,
            Self::Other(value) => value,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            RELATION_DEPENDS_ON => Self::DependsOn,
            RELATION_MANAGER_OF => Self::ManagerOf,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for EdgeRelation {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<EdgeRelation> for String {
    fn from(value: EdgeRelation) -> Self {
        value.as_str().to_string()
    }
}

impl Display for EdgeRelation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed, policy-carrying relation between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpdEdge {
    pub source_id: String,
    pub target_id: String,
    pub relation: EdgeRelation,
    #[serde(default)]
    pub policy_pack_ids: Vec<String>,
    #[serde(flatten)]
    pub interval: Bitemporal,
}

impl MpdEdge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: EdgeRelation,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation,
            policy_pack_ids: Vec::new(),
            interval: Bitemporal::now(),
        }
    }

    pub fn depends_on(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self::new(source_id, target_id, EdgeRelation::DependsOn)
    }

    pub fn with_policies<I, S>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy_pack_ids = policies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interval(mut self, interval: Bitemporal) -> Self {
        self.interval = interval;
        self
    }
}
