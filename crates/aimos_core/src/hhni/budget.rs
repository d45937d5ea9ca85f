//! Token budget packing (C10).
//!
//! # Invariants
//! - `total_tokens_used <= budget_limit` for every strategy.
//! - Candidates are ranked by relevance descending, then token count
//!   ascending; ties keep input order.
//! - Excluded items carry a reason; relevant exclusions are flagged in the
//!   audit trail.

use super::index::HierarchyLevel;
use crate::error::ErrorKind;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Excluded items at or above this relevance are flagged.
pub const HIGH_RELEVANCE_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    InvalidBudget(usize),
}

impl BudgetError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

impl Display for BudgetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBudget(value) => write!(f, "token budget must be positive, got {value}"),
        }
    }
}

impl Error for BudgetError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetItem {
    pub content: String,
    pub relevance_score: f64,
    pub token_count: usize,
    pub source_id: String,
    pub level: HierarchyLevel,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    #[default]
    Greedy,
    /// Reserved; runs greedy.
    Balanced,
    /// Reserved; runs greedy.
    Optimal,
}

impl BudgetStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greedy => "greedy",
            Self::Balanced => "balanced",
            Self::Optimal => "optimal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    Budget,
    InvalidTokens,
    BelowMinRelevance,
}

impl ExclusionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::InvalidTokens => "invalid tokens",
            Self::BelowMinRelevance => "below_min_relevance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedItem {
    pub item: BudgetItem,
    pub reason: ExclusionReason,
}

/// One decision recorded while shaping a context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub stage: String,
    pub message: String,
}

impl AuditEntry {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetResult {
    pub included: Vec<BudgetItem>,
    pub excluded: Vec<ExcludedItem>,
    pub total_tokens_used: usize,
    pub budget_limit: usize,
    /// Summed relevance per token used.
    pub efficiency: f64,
    pub audit_trail: Vec<AuditEntry>,
    pub strategy_used: BudgetStrategy,
}

impl BudgetResult {
    pub fn utilization(&self) -> f64 {
        self.total_tokens_used as f64 / self.budget_limit as f64
    }

    pub fn high_relevance_excluded(&self) -> usize {
        self.excluded
            .iter()
            .filter(|excluded| excluded.item.relevance_score >= HIGH_RELEVANCE_THRESHOLD)
            .count()
    }
}

pub fn optimize_for_budget(
    items: Vec<BudgetItem>,
    budget: usize,
    strategy: BudgetStrategy,
    min_relevance: f64,
) -> Result<BudgetResult, BudgetError> {
    if budget == 0 {
        return Err(BudgetError::InvalidBudget(budget));
    }
    let mut audit_trail = Vec::new();
    if strategy != BudgetStrategy::Greedy {
        warn!(
            "event=budget_optimize module=hhni status=fallback requested={} used=greedy",
            strategy.as_str()
        );
        audit_trail.push(AuditEntry::new(
            "budget",
            format!("strategy {} is not implemented; using greedy", strategy.as_str()),
        ));
    }

    let mut excluded = Vec::new();
    let mut candidates = Vec::with_capacity(items.len());
    for item in items {
        if item.relevance_score.is_finite() && item.relevance_score >= min_relevance {
            candidates.push(item);
        } else {
            excluded.push(ExcludedItem {
                item,
                reason: ExclusionReason::BelowMinRelevance,
            });
        }
    }
    candidates.sort_by(|left, right| {
        right
            .relevance_score
            .total_cmp(&left.relevance_score)
            .then(left.token_count.cmp(&right.token_count))
    });

    let mut included = Vec::new();
    let mut used = 0usize;
    for item in candidates {
        if item.token_count == 0 {
            excluded.push(ExcludedItem {
                item,
                reason: ExclusionReason::InvalidTokens,
            });
        } else if item.token_count <= budget - used {
            used += item.token_count;
            included.push(item);
        } else {
            excluded.push(ExcludedItem {
                item,
                reason: ExclusionReason::Budget,
            });
        }
    }

    for flagged in excluded
        .iter()
        .filter(|excluded| excluded.item.relevance_score >= HIGH_RELEVANCE_THRESHOLD)
    {
        audit_trail.push(AuditEntry::new(
            "budget",
            format!(
                "high-relevance item {} ({:.2}) excluded: {}",
                flagged.item.source_id,
                flagged.item.relevance_score,
                flagged.reason.as_str()
            ),
        ));
    }

    let relevance_sum: f64 = included.iter().map(|item| item.relevance_score).sum();
    let efficiency = if used == 0 {
        0.0
    } else {
        relevance_sum / used as f64
    };
    Ok(BudgetResult {
        included,
        excluded,
        total_tokens_used: used,
        budget_limit: budget,
        efficiency,
        audit_trail,
        strategy_used: BudgetStrategy::Greedy,
    })
}
