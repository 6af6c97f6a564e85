//! Capacity guard: plan-derived quota and concurrency checks run before a
//! build is admitted.
//!
//! The guard is read-only. Usage is incremented by the admission path only
//! after the build record has been written. Every store lookup runs under a
//! timeout and any failure denies the request (fail-closed).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::DbHandle;

/// Limits for one plan. `None` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanLimits {
    #[serde(default)]
    pub daily: Option<u32>,
    #[serde(default)]
    pub monthly: Option<u32>,
    pub concurrent: u32,
}

impl PlanLimits {
    pub const fn free() -> Self {
        Self {
            daily: Some(10),
            monthly: Some(100),
            concurrent: 3,
        }
    }

    pub const fn pro() -> Self {
        Self {
            daily: Some(100),
            monthly: Some(2000),
            concurrent: 10,
        }
    }

    pub const fn enterprise() -> Self {
        Self {
            daily: None,
            monthly: None,
            concurrent: 20,
        }
    }
}

pub const DEFAULT_PLAN: &str = "free";

/// Plan name to limits. Unknown plan names resolve to the free tier.
#[derive(Debug, Clone)]
pub struct PlanTable {
    plans: HashMap<String, PlanLimits>,
}

impl Default for PlanTable {
    fn default() -> Self {
        let mut plans = HashMap::new();
        plans.insert("free".to_string(), PlanLimits::free());
        plans.insert("pro".to_string(), PlanLimits::pro());
        plans.insert("enterprise".to_string(), PlanLimits::enterprise());
        Self { plans }
    }
}

impl PlanTable {
    /// Defaults overlaid with configured plans.
    pub fn with_overrides(overrides: &HashMap<String, PlanLimits>) -> Self {
        let mut table = Self::default();
        for (name, limits) in overrides {
            table.plans.insert(name.to_lowercase(), *limits);
        }
        table
    }

    pub fn limits(&self, plan: &str) -> PlanLimits {
        self.plans
            .get(&plan.to_lowercase())
            .or_else(|| self.plans.get(DEFAULT_PLAN))
            .copied()
            .unwrap_or(PlanLimits::free())
    }

    pub fn contains(&self, plan: &str) -> bool {
        self.plans.contains_key(&plan.to_lowercase())
    }

    /// A plan is top tier when no other plan allows more concurrent builds.
    pub fn is_top_tier(&self, plan: &str) -> bool {
        let limits = self.limits(plan);
        self.plans
            .values()
            .all(|other| other.concurrent <= limits.concurrent)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plans.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    DailyQuotaExceeded { used: u32, limit: u32 },
    MonthlyQuotaExceeded { used: u32, limit: u32 },
    ConcurrencyLimit { active: u32, limit: u32 },
    StoreUnavailable { detail: String },
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::DailyQuotaExceeded { .. } => "daily_quota_exceeded",
            DenyReason::MonthlyQuotaExceeded { .. } => "monthly_quota_exceeded",
            DenyReason::ConcurrencyLimit { .. } => "concurrency_limit",
            DenyReason::StoreUnavailable { .. } => "capacity_store_unavailable",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::DailyQuotaExceeded { used, limit } => {
                write!(f, "daily build quota exhausted ({}/{})", used, limit)
            }
            DenyReason::MonthlyQuotaExceeded { used, limit } => {
                write!(f, "monthly build quota exhausted ({}/{})", used, limit)
            }
            DenyReason::ConcurrencyLimit { active, limit } => {
                write!(f, "{} of {} concurrent builds already running", active, limit)
            }
            DenyReason::StoreUnavailable { detail } => {
                write!(f, "capacity store unavailable: {}", detail)
            }
        }
    }
}

/// Capacity left after an allowed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    pub plan: String,
    pub remaining_today: Option<u32>,
    pub remaining_this_month: Option<u32>,
    pub active_builds: u32,
    pub concurrent_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityDecision {
    Allow(CapacitySnapshot),
    Deny { reason: DenyReason, upgrade: bool },
}

impl CapacityDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CapacityDecision::Allow(_))
    }
}

/// Backing store for plan assignments, usage counters and active builds.
#[async_trait]
pub trait CapacityStore: Send + Sync {
    async fn plan_for(&self, user_id: &str) -> Result<Option<String>>;
    /// `(today, this_month)` build counts.
    async fn usage(&self, user_id: &str, day: &str, month: &str) -> Result<(u32, u32)>;
    async fn active_builds(&self, user_id: &str) -> Result<u32>;
    async fn record_usage(&self, user_id: &str, day: &str) -> Result<()>;
}

#[async_trait]
impl CapacityStore for DbHandle {
    async fn plan_for(&self, user_id: &str) -> Result<Option<String>> {
        let user_id = user_id.to_string();
        self.call(move |db| db.get_user_plan(&user_id)).await
    }

    async fn usage(&self, user_id: &str, day: &str, month: &str) -> Result<(u32, u32)> {
        let (user_id, day, month) = (user_id.to_string(), day.to_string(), month.to_string());
        self.call(move |db| db.usage_counts(&user_id, &day, &month))
            .await
    }

    async fn active_builds(&self, user_id: &str) -> Result<u32> {
        let user_id = user_id.to_string();
        self.call(move |db| db.active_build_count(&user_id)).await
    }

    async fn record_usage(&self, user_id: &str, day: &str) -> Result<()> {
        let (user_id, day) = (user_id.to_string(), day.to_string());
        self.call(move |db| db.increment_usage(&user_id, &day)).await
    }
}

pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

#[derive(Clone)]
pub struct CapacityGuard {
    store: Arc<dyn CapacityStore>,
    plans: PlanTable,
    timeout: Duration,
}

impl CapacityGuard {
    pub fn new(store: Arc<dyn CapacityStore>, plans: PlanTable, timeout: Duration) -> Self {
        Self {
            store,
            plans,
            timeout,
        }
    }

    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    pub async fn check(&self, user_id: &str) -> CapacityDecision {
        self.check_at(user_id, Utc::now()).await
    }

    pub async fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> CapacityDecision {
        let plan = match self.bounded(self.store.plan_for(user_id)).await {
            Ok(plan) => plan.unwrap_or_else(|| DEFAULT_PLAN.to_string()),
            Err(detail) => return self.unavailable(user_id, detail),
        };
        let limits = self.plans.limits(&plan);
        let upgrade = !self.plans.is_top_tier(&plan);

        let (today, month) = match self
            .bounded(self.store.usage(user_id, &day_key(now), &month_key(now)))
            .await
        {
            Ok(counts) => counts,
            Err(detail) => return self.unavailable(user_id, detail),
        };
        if let Some(limit) = limits.daily.filter(|limit| today >= *limit) {
            return CapacityDecision::Deny {
                reason: DenyReason::DailyQuotaExceeded { used: today, limit },
                upgrade,
            };
        }
        if let Some(limit) = limits.monthly.filter(|limit| month >= *limit) {
            return CapacityDecision::Deny {
                reason: DenyReason::MonthlyQuotaExceeded { used: month, limit },
                upgrade,
            };
        }

        let active = match self.bounded(self.store.active_builds(user_id)).await {
            Ok(active) => active,
            Err(detail) => return self.unavailable(user_id, detail),
        };
        if active >= limits.concurrent {
            return CapacityDecision::Deny {
                reason: DenyReason::ConcurrencyLimit {
                    active,
                    limit: limits.concurrent,
                },
                upgrade,
            };
        }

        CapacityDecision::Allow(CapacitySnapshot {
            plan,
            remaining_today: limits.daily.map(|l| l.saturating_sub(today)),
            remaining_this_month: limits.monthly.map(|l| l.saturating_sub(month)),
            active_builds: active,
            concurrent_limit: limits.concurrent,
        })
    }

    /// Count one admitted build against today's quota.
    pub async fn record_usage(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.store.record_usage(user_id, &day_key(now)).await
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> std::result::Result<T, String> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {}ms", self.timeout.as_millis())),
        }
    }

    fn unavailable(&self, user_id: &str, detail: String) -> CapacityDecision {
        warn!(user_id, %detail, "Capacity store unavailable, denying admission");
        CapacityDecision::Deny {
            reason: DenyReason::StoreUnavailable { detail },
            upgrade: false,
        }
    }
}
