//! Plan-based gating of live connections.
//!
//! Callers whose plan does not include real-time streaming never open a
//! socket; they are expected to poll the equivalent REST endpoints instead.

use serde::{Deserialize, Serialize};

/// Feature flag that grants streaming regardless of plan tier.
pub const REALTIME_FEATURE: &str = "realtime";

/// Subscription tier, ordered from least to most capable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    /// No paid plan.
    #[default]
    Free,
    /// Entry paid plan.
    Starter,
    /// Professional plan.
    Pro,
    /// Enterprise plan.
    Enterprise,
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan tier: {other}")),
        }
    }
}

/// What the REST backend reports about the caller's plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Current plan.
    pub plan: PlanTier,
    /// Extra feature flags granted on top of the plan.
    #[serde(default)]
    pub features: Vec<String>,
}

impl Entitlement {
    /// Entitlement for a plan with no extra features.
    #[must_use]
    pub const fn for_plan(plan: PlanTier) -> Self {
        Self {
            plan,
            features: Vec::new(),
        }
    }

    /// Add a feature flag.
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    /// Whether a feature flag is present.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Decides whether a caller may hold a live connection.
///
/// Implementations must be pure: the same entitlement always yields the same answer.
pub trait AccessGate: Send + Sync {
    /// Whether live streaming is permitted.
    fn has_access(&self, entitlement: &Entitlement) -> bool;
}

impl<F> AccessGate for F
where
    F: Fn(&Entitlement) -> bool + Send + Sync,
{
    fn has_access(&self, entitlement: &Entitlement) -> bool {
        self(entitlement)
    }
}

/// Grants access at or above a minimum tier, or with the realtime feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanGate {
    minimum: PlanTier,
}

impl Default for PlanGate {
    fn default() -> Self {
        Self {
            minimum: PlanTier::Pro,
        }
    }
}

impl PlanGate {
    /// Gate requiring at least `minimum`.
    #[must_use]
    pub const fn new(minimum: PlanTier) -> Self {
        Self { minimum }
    }

    /// Minimum tier.
    #[must_use]
    pub const fn minimum(&self) -> PlanTier {
        self.minimum
    }
}

impl AccessGate for PlanGate {
    fn has_access(&self, entitlement: &Entitlement) -> bool {
        entitlement.plan >= self.minimum || entitlement.has_feature(REALTIME_FEATURE)
    }
}

/// Gate that admits everyone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenGate;

impl AccessGate for OpenGate {
    fn has_access(&self, _entitlement: &Entitlement) -> bool {
        true
    }
}
