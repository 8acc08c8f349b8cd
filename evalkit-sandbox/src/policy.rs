//! Security policies applied to isolates and fallback execution

use crate::limits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Trust level of the code being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Completely untrusted (user-provided, unknown source)
    Untrusted,
    /// Reviewed or generated by a known pipeline
    Verified,
    /// First-party code
    Trusted,
}

/// Outbound network access posture
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPosture {
    /// Every fetch fails
    Blocked,
    /// Only these domains (and their subdomains) are reachable
    AllowListed(Vec<String>),
    #[default]
    Unrestricted,
}

impl NetworkPosture {
    /// Check whether a URL may be fetched under this posture
    pub fn allows(&self, raw_url: &str) -> bool {
        match self {
            NetworkPosture::Blocked => false,
            NetworkPosture::Unrestricted => true,
            NetworkPosture::AllowListed(domains) => {
                let host = match url::Url::parse(raw_url)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
                {
                    Some(host) => host,
                    None => return false,
                };
                domains.iter().any(|domain| host_matches(&host, domain))
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, NetworkPosture::Blocked)
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain
        .trim()
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
}

/// Security policy for one evaluation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// CPU-time budget in milliseconds (None = platform default)
    #[serde(default)]
    pub cpu_budget_ms: Option<u64>,

    /// Memory budget in megabytes (None = platform default)
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,

    /// Network posture enforced by the installed fetch binding
    #[serde(default)]
    pub network: NetworkPosture,

    /// If set, only these binding names are injected
    #[serde(default)]
    pub bindings_allow_list: Option<BTreeSet<String>>,
}

impl SecurityPolicy {
    /// Blocked network and strict budgets
    pub fn strict() -> Self {
        Self::for_trust(TrustLevel::Untrusted)
    }

    /// Default policy for a trust level
    pub fn for_trust(trust_level: TrustLevel) -> Self {
        let (limits, network) = match trust_level {
            TrustLevel::Untrusted => (ResourceLimits::strict(), NetworkPosture::Blocked),
            TrustLevel::Verified => (ResourceLimits::unlimited(), NetworkPosture::Blocked),
            TrustLevel::Trusted => (ResourceLimits::permissive(), NetworkPosture::Unrestricted),
        };
        Self {
            cpu_budget_ms: limits.cpu_budget_ms,
            memory_budget_mb: limits.memory_budget_mb,
            network,
            bindings_allow_list: None,
        }
    }

    pub fn with_network(mut self, network: NetworkPosture) -> Self {
        self.network = network;
        self
    }

    pub fn with_cpu_budget_ms(mut self, cpu_budget_ms: u64) -> Self {
        self.cpu_budget_ms = Some(cpu_budget_ms);
        self
    }

    pub fn with_memory_budget_mb(mut self, memory_budget_mb: u64) -> Self {
        self.memory_budget_mb = Some(memory_budget_mb);
        self
    }

    /// Restrict injected bindings to these names
    pub fn with_bindings_allow_list<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bindings_allow_list = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Platform limit fields for this policy
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_budget_ms: self.cpu_budget_ms,
            memory_budget_mb: self.memory_budget_mb,
        }
    }

    /// Check whether a binding name passes the allow-list
    pub fn allows_binding(&self, name: &str) -> bool {
        self.bindings_allow_list
            .as_ref()
            .map(|allowed| allowed.contains(name))
            .unwrap_or(true)
    }
}
