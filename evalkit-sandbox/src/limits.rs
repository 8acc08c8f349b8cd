//! Resource limits for isolates and fallback execution

use boa_engine::vm::RuntimeLimits;
use serde::{Deserialize, Serialize};

/// Loop iterations granted per millisecond of CPU budget.
///
/// The interpreter has no CPU clock hook, so the budget is enforced as a
/// loop-iteration ceiling.
pub const ITERATIONS_PER_CPU_MS: u64 = 20_000;

/// Call depth ceiling applied to every interpreter context
pub const RECURSION_LIMIT: usize = 512;

/// Resource limits for one isolated unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU-time budget in milliseconds (None = platform default)
    #[serde(default)]
    pub cpu_budget_ms: Option<u64>,

    /// Memory budget in megabytes (None = platform default)
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,
}

impl ResourceLimits {
    /// Platform defaults for everything
    pub fn unlimited() -> Self {
        Self {
            cpu_budget_ms: None,
            memory_budget_mb: None,
        }
    }

    /// Create strict limits for untrusted code
    pub fn strict() -> Self {
        Self {
            cpu_budget_ms: Some(1_000),
            memory_budget_mb: Some(16),
        }
    }

    /// Create permissive limits for trusted code
    pub fn permissive() -> Self {
        Self {
            cpu_budget_ms: Some(60_000),
            memory_budget_mb: Some(256),
        }
    }

    /// Interpreter limits for these budgets
    pub fn runtime_limits(&self) -> RuntimeLimits {
        let mut limits = RuntimeLimits::default();
        limits.set_recursion_limit(RECURSION_LIMIT);
        if let Some(cpu_ms) = self.cpu_budget_ms {
            limits.set_loop_iteration_limit(cpu_ms.saturating_mul(ITERATIONS_PER_CPU_MS));
        }
        limits
    }

    /// Whether a memory budget was requested that the interpreter cannot enforce
    pub fn has_advisory_memory_budget(&self) -> bool {
        self.memory_budget_mb.is_some()
    }
}
