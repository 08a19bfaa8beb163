//! Handle to the external evaluation engine.
//!
//! The daemon never evaluates build sources itself. Whoever embeds the
//! server supplies two callbacks: one executing a parsed invocation, one
//! resolving a variable name. The handle is cheap to clone and crosses
//! into protocol handlers freely.

use std::fmt;
use std::sync::Arc;

use kiln_eval::{ExecutionStatus, Invocation};

type Executor = dyn Fn(&Invocation) -> ExecutionStatus + Send + Sync;
type Resolver = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Shared pair of engine callbacks.
#[derive(Clone)]
pub struct EngineHandle {
    executor: Arc<Executor>,
    resolver: Arc<Resolver>,
}

impl EngineHandle {
    /// Wraps the engine callbacks.
    pub fn new(
        executor: impl Fn(&Invocation) -> ExecutionStatus + Send + Sync + 'static,
        resolver: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            resolver: Arc::new(resolver),
        }
    }

    /// Forwards one invocation to the engine.
    #[must_use]
    pub fn execute(&self, invocation: &Invocation) -> ExecutionStatus {
        (self.executor)(invocation)
    }

    /// Looks a variable up through the engine.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<String> {
        (self.resolver)(name)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}
