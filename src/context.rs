use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ResticConfig;

/// Per-call state handed to the provider: the optional resource-policy
/// overlay and a cancellation flag shared with whoever started the call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    policy: Option<ResticConfig>,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: ResticConfig) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn policy(&self) -> Option<&ResticConfig> {
        self.policy.as_ref()
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
