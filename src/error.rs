//! Error taxonomy for the reconciler.
//!
//! Almost nothing here reaches the host: scans and flushes absorb these
//! conditions, log them, and count them. The variants exist so the absorbing
//! code can say precisely what it absorbed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A schema or capability the operation depends on is not registered
    /// yet. Retried on the next cycle.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// The owning execution context rejected the task (shut down).
    #[error("owning execution context is unavailable")]
    ContextUnavailable,

    /// Guard-store work was requested from outside the owning context.
    #[error("guard store access attempted off the owning context")]
    OffContext,

    /// A host store call failed.
    #[error("host store error: {0}")]
    Host(#[from] anyhow::Error),

    /// A flush or bootstrap task panicked and was caught at its boundary.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Extract a printable message from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
