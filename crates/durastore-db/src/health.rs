//! Database health: the panic signal raised on unrecoverable failures.

use std::sync::Arc;

use durastore_storage::HealthCheck;
use parking_lot::RwLock;
use tracing::error;

use crate::error::CheckpointError;

/// Database-wide health signal.
///
/// A panic is terminal: once raised, the database refuses further writes
/// until restarted.
pub trait Health: HealthCheck {
    /// Fail if the database has panicked.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Panicked`] carrying the panic cause.
    fn assert_no_panic(&self) -> Result<(), CheckpointError>;

    /// Raise a panic. Only the first cause is kept.
    fn panic(&self, cause: CheckpointError);

    /// Cause of the panic, if any.
    fn cause(&self) -> Option<Arc<CheckpointError>>;
}

/// Default [`Health`] implementation.
#[derive(Debug, Default)]
pub struct DatabaseHealth {
    cause: RwLock<Option<Arc<CheckpointError>>>,
}

impl DatabaseHealth {
    /// A healthy database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl HealthCheck for DatabaseHealth {
    fn is_healthy(&self) -> bool {
        self.cause.read().is_none()
    }
}

impl Health for DatabaseHealth {
    fn assert_no_panic(&self) -> Result<(), CheckpointError> {
        match &*self.cause.read() {
            Some(cause) => Err(CheckpointError::Panicked(cause.to_string())),
            None => Ok(()),
        }
    }

    fn panic(&self, cause: CheckpointError) {
        let mut slot = self.cause.write();
        if let Some(existing) = &*slot {
            error!(error = %cause, first = %existing, "database panicked again");
            return;
        }
        error!(error = %cause, "database panicked");
        *slot = Some(Arc::new(cause));
    }

    fn cause(&self) -> Option<Arc<CheckpointError>> {
        self.cause.read().clone()
    }
}
