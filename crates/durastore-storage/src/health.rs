//! Health signal consulted before durable writes.

/// Read side of the database health signal.
///
/// Once a database has panicked, nothing more may be written to its logs.
pub trait HealthCheck: Send + Sync {
    /// Returns `false` once the database has panicked.
    fn is_healthy(&self) -> bool;
}
