//! # Hangouts Memory
//!
//! Session-scoped persistence for alarms, events, interactions and user context.
//! Each operation opens its own session; nothing is visible until `commit`.

pub mod history;
pub mod memory;
pub mod sqlite;

pub use memory::MemorySessionFactory;
pub use sqlite::SqliteSessionFactory;

use std::sync::Arc;

use hangouts_core::config::DatabaseConfig;
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::SessionFactory;

/// Create a session factory from configuration.
pub fn create_session_factory(config: &DatabaseConfig) -> Result<Arc<dyn SessionFactory>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteSessionFactory::open(&config.resolved_path())?)),
        "memory" => Ok(Arc::new(MemorySessionFactory::new())),
        other => Err(HangoutsError::Config(format!("Unknown database backend: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backends() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = DatabaseConfig {
            backend: "sqlite".into(),
            path: dir.path().join("h.db").to_string_lossy().into_owned(),
        };
        assert_eq!(create_session_factory(&sqlite).unwrap().name(), "sqlite");

        let memory = DatabaseConfig { backend: "memory".into(), ..Default::default() };
        assert_eq!(create_session_factory(&memory).unwrap().name(), "memory");

        let bogus = DatabaseConfig { backend: "redis".into(), ..Default::default() };
        assert!(matches!(create_session_factory(&bogus), Err(HangoutsError::Config(_))));
    }
}
