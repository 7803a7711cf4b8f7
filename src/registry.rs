//! Process-wide owner of the storage manager

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::StorageConfig;
use crate::manager::StorageManager;
use crate::{Error, Result};

/// Holds the one [`StorageManager`] of the process.
///
/// Created by the startup routine and passed by reference to whoever needs
/// storage. The first [`get_or_create`](Self::get_or_create) decides the
/// configuration; asking again with a different one is an error.
#[derive(Default)]
pub struct StorageRegistry(RwLock<Option<Arc<StorageManager>>>);

impl StorageRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// The live manager, creating and initializing it on first use.
   pub async fn get_or_create(&self, config: StorageConfig) -> Result<Arc<StorageManager>> {
      if let Some(manager) = self.0.read().await.as_ref() {
         return ensure_same_config(manager, &config);
      }

      let mut slot = self.0.write().await;

      // Another caller may have created it while we waited for the write lock
      if let Some(manager) = slot.as_ref() {
         return ensure_same_config(manager, &config);
      }

      let manager = Arc::new(StorageManager::new(config)?);
      manager.initialize().await?;
      *slot = Some(Arc::clone(&manager));

      debug!(path = %manager.config().path.display(), "Storage instance created");
      Ok(manager)
   }

   /// The live manager, if one has been created.
   pub async fn get(&self) -> Option<Arc<StorageManager>> {
      self.0.read().await.clone()
   }

   /// Close the live manager and forget it.
   pub async fn shutdown(&self) -> Result<()> {
      let manager = self.0.write().await.take();
      match manager {
         Some(manager) => manager.close().await,
         None => Ok(()),
      }
   }

   /// Close and forget the live manager so the next `get_or_create` builds a
   /// fresh one. Only allowed for test-mode instances.
   #[cfg(any(test, feature = "test-util"))]
   pub async fn reset_instance(&self) -> Result<()> {
      let mut slot = self.0.write().await;

      if let Some(manager) = slot.as_ref()
         && !manager.config().test_mode
      {
         return Err(Error::TestModeRequired("reset_instance"));
      }

      if let Some(manager) = slot.take() {
         manager.close().await?;
         debug!("Storage instance reset");
      }
      Ok(())
   }
}

fn ensure_same_config(
   manager: &Arc<StorageManager>,
   requested: &StorageConfig,
) -> Result<Arc<StorageManager>> {
   if manager.config() != &requested.resolved() {
      return Err(Error::ConfigurationMismatch {
         existing: manager.config().path.clone(),
      });
   }
   Ok(Arc::clone(manager))
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::time::Duration;
   use tempfile::TempDir;

   #[tokio::test]
   async fn test_get_or_create_returns_same_instance() {
      let temp = TempDir::new().unwrap();
      let registry = StorageRegistry::new();
      let config = StorageConfig::for_tests(temp.path().join("app.db"));

      let first = registry.get_or_create(config.clone()).await.unwrap();
      let second = registry.get_or_create(config).await.unwrap();

      assert!(Arc::ptr_eq(&first, &second));
      assert!(first.is_ready());

      registry.shutdown().await.unwrap();
      assert!(!first.is_ready());
      assert!(registry.get().await.is_none());
   }

   #[tokio::test]
   async fn test_different_config_is_rejected() {
      let temp = TempDir::new().unwrap();
      let registry = StorageRegistry::new();
      let config = StorageConfig::for_tests(temp.path().join("app.db"));

      registry.get_or_create(config.clone()).await.unwrap();

      let err = registry
         .get_or_create(StorageConfig {
            operation_timeout: Duration::from_millis(100),
            ..config
         })
         .await
         .err()
         .unwrap();
      assert_eq!(err.error_code(), "CONFIGURATION_MISMATCH");

      registry.shutdown().await.unwrap();
   }

   #[tokio::test]
   async fn test_reset_instance_builds_fresh_manager() {
      let temp = TempDir::new().unwrap();
      let registry = StorageRegistry::new();
      let config = StorageConfig::for_tests(temp.path().join("app.db"));

      let first = registry.get_or_create(config.clone()).await.unwrap();
      let statement = first.get_statement("SELECT 1").await.unwrap();

      registry.reset_instance().await.unwrap();
      assert!(!first.is_ready());

      let second = registry.get_or_create(config).await.unwrap();
      assert!(!Arc::ptr_eq(&first, &second));
      assert!(second.check_health().await);

      // Handles from the old connection are not reused
      let fresh = second.get_statement("SELECT 1").await.unwrap();
      assert!(!Arc::ptr_eq(&statement, &fresh));

      registry.shutdown().await.unwrap();
   }

   #[tokio::test]
   async fn test_reset_instance_requires_test_mode() {
      let temp = TempDir::new().unwrap();
      let registry = StorageRegistry::new();

      registry
         .get_or_create(StorageConfig::new(temp.path().join("app.db")))
         .await
         .unwrap();

      let err = registry.reset_instance().await.unwrap_err();
      assert_eq!(err.error_code(), "TEST_MODE_REQUIRED");

      registry.shutdown().await.unwrap();
   }
}
