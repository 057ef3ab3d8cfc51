use super::{DestroyResult, LifecycleManager};
use crate::error::LibappcontainerError;
use crate::reclaim::ResourceKind;

impl LifecycleManager {
    /// Finishes every destroy that was interrupted or only partially
    /// succeeded, returning one result per container in `Destroying`.
    ///
    /// A container whose destroy fails hard is reported with a `record`
    /// error and the remaining containers are still recovered.
    pub fn recover(&self) -> Result<Vec<DestroyResult>, LibappcontainerError> {
        let pending: Vec<String> = self
            .store()
            .list()?
            .into_iter()
            .filter(|record| record.state().is_destroying())
            .map(|record| record.container_uuid)
            .collect();
        if pending.is_empty() {
            tracing::debug!("no interrupted destroys");
            return Ok(Vec::new());
        }

        tracing::info!(count = pending.len(), "resuming interrupted destroys");
        Ok(self.resume(pending))
    }

    fn resume(&self, pending: Vec<String>) -> Vec<DestroyResult> {
        let mut results = Vec::with_capacity(pending.len());
        for container_uuid in pending {
            let span = tracing::info_span!("recover", container_uuid = container_uuid.as_str());
            let _enter = span.enter();
            match self.destroy_container(&container_uuid, None) {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::error!(%err, "failed to resume destroy");
                    let mut result = DestroyResult::new(Some(&container_uuid), None);
                    result.fail(ResourceKind::Record, err);
                    result.succeeded = false;
                    results.push(result);
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use anyhow::Result;

    use crate::container::record::LifecycleState;
    use crate::container::{LifecycleManager, StateStore};
    use crate::host::test::TestHost;
    use crate::identity::IdentityHints;
    use crate::reclaim::ResourceKind;
    use crate::test_utils;

    fn manager_with(
        records: &[(&str, LifecycleState)],
    ) -> Result<(tempfile::TempDir, Arc<StateStore>, LifecycleManager)> {
        let tmp = tempfile::tempdir()?;
        let containers = tmp.path().join("containers");
        let store = Arc::new(StateStore::open(tmp.path().join("records"))?);
        let host = Arc::new(TestHost::default());
        for (i, (uuid, state)) in records.iter().enumerate() {
            let i = i as u32;
            let mut record = test_utils::running_container(
                uuid,
                1500 + i,
                4000 + i as i32,
                35531 + i as u16,
                &containers,
            );
            record.set_state(*state);
            test_utils::provision(&host, &record);
            test_utils::populate_root(record.filesystem_root())?;
            store.save(&record)?;
        }
        let manager = LifecycleManager::new(store.clone(), host, test_utils::fast_config())?;
        Ok((tmp, store, manager))
    }

    #[test]
    fn test_recover_only_touches_destroying() -> Result<()> {
        let (_tmp, store, manager) = manager_with(&[
            ("c-1", LifecycleState::Destroying),
            ("c-2", LifecycleState::Running),
        ])?;

        let results = manager.recover()?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].container_uuid.as_deref(), Some("c-1"));
        assert!(results[0].succeeded);
        assert!(results[0]
            .reclaimed_resources
            .contains(&ResourceKind::Filesystem));

        assert!(store.load("c-1")?.is_none());
        assert_eq!(
            store.load("c-2")?.map(|record| record.state()),
            Some(LifecycleState::Running)
        );
        assert!(manager.recover()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_corrupt_record_does_not_block_others() -> Result<()> {
        let (_tmp, store, manager) = manager_with(&[
            ("c-1", LifecycleState::Destroying),
            ("c-2", LifecycleState::Destroying),
            ("c-3", LifecycleState::Running),
        ])?;
        fs::write(store.record_path("c-2")?, "{truncated")?;

        let results = manager.recover()?;
        assert_eq!(results.len(), 1);
        assert!(results[0].succeeded);
        assert!(store.load("c-1")?.is_none());

        // resolution by name still works around the damaged record
        let identity = manager.resolve(&IdentityHints::by_name("c-3-app", Some("ns1")))?;
        assert_eq!(identity.container_uuid, "c-3");
        Ok(())
    }

    #[test]
    fn test_resume_continues_after_hard_failure() -> Result<()> {
        let (_tmp, store, manager) = manager_with(&[("c-1", LifecycleState::Destroying)])?;

        let results = manager.resume(vec!["../escape".to_owned(), "c-1".to_owned()]);
        assert_eq!(results.len(), 2);
        assert!(!results[0].succeeded);
        assert_eq!(results[0].errors[0].kind, ResourceKind::Record);
        assert!(results[1].succeeded, "{:?}", results[1].errors);
        assert!(store.load("c-1")?.is_none());
        Ok(())
    }
}
