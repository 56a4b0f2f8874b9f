use std::sync::{Arc, Mutex, MutexGuard};

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

/// In-process slot allowing at most one active run.
#[derive(Clone, Default)]
pub struct RunSlot {
    active: Arc<Mutex<Option<String>>>,
}

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `run_id`, or fail with `AlreadyRunning` naming the
    /// run that holds it.
    pub fn acquire(&self, run_id: &str) -> DimloadResult<RunGuard> {
        let mut active = self.lock();
        if let Some(current) = active.as_ref() {
            return Err(Error::AlreadyRunning(current.clone()));
        }
        *active = Some(run_id.to_string());
        Ok(RunGuard { slot: self.clone(), run_id: run_id.to_string() })
    }

    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }
}

/// Releases the slot when dropped, including on panic or task abort.
pub struct RunGuard {
    slot: RunSlot,
    run_id: String,
}

impl RunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = self.slot.lock();
        if active.as_deref() == Some(self.run_id.as_str()) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_rejected_until_release() {
        let slot = RunSlot::new();
        let guard = slot.acquire("run-1").unwrap();
        assert_eq!(slot.current().as_deref(), Some("run-1"));

        match slot.acquire("run-2") {
            Err(Error::AlreadyRunning(id)) => assert_eq!(id, "run-1"),
            _ => panic!("expected AlreadyRunning"),
        }

        drop(guard);
        assert!(slot.current().is_none());
        assert!(slot.acquire("run-2").is_ok());
    }

    #[tokio::test]
    async fn guard_moves_into_spawned_task() {
        let slot = RunSlot::new();
        let guard = slot.acquire("run-async").unwrap();
        let handle = tokio::spawn(async move {
            assert_eq!(guard.run_id(), "run-async");
        });
        handle.await.unwrap();
        assert!(slot.current().is_none());
    }
}
