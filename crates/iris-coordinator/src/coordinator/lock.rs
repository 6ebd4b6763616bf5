use crate::backend::LockBehaviour;
use crate::error::Result;

/// A non-blocking distributed lock.
///
/// Acquire fails immediately (rather than blocking) if the lock is already held, including by
/// this same node. Only a held lock can be released.
pub struct NonBlockingLock(Box<dyn LockBehaviour>);

impl NonBlockingLock {
    pub(crate) fn new(behaviour: Box<dyn LockBehaviour>) -> NonBlockingLock {
        NonBlockingLock(behaviour)
    }

    pub async fn acquire(&self) -> Result<()> {
        self.0.acquire().await
    }

    /// Best-effort liveness check; does not itself attempt to acquire or release.
    pub fn check(&self) -> bool {
        self.0.check()
    }

    pub async fn release(&self) -> Result<()> {
        self.0.release().await
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::mock::MockBackend;
    use crate::backend::Backend;
    use crate::NodeId;

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let backend = MockBackend::new(NodeId::new());
        let lock = crate::coordinator::NonBlockingLock::new(backend.lock("/locks/test"));
        assert!(!lock.check());
        lock.acquire().await.expect("acquire");
        assert!(lock.check());
        lock.release().await.expect("release");
        assert!(!lock.check());
    }

    #[tokio::test]
    async fn acquire_when_already_locked_fails() {
        let backend = MockBackend::new(NodeId::new());
        let first = crate::coordinator::NonBlockingLock::new(backend.lock("/locks/test"));
        let second = crate::coordinator::NonBlockingLock::new(backend.lock("/locks/test"));
        first.acquire().await.expect("first acquire");
        assert!(second.acquire().await.is_err());
    }

    #[tokio::test]
    async fn release_when_not_held_fails() {
        let backend = MockBackend::new(NodeId::new());
        let lock = crate::coordinator::NonBlockingLock::new(backend.lock("/locks/test"));
        assert!(lock.release().await.is_err());
    }
}
