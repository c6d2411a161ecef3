use crate::document::DocumentId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Single-flight guard per document.
///
/// Whoever holds the guard is the only task allowed to change the document
/// or talk to the SRI about it.
#[derive(Debug, Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the document's lock, or `None` if another task holds it.
    pub fn try_acquire(&self, id: DocumentId) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }

    pub fn is_locked(&self, id: DocumentId) -> bool {
        self.locks
            .lock()
            .get(&id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = DocumentLocks::new();
        let id = DocumentId::new();
        let guard = locks.try_acquire(id).unwrap();
        assert!(locks.try_acquire(id).is_none());
        assert!(locks.is_locked(id));
        assert!(locks.try_acquire(DocumentId::new()).is_some());
        drop(guard);
        assert!(!locks.is_locked(id));
        assert!(locks.try_acquire(id).is_some());
    }
}
