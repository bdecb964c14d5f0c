//! Per-account locks.
//!
//! A merge or replay is a read-modify-write over one account's rows; the
//! server holds that account's lock for the whole batch so concurrent rounds
//! for the same account cannot interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::sync::SyncError;

#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `account`; the same handle is returned for every call.
    pub fn handle(&self, account: Uuid) -> Result<Arc<Mutex<()>>, SyncError> {
        let mut locks = self.locks.lock().map_err(|_| SyncError::LockPoisoned)?;
        Ok(locks.entry(account).or_default().clone())
    }

    /// Run `f` while holding `account`'s lock.
    pub fn with_lock<T>(
        &self,
        account: Uuid,
        f: impl FnOnce() -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let handle = self.handle(account)?;
        let result = {
            let _guard = handle.lock().map_err(|_| SyncError::LockPoisoned)?;
            f()
        };
        drop(handle);
        self.release(account)?;
        result
    }

    /// Forget `account`'s entry once nobody outside the map holds it.
    fn release(&self, account: Uuid) -> Result<(), SyncError> {
        let mut locks = self.locks.lock().map_err(|_| SyncError::LockPoisoned)?;
        if locks
            .get(&account)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&account);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
