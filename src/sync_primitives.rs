//! The public, standalone mutex/condvar API, for callers who want bare
//! mutual exclusion without a [`crate::monitor::Monitor`]'s state
//! replication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::cv_engine::CvEngine;
use crate::error::{Error, Result};
use crate::mutex_engine::MutexEngine;

/// A named distributed mutex. Non-reentrant: calling [`DistributedMutex::lock`]
/// while already holding it is unspecified (the underlying protocol has no
/// notion of re-entry).
///
/// `local_entry` guards only against two local threads both being mid-way
/// through the engine's `acquire` protocol for this name at once (their
/// `MUTEX_AGREEMENT` subscriptions would otherwise both match the same
/// incoming packets and double-count agreements meant for only one of
/// them) -- the same single-engine-wide-mutex decision [`crate::monitor::Monitor`]
/// applies via its own `local_entry`.
pub struct DistributedMutex {
    name: String,
    engine: Arc<MutexEngine>,
    owned: AtomicBool,
    local_entry: StdMutex<()>,
}

impl DistributedMutex {
    pub fn new(name: impl Into<String>, engine: Arc<MutexEngine>) -> Self {
        let name = name.into();
        engine.register(&name);
        Self {
            name,
            engine,
            owned: AtomicBool::new(false),
            local_entry: StdMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until this process holds the lock.
    pub fn lock(&self) -> Result<()> {
        let _local_guard = self.local_entry.lock().expect("distributed mutex local-entry mutex poisoned");
        self.engine.acquire(&self.name)?;
        self.owned.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Acquire without blocking on a concurrent local holder: if another
    /// local thread is already inside `lock`/`try_lock` for this name, or
    /// this instance already believes it holds the lock, returns `Ok(false)`
    /// immediately. Otherwise behaves like `lock` and returns `Ok(true)`.
    ///
    /// There is no way to poll the distributed protocol itself without
    /// blocking for every other peer's agreement, so a successful
    /// `try_lock` still waits on that round trip -- it only short-circuits
    /// the purely local cases where we already know we won't proceed.
    pub fn try_lock(&self) -> Result<bool> {
        if self.is_owned() {
            return Ok(false);
        }
        let Ok(_local_guard) = self.local_entry.try_lock() else {
            return Ok(false);
        };
        self.engine.acquire(&self.name)?;
        self.owned.store(true, Ordering::SeqCst);
        Ok(true)
    }

    pub fn unlock(&self) -> Result<()> {
        self.owned.store(false, Ordering::SeqCst);
        self.engine.release(&self.name)
    }

    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::SeqCst)
    }
}

impl Drop for DistributedMutex {
    fn drop(&mut self) {
        self.engine.unregister(&self.name);
    }
}

/// A named distributed condition variable, used together with a
/// [`DistributedMutex`] the caller already holds.
pub struct DistributedConditionVariable {
    name: String,
    engine: Arc<CvEngine>,
}

impl DistributedConditionVariable {
    pub fn new(name: impl Into<String>, engine: Arc<CvEngine>) -> Self {
        let name = name.into();
        engine.register(&name);
        Self { name, engine }
    }

    /// `mutex` must already be held, or this returns
    /// [`Error::Misuse`]. On return, `mutex` is held again.
    pub fn wait(
        &self,
        mutex: &DistributedMutex,
        mutex_engine: &MutexEngine,
        predicate: impl FnMut() -> bool,
    ) -> Result<()> {
        if !mutex.is_owned() {
            return Err(Error::misuse(format!(
                "wait({:?}) called without holding mutex {:?}",
                self.name,
                mutex.name()
            )));
        }
        mutex.owned.store(false, Ordering::SeqCst);
        let result = self.engine.wait(&self.name, mutex.name(), mutex_engine, predicate);
        mutex.owned.store(true, Ordering::SeqCst);
        result
    }

    pub fn notify_one(&self) -> Result<()> {
        self.engine.notify_one(&self.name)
    }

    pub fn notify_all(&self) -> Result<()> {
        self.engine.notify_all(&self.name)
    }
}

impl Drop for DistributedConditionVariable {
    fn drop(&mut self) {
        self.engine.unregister(&self.name);
    }
}
