//! The [`Monitor`]: a named mutex bound to user-supplied state, replicated
//! to the next holder via a `SYNC` broadcast sent just before release.
//!
//! Relies on the channel's FIFO guarantee: every peer sees our `SYNC`
//! strictly before the `MUTEX_AGREEMENT` that lets it enter next, so
//! whoever enters next has already applied our `restore_state` by the time
//! their body runs.

use std::sync::{Arc, Mutex as StdMutex};

use log::debug;

use crate::channel::Channel;
use crate::cv_engine::CvEngine;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::mutex_engine::MutexEngine;
use crate::packet::{frame_sync_payload, unframe_sync_payload, MessageType};

const MAX_NAME_LEN: usize = 255;

type SaveState = dyn Fn() -> Vec<u8> + Send + Sync;
type RestoreState = dyn Fn(&[u8]) + Send + Sync;

/// A named mutual-exclusion region with replicated private state.
///
/// Only one [`Monitor`] per name should exist locally; constructing a
/// second one for the same `(name, engine)` pair is a programmer error you
/// are expected to avoid (there is no detection for it here, the same way
/// the underlying mutex has no reentrancy detection -- see the design notes
/// on `DistributedMutex`).
pub struct Monitor {
    name: String,
    channel: Arc<dyn Channel>,
    dispatcher: Arc<Dispatcher>,
    mutex_engine: Arc<MutexEngine>,
    cv_engine: Arc<CvEngine>,
    /// Guards against two local threads entering the same named monitor at
    /// once; the distributed protocol itself is not reentrant.
    local_entry: StdMutex<()>,
    save_state: Arc<SaveState>,
    sync_subscription: crate::dispatcher::SubscriptionId,
}

impl Monitor {
    /// `save_state`/`restore_state` serialize and install the monitor's
    /// private data; they run on the caller's thread at the moments
    /// documented on [`Monitor::enter`], except `restore_state` which also
    /// runs on the receiver thread for `SYNC` packets that arrive while we
    /// are not inside the monitor.
    pub fn new(
        name: impl Into<String>,
        channel: Arc<dyn Channel>,
        dispatcher: Arc<Dispatcher>,
        mutex_engine: Arc<MutexEngine>,
        cv_engine: Arc<CvEngine>,
        save_state: impl Fn() -> Vec<u8> + Send + Sync + 'static,
        restore_state: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        if name.len() > MAX_NAME_LEN {
            let len = name.len();
            return Err(Error::NameTooLong(name, len));
        }
        mutex_engine.register(&name);
        cv_engine.register(&name);

        let save_state: Arc<SaveState> = Arc::new(save_state);
        let restore_state: Arc<RestoreState> = Arc::new(restore_state);

        let name_for_sub = name.clone();
        let sync_subscription = dispatcher.subscribe(
            move |p| {
                if p.message_type != MessageType::Sync {
                    return false;
                }
                match unframe_sync_payload(&p.payload) {
                    Ok((sync_name, _)) => sync_name == name_for_sub,
                    Err(_) => false,
                }
            },
            move |p| {
                if let Ok((_, state)) = unframe_sync_payload(&p.payload) {
                    debug!("applying SYNC state ({} bytes)", state.len());
                    restore_state(state);
                }
            },
        );

        Ok(Arc::new(Self {
            name,
            channel,
            dispatcher,
            mutex_engine,
            cv_engine,
            local_entry: StdMutex::new(()),
            save_state,
            sync_subscription,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cv_engine(&self) -> &Arc<CvEngine> {
        &self.cv_engine
    }

    /// Acquire the monitor, returning a scoped guard. On drop, the guard
    /// serializes the current state via `save_state`, broadcasts it as a
    /// `SYNC`, and only then releases the mutex -- in that order, so that
    /// FIFO delivery guarantees every peer applies our state before it can
    /// act on the agreement that lets it in next.
    pub fn enter(self: &Arc<Self>) -> Result<MonitorGuard> {
        // Held only long enough to prevent two local threads from both
        // entering this named monitor's distributed protocol at once; the
        // distributed mutex itself has no reentrancy detection.
        let _local_guard = self
            .local_entry
            .lock()
            .expect("monitor local-entry mutex poisoned");
        self.mutex_engine.acquire(&self.name)?;
        Ok(MonitorGuard { monitor: self.clone() })
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.sync_subscription);
        self.mutex_engine.unregister(&self.name);
        self.cv_engine.unregister(&self.name);
    }
}

/// RAII scope for a [`Monitor::enter`]. On drop: save, broadcast `SYNC`,
/// release -- in that order.
pub struct MonitorGuard {
    monitor: Arc<Monitor>,
}

impl MonitorGuard {
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        let state = (self.monitor.save_state)();
        let payload = frame_sync_payload(&self.monitor.name, &state);
        if let Err(e) = self.monitor.channel.send_others(MessageType::Sync, &payload) {
            log::error!("failed to broadcast SYNC for monitor {:?}: {e}", self.monitor.name);
        }
        if let Err(e) = self.monitor.mutex_engine.release(&self.monitor.name) {
            log::error!("failed to release monitor {:?}: {e}", self.monitor.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use std::convert::TryInto;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn sync_replicates_state_to_next_holder() {
        let mut channels = InMemoryChannel::new_group(2);
        let c1 = Arc::new(channels.remove(1)) as Arc<dyn Channel>;
        let c0 = Arc::new(channels.remove(0)) as Arc<dyn Channel>;

        let d0 = Dispatcher::new(c0.clone());
        let d1 = Dispatcher::new(c1.clone());
        let me0 = MutexEngine::new(c0.clone(), d0.clone());
        let me1 = MutexEngine::new(c1.clone(), d1.clone());
        let cv0 = CvEngine::new(c0.clone(), d0.clone());
        let cv1 = CvEngine::new(c1.clone(), d1.clone());

        let counter0 = Arc::new(AtomicI64::new(0));
        let counter0_save = counter0.clone();
        let counter0_restore = counter0.clone();
        let m0 = Monitor::new(
            "counter",
            c0.clone(),
            d0.clone(),
            me0,
            cv0,
            move || counter0_save.load(Ordering::SeqCst).to_le_bytes().to_vec(),
            move |bytes| {
                let v = i64::from_le_bytes(bytes.try_into().unwrap());
                counter0_restore.store(v, Ordering::SeqCst);
            },
        )
        .unwrap();

        let counter1 = Arc::new(AtomicI64::new(-1));
        let counter1_save = counter1.clone();
        let counter1_restore = counter1.clone();
        let m1 = Monitor::new(
            "counter",
            c1.clone(),
            d1.clone(),
            me1,
            cv1,
            move || counter1_save.load(Ordering::SeqCst).to_le_bytes().to_vec(),
            move |bytes| {
                let v = i64::from_le_bytes(bytes.try_into().unwrap());
                counter1_restore.store(v, Ordering::SeqCst);
            },
        )
        .unwrap();

        let d0_listener = {
            let d0 = d0.clone();
            std::thread::spawn(move || d0.listen_blocking())
        };
        let d1_listener = {
            let d1 = d1.clone();
            std::thread::spawn(move || d1.listen_blocking())
        };

        {
            let guard = m0.enter().unwrap();
            counter0.store(7, Ordering::SeqCst);
            drop(guard);
        }

        {
            let _guard = m1.enter().unwrap();
            assert_eq!(counter1.load(Ordering::SeqCst), 7);
        }

        d0.stop();
        d1.stop();
        let _ = d0_listener.join();
        let _ = d1_listener.join();
    }

    #[test]
    fn rejects_names_over_255_bytes() {
        let channels = InMemoryChannel::new_group(1);
        let c0 = Arc::new(channels.into_iter().next().unwrap()) as Arc<dyn Channel>;
        let d0 = Dispatcher::new(c0.clone());
        let me0 = MutexEngine::new(c0.clone(), d0.clone());
        let cv0 = CvEngine::new(c0.clone(), d0.clone());
        let long_name = "x".repeat(256);
        let result = Monitor::new(long_name, c0, d0, me0, cv0, Vec::new, |_| {});
        assert!(matches!(result, Err(Error::NameTooLong(..))));
    }
}
