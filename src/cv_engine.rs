//! Distributed condition variables layered on a [`MutexEngine`].
//!
//! Waiting is split into two phases: announce intent (`COND_WAIT`), sleep
//! locally until a `COND_NOTIFY` arrives, then announce departure
//! (`COND_WAIT_END`) and block for a confirmation from every other peer
//! before continuing. The confirmation barrier exists so that a notify that
//! raced our exit can never be mistaken for a notify meant for a future
//! wait -- see the module docs on [`CvEngine::wait`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, warn};

use crate::channel::Channel;
use crate::clock::ProcessId;
use crate::dispatcher::{Dispatcher, POISON_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::mutex_engine::MutexEngine;
use crate::packet::{MessageType, Packet};

#[derive(Default)]
struct State {
    registered: HashSet<String>,
    /// Peers we believe are currently waiting on a given condition, sorted
    /// implicitly by [`Packet::happens_before`] at selection time.
    waiters: HashMap<String, Vec<Packet>>,
}

struct RealCond {
    woken: Mutex<bool>,
    cond: Condvar,
}

struct EndBarrier {
    confirmations: Mutex<HashSet<ProcessId>>,
    cond: Condvar,
}

pub struct CvEngine {
    channel: Arc<dyn Channel>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<State>,
}

impl CvEngine {
    pub fn new(channel: Arc<dyn Channel>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let engine = Arc::new(Self {
            channel,
            dispatcher: dispatcher.clone(),
            state: Mutex::new(State::default()),
        });

        let weak = Arc::downgrade(&engine);
        dispatcher.subscribe(
            {
                let weak = weak.clone();
                move |p| {
                    if p.message_type != MessageType::CondWait {
                        return false;
                    }
                    let Some(engine) = weak.upgrade() else { return false };
                    let name = String::from_utf8_lossy(&p.payload).into_owned();
                    let contains = engine.state.lock().expect("cv engine state poisoned").registered.contains(&name);
                    contains
                }
            },
            {
                let engine = engine.clone();
                move |p| engine.handle_wait(p)
            },
        );

        let weak = Arc::downgrade(&engine);
        dispatcher.subscribe(
            move |p| {
                if p.message_type != MessageType::CondWaitEnd {
                    return false;
                }
                let Some(engine) = weak.upgrade() else { return false };
                let name = String::from_utf8_lossy(&p.payload).into_owned();
                let contains = engine.state.lock().expect("cv engine state poisoned").registered.contains(&name);
                contains
            },
            {
                let engine = engine.clone();
                move |p| engine.handle_wait_end(p)
            },
        );

        engine
    }

    pub fn register(&self, name: &str) {
        self.state
            .lock()
            .expect("cv engine state poisoned")
            .registered
            .insert(name.to_string());
    }

    pub fn unregister(&self, name: &str) {
        self.state
            .lock()
            .expect("cv engine state poisoned")
            .registered
            .remove(name);
    }

    fn handle_wait(&self, packet: &Packet) {
        let name = String::from_utf8_lossy(&packet.payload).into_owned();
        self.state
            .lock()
            .expect("cv engine state poisoned")
            .waiters
            .entry(name)
            .or_default()
            .push(packet.clone());
    }

    fn handle_wait_end(&self, packet: &Packet) {
        let name = String::from_utf8_lossy(&packet.payload).into_owned();
        // Only the departing process's own entry, not every waiter on this
        // condition -- otherwise one waiter leaving would erase everyone
        // else's registration and they'd never be notified again.
        if let Some(waiters) = self.state.lock().expect("cv engine state poisoned").waiters.get_mut(&name) {
            waiters.retain(|p| p.source != packet.source);
        }
        let _ = self.channel.send(MessageType::CondWaitEndConfirm, name.as_bytes(), packet.source);
    }

    /// `mutex` must already be held by the caller. Releases it while
    /// asleep and re-acquires it (through the full distributed protocol)
    /// before returning.
    pub fn wait(
        &self,
        name: &str,
        mutex_name: &str,
        mutex_engine: &MutexEngine,
        mut predicate: impl FnMut() -> bool,
    ) -> Result<()> {
        let n = self.channel.number_of_processes();

        let real_cond = Arc::new(RealCond {
            woken: Mutex::new(false),
            cond: Condvar::new(),
        });
        let real_cond_for_sub = real_cond.clone();
        let notify_sub = self.dispatcher.subscribe(
            {
                let name = name.to_string();
                move |p| p.message_type == MessageType::CondNotify && p.payload == name.as_bytes()
            },
            move |_| {
                *real_cond_for_sub.woken.lock().expect("real cond mutex poisoned") = true;
                real_cond_for_sub.cond.notify_all();
            },
        );

        debug!("{name}: announcing wait");
        self.channel.send_others(MessageType::CondWait, name.as_bytes())?;
        mutex_engine.release(mutex_name)?;

        {
            let mut woken = real_cond.woken.lock().expect("real cond mutex poisoned");
            while !*woken && !predicate() {
                if let Some(message) = self.dispatcher.poison() {
                    drop(woken);
                    self.dispatcher.unsubscribe(notify_sub);
                    return Err(Error::protocol_violation(format!(
                        "receiver thread died while waiting on condition {name:?}: {message}"
                    )));
                }
                let (guard, _timed_out) = real_cond
                    .cond
                    .wait_timeout(woken, POISON_POLL_INTERVAL)
                    .expect("real cond mutex poisoned");
                woken = guard;
            }
        }
        self.dispatcher.unsubscribe(notify_sub);

        mutex_engine.acquire(mutex_name)?;

        if n > 1 {
            let barrier = Arc::new(EndBarrier {
                confirmations: Mutex::new(HashSet::new()),
                cond: Condvar::new(),
            });
            let barrier_for_sub = barrier.clone();
            let confirm_sub = self.dispatcher.subscribe(
                {
                    let name = name.to_string();
                    move |p| p.message_type == MessageType::CondWaitEndConfirm && p.payload == name.as_bytes()
                },
                move |p| {
                    let mut confirmations = barrier_for_sub.confirmations.lock().expect("end barrier mutex poisoned");
                    confirmations.insert(p.source);
                    barrier_for_sub.cond.notify_all();
                },
            );

            self.channel.send_others(MessageType::CondWaitEnd, name.as_bytes())?;

            let needed = n - 1;
            let mut confirmations = barrier.confirmations.lock().expect("end barrier mutex poisoned");
            while confirmations.len() < needed {
                if let Some(message) = self.dispatcher.poison() {
                    drop(confirmations);
                    self.dispatcher.unsubscribe(confirm_sub);
                    return Err(Error::protocol_violation(format!(
                        "receiver thread died while waiting for COND_WAIT_END_CONFIRM on {name:?}: {message}"
                    )));
                }
                let (guard, _timed_out) = barrier
                    .cond
                    .wait_timeout(confirmations, POISON_POLL_INTERVAL)
                    .expect("end barrier mutex poisoned");
                confirmations = guard;
            }
            drop(confirmations);
            self.dispatcher.unsubscribe(confirm_sub);
        }

        debug!("{name}: wait complete, mutex re-acquired");
        Ok(())
    }

    /// Wake the single remote waiter with the smallest `(lamport_time,
    /// source)`. A no-op if nobody is currently known to be waiting.
    pub fn notify_one(&self, name: &str) -> Result<()> {
        let chosen = {
            let mut state = self.state.lock().expect("cv engine state poisoned");
            let Some(waiters) = state.waiters.get_mut(name) else {
                warn!("notify_one({name}): no waiters");
                return Ok(());
            };
            if waiters.is_empty() {
                warn!("notify_one({name}): no waiters");
                return Ok(());
            }
            let idx = waiters
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    (a.lamport_time, a.source).cmp(&(b.lamport_time, b.source))
                })
                .map(|(idx, _)| idx)
                .expect("waiters is non-empty");
            waiters.remove(idx)
        };
        self.channel.send(MessageType::CondNotify, name.as_bytes(), chosen.source)?;
        Ok(())
    }

    /// Wake every remote waiter currently registered for this condition.
    pub fn notify_all(&self, name: &str) -> Result<()> {
        let recipients: Vec<ProcessId> = {
            let state = self.state.lock().expect("cv engine state poisoned");
            match state.waiters.get(name) {
                Some(waiters) if !waiters.is_empty() => waiters.iter().map(|p| p.source).collect(),
                _ => {
                    warn!("notify_all({name}): no waiters");
                    return Ok(());
                }
            }
        };
        for recipient in recipients {
            self.channel.send(MessageType::CondNotify, name.as_bytes(), recipient)?;
        }
        Ok(())
    }
}
