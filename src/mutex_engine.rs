//! Ricart-Agrawala distributed mutual exclusion, driven by Lamport time.
//!
//! One [`MutexEngine`] per process serves every named mutex: acquiring `m`
//! broadcasts a request and blocks for agreement from every other peer;
//! a concurrent request for the same name is answered immediately if it's
//! older (by `(lamport_time, process_id)`), otherwise deferred until we
//! release.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::channel::Channel;
use crate::clock::ProcessId;
use crate::dispatcher::{Dispatcher, POISON_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::packet::{MessageType, Packet};

#[derive(Default)]
struct State {
    registered: HashSet<String>,
    /// Our own outstanding request's timestamp, present while we're
    /// attempting to acquire or currently holding the named mutex.
    queued: HashMap<String, Packet>,
    /// Peer requests we've chosen not to answer yet, to be released on our
    /// own `release`.
    deferred: HashMap<String, Vec<Packet>>,
}

struct AcquireWait {
    agreements: Mutex<HashSet<ProcessId>>,
    cond: Condvar,
}

pub struct MutexEngine {
    channel: Arc<dyn Channel>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<State>,
}

impl MutexEngine {
    pub fn new(channel: Arc<dyn Channel>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let engine = Arc::new(Self {
            channel,
            dispatcher: dispatcher.clone(),
            state: Mutex::new(State::default()),
        });

        let weak_for_request = Arc::downgrade(&engine);
        dispatcher.subscribe(
            move |p| {
                if p.message_type != MessageType::MutexRequest {
                    return false;
                }
                let Some(engine) = weak_for_request.upgrade() else { return false };
                let name = String::from_utf8_lossy(&p.payload).into_owned();
                let contains = engine.state.lock().expect("mutex engine state poisoned").registered.contains(&name);
                contains
            },
            {
                let engine = engine.clone();
                move |p| engine.handle_request(p)
            },
        );

        engine
    }

    pub fn register(&self, name: &str) {
        self.state
            .lock()
            .expect("mutex engine state poisoned")
            .registered
            .insert(name.to_string());
    }

    pub fn unregister(&self, name: &str) {
        self.state
            .lock()
            .expect("mutex engine state poisoned")
            .registered
            .remove(name);
    }

    fn handle_request(&self, request: &Packet) {
        let name = String::from_utf8_lossy(&request.payload).into_owned();
        let mut state = self.state.lock().expect("mutex engine state poisoned");
        // Defer only if our own outstanding request/hold has priority over
        // the incoming one (we came first); otherwise the incoming request
        // has priority and we must answer immediately even though we're
        // still queued or holding the mutex ourselves.
        let should_defer = match state.queued.get(&name) {
            Some(ours) => ours.happens_before(request),
            None => false,
        };
        if should_defer {
            state
                .deferred
                .entry(name)
                .or_default()
                .push(request.clone());
        } else {
            drop(state);
            debug!("granting agreement for {name} to {}", request.source);
            let _ = self.channel.send(MessageType::MutexAgreement, name.as_bytes(), request.source);
        }
    }

    /// Block until we hold the named mutex. The name must already be
    /// [`MutexEngine::register`]ed.
    pub fn acquire(&self, name: &str) -> Result<()> {
        let n = self.channel.number_of_processes();
        if n <= 1 {
            // Under the queued lock: an incoming MUTEX_REQUEST for this name
            // dispatched on the receiver thread must never observe `queued`
            // empty in the window between sending our own request and
            // recording it.
            let mut state = self.state.lock().expect("mutex engine state poisoned");
            let own = self.channel.send_others(MessageType::MutexRequest, name.as_bytes())?;
            state.queued.insert(name.to_string(), own);
            return Ok(());
        }

        let wait = Arc::new(AcquireWait {
            agreements: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        });
        let name_owned = name.to_string();
        let wait_for_sub = wait.clone();
        let sub_id = self.dispatcher.subscribe(
            {
                let name_owned = name_owned.clone();
                move |p| p.message_type == MessageType::MutexAgreement && p.payload == name_owned.as_bytes()
            },
            move |p| {
                let mut agreements = wait_for_sub.agreements.lock().expect("acquire wait mutex poisoned");
                agreements.insert(p.source);
                wait_for_sub.cond.notify_all();
            },
        );

        // Hold the queued lock across the send and the insert: otherwise a
        // MUTEX_REQUEST for this name arriving on the receiver thread in
        // between would see `queued` empty and grant agreement immediately,
        // even though our own just-sent request may have priority -- two
        // peers could then both collect N-1 agreements for the same mutex.
        {
            let mut state = self.state.lock().expect("mutex engine state poisoned");
            let own_request = match self.channel.send_others(MessageType::MutexRequest, name.as_bytes()) {
                Ok(packet) => packet,
                Err(e) => {
                    drop(state);
                    self.dispatcher.unsubscribe(sub_id);
                    return Err(e);
                }
            };
            state.queued.insert(name.to_string(), own_request);
        }

        let needed = n - 1;
        let mut agreements = wait.agreements.lock().expect("acquire wait mutex poisoned");
        while agreements.len() < needed {
            if let Some(message) = self.dispatcher.poison() {
                drop(agreements);
                self.dispatcher.unsubscribe(sub_id);
                return Err(Error::protocol_violation(format!(
                    "receiver thread died before {name:?} collected all agreements: {message}"
                )));
            }
            let (guard, _timed_out) = wait
                .cond
                .wait_timeout(agreements, POISON_POLL_INTERVAL)
                .expect("acquire wait mutex poisoned");
            agreements = guard;
        }
        drop(agreements);
        self.dispatcher.unsubscribe(sub_id);
        Ok(())
    }

    /// Release the named mutex we currently hold: reply to every deferred
    /// peer and forget our own request.
    pub fn release(&self, name: &str) -> Result<()> {
        let deferred = {
            let mut state = self.state.lock().expect("mutex engine state poisoned");
            state.queued.remove(name);
            state.deferred.remove(name).unwrap_or_default()
        };
        for request in deferred {
            self.channel.send(MessageType::MutexAgreement, name.as_bytes(), request.source)?;
        }
        Ok(())
    }

    pub fn is_requested(&self, name: &str) -> bool {
        self.state.lock().expect("mutex engine state poisoned").queued.contains_key(name)
    }
}
