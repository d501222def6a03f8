//! The receiver loop: pulls packets off the [`Channel`] and fans them out to
//! whoever subscribed.
//!
//! Modeled on the draining event loop in `raft::Node::run` from the crate
//! this one grew out of -- one thread blocks in `receive`, every other
//! thread waits on a local condition variable that a subscription callback
//! signals.

use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::packet::{MessageType, Packet};

pub type SubscriptionId = u64;

/// Payload used to wake a receiver thread blocked in `Channel::receive`
/// when shutting down; never matched against any real subscription.
const WAKE_SENTINEL: &[u8] = b"__dispatcher_stop__";

/// How often a blocking call (`MutexEngine::acquire`, `CvEngine::wait`)
/// re-checks [`Dispatcher::poison`] while parked on its own condition
/// variable, so it notices a dead receiver within a bounded delay instead
/// of only on its next real wakeup.
pub const POISON_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Subscription {
    id: SubscriptionId,
    predicate: Box<dyn Fn(&Packet) -> bool + Send>,
    callback: Box<dyn Fn(&Packet) + Send>,
}

/// Demultiplexes inbound packets to registered `(predicate, callback)`
/// subscriptions. One [`Dispatcher`] per process, shared by every engine
/// that needs to react to incoming packets.
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    terminate: AtomicBool,
    listening: AtomicBool,
    /// Set once the receiver loop dies from a fatal protocol violation, so
    /// that blocking calls parked on their own condition variable can
    /// notice and return an error instead of waiting on a receiver that
    /// will never run again.
    poison: Mutex<Option<String>>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn Channel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            terminate: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            poison: Mutex::new(None),
        })
    }

    /// Register a subscription and return its id. The callback runs on the
    /// receiver thread and must not block on message I/O.
    pub fn subscribe(
        &self,
        predicate: impl Fn(&Packet) -> bool + Send + 'static,
        callback: impl Fn(&Packet) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().expect("subscriptions mutex poisoned").push(Subscription {
            id,
            predicate: Box::new(predicate),
            callback: Box::new(callback),
        });
        id
    }

    /// Idempotent: unsubscribing an id that's already gone is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .retain(|s| s.id != id);
    }

    fn dispatch(&self, packet: &Packet) -> Result<()> {
        let subs = self.subscriptions.lock().expect("subscriptions mutex poisoned");
        let mut matched = false;
        for sub in subs.iter() {
            if (sub.predicate)(packet) {
                matched = true;
                (sub.callback)(packet);
            }
        }
        if !matched {
            if packet.message_type == MessageType::CondNotify {
                // A notify racing a waiter's exit is harmless; see cv_engine.
                warn!("dropping unmatched COND_NOTIFY from {}", packet.source);
                return Ok(());
            }
            error!(
                "packet {:?} from {} matched no subscription",
                packet.message_type, packet.source
            );
            return Err(Error::protocol_violation(format!(
                "packet of type {:?} from process {} matched no subscription",
                packet.message_type, packet.source
            )));
        }
        Ok(())
    }

    /// Start the receiver loop on the calling thread. Runs until
    /// [`Dispatcher::stop`] is called or the channel errors out.
    ///
    /// Termination is driven solely by receiving the wakeup sentinel, not
    /// by polling the `terminate` flag between packets: the channel is
    /// FIFO, so any real packet already queued ahead of the sentinel at the
    /// time `stop` was called is guaranteed to be dispatched first. Exiting
    /// as soon as `terminate` is observed true would risk dropping such a
    /// packet un-dispatched.
    pub fn listen_blocking(self: &Arc<Self>) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            let packet = self.channel.receive()?;
            if packet.source == self.channel.process_id() && packet.payload == WAKE_SENTINEL {
                break;
            }
            debug!("received {:?} from {}", packet.message_type, packet.source);
            if let Err(e) = self.dispatch(&packet) {
                *self.poison.lock().expect("poison mutex poisoned") = Some(e.to_string());
                return Err(e);
            }
        }
        Ok(())
    }

    /// The error that killed the receiver loop, if it has exited due to a
    /// fatal protocol violation. `None` while the receiver is still alive
    /// (or hasn't started).
    pub fn poison(&self) -> Option<String> {
        self.poison.lock().expect("poison mutex poisoned").clone()
    }

    /// Spawn [`Dispatcher::listen_blocking`] on its own thread.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("dispatcher-receiver".into())
            .spawn(move || this.listen_blocking())
            .expect("failed to spawn receiver thread")
    }

    /// Ask the receiver loop to exit. A thread blocked in
    /// `Channel::receive` is woken by sending it a harmless message
    /// addressed to itself, since there's no cancellable receive in the
    /// `Channel` contract. Idempotent: a second call is a no-op, so we
    /// never enqueue more than one sentinel.
    pub fn stop(&self) {
        if self.terminate.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.channel.send(MessageType::Sync, WAKE_SENTINEL, self.channel.process_id());
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }
}
