//! Parameter change observation.
//!
//! The render context never calls listeners. It pushes [`ParameterChange`]s
//! into a per-node ring buffer through its [`Notifier`]; the control context
//! (or a [`Dispatcher`] thread) drains those rings and calls whichever
//! listener currently holds the node's [`ObserverToken`].
//!
//! Each node has at most one live token. Subscribing again replaces the
//! listener, and changes stamped with the old token are discarded on dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, trace, warn};

use crate::node::NodeId;
use crate::param::ParameterAddress;

/// Proof of a node's current subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverToken {
    node: NodeId,
    serial: u64,
}

impl ObserverToken {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// A value the render context published for a parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterChange {
    pub token: ObserverToken,
    pub address: ParameterAddress,
    pub value: f64,
}

/// Render-side end of a node's notification ring.
pub struct Notifier {
    producer: Producer<ParameterChange>,
}

impl Notifier {
    /// Queue a change for dispatch.
    ///
    /// Lock-free and allocation-free. Returns `false` if the ring is full and
    /// the change was dropped.
    #[inline]
    pub fn notify(&mut self, token: ObserverToken, address: ParameterAddress, value: f64) -> bool {
        self.producer
            .push(ParameterChange { token, address, value })
            .is_ok()
    }
}

type Listener = Box<dyn FnMut(ParameterChange) + Send>;

struct Registration {
    token: ObserverToken,
    listener: Listener,
}

#[derive(Default)]
struct HubInner {
    registrations: HashMap<NodeId, Registration>,
    channels: HashMap<NodeId, Consumer<ParameterChange>>,
}

/// Subscription registry shared by the control context.
///
/// Cloning is cheap; clones share the same registrations.
#[derive(Clone, Default)]
pub struct ParameterObservationHub {
    inner: Arc<Mutex<HubInner>>,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

impl ParameterObservationHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the notification ring for `node`, replacing any previous one.
    pub fn channel(&self, node: NodeId, capacity: usize) -> Notifier {
        let (producer, consumer) = RingBuffer::new(capacity.max(1));
        self.lock().channels.insert(node, consumer);
        Notifier { producer }
    }

    /// Register `listener` as the node's only observer.
    ///
    /// Any earlier token for the node stops receiving changes.
    pub fn subscribe<F>(&self, node: NodeId, listener: F) -> ObserverToken
    where
        F: FnMut(ParameterChange) + Send + 'static,
    {
        let token = ObserverToken {
            node,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        };
        let previous = self.lock().registrations.insert(
            node,
            Registration {
                token,
                listener: Box::new(listener),
            },
        );
        if let Some(previous) = previous {
            debug!(?node, old = previous.token.serial, new = token.serial, "observer replaced");
        }
        token
    }

    /// Drop the registration held by `token`. Stale tokens are ignored.
    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        let mut inner = self.lock();
        match inner.registrations.get(&token.node) {
            Some(reg) if reg.token == token => {
                inner.registrations.remove(&token.node);
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, token: ObserverToken) -> bool {
        self.lock()
            .registrations
            .get(&token.node)
            .map_or(false, |reg| reg.token == token)
    }

    /// Forget everything about `node`.
    pub fn remove_node(&self, node: NodeId) {
        let mut inner = self.lock();
        inner.registrations.remove(&node);
        inner.channels.remove(&node);
    }

    /// Deliver every queued change to its current listener.
    ///
    /// Returns the number of changes delivered. Listeners run with the hub
    /// locked and must not call back into it.
    pub fn dispatch(&self) -> usize {
        let mut guard = self.lock();
        let HubInner {
            registrations,
            channels,
        } = &mut *guard;

        let mut delivered = 0;
        for (node, consumer) in channels.iter_mut() {
            while let Ok(change) = consumer.pop() {
                match registrations.get_mut(node) {
                    Some(reg) if reg.token == change.token => {
                        (reg.listener)(change);
                        delivered += 1;
                    }
                    _ => trace!(?node, "dropping change for stale token"),
                }
            }
        }
        if delivered > 0 {
            trace!(delivered, "dispatched parameter changes");
        }
        delivered
    }

    /// Run [`dispatch`](Self::dispatch) on a background thread every `period`.
    pub fn spawn_dispatcher(&self, period: Duration) -> std::io::Result<Dispatcher> {
        let hub = self.clone();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = std::thread::Builder::new()
            .name("kanalwahl-observer".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    hub.dispatch();
                    std::thread::sleep(period);
                }
                hub.dispatch();
            })?;

        Ok(Dispatcher {
            running,
            thread: Some(thread),
        })
    }
}

/// Background dispatch loop; stops and joins when dropped.
pub struct Dispatcher {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("observer dispatcher panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
