use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use derive_more::{Deref, DerefMut, Display};
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref, DerefMut)]
pub struct ObserverId(uid::Id<ObserverId>);

/// Outcome of [`Signal::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WaitStatus {
    Ready,
    TimedOut,
}

/// Called synchronously on every [`Signal::signal`].
///
/// Observers run while the signal's lock is held and must not call back into the same signal.
pub trait SignalObserver: Send + Sync {
    fn call(&self, value: u32);

    /// The observed signal is being destroyed; no further calls will arrive.
    fn on_weakified(&self) {}
}

#[derive(Default)]
struct Inner {
    value: u32,
    observers: Vec<(ObserverId, Weak<dyn SignalObserver>)>,
}

/// A thread-safe, observable and waitable 32-bit state cell.
pub struct Signal {
    id: Uuid,
    inner: Mutex<Inner>,
    notifier: Condvar,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &format_args!("{:#x}", inner.value))
            .field("observers", &inner.observers.len())
            .finish()
    }
}

impl Signal {
    #[inline]
    pub fn new(id: Uuid) -> Self {
        Self::with_value(id, 0)
    }

    pub fn with_value(id: Uuid, value: u32) -> Self {
        log::debug!("signal {id} created with {value:#x}");
        let inner = Mutex::new(Inner {
            value,
            observers: vec![],
        });
        let notifier = Condvar::new();
        Self {
            id,
            inner,
            notifier,
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The last published value.
    #[inline]
    pub fn state(&self) -> u32 {
        self.inner.lock().value
    }

    /// Publishes `value`, calls every live observer and wakes all waiters.
    pub fn signal(&self, value: u32) {
        log::debug!("signal {}: {value:#x}", self.id);

        // strong references outlive the lock so no observer is destroyed during its own call
        let observers = {
            let mut inner = self.inner.lock();
            inner.value = value;
            inner.observers.retain(|(_, observer)| observer.strong_count() > 0);
            let observers = inner
                .observers
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect_vec();
            observers.iter().for_each(|observer| observer.call(value));
            self.notifier.notify_all();
            observers
        };
        drop(observers);
    }

    /// Blocks until `predicate` holds for the current value, and returns that value.
    pub fn wait(&self, mut predicate: impl FnMut(u32) -> bool) -> u32 {
        log::debug!("wait on signal {}", self.id);
        let mut inner = self.inner.lock();
        self.notifier
            .wait_while(&mut inner, |inner| !predicate(inner.value));
        inner.value
    }

    /// Like [`Signal::wait`], but gives up after `timeout`.
    pub fn wait_for(&self, timeout: Duration, mut predicate: impl FnMut(u32) -> bool) -> WaitStatus {
        log::debug!("wait on signal {} for {timeout:?}", self.id);
        let mut inner = self.inner.lock();
        self.notifier
            .wait_while_for(&mut inner, |inner| !predicate(inner.value), timeout);
        match predicate(inner.value) {
            true => WaitStatus::Ready,
            false => WaitStatus::TimedOut,
        }
    }

    /// Registers `observer`. The signal keeps only a weak reference; the returned
    /// [`Subscription`] unregisters it when dropped.
    pub fn observe(self: &Arc<Self>, observer: Arc<dyn SignalObserver>) -> Subscription {
        let id = ObserverId(uid::Id::new());
        self.inner
            .lock()
            .observers
            .push((id, Arc::downgrade(&observer)));
        log::debug!("signal {}: observer {id} registered", self.id);
        let signal = Arc::downgrade(self);
        Subscription { signal, id }
    }

    fn unobserve(&self, id: ObserverId) {
        self.inner
            .lock()
            .observers
            .retain(|(other, _)| *other != id);
        log::debug!("signal {}: observer {id} removed", self.id);
    }

    /// Creates a listener that receives every subsequently published value through a channel.
    pub fn listen(self: &Arc<Self>) -> SignalListener {
        let (sender, receiver) = flume::unbounded();
        let observer = Arc::new(ChannelObserver {
            sender: Mutex::new(Some(sender)),
        });
        let subscription = self.observe(observer.clone());
        SignalListener {
            receiver,
            _observer: observer,
            _subscription: subscription,
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        log::debug!("signal {} destroyed", self.id);
        let observers = std::mem::take(&mut self.inner.get_mut().observers);
        observers
            .into_iter()
            .filter_map(|(_, observer)| observer.upgrade())
            .for_each(|observer| observer.on_weakified());
    }
}

/// Keeps an observer registered on a [`Signal`].
#[derive(Debug)]
pub struct Subscription {
    signal: Weak<Signal>,
    id: ObserverId,
}

impl Subscription {
    #[inline]
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Returns `false` once the observed signal is gone.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.signal.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.unobserve(self.id);
        }
    }
}

struct ChannelObserver {
    sender: Mutex<Option<flume::Sender<u32>>>,
}

impl SignalObserver for ChannelObserver {
    fn call(&self, value: u32) {
        if let Some(sender) = self.sender.lock().as_ref() {
            _ = sender.send(value);
        }
    }

    fn on_weakified(&self) {
        self.sender.lock().take();
    }
}

/// Forwards published values into a channel. Disconnects once the signal is dropped.
pub struct SignalListener {
    receiver: flume::Receiver<u32>,
    _observer: Arc<ChannelObserver>,
    _subscription: Subscription,
}

impl std::fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalListener")
            .field("pending", &self.receiver.len())
            .finish()
    }
}

impl SignalListener {
    #[inline]
    pub fn try_recv(&self) -> Result<u32, flume::TryRecvError> {
        self.receiver.try_recv()
    }

    #[inline]
    pub fn recv(&self) -> Result<u32, flume::RecvError> {
        self.receiver.recv()
    }

    #[inline]
    pub fn recv_timeout(&self, timeout: Duration) -> Result<u32, flume::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    #[inline]
    pub async fn recv_async(&self) -> Result<u32, flume::RecvError> {
        self.receiver.recv_async().await
    }
}
