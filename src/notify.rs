use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Transition;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for outbound status transitions.
///
/// Each entity id gets its own channel, created on first subscribe. The
/// firehose carries every transition in the tenant for audit consumers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Transition>>,
    firehose: broadcast::Sender<Transition>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to transitions published under `id`.
    pub fn subscribe(&self, id: Ulid) -> broadcast::Receiver<Transition> {
        self.channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every transition in the tenant.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Transition> {
        self.firehose.subscribe()
    }

    /// Publish under the transition's own id and, if given, under `also`
    /// (a work order's originating request). No-op without subscribers.
    pub fn send(&self, transition: &Transition, also: Option<Ulid>) {
        let _ = self.firehose.send(transition.clone());
        for id in std::iter::once(transition.id).chain(also) {
            if let Some(sender) = self.channels.get(&id) {
                let _ = sender.send(transition.clone());
            }
        }
    }

    /// Drop channels nobody listens to any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
