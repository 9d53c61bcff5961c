//! Notification fan-out to connected clients.
//!
//! Every client connection registers a [`CallbackChannel`] under its subscriber id. Quote and
//! lifecycle notifications go to every subscriber; engine events go only to the subscribers bound
//! to the emitting session. A delivery that fails removes that subscriber and never affects the
//! others.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use mtbridge_common::wire::{Notification, ServerFrame};
use mtbridge_common::{BridgeError, Result, SessionHandle};

/// Identifies one client connection.
pub type SubscriberId = u64;

/// Outbound notification path of one subscriber.
pub trait CallbackChannel: Send + Sync {
    /// Hands a notification to the subscriber. An error marks the subscriber as dead.
    fn deliver(&self, notification: &Notification) -> Result<()>;
}

impl CallbackChannel for Sender<ServerFrame> {
    fn deliver(&self, notification: &Notification) -> Result<()> {
        self.send(ServerFrame::Notify(notification.clone()))
            .map_err(|e| BridgeError::ChannelSend(e.to_string()))
    }
}

struct Subscriber {
    channel: Arc<dyn CallbackChannel>,
    sessions: HashSet<SessionHandle>,
}

/// Registered subscribers of one server.
#[derive(Default)]
pub struct FanoutHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    // Serializes deliveries so every subscriber observes one global emission order.
    emit: Mutex<()>,
}

impl FanoutHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber. Returns `false` when `id` is already subscribed.
    pub fn subscribe(&self, id: SubscriberId, channel: Arc<dyn CallbackChannel>) -> Result<bool> {
        let mut subscribers = self.subscribers.write()?;
        if subscribers.contains_key(&id) {
            debug!("Subscriber {} is already registered", id);
            return Ok(false);
        }
        subscribers.insert(
            id,
            Subscriber {
                channel,
                sessions: HashSet::new(),
            },
        );
        info!("Subscriber {} registered; {} active", id, subscribers.len());
        Ok(true)
    }

    /// Removes a subscriber. Returns `false` when it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<bool> {
        let removed = self.subscribers.write()?.remove(&id).is_some();
        if removed {
            info!("Subscriber {} unregistered", id);
        }
        Ok(removed)
    }

    /// Binds a subscriber to a session so it receives that session's engine events.
    pub fn bind(&self, id: SubscriberId, handle: SessionHandle) -> Result<()> {
        if let Some(subscriber) = self.subscribers.write()?.get_mut(&id) {
            if subscriber.sessions.insert(handle) {
                debug!("Subscriber {} bound to session {}", id, handle);
            }
        }
        Ok(())
    }

    /// Delivers `notification` to every subscriber. Returns the number of successful deliveries.
    pub fn broadcast(&self, notification: &Notification) -> Result<usize> {
        self.deliver_where(notification, |_| true)
    }

    /// Delivers `notification` to the subscribers bound to `handle`.
    pub fn deliver_to_session(
        &self,
        handle: SessionHandle,
        notification: &Notification,
    ) -> Result<usize> {
        self.deliver_where(notification, |s| s.sessions.contains(&handle))
    }

    /// Number of subscribers.
    pub fn len(&self) -> Result<usize> {
        Ok(self.subscribers.read()?.len())
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn deliver_where(
        &self,
        notification: &Notification,
        select: impl Fn(&Subscriber) -> bool,
    ) -> Result<usize> {
        let _emit = self.emit.lock()?;
        let targets: Vec<(SubscriberId, Arc<dyn CallbackChannel>)> = self
            .subscribers
            .read()?
            .iter()
            .filter(|(_, s)| select(s))
            .map(|(id, s)| (*id, Arc::clone(&s.channel)))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, channel) in targets {
            match channel.deliver(notification) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Delivery to subscriber {} failed, removing it: {}", id, e);
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write()?;
            for id in dead {
                subscribers.remove(&id);
            }
        }
        Ok(delivered)
    }
}
