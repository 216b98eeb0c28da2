//! Per-channel request correlation
//!
//! A gateway tracks one outstanding request per logical channel (for market
//! data, "product:stream"). Different channels proceed concurrently; a
//! second request on a busy channel fails fast rather than queueing.
//! Completions fire exactly once: with the matched reply, or with `None` on
//! any failure, timeout, or disconnect.

use crate::codec::Codec;
use crate::durable::DurableConnection;
use crate::turnstile::DoneFn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Maps requests and replies onto logical channel keys
pub trait ChannelMap<C: Codec>: Send + Sync + 'static {
    /// Channel a request occupies
    fn request_channel(&self, msg: &C::Out) -> String;

    /// Channel a reply settles, if the message is a reply at all
    fn reply_channel(&self, msg: &C::In) -> Option<String>;
}

struct Slot<In> {
    /// Taken under the lock for exactly-once completion
    done: Option<DoneFn<In>>,
    id: u64,
}

/// Routes request/reply traffic over one connection, one inflight request
/// per channel
pub struct Gateway<C: Codec, M: ChannelMap<C>> {
    durable: DurableConnection<C>,
    channels: M,
    slots: Arc<Mutex<HashMap<String, Slot<C::In>>>>,
    next_id: AtomicU64,
    reply_timeout: Duration,
    send_timeout: Duration,
}

impl<C: Codec, M: ChannelMap<C>> Gateway<C, M> {
    pub fn new(durable: DurableConnection<C>, channels: M) -> Self {
        Self {
            durable,
            channels,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            reply_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &DurableConnection<C> {
        &self.durable
    }

    /// Send a request on its channel. `done` fires exactly once.
    ///
    /// Fails fast (returns false, `done(None)` already called) when the
    /// connection is down, the channel is busy, or the write fails.
    pub async fn send(&self, msg: C::Out, done: DoneFn<C::In>) -> bool {
        if !self.durable.connected() {
            done(None);
            return false;
        }

        let channel = self.channels.request_channel(&msg);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&channel) {
                drop(slots);
                warn!(channel = %channel, "channel busy, dropping request");
                done(None);
                return false;
            }
            slots.insert(
                channel.clone(),
                Slot {
                    done: Some(done),
                    id,
                },
            );
        }

        let guard = match self.durable.lock_timeout(self.send_timeout).await {
            Ok(guard) => guard,
            Err(_) => {
                self.fail_slot(&channel, id);
                return false;
            }
        };
        if guard.writer().send(&msg).await.is_err() {
            drop(guard);
            self.fail_slot(&channel, id);
            return false;
        }
        drop(guard);

        self.arm_reply_timeout(channel, id);
        true
    }

    fn arm_reply_timeout(&self, channel: String, id: u64) {
        let slots = Arc::clone(&self.slots);
        let durable = self.durable.clone();
        let reply_timeout = self.reply_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(reply_timeout).await;
            let done = take_slot(&slots, &channel, Some(id));
            if let Some(done) = done {
                warn!(channel = %channel, "reply timeout, recycling connection");
                done(None);
                durable.reconnect();
            }
        });
    }

    /// Route an inbound message to the matching channel's request.
    ///
    /// Returns true if it completed a request; false if the message is not a
    /// reply or its channel has nothing inflight.
    pub fn on_message(&self, msg: &C::In) -> bool {
        let Some(channel) = self.channels.reply_channel(msg) else {
            return false;
        };
        match take_slot(&self.slots, &channel, None) {
            Some(done) => {
                done(Some(msg.clone()));
                true
            }
            None => false,
        }
    }

    /// Fail every inflight request. Called on disconnect.
    pub fn on_disconnect(&self) {
        let drained: Vec<DoneFn<C::In>> = {
            let mut slots = self.slots.lock();
            slots
                .drain()
                .filter_map(|(_, mut slot)| slot.done.take())
                .collect()
        };
        for done in drained {
            done(None);
        }
    }

    /// Number of channels with an outstanding request
    pub fn inflight(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_channel_busy(&self, channel: &str) -> bool {
        self.slots.lock().contains_key(channel)
    }

    fn fail_slot(&self, channel: &str, id: u64) {
        if let Some(done) = take_slot(&self.slots, channel, Some(id)) {
            done(None);
        }
    }
}

/// Take the completion for a channel; with `Some(id)` only if the slot still
/// belongs to that request.
fn take_slot<In>(
    slots: &Mutex<HashMap<String, Slot<In>>>,
    channel: &str,
    id: Option<u64>,
) -> Option<DoneFn<In>> {
    let mut slots = slots.lock();
    let matches = slots
        .get(channel)
        .is_some_and(|slot| id.is_none() || id == Some(slot.id));
    if !matches {
        return None;
    }
    slots.remove(channel).and_then(|mut slot| slot.done.take())
}
