//! Relay pool: one client over all configured relays, a single
//! subscription filter, and a router task that merges relay traffic
//! into two bounded in-process channels (DMs and zap receipts). The
//! same event arriving from several relays is forwarded once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nostr::{Event, EventId, Filter, Keys, Kind, Timestamp};
use nostr_sdk::{Client, RelayPoolNotification};
use tokio::sync::broadcast;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 100;
const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);

/// The merged, deduplicated event streams the dispatch loop consumes.
pub struct EventStreams {
    pub dm_events: mpsc::Receiver<Event>,
    pub zap_events: mpsc::Receiver<Event>,
}

pub struct RelayPool {
    client: Client,
}

impl RelayPool {
    /// Connects to the configured relays and installs the bot's filter:
    /// DM and zap kinds, `p`-tagged to the bot, newer than `since`.
    /// Reconnection with backoff is handled inside the relay pool.
    pub async fn connect(
        keys: &Keys,
        relay_urls: &[String],
        since: Timestamp,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(RelayPool, EventStreams)> {
        let client = Client::new(keys);

        let mut added = 0usize;
        for url in relay_urls {
            match client.add_relay(url.clone()).await {
                Ok(_) => added += 1,
                Err(e) => warn!("failed to add relay {url}: {e}"),
            }
        }
        if added == 0 {
            return Err(Error::Relay("no usable relays configured".into()));
        }

        client.connect().await;
        info!("connected to {added}/{} relays", relay_urls.len());

        let filter = Filter::new()
            .kinds(vec![
                Kind::EncryptedDirectMessage,
                Kind::GiftWrap,
                Kind::ZapReceipt,
            ])
            .pubkey(keys.public_key())
            .since(since);
        client.subscribe(vec![filter], None).await;

        let (dm_tx, dm_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (zap_tx, zap_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let notifications = client.notifications();
        tokio::spawn(route_events(notifications, dm_tx, zap_tx, shutdown));

        Ok((
            RelayPool { client },
            EventStreams {
                dm_events: dm_rx,
                zap_events: zap_rx,
            },
        ))
    }

    /// Publishes to every relay; succeeds as long as at least one
    /// relay accepts the event.
    pub async fn publish(&self, event: Event) -> Result<EventId> {
        self.client
            .send_event(event)
            .await
            .map_err(|e| Error::Relay(e.to_string()))
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("relay disconnect: {e}");
        }
    }
}

/// Demultiplexes relay notifications into the DM and zap channels.
/// Never blocks: a full channel drops the event with a log line.
async fn route_events(
    mut notifications: broadcast::Receiver<RelayPoolNotification>,
    dm_tx: mpsc::Sender<Event>,
    zap_tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dedup = Deduplicator::new(DEDUP_TTL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = notifications.recv() => match res {
                Ok(RelayPoolNotification::Event { event, .. }) => {
                    let event = *event;
                    if dedup.is_duplicate(event.id) {
                        debug!("duplicate event {} from another relay, dropping", event.id);
                        continue;
                    }
                    match event.kind {
                        Kind::EncryptedDirectMessage | Kind::GiftWrap => {
                            forward(&dm_tx, event, "DM");
                        }
                        Kind::ZapReceipt => forward(&zap_tx, event, "zap"),
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("relay notification stream lagged, skipped {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    // Dropping the senders closes both output channels.
}

fn forward(tx: &mpsc::Sender<Event>, event: Event, label: &str) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(ev)) => {
            warn!("{label} event channel full, dropping event {}", ev.id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// TTL-bounded set of seen event ids. Entries expire lazily on the
/// next insert after a TTL has elapsed since the last sweep.
struct Deduplicator {
    seen: HashMap<EventId, Instant>,
    ttl: Duration,
    last_cleanup: Instant,
}

impl Deduplicator {
    fn new(ttl: Duration) -> Self {
        Deduplicator {
            seen: HashMap::new(),
            ttl,
            last_cleanup: Instant::now(),
        }
    }

    fn is_duplicate(&mut self, id: EventId) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_cleanup) >= self.ttl {
            let ttl = self.ttl;
            self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < ttl);
            self.last_cleanup = now;
        }

        if self.seen.contains_key(&id) {
            return true;
        }
        self.seen.insert(id, now);
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nostr::EventBuilder;

    fn event_id(content: &str) -> EventId {
        let keys = Keys::generate();
        EventBuilder::text_note(content, [])
            .to_event(&keys)
            .unwrap()
            .id
    }

    #[test]
    fn dedup_first_seen_passes() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60));
        let id = event_id("a");
        assert!(!dedup.is_duplicate(id));
        assert!(dedup.is_duplicate(id));
        assert!(dedup.is_duplicate(id));
    }

    #[test]
    fn dedup_distinct_ids_pass() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60));
        assert!(!dedup.is_duplicate(event_id("a")));
        assert!(!dedup.is_duplicate(event_id("b")));
        assert!(!dedup.is_duplicate(event_id("c")));
    }

    #[test]
    fn dedup_expires_after_ttl() {
        let mut dedup = Deduplicator::new(Duration::from_millis(1));
        let id = event_id("a");
        assert!(!dedup.is_duplicate(id));
        std::thread::sleep(Duration::from_millis(5));
        // TTL elapsed: the sweep forgets the entry and it passes again.
        assert!(!dedup.is_duplicate(id));
    }

    #[tokio::test]
    async fn forward_drops_when_full() {
        let (tx, mut rx) = mpsc::channel::<Event>(1);
        let keys = Keys::generate();
        let a = EventBuilder::text_note("a", []).to_event(&keys).unwrap();
        let b = EventBuilder::text_note("b", []).to_event(&keys).unwrap();

        forward(&tx, a.clone(), "DM");
        forward(&tx, b, "DM"); // dropped, channel capacity is 1

        assert_eq!(rx.recv().await.unwrap().id, a.id);
        assert!(rx.try_recv().is_err());
    }
}
