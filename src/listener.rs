//! The dispatch loop: receive event, dedup, decrypt, parse, authorize,
//! execute, reply in the inbound format. The high-water mark advances
//! on every exit path once the event has been claimed, so a restart
//! neither reprocesses nor loses events.

use log::{debug, error, info, warn};
use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Event, Keys, PublicKey};
use tokio::sync::watch;

use crate::commands::{self, ExecuteConfig};
use crate::dm::{self, DmProtocol};
use crate::error::Error;
use crate::fsm::{ProcessorEvent, ProcessorFsm};
use crate::models::{self, Customer, Db, Inventory, Notification, ProcessedEvent};
use crate::relay::{EventStreams, RelayPool};
use crate::zaps;

/// Admin broadcast syntax, checked before normal command parsing.
const BROADCAST_PREFIX: &str = "message customers:";

pub struct EventLoop {
    db: Db,
    keys: Keys,
    pool: RelayPool,
    processor: ProcessorFsm,
    cfg: ExecuteConfig,
    lnurl_pubkey: Option<PublicKey>,
}

impl EventLoop {
    pub fn new(
        db: Db,
        keys: Keys,
        pool: RelayPool,
        cfg: ExecuteConfig,
        lnurl_pubkey: Option<PublicKey>,
    ) -> Self {
        EventLoop {
            db,
            keys,
            pool,
            processor: ProcessorFsm::new(),
            cfg,
            lnurl_pubkey,
        }
    }

    /// Consumes the merged relay streams until shutdown. Events are
    /// processed strictly one at a time; that serialization is what
    /// keeps the ledger's invariants cheap to maintain.
    pub async fn run(
        self,
        mut streams: EventStreams,
        mut shutdown: watch::Receiver<bool>,
    ) -> crate::error::Result<()> {
        info!("eggbot running, waiting for events...");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutting down...");
                    break;
                }
                maybe = streams.dm_events.recv() => match maybe {
                    Some(event) => self.handle_dm(event).await,
                    None => break,
                },
                maybe = streams.zap_events.recv() => match maybe {
                    Some(event) => self.handle_zap(event).await,
                    None => break,
                },
            }
        }

        self.pool.shutdown().await;
        Ok(())
    }

    async fn handle_dm(&self, event: Event) {
        debug!("received DM event: {} (kind:{})", event.id, event.kind.as_u32());
        let event_ts = event.created_at.as_u64() as i64;

        if let Err(e) = self.processor.on_event(ProcessorEvent::DmReceived) {
            warn!("processor refused DM event: {e}");
            self.processor.reset();
            return;
        }

        match self.claim(&event) {
            Ok(true) => {}
            Ok(false) => {
                debug!("duplicate event {}, skipping", event.id);
                self.finish(event_ts);
                return;
            }
            Err(e) => {
                error!("dedup check failed: {e}");
                self.processor.reset();
                return;
            }
        }

        let dm = match dm::decrypt_dm(&self.keys, &event) {
            Ok(dm) => dm,
            Err(e) => {
                warn!("failed to decrypt DM {}: {e}", event.id);
                self.finish(event_ts);
                return;
            }
        };

        let sender_npub = match dm.sender.to_bech32() {
            Ok(npub) => npub,
            Err(e) => {
                error!("failed to encode sender npub: {e}");
                self.finish(event_ts);
                return;
            }
        };
        info!("DM from {sender_npub}: {}", dm.content);

        if let Some(broadcast) = parse_broadcast(&dm.content) {
            self.handle_broadcast(&dm.sender, &sender_npub, &broadcast, dm.protocol)
                .await;
            self.finish(event_ts);
            return;
        }

        let Some(cmd) = commands::parse(&dm.content) else {
            debug!("empty message, ignoring");
            self.finish(event_ts);
            return;
        };

        if !cmd.is_valid() {
            debug!("unknown command: {}", cmd.name);
            self.send_dm(
                &dm.sender,
                &format!(
                    "Unknown command: {}. Send 'help' for available commands.",
                    cmd.name
                ),
                dm.protocol,
            )
            .await;
            self.finish(event_ts);
            return;
        }

        let permitted = self
            .db
            .conn()
            .and_then(|mut conn| commands::can_execute(&mut conn, &cmd, &sender_npub, &self.cfg.admins));
        match permitted {
            Ok(()) => {}
            Err(e) if e.is_permission_denied() => {
                info!("permission denied for {sender_npub}: {e}");
                self.send_dm(&dm.sender, &format!("Permission denied: {e}"), dm.protocol)
                    .await;
                self.finish(event_ts);
                return;
            }
            Err(e) => {
                error!("permission check failed: {e}");
                self.finish(event_ts);
                return;
            }
        }

        info!("executing command: {} {:?}", cmd.name, cmd.args);

        if let Err(e) = self.processor.on_event(ProcessorEvent::CommandProcessed) {
            warn!("processor refused command_processed: {e}");
            self.finish(event_ts);
            return;
        }

        match commands::execute(&self.db, &cmd, &sender_npub, &self.cfg).await {
            Err(e) => {
                if let Err(fsm_err) = self.processor.on_event(ProcessorEvent::Error) {
                    warn!("processor refused error event: {fsm_err}");
                }
                if e.is_infrastructure() {
                    // Never echo internal failures back over a DM.
                    error!("command {} failed: {e}", cmd.name);
                } else {
                    info!("command error: {e}");
                    self.send_dm(&dm.sender, &format!("Error: {e}"), dm.protocol).await;
                }
                self.finish(event_ts);
            }
            Ok(message) => {
                if let Err(e) = self.processor.on_event(ProcessorEvent::ResponseSent) {
                    warn!("processor refused response_sent: {e}");
                }
                debug!("command result: {message}");
                self.send_dm(&dm.sender, &message, dm.protocol).await;

                if cmd.name == "order" {
                    let summary = message.lines().next().unwrap_or_default();
                    self.notify_admins(&format!("📥 New order from {sender_npub}:\n{summary}"))
                        .await;
                }

                // Cancel and the inventory admin ops can raise availability.
                if cmd.name == "cancel" || cmd.name == "inventory" {
                    self.sweep_notifications().await;
                }

                self.finish(event_ts);
            }
        }
    }

    async fn handle_zap(&self, event: Event) {
        info!("received zap event: {} (kind:{})", event.id, event.kind.as_u32());
        let event_ts = event.created_at.as_u64() as i64;

        if let Err(e) = self.processor.on_event(ProcessorEvent::ZapReceived) {
            warn!("processor refused zap event: {e}");
            self.processor.reset();
            return;
        }

        match self.claim(&event) {
            Ok(true) => {}
            Ok(false) => {
                debug!("duplicate event {}, skipping", event.id);
                self.finish(event_ts);
                return;
            }
            Err(e) => {
                error!("dedup check failed: {e}");
                self.processor.reset();
                return;
            }
        }

        let zap = match zaps::validate_zap_receipt(&event, self.lnurl_pubkey.as_ref()) {
            Ok(zap) => zap,
            Err(e @ Error::UnauthorizedZapProvider { .. }) => {
                warn!("zap from unauthorized provider: {e}");
                self.finish(event_ts);
                return;
            }
            Err(e) => {
                warn!("invalid zap receipt: {e}");
                self.finish(event_ts);
                return;
            }
        };

        info!("valid zap: {} sats from {}", zap.amount_sats, zap.sender_npub);

        let outcome = self
            .db
            .conn()
            .and_then(|mut conn| zaps::process_zap(&mut conn, &zap));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(Error::DuplicateZap) => {
                // Expected on multi-relay delivery; nothing to undo.
                info!("duplicate zap event {}, ignoring", zap.zap_event_id);
                self.processor.reset();
                self.set_watermark(event_ts);
                return;
            }
            Err(e) => {
                error!("failed to process zap: {e}");
                if let Err(fsm_err) = self.processor.on_event(ProcessorEvent::Error) {
                    warn!("processor refused error event: {fsm_err}");
                }
                self.finish(event_ts);
                return;
            }
        };

        if let Err(e) = self.processor.on_event(ProcessorEvent::ResponseSent) {
            warn!("processor refused response_sent: {e}");
        }
        info!("zap processed: {}", outcome.message);

        // Confirmation goes out as a legacy DM; zappers may not run a
        // gift-wrap capable client.
        match PublicKey::from_bech32(&zap.sender_npub) {
            Ok(sender) => self.send_dm(&sender, &outcome.message, DmProtocol::Nip04).await,
            Err(e) => warn!("failed to decode zapper npub: {e}"),
        }

        self.notify_admins(&format!(
            "💰 Payment received from {}:\n{}",
            zap.sender_npub, outcome.message
        ))
        .await;

        self.finish(event_ts);
    }

    /// Claims the event in the processed-events table. False means some
    /// earlier delivery already handled it.
    fn claim(&self, event: &Event) -> crate::error::Result<bool> {
        let mut conn = self.db.conn()?;
        ProcessedEvent::try_process(
            &mut conn,
            &event.id.to_hex(),
            event.kind.as_u32() as i32,
            event.created_at.as_u64() as i64,
        )
    }

    /// Terminal bookkeeping for one event: FSM back to idle, watermark
    /// advanced.
    fn finish(&self, event_ts: i64) {
        self.processor.reset();
        self.set_watermark(event_ts);
    }

    fn set_watermark(&self, event_ts: i64) {
        match self.db.conn() {
            Ok(mut conn) => {
                if let Err(e) = models::set_high_water_mark(&mut conn, event_ts) {
                    error!("setting high water mark: {e}");
                }
            }
            Err(e) => error!("setting high water mark: {e}"),
        }
    }

    async fn handle_broadcast(
        &self,
        sender: &PublicKey,
        sender_npub: &str,
        message: &str,
        protocol: DmProtocol,
    ) {
        if !commands::is_admin(sender_npub, &self.cfg.admins) {
            self.send_dm(
                sender,
                "Permission denied: broadcast requires admin privileges",
                protocol,
            )
            .await;
            return;
        }

        if message.is_empty() {
            self.send_dm(sender, "Usage: message customers: <your message>", protocol)
                .await;
            return;
        }

        info!("admin {sender_npub} broadcasting: {message}");
        let (sent, failed) = self.broadcast_to_customers(message).await;

        let mut summary = format!("Broadcast sent to {sent} customers");
        if failed > 0 {
            summary.push_str(&format!(" ({failed} failed)"));
        }
        self.send_dm(sender, &summary, protocol).await;
    }

    async fn broadcast_to_customers(&self, message: &str) -> (usize, usize) {
        let customers = match self.db.conn().and_then(|mut conn| Customer::list(&mut conn)) {
            Ok(customers) => customers,
            Err(e) => {
                error!("failed to list customers for broadcast: {e}");
                return (0, 0);
            }
        };

        let mut sent = 0;
        let mut failed = 0;
        for customer in customers {
            match PublicKey::from_bech32(&customer.npub) {
                Ok(pk) => {
                    self.send_dm(&pk, message, DmProtocol::Nip04).await;
                    sent += 1;
                }
                Err(e) => {
                    warn!("failed to decode customer npub {}: {e}", customer.npub);
                    failed += 1;
                }
            }
        }
        (sent, failed)
    }

    async fn notify_admins(&self, message: &str) {
        for admin in &self.cfg.admins {
            match PublicKey::from_bech32(admin) {
                Ok(pk) => self.send_dm(&pk, message, DmProtocol::Nip04).await,
                Err(e) => warn!("failed to decode admin npub {admin}: {e}"),
            }
        }
    }

    /// Fires one-shot restock alerts. Subscriptions are deleted after
    /// the first send attempt, delivered or not.
    async fn sweep_notifications(&self) {
        let triggered = {
            let mut conn = match self.db.conn() {
                Ok(conn) => conn,
                Err(e) => {
                    error!("failed to check inventory notifications: {e}");
                    return;
                }
            };

            let available = match Inventory::get(&mut conn) {
                Ok(n) => n,
                Err(e) => {
                    error!("failed to get inventory for notifications: {e}");
                    return;
                }
            };
            if available == 0 {
                return;
            }

            match Notification::triggered(&mut conn, available) {
                Ok(rows) => (available, rows),
                Err(e) => {
                    error!("failed to get triggered notifications: {e}");
                    return;
                }
            }
        };

        let (available, rows) = triggered;
        for (notification, npub) in rows {
            match PublicKey::from_bech32(&npub) {
                Ok(pk) => {
                    let msg =
                        format!("🥚 Inventory alert: {available} eggs are now available!");
                    self.send_dm(&pk, &msg, DmProtocol::Nip04).await;
                }
                Err(e) => warn!("failed to decode customer npub {npub}: {e}"),
            }

            match self.db.conn() {
                Ok(mut conn) => {
                    if let Err(e) = Notification::delete_by_id(&mut conn, notification.id) {
                        error!("failed to delete notification {}: {e}", notification.id);
                    } else {
                        info!(
                            "sent inventory notification to {npub} (threshold: {})",
                            notification.threshold_eggs
                        );
                    }
                }
                Err(e) => error!("failed to delete notification {}: {e}", notification.id),
            }
        }
    }

    /// Wraps the message in the given protocol and publishes it. Send
    /// failures are logged, never propagated; replies are best-effort.
    async fn send_dm(&self, recipient: &PublicKey, message: &str, protocol: DmProtocol) {
        let wrapped = match dm::encrypt_dm(&self.keys, recipient, message, protocol) {
            Ok(event) => event,
            Err(e) => {
                error!("failed to wrap response: {e}");
                return;
            }
        };

        match self.pool.publish(wrapped).await {
            Ok(_) => {
                if let Ok(npub) = recipient.to_bech32() {
                    debug!("sent response to {npub}");
                }
            }
            Err(e) => error!("failed to publish response: {e}"),
        }
    }
}

/// Checks for the admin broadcast syntax and extracts the payload.
fn parse_broadcast(content: &str) -> Option<String> {
    let stripped = commands::strip_markdown_comments(content);
    let trimmed = stripped.trim();
    if !trimmed.to_lowercase().starts_with(BROADCAST_PREFIX) {
        return None;
    }
    Some(trimmed[BROADCAST_PREFIX.len()..].trim().to_string())
}
