//! Encrypt/decrypt direct messages in the two wire formats customers
//! actually use: legacy NIP-04 (kind 4, shared-secret ciphertext) and
//! NIP-17 gift wrap (kind 1059, rumor sealed under ephemeral keys).
//! Replies must go out in the same format the request came in, so the
//! decrypt path reports which one it saw.

use nostr::nips::nip04;
use nostr::nips::nip59::{self, UnwrappedGift};
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Tag};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmProtocol {
    /// Legacy encrypted DM, kind 4.
    Nip04,
    /// Gift-wrapped DM, kind 1059.
    Nip17,
}

/// A decrypted inbound DM. `sender` is the real author: for gift wraps
/// that is the rumor's pubkey, never the ephemeral wrapper key.
#[derive(Debug, Clone)]
pub struct IncomingDm {
    pub sender: PublicKey,
    pub content: String,
    pub protocol: DmProtocol,
}

pub fn decrypt_dm(keys: &Keys, event: &Event) -> Result<IncomingDm> {
    match event.kind {
        Kind::EncryptedDirectMessage => {
            let secret_key = keys
                .secret_key()
                .map_err(|e| Error::Dm(format!("no secret key: {e}")))?;
            let content = nip04::decrypt(secret_key, &event.pubkey, &event.content)
                .map_err(|e| Error::Dm(format!("nip04 decrypt: {e}")))?;
            Ok(IncomingDm {
                sender: event.pubkey,
                content,
                protocol: DmProtocol::Nip04,
            })
        }
        Kind::GiftWrap => {
            let UnwrappedGift { rumor, .. } = nip59::extract_rumor(keys, event)
                .map_err(|e| Error::Dm(format!("gift unwrap: {e}")))?;
            if rumor.kind != Kind::SealedDirect {
                return Err(Error::Dm(format!(
                    "unexpected rumor kind: {}",
                    rumor.kind.as_u32()
                )));
            }
            Ok(IncomingDm {
                sender: rumor.pubkey,
                content: rumor.content,
                protocol: DmProtocol::Nip17,
            })
        }
        kind => Err(Error::Dm(format!("unexpected DM kind: {}", kind.as_u32()))),
    }
}

/// Builds a ready-to-publish reply in the requested format. Both carry
/// a single `p` tag with the recipient.
pub fn encrypt_dm(
    keys: &Keys,
    recipient: &PublicKey,
    message: &str,
    protocol: DmProtocol,
) -> Result<Event> {
    match protocol {
        DmProtocol::Nip04 => {
            let secret_key = keys
                .secret_key()
                .map_err(|e| Error::Dm(format!("no secret key: {e}")))?;
            let ciphertext = nip04::encrypt(secret_key, recipient, message)
                .map_err(|e| Error::Dm(format!("nip04 encrypt: {e}")))?;
            let event = EventBuilder::new(
                Kind::EncryptedDirectMessage,
                ciphertext,
                [Tag::public_key(*recipient)],
            )
            .to_event(keys)?;
            Ok(event)
        }
        DmProtocol::Nip17 => {
            let rumor = EventBuilder::new(
                Kind::SealedDirect,
                message,
                [Tag::public_key(*recipient)],
            )
            .to_unsigned_event(keys.public_key());
            let wrapped = EventBuilder::gift_wrap(keys, recipient, rumor, None)
                .map_err(|e| Error::Dm(format!("gift wrap: {e}")))?;
            Ok(wrapped)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nip04_round_trip() {
        let bot = Keys::generate();
        let customer = Keys::generate();

        let event = encrypt_dm(&customer, &bot.public_key(), "order 6", DmProtocol::Nip04).unwrap();
        assert_eq!(event.kind, Kind::EncryptedDirectMessage);
        assert_ne!(event.content, "order 6", "content must be ciphertext");

        let dm = decrypt_dm(&bot, &event).unwrap();
        assert_eq!(dm.content, "order 6");
        assert_eq!(dm.sender, customer.public_key());
        assert_eq!(dm.protocol, DmProtocol::Nip04);
    }

    #[test]
    fn gift_wrap_round_trip_preserves_rumor_sender() {
        let bot = Keys::generate();
        let customer = Keys::generate();

        let event = encrypt_dm(&customer, &bot.public_key(), "balance", DmProtocol::Nip17).unwrap();
        assert_eq!(event.kind, Kind::GiftWrap);
        // The outer event is signed by a throwaway key, not the author.
        assert_ne!(event.pubkey, customer.public_key());

        let dm = decrypt_dm(&bot, &event).unwrap();
        assert_eq!(dm.content, "balance");
        assert_eq!(dm.sender, customer.public_key());
        assert_eq!(dm.protocol, DmProtocol::Nip17);
    }

    #[test]
    fn reply_protocol_matches_request() {
        let bot = Keys::generate();
        let customer = Keys::generate();

        for protocol in [DmProtocol::Nip04, DmProtocol::Nip17] {
            let inbound =
                encrypt_dm(&customer, &bot.public_key(), "inventory", protocol).unwrap();
            let dm = decrypt_dm(&bot, &inbound).unwrap();
            let reply = encrypt_dm(&bot, &dm.sender, "24 eggs available.", dm.protocol).unwrap();
            assert_eq!(reply.kind, inbound.kind);
        }
    }

    #[test]
    fn unexpected_kind_is_rejected() {
        let bot = Keys::generate();
        let note = EventBuilder::text_note("hello", []).to_event(&bot).unwrap();
        assert!(decrypt_dm(&bot, &note).is_err());
    }
}
