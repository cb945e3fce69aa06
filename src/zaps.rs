//! NIP-57 zap receipt validation and payment application.

use log::info;
use nostr::nips::nip19::ToBech32;
use nostr::{Event, JsonUtil, Kind, PublicKey};

use crate::error::{Error, Result};
use crate::fsm::OrderState;
use crate::models::{Customer, Order, Payment};

/// Payment info extracted from a valid zap receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedZap {
    pub sender_npub: String,
    pub amount_sats: i64,
    pub zap_event_id: String,
}

/// Validates a zap receipt and extracts the payer and amount.
///
/// Checks, in order: event kind and signature; the configured LNURL
/// provider key if any; the embedded zap request in the `description`
/// tag (its pubkey is the payer); the amount from the `bolt11` tag.
pub fn validate_zap_receipt(
    event: &Event,
    lnurl_pubkey: Option<&PublicKey>,
) -> Result<ValidatedZap> {
    if event.kind != Kind::ZapReceipt {
        return Err(Error::InvalidZapReceipt(format!(
            "expected kind {}, got {}",
            Kind::ZapReceipt.as_u32(),
            event.kind.as_u32()
        )));
    }

    event
        .verify()
        .map_err(|_| Error::InvalidZapReceipt("invalid signature".into()))?;

    if let Some(expected) = lnurl_pubkey {
        if event.pubkey != *expected {
            return Err(Error::UnauthorizedZapProvider {
                expected: expected.to_bech32()?,
                got: event.pubkey.to_bech32()?,
            });
        }
    }

    let description = tag_value(event, "description")
        .ok_or_else(|| Error::InvalidZapReceipt("missing description tag".into()))?;

    let zap_request = Event::from_json(&description)
        .map_err(|e| Error::InvalidZapReceipt(format!("invalid zap request JSON: {e}")))?;

    if zap_request.kind != Kind::ZapRequest {
        return Err(Error::InvalidZapReceipt(format!(
            "zap request kind is {}, expected {}",
            zap_request.kind.as_u32(),
            Kind::ZapRequest.as_u32()
        )));
    }

    let bolt11 = tag_value(event, "bolt11")
        .ok_or_else(|| Error::InvalidZapReceipt("missing bolt11 tag".into()))?;

    let amount_msats = amount_msats_from_bolt11(&bolt11).map_err(Error::InvalidZapReceipt)?;
    let amount_sats = amount_msats / 1000;

    Ok(ValidatedZap {
        sender_npub: zap_request.pubkey.to_bech32()?,
        amount_sats,
        zap_event_id: event.id.to_hex(),
    })
}

fn tag_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|t| {
        let v = t.as_vec();
        if v.len() >= 2 && v[0] == name {
            Some(v[1].clone())
        } else {
            None
        }
    })
}

/// Extracts the amount in millisats from a bolt11 invoice's HRP.
///
/// Format: `ln<network><amount>[multiplier]1<data>`. The bech32 data
/// alphabet excludes `1`, so the last `1` is the HRP/data separator.
/// Multipliers scale BTC: m = 1e-3, u = 1e-6, n = 1e-9, p = 1e-12.
fn amount_msats_from_bolt11(invoice: &str) -> std::result::Result<i64, String> {
    let invoice = invoice.to_lowercase();

    let amount_start = if invoice.starts_with("lnbcrt") {
        6
    } else if invoice.starts_with("lnbc") || invoice.starts_with("lntb") {
        4
    } else {
        return Err("unrecognized invoice prefix".into());
    };

    let sep = invoice
        .rfind('1')
        .filter(|&i| i > amount_start)
        .ok_or_else(|| "invalid invoice format: no separator found".to_string())?;

    let amount_part = &invoice[amount_start..sep];
    if amount_part.is_empty() {
        return Err("no amount in invoice".into());
    }

    let last = amount_part.as_bytes()[amount_part.len() - 1];
    let (digits, multiplier) = if last.is_ascii_digit() {
        // No multiplier letter: the amount is whole BTC.
        (amount_part, 100_000_000_000i64)
    } else {
        let digits = &amount_part[..amount_part.len() - 1];
        let multiplier = match last {
            b'm' => 100_000_000,
            b'u' => 100_000,
            b'n' => 100,
            b'p' => 0, // tenths of a msat truncate to zero
            other => return Err(format!("unknown multiplier: {}", other as char)),
        };
        (digits, multiplier)
    };

    let amount = digits
        .parse::<i64>()
        .map_err(|e| format!("invalid amount number: {e}"))?;

    Ok(amount * multiplier)
}

/// Outcome of applying a validated zap to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapOutcome {
    pub customer_found: bool,
    pub amount_sats: i64,
    pub message: String,
}

/// Credits a validated zap. Only registered customers are credited;
/// a replayed receipt surfaces as `DuplicateZap` from the UNIQUE
/// constraint. When the resulting balance covers the sender's oldest
/// pending order, that single order is marked paid.
pub fn process_zap(conn: &mut diesel::SqliteConnection, zap: &ValidatedZap) -> Result<ZapOutcome> {
    let customer = match Customer::get_by_npub(conn, &zap.sender_npub) {
        Ok(c) => c,
        Err(Error::CustomerNotFound) => {
            let npub = &zap.sender_npub;
            return Ok(ZapOutcome {
                customer_found: false,
                amount_sats: zap.amount_sats,
                message: format!(
                    "Zap received from unknown sender {}...{} ({} sats) - not credited",
                    &npub[..12],
                    &npub[npub.len() - 4..],
                    zap.amount_sats
                ),
            });
        }
        Err(e) => return Err(e),
    };

    Payment::record(conn, None, &zap.zap_event_id, zap.amount_sats, &zap.sender_npub)?;

    let oldest = Order::oldest_pending_for_customer(conn, customer.id)?;
    let Some(order) = oldest else {
        return Ok(ZapOutcome {
            customer_found: true,
            amount_sats: zap.amount_sats,
            message: format!("Credited {} sats", zap.amount_sats),
        });
    };

    let balance = Payment::balance(conn, &zap.sender_npub)?;
    if balance >= order.total_sats {
        if Order::update_status(conn, order.id, OrderState::Paid).is_ok() {
            info!("order {} marked paid by zap {}", order.id, zap.zap_event_id);
            return Ok(ZapOutcome {
                customer_found: true,
                amount_sats: zap.amount_sats,
                message: format!(
                    "Credited {} sats - order #{} marked as paid!",
                    zap.amount_sats, order.id
                ),
            });
        }
    }

    Ok(ZapOutcome {
        customer_found: true,
        amount_sats: zap.amount_sats,
        message: format!(
            "Credited {} sats (balance: {}, order needs {})",
            zap.amount_sats, balance, order.total_sats
        ),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Db, Inventory};
    use nostr::{EventBuilder, Keys, Tag};

    #[test]
    fn bolt11_amounts() {
        // 3200 sats = 32000n on mainnet.
        assert_eq!(amount_msats_from_bolt11("lnbc32000n1pjqdata"), Ok(3_200_000));
        // 2.5 mBTC = 250_000 sats.
        assert_eq!(
            amount_msats_from_bolt11("lnbc2500m1pjqdata"),
            Ok(250_000_000_000)
        );
        // Micro-BTC, testnet and regtest prefixes.
        assert_eq!(amount_msats_from_bolt11("lntb20u1pjqdata"), Ok(2_000_000));
        assert_eq!(amount_msats_from_bolt11("lnbcrt5u1pjqdata"), Ok(500_000));
        // Whole BTC when no multiplier letter.
        assert_eq!(
            amount_msats_from_bolt11("lnbc11pjqdata"),
            Ok(100_000_000_000)
        );
        // Pico truncates to zero msats.
        assert_eq!(amount_msats_from_bolt11("lnbc900p1pjqdata"), Ok(0));
        // Uppercase input is normalized.
        assert_eq!(amount_msats_from_bolt11("LNBC32000N1PJQDATA"), Ok(3_200_000));
    }

    #[test]
    fn bolt11_rejects_malformed() {
        assert!(amount_msats_from_bolt11("xxbc1000n1pjq").is_err());
        assert!(amount_msats_from_bolt11("lnbc1").is_err());
        assert!(amount_msats_from_bolt11("lnbc").is_err());
        assert!(amount_msats_from_bolt11("lnbc12x1pjqdata").is_err());
    }

    fn zap_request_json(sender: &Keys) -> String {
        let request = EventBuilder::new(Kind::ZapRequest, "", [])
            .to_event(sender)
            .unwrap();
        request.as_json()
    }

    fn zap_receipt(provider: &Keys, sender: &Keys, bolt11: &str) -> Event {
        let tags = [
            Tag::parse(vec!["description".to_string(), zap_request_json(sender)]).unwrap(),
            Tag::parse(vec!["bolt11".to_string(), bolt11.to_string()]).unwrap(),
        ];
        EventBuilder::new(Kind::ZapReceipt, "", tags)
            .to_event(provider)
            .unwrap()
    }

    #[test]
    fn validate_extracts_sender_and_amount() {
        let provider = Keys::generate();
        let sender = Keys::generate();
        let receipt = zap_receipt(&provider, &sender, "lnbc35000n1pjqdata");

        let zap = validate_zap_receipt(&receipt, None).unwrap();
        assert_eq!(zap.amount_sats, 3500);
        assert_eq!(zap.sender_npub, sender.public_key().to_bech32().unwrap());
        assert_eq!(zap.zap_event_id, receipt.id.to_hex());
    }

    #[test]
    fn validate_rejects_wrong_kind() {
        let keys = Keys::generate();
        let note = EventBuilder::text_note("hi", []).to_event(&keys).unwrap();
        assert!(matches!(
            validate_zap_receipt(&note, None),
            Err(Error::InvalidZapReceipt(_))
        ));
    }

    #[test]
    fn validate_enforces_provider_key() {
        let provider = Keys::generate();
        let sender = Keys::generate();
        let receipt = zap_receipt(&provider, &sender, "lnbc32000n1pjqdata");

        // Matching provider passes.
        assert!(validate_zap_receipt(&receipt, Some(&provider.public_key())).is_ok());

        // A different configured provider fails.
        let other = Keys::generate();
        assert!(matches!(
            validate_zap_receipt(&receipt, Some(&other.public_key())),
            Err(Error::UnauthorizedZapProvider { .. })
        ));
    }

    #[test]
    fn validate_requires_description_and_bolt11() {
        let provider = Keys::generate();
        let sender = Keys::generate();

        let no_desc = EventBuilder::new(
            Kind::ZapReceipt,
            "",
            [Tag::parse(vec!["bolt11".to_string(), "lnbc32000n1pjqdata".to_string()]).unwrap()],
        )
        .to_event(&provider)
        .unwrap();
        assert!(matches!(
            validate_zap_receipt(&no_desc, None),
            Err(Error::InvalidZapReceipt(_))
        ));

        let no_bolt11 = EventBuilder::new(
            Kind::ZapReceipt,
            "",
            [Tag::parse(vec!["description".to_string(), zap_request_json(&sender)]).unwrap()],
        )
        .to_event(&provider)
        .unwrap();
        assert!(matches!(
            validate_zap_receipt(&no_bolt11, None),
            Err(Error::InvalidZapReceipt(_))
        ));
    }

    fn seeded(npub: &str, eggs: i32) -> Db {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        Inventory::set(&mut conn, eggs).unwrap();
        Customer::create(&mut conn, npub).unwrap();
        db
    }

    fn valid_zap(npub: &str, sats: i64, id: &str) -> ValidatedZap {
        ValidatedZap {
            sender_npub: npub.to_string(),
            amount_sats: sats,
            zap_event_id: id.to_string(),
        }
    }

    const NPUB: &str = "npub1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqsp5dnd";

    #[test]
    fn zap_marks_oldest_pending_order_paid() {
        let db = seeded(NPUB, 30);
        let mut conn = db.conn().unwrap();
        let customer = Customer::get_by_npub(&mut conn, NPUB).unwrap();
        let order = Order::create(&mut conn, customer.id, 6, 3200).unwrap();

        let outcome = process_zap(&mut conn, &valid_zap(NPUB, 3500, "zap-1")).unwrap();
        assert!(outcome.customer_found);
        assert_eq!(
            outcome.message,
            format!("Credited 3500 sats - order #{} marked as paid!", order.id)
        );
        assert_eq!(
            Order::get_by_id(&mut conn, order.id).unwrap().state(),
            OrderState::Paid
        );
    }

    #[test]
    fn zap_below_price_credits_without_paying() {
        let db = seeded(NPUB, 30);
        let mut conn = db.conn().unwrap();
        let customer = Customer::get_by_npub(&mut conn, NPUB).unwrap();
        let order = Order::create(&mut conn, customer.id, 6, 3200).unwrap();

        let outcome = process_zap(&mut conn, &valid_zap(NPUB, 1000, "zap-1")).unwrap();
        assert_eq!(outcome.message, "Credited 1000 sats (balance: 1000, order needs 3200)");
        assert_eq!(
            Order::get_by_id(&mut conn, order.id).unwrap().state(),
            OrderState::Pending
        );

        // A second zap tops the balance over the price and clears it.
        let outcome = process_zap(&mut conn, &valid_zap(NPUB, 2500, "zap-2")).unwrap();
        assert!(outcome.message.ends_with("marked as paid!"));
    }

    #[test]
    fn zap_replay_is_duplicate() {
        let db = seeded(NPUB, 30);
        let mut conn = db.conn().unwrap();

        process_zap(&mut conn, &valid_zap(NPUB, 3500, "zap-1")).unwrap();
        let err = process_zap(&mut conn, &valid_zap(NPUB, 3500, "zap-1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateZap));
        assert_eq!(Payment::balance(&mut conn, NPUB).unwrap(), 3500);
    }

    #[test]
    fn zap_from_unknown_sender_not_credited() {
        let db = seeded(NPUB, 30);
        let mut conn = db.conn().unwrap();

        let stranger = "npub1zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzs9janc";
        let outcome = process_zap(&mut conn, &valid_zap(stranger, 4200, "zap-9")).unwrap();
        assert!(!outcome.customer_found);
        assert!(outcome.message.contains("not credited"));
        assert_eq!(Payment::balance(&mut conn, stranger).unwrap(), 0);
    }

    #[test]
    fn zap_clears_only_one_order() {
        let db = seeded(NPUB, 30);
        let mut conn = db.conn().unwrap();
        let customer = Customer::get_by_npub(&mut conn, NPUB).unwrap();
        let first = Order::create(&mut conn, customer.id, 6, 3200).unwrap();
        let second = Order::create(&mut conn, customer.id, 6, 3200).unwrap();

        // Covers both, but only the oldest is applied.
        let outcome = process_zap(&mut conn, &valid_zap(NPUB, 10_000, "zap-1")).unwrap();
        assert!(outcome.message.contains(&format!("order #{}", first.id)));
        assert_eq!(
            Order::get_by_id(&mut conn, second.id).unwrap().state(),
            OrderState::Pending
        );
    }
}
