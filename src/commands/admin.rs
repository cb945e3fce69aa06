//! Admin-only commands: delivery, manual payment state, ledger
//! adjustments, and customer management.

use crate::commands::{parse_npub, shorten_npub, ExecuteConfig};
use crate::error::{Error, Result};
use crate::fsm::OrderState;
use crate::models::{Customer, Db, Order, Payment};

/// Fulfills a single paid order. Inventory is untouched; the
/// reservation at order time already accounted for it.
pub fn deliver_cmd(db: &Db, args: &[String]) -> Result<String> {
    let order_id = args
        .first()
        .ok_or_else(|| Error::Usage("usage: deliver <order_id>".into()))?
        .parse::<i64>()
        .map_err(|_| Error::Usage("order_id must be a number".into()))?;

    let mut conn = db.conn()?;
    let order = Order::get_by_id(&mut conn, order_id)?;

    if order.state() != OrderState::Paid {
        return Err(Error::InvalidStateTransition(format!(
            "order {} is {}, only paid orders can be delivered",
            order_id, order.status
        )));
    }

    Order::fulfill(&mut conn, order_id)?;
    Ok(format!("Order {} delivered ({} eggs).", order_id, order.quantity))
}

/// Marks a pending order paid, for out-of-band payments.
pub fn markpaid_cmd(db: &Db, args: &[String]) -> Result<String> {
    let order_id = args
        .first()
        .ok_or_else(|| Error::Usage("usage: markpaid <order_id>".into()))?
        .parse::<i64>()
        .map_err(|_| Error::Usage("order_id must be a number".into()))?;

    let mut conn = db.conn()?;
    Order::update_status(&mut conn, order_id, OrderState::Paid)?;
    Ok(format!("Order {order_id} marked as paid."))
}

/// Records a balance adjustment (positive or negative) with a synthetic
/// zap event id.
pub fn adjust_cmd(db: &Db, args: &[String]) -> Result<String> {
    if args.len() < 2 {
        return Err(Error::Usage("usage: adjust <npub> <sats>".into()));
    }

    let npub = parse_npub(&args[0])?;
    let amount = args[1]
        .parse::<i64>()
        .map_err(|_| Error::BadAmount("amount must be a number (can be negative)".into()))?;

    let mut conn = db.conn()?;
    Customer::get_by_npub(&mut conn, &npub)?;

    let event_id = format!("adjust-{amount}");
    Payment::record(&mut conn, None, &event_id, amount, &npub)?;

    if amount >= 0 {
        Ok(format!("Added {} sats to {}", amount, shorten_npub(&npub)))
    } else {
        Ok(format!("Deducted {} sats from {}", -amount, shorten_npub(&npub)))
    }
}

pub fn orders_cmd(db: &Db) -> Result<String> {
    let mut conn = db.conn()?;
    let orders = Order::list_with_customers(&mut conn, 25)?;

    if orders.is_empty() {
        return Ok("No orders yet.".to_string());
    }

    let mut msg = String::from("Recent orders:\n");
    for o in orders {
        msg.push_str(&format!(
            "• #{}: {} - {} eggs, {} sats ({})\n",
            o.id,
            shorten_npub(&o.customer_npub),
            o.quantity,
            o.total_sats,
            o.status
        ));
    }
    Ok(msg)
}

pub fn customers_cmd(db: &Db) -> Result<String> {
    let mut conn = db.conn()?;
    let customers = Customer::list(&mut conn)?;

    if customers.is_empty() {
        return Ok("No registered customers.".to_string());
    }

    let mut msg = format!("{} registered customers:\n", customers.len());
    for c in customers {
        let name = match c.name.as_deref() {
            Some(n) if !n.is_empty() => format!(" ({n})"),
            _ => String::new(),
        };
        msg.push_str(&format!("• {}{}\n", shorten_npub(&c.npub), name));
    }
    Ok(msg)
}

pub fn add_customer_cmd(db: &Db, args: &[String]) -> Result<String> {
    let npub = parse_npub(
        args.first()
            .ok_or_else(|| Error::Usage("usage: addcustomer <npub>".into()))?,
    )?;

    let mut conn = db.conn()?;
    match Customer::create(&mut conn, &npub) {
        Ok(_) => Ok(format!("Registered customer {}", shorten_npub(&npub))),
        Err(Error::CustomerExists) => Ok("Customer already registered.".to_string()),
        Err(e) => Err(e),
    }
}

pub fn remove_customer_cmd(db: &Db, args: &[String]) -> Result<String> {
    let npub = parse_npub(
        args.first()
            .ok_or_else(|| Error::Usage("usage: removecustomer <npub>".into()))?,
    )?;

    let mut conn = db.conn()?;
    Customer::remove(&mut conn, &npub)?;
    Ok(format!("Removed customer {}", shorten_npub(&npub)))
}

pub fn sales_cmd(db: &Db) -> Result<String> {
    let mut conn = db.conn()?;
    let total = Payment::total_sales(&mut conn)?;
    Ok(format!("Total sales: {total} sats"))
}

/// Creates an order on a customer's behalf. Same rules as a customer
/// `order`: quantity 6 or 12, no prior pending order, atomic reserve.
pub fn sell_cmd(db: &Db, args: &[String], cfg: &ExecuteConfig) -> Result<String> {
    if args.len() < 2 {
        return Err(Error::Usage("usage: sell <npub> <quantity>".into()));
    }

    let npub = parse_npub(&args[0])?;
    let quantity = match args[1].parse::<i32>() {
        Ok(q) if q == 6 || q == 12 => q,
        _ => return Err(Error::BadQuantity("quantity must be 6 or 12".into())),
    };

    let mut conn = db.conn()?;
    let customer = Customer::get_by_npub(&mut conn, &npub)?;

    let pending = Order::pending_for_customer(&mut conn, customer.id)?;
    if !pending.is_empty() {
        return Err(Error::PendingOrderExists(pending.len()));
    }

    let total_sats = (quantity as i64 / 6) * cfg.sats_per_half_dozen;
    let order = Order::create(&mut conn, customer.id, quantity, total_sats)?;

    Ok(format!(
        "Order {} created for {}: {} eggs reserved for {} sats.",
        order.id,
        shorten_npub(&npub),
        quantity,
        total_sats
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Inventory;
    use nostr::nips::nip19::ToBech32;

    fn gen_npub() -> String {
        nostr::Keys::generate().public_key().to_bech32().unwrap()
    }

    fn test_cfg() -> ExecuteConfig {
        ExecuteConfig {
            sats_per_half_dozen: 3200,
            admins: vec![gen_npub()],
            lightning_address: None,
            bot_npub: String::new(),
            lnurl: None,
        }
    }

    fn seeded_db(eggs: i32) -> (Db, String) {
        let db = Db::open_in_memory().unwrap();
        let npub = gen_npub();
        let mut conn = db.conn().unwrap();
        Inventory::set(&mut conn, eggs).unwrap();
        Customer::create(&mut conn, &npub).unwrap();
        drop(conn);
        (db, npub)
    }

    #[test]
    fn sell_then_markpaid_then_deliver() {
        let (db, npub) = seeded_db(30);
        let cfg = test_cfg();

        let args = vec![npub, "6".to_string()];
        let msg = sell_cmd(&db, &args, &cfg).unwrap();
        assert!(msg.contains("6 eggs reserved for 3200 sats"));

        // Delivering an unpaid order is refused.
        let deliver_args = vec!["1".to_string()];
        let err = deliver_cmd(&db, &deliver_args).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition(_)));

        let msg = markpaid_cmd(&db, &deliver_args).unwrap();
        assert_eq!(msg, "Order 1 marked as paid.");

        let msg = deliver_cmd(&db, &deliver_args).unwrap();
        assert_eq!(msg, "Order 1 delivered (6 eggs).");

        // Inventory stays where the reservation left it.
        let mut conn = db.conn().unwrap();
        assert_eq!(Inventory::get(&mut conn).unwrap(), 24);
    }

    #[test]
    fn markpaid_requires_pending() {
        let (db, npub) = seeded_db(30);
        let cfg = test_cfg();
        sell_cmd(&db, &[npub, "6".to_string()], &cfg).unwrap();
        markpaid_cmd(&db, &["1".to_string()]).unwrap();

        assert!(matches!(
            markpaid_cmd(&db, &["1".to_string()]),
            Err(Error::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn deliver_missing_order() {
        let (db, _) = seeded_db(30);
        assert!(matches!(
            deliver_cmd(&db, &["42".to_string()]),
            Err(Error::OrderNotFound(42))
        ));
    }

    #[test]
    fn adjust_records_signed_amounts() {
        let (db, npub) = seeded_db(0);

        let args = vec![npub.clone(), "500".to_string()];
        let msg = adjust_cmd(&db, &args).unwrap();
        assert!(msg.starts_with("Added 500 sats to npub1"));

        let args = vec![npub.clone(), "-200".to_string()];
        let msg = adjust_cmd(&db, &args).unwrap();
        assert!(msg.starts_with("Deducted 200 sats from npub1"));

        let mut conn = db.conn().unwrap();
        assert_eq!(Payment::balance(&mut conn, &npub).unwrap(), 300);
    }

    #[test]
    fn adjust_rejects_unknown_customer_and_bad_npub() {
        let (db, _) = seeded_db(0);

        let args = vec![gen_npub(), "100".to_string()];
        assert!(matches!(adjust_cmd(&db, &args), Err(Error::CustomerNotFound)));

        let args = vec!["garbage".to_string(), "100".to_string()];
        assert!(matches!(adjust_cmd(&db, &args), Err(Error::InvalidNpub)));
    }

    #[test]
    fn add_and_remove_customer() {
        let db = Db::open_in_memory().unwrap();

        let args = vec![gen_npub()];
        let msg = add_customer_cmd(&db, &args).unwrap();
        assert!(msg.starts_with("Registered customer"));

        // Re-adding is reported, not an error.
        let msg = add_customer_cmd(&db, &args).unwrap();
        assert_eq!(msg, "Customer already registered.");

        let msg = remove_customer_cmd(&db, &args).unwrap();
        assert!(msg.starts_with("Removed customer"));
        assert!(matches!(
            remove_customer_cmd(&db, &args),
            Err(Error::CustomerNotFound)
        ));
    }

    #[test]
    fn sales_and_orders_listing() {
        let (db, npub) = seeded_db(30);
        let cfg = test_cfg();

        assert_eq!(sales_cmd(&db).unwrap(), "Total sales: 0 sats");
        assert_eq!(orders_cmd(&db).unwrap(), "No orders yet.");

        sell_cmd(&db, &[npub, "12".to_string()], &cfg).unwrap();
        markpaid_cmd(&db, &["1".to_string()]).unwrap();
        deliver_cmd(&db, &["1".to_string()]).unwrap();

        assert_eq!(sales_cmd(&db).unwrap(), "Total sales: 6400 sats");

        let listing = orders_cmd(&db).unwrap();
        assert!(listing.contains("12 eggs, 6400 sats (fulfilled)"));
    }

    #[test]
    fn customers_listing() {
        let (db, _) = seeded_db(0);
        let listing = customers_cmd(&db).unwrap();
        assert!(listing.starts_with("1 registered customers:"));
        assert!(listing.contains("npub1"));
    }
}
