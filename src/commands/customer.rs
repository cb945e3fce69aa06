//! Commands available to registered customers. `inventory` doubles as
//! an admin command through its `add`/`set` subcommands.

use log::warn;

use crate::commands::ExecuteConfig;
use crate::error::{Error, Result};
use crate::models::{Customer, Db, Inventory, Notification, Order, Payment};

pub fn inventory_cmd(db: &Db, args: &[String], is_admin: bool) -> Result<String> {
    if args.is_empty() {
        return show_inventory(db, is_admin);
    }

    match args[0].as_str() {
        "add" => {
            if !is_admin {
                return Err(Error::AdminRequired);
            }
            inventory_add(db, &args[1..])
        }
        "set" => {
            if !is_admin {
                return Err(Error::AdminRequired);
            }
            inventory_set(db, &args[1..])
        }
        other => {
            // Customers poking at subcommands just get the count back.
            if is_admin {
                return Err(Error::Usage(format!(
                    "unknown subcommand: {other} (use add or set)"
                )));
            }
            show_inventory(db, false)
        }
    }
}

fn show_inventory(db: &Db, is_admin: bool) -> Result<String> {
    let mut conn = db.conn()?;
    let available = Inventory::get(&mut conn)?;

    if !is_admin {
        return Ok(match available {
            0 => "No eggs available. Check back later!".to_string(),
            1 => "1 egg available.".to_string(),
            n => format!("{n} eggs available."),
        });
    }

    let reserved = Inventory::reserved(&mut conn)?;
    let sold = Inventory::sold(&mut conn)?;
    let on_hand = available as i64 + reserved + sold;

    Ok(format!(
        "Available: {available:3} eggs (can be sold)\n\
         Reserved:  {reserved:3} eggs (pending payment)\n\
         Sold:      {sold:3} eggs (awaiting delivery)\n\
         ---\n\
         On-hand:   {on_hand:3} eggs (total in storage)"
    ))
}

fn inventory_add(db: &Db, args: &[String]) -> Result<String> {
    let quantity = args
        .first()
        .ok_or_else(|| Error::Usage("usage: inventory add <quantity>".into()))?
        .parse::<i32>()
        .ok()
        .filter(|q| *q >= 1)
        .ok_or_else(|| Error::BadQuantity("quantity must be a positive number".into()))?;

    let mut conn = db.conn()?;
    Inventory::add(&mut conn, quantity)?;
    let total = Inventory::get(&mut conn)?;
    Ok(format!("Added {quantity} eggs. Total: {total}"))
}

fn inventory_set(db: &Db, args: &[String]) -> Result<String> {
    let quantity = args
        .first()
        .ok_or_else(|| Error::Usage("usage: inventory set <quantity>".into()))?
        .parse::<i32>()
        .ok()
        .filter(|q| *q >= 0)
        .ok_or_else(|| Error::BadQuantity("quantity must be a non-negative number".into()))?;

    let mut conn = db.conn()?;
    Inventory::set(&mut conn, quantity)?;
    Ok(format!("Inventory set to {quantity} eggs."))
}

fn parse_order_quantity(args: &[String]) -> Result<i32> {
    let arg = args
        .first()
        .ok_or_else(|| Error::Usage("usage: order <quantity> (6 or 12)".into()))?;
    match arg.parse::<i32>() {
        Ok(q) if q == 6 || q == 12 => Ok(q),
        _ => Err(Error::BadQuantity("quantity must be 6 or 12".into())),
    }
}

/// Creates a pending order, reserving inventory atomically. The reply
/// carries a bolt11 invoice when a Lightning address is configured and
/// the fetch succeeds, plus a zap link to the bot profile.
pub async fn order_cmd(
    db: &Db,
    sender_npub: &str,
    args: &[String],
    cfg: &ExecuteConfig,
) -> Result<String> {
    let quantity = parse_order_quantity(args)?;

    let order = {
        let mut conn = db.conn()?;
        let customer = Customer::get_by_npub(&mut conn, sender_npub)?;

        let pending = Order::pending_for_customer(&mut conn, customer.id)?;
        if !pending.is_empty() {
            return Err(Error::PendingOrderExists(pending.len()));
        }

        let total_sats = (quantity as i64 / 6) * cfg.sats_per_half_dozen;
        Order::create(&mut conn, customer.id, quantity, total_sats)?
    };

    let mut msg = format!(
        "Order {}: {} eggs reserved for {} sats.",
        order.id, order.quantity, order.total_sats
    );

    // Invoice fetch is best-effort: the zap path still works without it.
    let mut has_invoice = false;
    if let (Some(client), Some(address)) = (&cfg.lnurl, &cfg.lightning_address) {
        match client.request_invoice(address, order.total_sats).await {
            Ok(invoice) => {
                msg.push_str(&format!("\n\nPay invoice:\n{invoice}"));
                has_invoice = true;
            }
            Err(e) => warn!("invoice generation failed: {e}"),
        }
    }

    if !cfg.bot_npub.is_empty() {
        if has_invoice {
            msg.push_str(&format!("\n\nOr zap this profile:\nnostr:{}", cfg.bot_npub));
        } else {
            msg.push_str(&format!("\n\nZap this profile to pay:\nnostr:{}", cfg.bot_npub));
        }
    }

    Ok(msg)
}

/// Cancels one of the caller's own pending orders.
pub fn cancel_cmd(db: &Db, sender_npub: &str, args: &[String]) -> Result<String> {
    let order_id = args
        .first()
        .ok_or_else(|| Error::Usage("usage: cancel <order_id>".into()))?
        .parse::<i64>()
        .map_err(|_| Error::Usage("order_id must be a number".into()))?;

    let mut conn = db.conn()?;
    let customer = Customer::get_by_npub(&mut conn, sender_npub)?;
    let order = Order::get_by_id(&mut conn, order_id)?;

    if order.customer_id != customer.id {
        return Err(Error::NotYourOrder);
    }

    Order::cancel(&mut conn, order_id)?;
    Ok(format!("Order {order_id} cancelled."))
}

pub fn balance_cmd(db: &Db, sender_npub: &str) -> Result<String> {
    let mut conn = db.conn()?;
    let customer = Customer::get_by_npub(&mut conn, sender_npub)?;

    let received = Payment::balance(&mut conn, sender_npub)?;
    let spent = Payment::spent(&mut conn, customer.id)?;
    let balance = received - spent;

    if balance == 0 && received == 0 {
        return Ok("No payments received yet.".to_string());
    }

    Ok(format!(
        "Received: {received} sats | Spent: {spent} sats | Balance: {balance} sats"
    ))
}

pub fn history_cmd(db: &Db, sender_npub: &str) -> Result<String> {
    let mut conn = db.conn()?;
    let customer = Customer::get_by_npub(&mut conn, sender_npub)?;
    let orders = Order::for_customer(&mut conn, customer.id, 25)?;

    if orders.is_empty() {
        return Ok("No orders yet.".to_string());
    }

    let mut msg = String::from("Recent orders:\n");
    for o in orders {
        msg.push_str(&format!(
            "• #{}: {} eggs, {} sats ({})\n",
            o.id, o.quantity, o.total_sats, o.status
        ));
    }
    Ok(msg)
}

/// `notify <6|12>` subscribes, `notify off` unsubscribes, bare `notify`
/// reports. Subscriptions are one-shot.
pub fn notify_cmd(db: &Db, sender_npub: &str, args: &[String]) -> Result<String> {
    let mut conn = db.conn()?;
    let customer = Customer::get_by_npub(&mut conn, sender_npub)?;

    match args.first().map(String::as_str) {
        None => match Notification::get(&mut conn, customer.id)? {
            Some(n) => Ok(format!(
                "You'll be notified when at least {} eggs are available.",
                n.threshold_eggs
            )),
            None => Ok("No notification set. Use 'notify 6' or 'notify 12'.".to_string()),
        },
        Some("off") => {
            Notification::delete(&mut conn, customer.id)?;
            Ok("Notifications disabled.".to_string())
        }
        Some(arg) => {
            let threshold = match arg.parse::<i32>() {
                Ok(t) if t == 6 || t == 12 => t,
                _ => return Err(Error::BadQuantity("threshold must be 6 or 12".into())),
            };
            Notification::upsert(&mut conn, customer.id, threshold)?;
            Ok(format!(
                "OK - you'll be notified when at least {threshold} eggs are available."
            ))
        }
    }
}

pub fn help_text(is_admin: bool) -> String {
    let mut msg = String::from(
        "Available commands:\n\
         • inventory - Check egg availability\n\
         • order <6|12> - Order eggs (half-dozen or dozen)\n\
         • cancel <order_id> - Cancel a pending order\n\
         • balance - Check your payment balance\n\
         • history - View recent orders\n\
         • notify <6|12|off> - One-shot restock alert\n\
         • help - Show this message",
    );

    if is_admin {
        msg.push_str(
            "\n\nAdmin commands:\n\
             • inventory add <qty> - Add eggs to inventory\n\
             • inventory set <qty> - Set inventory to exact count\n\
             • sell <npub> <qty> - Create order for a customer\n\
             • markpaid <order_id> - Mark pending order as paid\n\
             • deliver <order_id> - Fulfill a paid order\n\
             • adjust <npub> <sats> - Adjust customer balance\n\
             • orders - List all orders\n\
             • customers - List registered customers\n\
             • addcustomer <npub> - Register new customer\n\
             • removecustomer <npub> - Remove customer\n\
             • sales - Show total sales",
        );
    }

    msg
}
