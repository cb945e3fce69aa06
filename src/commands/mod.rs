//! DM command parsing, permission checks, and dispatch.

use nostr::nips::nip19::FromBech32;
use nostr::PublicKey;

use crate::error::{Error, Result};
use crate::models::{Customer, Db};

pub mod admin;
pub mod customer;

/// A parsed user command: lowercased verb plus positional args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

/// Extracts a command from message content. Lines injected by clients
/// as markdown reference comments (`[//]: # (...)`) are dropped first.
/// Returns None for empty or whitespace-only messages.
pub fn parse(content: &str) -> Option<Command> {
    let cleaned = strip_markdown_comments(content);
    let mut parts = cleaned.split_whitespace();
    let name = parts.next()?.to_lowercase();
    let args = parts.map(str::to_string).collect();
    Some(Command { name, args })
}

/// Removes every whole line that begins (after trimming) with `[//]:`.
pub fn strip_markdown_comments(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with("[//]:"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Command {
    pub fn is_customer_command(&self) -> bool {
        matches!(
            self.name.as_str(),
            "inventory" | "order" | "cancel" | "balance" | "history" | "help" | "notify"
        )
    }

    pub fn is_admin_command(&self) -> bool {
        matches!(
            self.name.as_str(),
            "deliver"
                | "markpaid"
                | "adjust"
                | "orders"
                | "customers"
                | "addcustomer"
                | "removecustomer"
                | "sales"
                | "sell"
        )
    }

    pub fn is_valid(&self) -> bool {
        self.is_customer_command() || self.is_admin_command()
    }
}

/// Everything command execution needs beyond the ledger.
#[derive(Clone)]
pub struct ExecuteConfig {
    pub sats_per_half_dozen: i64,
    pub admins: Vec<String>,
    pub lightning_address: Option<String>,
    pub bot_npub: String,
    pub lnurl: Option<crate::lnurl::Client>,
}

pub fn is_admin(sender_npub: &str, admins: &[String]) -> bool {
    admins.iter().any(|a| a == sender_npub)
}

/// Admins may run anything. Customers may run customer commands.
/// Everyone else is turned away.
pub fn can_execute(
    conn: &mut diesel::SqliteConnection,
    cmd: &Command,
    sender_npub: &str,
    admins: &[String],
) -> Result<()> {
    if is_admin(sender_npub, admins) {
        return Ok(());
    }
    if !Customer::exists(conn, sender_npub)? {
        return Err(Error::NotCustomer);
    }
    if cmd.is_admin_command() {
        return Err(Error::AdminRequired);
    }
    Ok(())
}

/// Runs the command and returns the user-visible reply. Unknown verbs
/// fall through to the help text.
pub async fn execute(
    db: &Db,
    cmd: &Command,
    sender_npub: &str,
    cfg: &ExecuteConfig,
) -> Result<String> {
    let admin = is_admin(sender_npub, &cfg.admins);

    match cmd.name.as_str() {
        "inventory" => customer::inventory_cmd(db, &cmd.args, admin),
        "order" => customer::order_cmd(db, sender_npub, &cmd.args, cfg).await,
        "cancel" => customer::cancel_cmd(db, sender_npub, &cmd.args),
        "balance" => customer::balance_cmd(db, sender_npub),
        "history" => customer::history_cmd(db, sender_npub),
        "notify" => customer::notify_cmd(db, sender_npub, &cmd.args),
        "help" => Ok(customer::help_text(admin)),

        "deliver" => admin::deliver_cmd(db, &cmd.args),
        "markpaid" => admin::markpaid_cmd(db, &cmd.args),
        "adjust" => admin::adjust_cmd(db, &cmd.args),
        "orders" => admin::orders_cmd(db),
        "customers" => admin::customers_cmd(db),
        "addcustomer" => admin::add_customer_cmd(db, &cmd.args),
        "removecustomer" => admin::remove_customer_cmd(db, &cmd.args),
        "sales" => admin::sales_cmd(db),
        "sell" => admin::sell_cmd(db, &cmd.args, cfg),

        _ => Ok(customer::help_text(admin)),
    }
}

/// Validates a user-supplied npub argument.
pub(crate) fn parse_npub(s: &str) -> Result<String> {
    if !s.starts_with("npub1") {
        return Err(Error::InvalidNpub);
    }
    PublicKey::from_bech32(s).map_err(|_| Error::InvalidNpub)?;
    Ok(s.to_string())
}

/// Shortened npub for display.
pub(crate) fn shorten_npub(npub: &str) -> String {
    if npub.len() < 20 {
        return npub.to_string();
    }
    format!("{}...{}", &npub[..12], &npub[npub.len() - 4..])
}
