use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes across the ledger, the payment pipeline, and the
/// command executor. Commands surface these to users verbatim, so the
/// business variants carry the full user-visible sentence.
#[derive(Debug, Error)]
pub enum Error {
    // Input / business
    #[error("only {available} eggs available, cannot order {requested}")]
    InsufficientInventory { available: i32, requested: i32 },

    #[error("customer not found")]
    CustomerNotFound,

    #[error("customer already exists")]
    CustomerExists,

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("order {id} cannot be cancelled (status: {status})")]
    OrderNotPending { id: i64, status: String },

    #[error("invalid order state transition: {0}")]
    InvalidStateTransition(String),

    #[error("invalid npub")]
    InvalidNpub,

    #[error("{0}")]
    BadQuantity(String),

    #[error("{0}")]
    BadAmount(String),

    #[error("{0}")]
    Usage(String),

    #[error("you have {0} unpaid order(s) - please pay or cancel before ordering more")]
    PendingOrderExists(usize),

    // Authorization
    #[error("you are not a registered customer")]
    NotCustomer,

    #[error("admin access required")]
    AdminRequired,

    #[error("you can only cancel your own orders")]
    NotYourOrder,

    // Payment pipeline
    #[error("invalid zap receipt: {0}")]
    InvalidZapReceipt(String),

    #[error("unauthorized zap provider: expected {expected}, got {got}")]
    UnauthorizedZapProvider { expected: String, got: String },

    #[error("duplicate zap event")]
    DuplicateZap,

    #[error("invalid lightning address: expected user@domain format")]
    InvalidLightningAddress,

    #[error("fetching lnurl metadata: {0}")]
    LnurlMetadataFetch(String),

    #[error("requesting lnurl invoice: {0}")]
    LnurlInvoiceRequest(String),

    #[error("{sats} sats outside provider bounds [{min_sats}, {max_sats}]")]
    InvoiceAmountOutOfRange {
        sats: i64,
        min_sats: i64,
        max_sats: i64,
    },

    // Infrastructure
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("bech32 codec error: {0}")]
    Bech32(#[from] nostr::nips::nip19::Error),

    #[error("event build error: {0}")]
    EventBuilder(#[from] nostr::event::builder::Error),

    #[error("dm codec error: {0}")]
    Dm(String),

    #[error("relay error: {0}")]
    Relay(String),
}

impl Error {
    /// Errors that mean "the sender may not do this" rather than
    /// "the request was bad". The event loop prefixes these with
    /// "Permission denied" instead of "Error".
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::NotCustomer | Error::AdminRequired)
    }

    /// Failures of our own plumbing. These are logged with context but
    /// never echoed back over a DM.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Pool(_)
                | Error::Migration(_)
                | Error::Bech32(_)
                | Error::EventBuilder(_)
                | Error::Dm(_)
                | Error::Relay(_)
        )
    }
}
