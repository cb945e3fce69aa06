use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::{Error, Result};

pub mod customer;
pub mod inventory;
pub mod notification;
pub mod order;
pub mod payment;
pub mod processed_event;
mod schema;

pub use customer::Customer;
pub use inventory::Inventory;
pub use notification::Notification;
pub use order::{Order, OrderWithCustomer};
pub use payment::Payment;
pub use processed_event::{get_high_water_mark, set_high_water_mark, ProcessedEvent};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Session pragmas applied to every pooled connection.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub type Conn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Handle to the ledger database. The pool is capped at one connection,
/// which serializes all writers at the driver level.
#[derive(Clone)]
pub struct Db {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Db {
    pub fn open(path: &str) -> Result<Db> {
        Db::build(path)
    }

    pub fn open_in_memory() -> Result<Db> {
        Db::build(":memory:")
    }

    fn build(url: &str) -> Result<Db> {
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder()
            .max_size(1)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)?;

        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| Error::Migration(e.to_string()))?;
        drop(conn);

        Ok(Db { pool })
    }

    pub fn conn(&self) -> Result<Conn> {
        Ok(self.pool.get()?)
    }
}
