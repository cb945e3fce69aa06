use diesel::dsl::sql;
use diesel::sql_types::{BigInt, Nullable};
use diesel::{ExpressionMethods, QueryDsl, RunQueryDsl, SqliteConnection};

use crate::error::{Error, Result};
use crate::fsm::OrderState;
use crate::models::schema::{orders, transactions};

/// A recorded payment. Usually backed by a zap receipt; admin
/// adjustments use a synthetic `zap_event_id` and may be negative.
#[derive(diesel::Queryable, diesel::Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = transactions)]
pub struct Payment {
    pub id: i64,
    pub order_id: Option<i64>,
    pub zap_event_id: String,
    pub amount_sats: i64,
    pub sender_npub: String,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(diesel::Insertable)]
#[diesel(table_name = transactions)]
struct NewPayment<'a> {
    order_id: Option<i64>,
    zap_event_id: &'a str,
    amount_sats: i64,
    sender_npub: &'a str,
}

impl Payment {
    /// Insert-only. The UNIQUE constraint on `zap_event_id` is the
    /// at-most-once guard; a violation surfaces as `DuplicateZap`.
    pub fn record(
        conn: &mut SqliteConnection,
        order_id: Option<i64>,
        zap_event_id: &str,
        amount_sats: i64,
        sender_npub: &str,
    ) -> Result<Payment> {
        diesel::insert_into(transactions::table)
            .values(&NewPayment {
                order_id,
                zap_event_id,
                amount_sats,
                sender_npub,
            })
            .get_result::<Payment>(conn)
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => Error::DuplicateZap,
                e => Error::Database(e),
            })
    }

    /// Total sats ever received from this npub.
    pub fn balance(conn: &mut SqliteConnection, npub: &str) -> Result<i64> {
        let total = transactions::table
            .filter(transactions::sender_npub.eq(npub))
            .select(sql::<Nullable<BigInt>>("SUM(amount_sats)"))
            .first::<Option<i64>>(conn)?;
        Ok(total.unwrap_or(0))
    }

    /// Total sats a customer has spent on fulfilled orders.
    pub fn spent(conn: &mut SqliteConnection, customer_id: i64) -> Result<i64> {
        let total = orders::table
            .filter(orders::customer_id.eq(customer_id))
            .filter(orders::status.eq(OrderState::Fulfilled.as_str()))
            .select(sql::<Nullable<BigInt>>("SUM(total_sats)"))
            .first::<Option<i64>>(conn)?;
        Ok(total.unwrap_or(0))
    }

    /// Total sats across all fulfilled orders.
    pub fn total_sales(conn: &mut SqliteConnection) -> Result<i64> {
        let total = orders::table
            .filter(orders::status.eq(OrderState::Fulfilled.as_str()))
            .select(sql::<Nullable<BigInt>>("SUM(total_sats)"))
            .first::<Option<i64>>(conn)?;
        Ok(total.unwrap_or(0))
    }
}
