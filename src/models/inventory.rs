use diesel::dsl::sum;
use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, RunQueryDsl, SqliteConnection};

use crate::error::{Error, Result};
use crate::fsm::OrderState;
use crate::models::schema::{inventory, orders};

/// Singleton inventory row. Eggs reserved by orders are tracked through
/// the orders table; `eggs_available` only counts unsold stock.
#[derive(diesel::Queryable, diesel::Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = inventory)]
pub struct Inventory {
    pub id: i32,
    pub eggs_available: i32,
    pub updated_at: chrono::NaiveDateTime,
}

impl Inventory {
    pub fn get(conn: &mut SqliteConnection) -> Result<i32> {
        let count = inventory::table
            .find(1)
            .select(inventory::eggs_available)
            .first::<i32>(conn)?;
        Ok(count)
    }

    pub fn add(conn: &mut SqliteConnection, count: i32) -> Result<()> {
        diesel::update(inventory::table.find(1))
            .set((
                inventory::eggs_available.eq(inventory::eggs_available + count),
                inventory::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn set(conn: &mut SqliteConnection, count: i32) -> Result<()> {
        diesel::update(inventory::table.find(1))
            .set((
                inventory::eggs_available.eq(count),
                inventory::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;
        Ok(())
    }

    /// Conditional decrement: the `WHERE eggs_available >= count` guard
    /// makes the check-and-debit a single atomic statement.
    pub fn deduct(conn: &mut SqliteConnection, count: i32) -> Result<()> {
        let rows = diesel::update(
            inventory::table.filter(inventory::id.eq(1).and(inventory::eggs_available.ge(count))),
        )
        .set((
            inventory::eggs_available.eq(inventory::eggs_available - count),
            inventory::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)?;

        if rows == 0 {
            let available = Inventory::get(conn)?;
            return Err(Error::InsufficientInventory {
                available,
                requested: count,
            });
        }
        Ok(())
    }

    /// Total eggs in pending (unpaid) orders.
    pub fn reserved(conn: &mut SqliteConnection) -> Result<i64> {
        let total = orders::table
            .filter(orders::status.eq(OrderState::Pending.as_str()))
            .select(sum(orders::quantity))
            .first::<Option<i64>>(conn)?;
        Ok(total.unwrap_or(0))
    }

    /// Total eggs in paid orders awaiting delivery.
    pub fn sold(conn: &mut SqliteConnection) -> Result<i64> {
        let total = orders::table
            .filter(orders::status.eq(OrderState::Paid.as_str()))
            .select(sum(orders::quantity))
            .first::<Option<i64>>(conn)?;
        Ok(total.unwrap_or(0))
    }
}
