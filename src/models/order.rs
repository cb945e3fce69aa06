use diesel::{
    BoolExpressionMethods, Connection, ExpressionMethods, JoinOnDsl, OptionalExtension, QueryDsl,
    RunQueryDsl, SqliteConnection,
};

use crate::error::{Error, Result};
use crate::fsm::{self, OrderEvent, OrderState};
use crate::models::schema::{customers, inventory, orders};

#[derive(diesel::Queryable, diesel::Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = orders)]
pub struct Order {
    pub id: i64,
    pub customer_id: i64,
    pub quantity: i32,
    pub total_sats: i64,
    pub status: String,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

/// Order row joined with the owning customer's npub, for admin listings.
#[derive(diesel::Queryable, Debug, Clone)]
pub struct OrderWithCustomer {
    pub id: i64,
    pub customer_npub: String,
    pub quantity: i32,
    pub total_sats: i64,
    pub status: String,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(diesel::Insertable)]
#[diesel(table_name = orders)]
struct NewOrder {
    customer_id: i64,
    quantity: i32,
    total_sats: i64,
    status: &'static str,
}

impl Order {
    pub fn state(&self) -> OrderState {
        OrderState::parse(&self.status).unwrap_or(OrderState::Pending)
    }

    /// Creates a pending order, reserving inventory in the same
    /// transaction. The conditional decrement fails the whole operation
    /// with `InsufficientInventory` when stock is short.
    pub fn create(
        conn: &mut SqliteConnection,
        customer_id: i64,
        quantity: i32,
        total_sats: i64,
    ) -> Result<Order> {
        conn.transaction::<_, Error, _>(|conn| {
            let rows = diesel::update(
                inventory::table
                    .filter(inventory::id.eq(1).and(inventory::eggs_available.ge(quantity))),
            )
            .set((
                inventory::eggs_available.eq(inventory::eggs_available - quantity),
                inventory::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;

            if rows == 0 {
                let available = inventory::table
                    .find(1)
                    .select(inventory::eggs_available)
                    .first::<i32>(conn)?;
                return Err(Error::InsufficientInventory {
                    available,
                    requested: quantity,
                });
            }

            let order = diesel::insert_into(orders::table)
                .values(&NewOrder {
                    customer_id,
                    quantity,
                    total_sats,
                    status: OrderState::Pending.as_str(),
                })
                .get_result::<Order>(conn)?;

            Ok(order)
        })
    }

    pub fn get_by_id(conn: &mut SqliteConnection, order_id: i64) -> Result<Order> {
        orders::table
            .find(order_id)
            .first::<Order>(conn)
            .optional()?
            .ok_or(Error::OrderNotFound(order_id))
    }

    /// Orders for a customer, most recent first.
    pub fn for_customer(
        conn: &mut SqliteConnection,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<Order>> {
        let rows = orders::table
            .filter(orders::customer_id.eq(customer_id))
            .order((orders::created_at.desc(), orders::id.desc()))
            .limit(limit)
            .load::<Order>(conn)?;
        Ok(rows)
    }

    pub fn pending_for_customer(
        conn: &mut SqliteConnection,
        customer_id: i64,
    ) -> Result<Vec<Order>> {
        let rows = orders::table
            .filter(
                orders::customer_id
                    .eq(customer_id)
                    .and(orders::status.eq(OrderState::Pending.as_str())),
            )
            .order((orders::created_at.desc(), orders::id.desc()))
            .load::<Order>(conn)?;
        Ok(rows)
    }

    /// Oldest pending order for a customer, if any. Automatic payment
    /// application clears at most this one order per zap.
    pub fn oldest_pending_for_customer(
        conn: &mut SqliteConnection,
        customer_id: i64,
    ) -> Result<Option<Order>> {
        let row = orders::table
            .filter(
                orders::customer_id
                    .eq(customer_id)
                    .and(orders::status.eq(OrderState::Pending.as_str())),
            )
            .order(orders::id.asc())
            .first::<Order>(conn)
            .optional()?;
        Ok(row)
    }

    /// All orders joined with customer npubs, most recent first.
    pub fn list_with_customers(
        conn: &mut SqliteConnection,
        limit: i64,
    ) -> Result<Vec<OrderWithCustomer>> {
        let rows = orders::table
            .inner_join(customers::table.on(customers::id.eq(orders::customer_id)))
            .select((
                orders::id,
                customers::npub,
                orders::quantity,
                orders::total_sats,
                orders::status,
                orders::created_at,
            ))
            .order((orders::created_at.desc(), orders::id.desc()))
            .limit(limit)
            .load::<OrderWithCustomer>(conn)?;
        Ok(rows)
    }

    /// Cancels a pending order and restores the reserved inventory, both
    /// in one transaction. The status flip carries its own
    /// `WHERE status = 'pending'` so a concurrent transition cannot
    /// slip through between the FSM check and the update.
    pub fn cancel(conn: &mut SqliteConnection, order_id: i64) -> Result<()> {
        conn.transaction::<_, Error, _>(|conn| {
            let order = Order::get_by_id(conn, order_id)?;
            let state = order.state();

            if !state.can(OrderEvent::Cancel) || !fsm::can_restore(state) {
                return Err(Error::OrderNotPending {
                    id: order_id,
                    status: order.status.clone(),
                });
            }

            let rows = diesel::update(
                orders::table.filter(
                    orders::id
                        .eq(order_id)
                        .and(orders::status.eq(OrderState::Pending.as_str())),
                ),
            )
            .set((
                orders::status.eq(OrderState::Cancelled.as_str()),
                orders::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;

            if rows == 0 {
                return Err(Error::OrderNotPending {
                    id: order_id,
                    status: order.status,
                });
            }

            diesel::update(inventory::table.find(1))
                .set((
                    inventory::eggs_available.eq(inventory::eggs_available + order.quantity),
                    inventory::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;

            Ok(())
        })
    }

    /// Marks a paid order fulfilled. Inventory was reserved at order
    /// time, so delivery has no inventory effect.
    pub fn fulfill(conn: &mut SqliteConnection, order_id: i64) -> Result<()> {
        let order = Order::get_by_id(conn, order_id)?;
        let state = order.state();

        if !state.can(OrderEvent::Fulfill) || !fsm::can_consume(state) {
            return Err(Error::InvalidStateTransition(format!(
                "cannot fulfill order in {state} state"
            )));
        }

        let rows = diesel::update(
            orders::table.filter(
                orders::id
                    .eq(order_id)
                    .and(orders::status.eq(OrderState::Paid.as_str())),
            ),
        )
        .set((
            orders::status.eq(OrderState::Fulfilled.as_str()),
            orders::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)?;

        if rows == 0 {
            return Err(Error::InvalidStateTransition(
                "order state changed concurrently".into(),
            ));
        }
        Ok(())
    }

    /// Generic status update: infers the FSM event from the (from, to)
    /// pair, refuses unmapped pairs, and re-checks the source status in
    /// the `WHERE` clause.
    pub fn update_status(
        conn: &mut SqliteConnection,
        order_id: i64,
        new_status: OrderState,
    ) -> Result<()> {
        let order = Order::get_by_id(conn, order_id)?;
        let current = order.state();

        let event = fsm::infer_order_event(current, new_status).ok_or_else(|| {
            Error::InvalidStateTransition(format!("{current} -> {new_status}"))
        })?;
        current.apply(event)?;

        let rows = diesel::update(
            orders::table.filter(
                orders::id
                    .eq(order_id)
                    .and(orders::status.eq(current.as_str())),
            ),
        )
        .set((
            orders::status.eq(new_status.as_str()),
            orders::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)?;

        if rows == 0 {
            return Err(Error::InvalidStateTransition(
                "order state changed concurrently".into(),
            ));
        }
        Ok(())
    }
}
