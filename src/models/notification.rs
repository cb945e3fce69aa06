use diesel::{
    ExpressionMethods, JoinOnDsl, OptionalExtension, QueryDsl, RunQueryDsl, SqliteConnection,
};

use crate::error::Result;
use crate::models::schema::{customers, inventory_notifications};

/// One-shot restock alert subscription. At most one per customer; the
/// row is deleted when the alert fires.
#[derive(diesel::Queryable, diesel::Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = inventory_notifications)]
pub struct Notification {
    pub id: i64,
    pub customer_id: i64,
    pub threshold_eggs: i32,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(diesel::Insertable)]
#[diesel(table_name = inventory_notifications)]
struct NewNotification {
    customer_id: i64,
    threshold_eggs: i32,
}

impl Notification {
    /// Replace semantics: re-subscribing overwrites the threshold.
    pub fn upsert(conn: &mut SqliteConnection, customer_id: i64, threshold: i32) -> Result<()> {
        diesel::insert_into(inventory_notifications::table)
            .values(&NewNotification {
                customer_id,
                threshold_eggs: threshold,
            })
            .on_conflict(inventory_notifications::customer_id)
            .do_update()
            .set((
                inventory_notifications::threshold_eggs.eq(threshold),
                inventory_notifications::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn get(conn: &mut SqliteConnection, customer_id: i64) -> Result<Option<Notification>> {
        let row = inventory_notifications::table
            .filter(inventory_notifications::customer_id.eq(customer_id))
            .first::<Notification>(conn)
            .optional()?;
        Ok(row)
    }

    pub fn delete(conn: &mut SqliteConnection, customer_id: i64) -> Result<()> {
        diesel::delete(
            inventory_notifications::table
                .filter(inventory_notifications::customer_id.eq(customer_id)),
        )
        .execute(conn)?;
        Ok(())
    }

    pub fn delete_by_id(conn: &mut SqliteConnection, id: i64) -> Result<()> {
        diesel::delete(inventory_notifications::table.find(id)).execute(conn)?;
        Ok(())
    }

    /// Subscriptions satisfied by the current availability, joined with
    /// the customer npub the alert DM goes to.
    pub fn triggered(
        conn: &mut SqliteConnection,
        available: i32,
    ) -> Result<Vec<(Notification, String)>> {
        let rows = inventory_notifications::table
            .inner_join(
                customers::table.on(customers::id.eq(inventory_notifications::customer_id)),
            )
            .filter(inventory_notifications::threshold_eggs.le(available))
            .select((
                (
                    inventory_notifications::id,
                    inventory_notifications::customer_id,
                    inventory_notifications::threshold_eggs,
                    inventory_notifications::created_at,
                    inventory_notifications::updated_at,
                ),
                customers::npub,
            ))
            .load::<(Notification, String)>(conn)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Customer, Db};

    const NPUB_A: &str = "npub1aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaswrenc";
    const NPUB_B: &str = "npub1bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbsmvhjn";

    #[test]
    fn upsert_replaces_threshold() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let customer = Customer::create(&mut conn, NPUB_A).unwrap();

        Notification::upsert(&mut conn, customer.id, 6).unwrap();
        Notification::upsert(&mut conn, customer.id, 12).unwrap();

        let n = Notification::get(&mut conn, customer.id).unwrap().unwrap();
        assert_eq!(n.threshold_eggs, 12);
    }

    #[test]
    fn triggered_filters_by_threshold() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let a = Customer::create(&mut conn, NPUB_A).unwrap();
        let b = Customer::create(&mut conn, NPUB_B).unwrap();

        Notification::upsert(&mut conn, a.id, 6).unwrap();
        Notification::upsert(&mut conn, b.id, 12).unwrap();

        let hits = Notification::triggered(&mut conn, 8).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, NPUB_A);

        let hits = Notification::triggered(&mut conn, 12).unwrap();
        assert_eq!(hits.len(), 2);

        let hits = Notification::triggered(&mut conn, 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn delete_by_id_is_one_shot() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let a = Customer::create(&mut conn, NPUB_A).unwrap();

        Notification::upsert(&mut conn, a.id, 6).unwrap();
        let hits = Notification::triggered(&mut conn, 6).unwrap();
        Notification::delete_by_id(&mut conn, hits[0].0.id).unwrap();
        assert!(Notification::triggered(&mut conn, 6).unwrap().is_empty());
    }
}
