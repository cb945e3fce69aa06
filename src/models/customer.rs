use diesel::{
    ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl, SqliteConnection,
};

use crate::error::{Error, Result};
use crate::models::schema::customers;

#[derive(diesel::Queryable, diesel::Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = customers)]
pub struct Customer {
    pub id: i64,
    pub npub: String,
    pub name: Option<String>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

#[derive(diesel::Insertable)]
#[diesel(table_name = customers)]
struct NewCustomer<'a> {
    npub: &'a str,
}

impl Customer {
    pub fn create(conn: &mut SqliteConnection, npub: &str) -> Result<Customer> {
        diesel::insert_into(customers::table)
            .values(&NewCustomer { npub })
            .get_result::<Customer>(conn)
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => Error::CustomerExists,
                e => Error::Database(e),
            })
    }

    pub fn get_by_npub(conn: &mut SqliteConnection, npub: &str) -> Result<Customer> {
        customers::table
            .filter(customers::npub.eq(npub))
            .first::<Customer>(conn)
            .optional()?
            .ok_or(Error::CustomerNotFound)
    }

    pub fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Customer> {
        customers::table
            .find(id)
            .first::<Customer>(conn)
            .optional()?
            .ok_or(Error::CustomerNotFound)
    }

    pub fn exists(conn: &mut SqliteConnection, npub: &str) -> Result<bool> {
        let count = customers::table
            .filter(customers::npub.eq(npub))
            .count()
            .get_result::<i64>(conn)?;
        Ok(count > 0)
    }

    pub fn remove(conn: &mut SqliteConnection, npub: &str) -> Result<()> {
        let rows =
            diesel::delete(customers::table.filter(customers::npub.eq(npub))).execute(conn)?;
        if rows == 0 {
            return Err(Error::CustomerNotFound);
        }
        Ok(())
    }

    pub fn list(conn: &mut SqliteConnection) -> Result<Vec<Customer>> {
        let all = customers::table
            .order(customers::created_at.desc())
            .load::<Customer>(conn)?;
        Ok(all)
    }
}
