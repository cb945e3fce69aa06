use diesel::{BoolExpressionMethods, ExpressionMethods, QueryDsl, RunQueryDsl, SqliteConnection};

use crate::error::Result;
use crate::models::schema::{high_water_mark, processed_events};

/// Replay guard: membership means the event was already handled.
#[derive(diesel::Queryable, diesel::Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = processed_events)]
#[diesel(primary_key(event_id))]
pub struct ProcessedEvent {
    pub event_id: String,
    pub kind: i32,
    pub created_at: i64,
    pub processed_at: chrono::NaiveDateTime,
}

#[derive(diesel::Insertable)]
#[diesel(table_name = processed_events)]
struct NewProcessedEvent<'a> {
    event_id: &'a str,
    kind: i32,
    created_at: i64,
}

impl ProcessedEvent {
    /// Insert-or-ignore. Returns true iff the event is new, i.e. this
    /// caller won the claim and should process it.
    pub fn try_process(
        conn: &mut SqliteConnection,
        event_id: &str,
        kind: i32,
        created_at: i64,
    ) -> Result<bool> {
        let rows = diesel::insert_into(processed_events::table)
            .values(&NewProcessedEvent {
                event_id,
                kind,
                created_at,
            })
            .on_conflict_do_nothing()
            .execute(conn)?;
        Ok(rows == 1)
    }
}

/// Unix timestamp of the most recently processed event; 0 when nothing
/// has been processed yet. Used as the subscription floor on restart.
pub fn get_high_water_mark(conn: &mut SqliteConnection) -> Result<i64> {
    let ts = high_water_mark::table
        .find(1)
        .select(high_water_mark::last_event_at)
        .first::<i64>(conn)?;
    Ok(ts)
}

/// Advances the mark. The `last_event_at < ts` guard keeps it monotone
/// under out-of-order arrivals.
pub fn set_high_water_mark(conn: &mut SqliteConnection, ts: i64) -> Result<()> {
    diesel::update(
        high_water_mark::table
            .filter(high_water_mark::id.eq(1).and(high_water_mark::last_event_at.lt(ts))),
    )
    .set((
        high_water_mark::last_event_at.eq(ts),
        high_water_mark::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)?;
    Ok(())
}
