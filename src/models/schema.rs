diesel::table! {
    inventory (id) {
        id -> Integer,
        eggs_available -> Integer,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    customers (id) {
        id -> BigInt,
        npub -> Text,
        name -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    orders (id) {
        id -> BigInt,
        customer_id -> BigInt,
        quantity -> Integer,
        total_sats -> BigInt,
        status -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    transactions (id) {
        id -> BigInt,
        order_id -> Nullable<BigInt>,
        zap_event_id -> Text,
        amount_sats -> BigInt,
        sender_npub -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    inventory_notifications (id) {
        id -> BigInt,
        customer_id -> BigInt,
        threshold_eggs -> Integer,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    high_water_mark (id) {
        id -> Integer,
        last_event_at -> BigInt,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    processed_events (event_id) {
        event_id -> Text,
        kind -> Integer,
        created_at -> BigInt,
        processed_at -> Timestamp,
    }
}

diesel::joinable!(orders -> customers (customer_id));
diesel::joinable!(transactions -> orders (order_id));
diesel::joinable!(inventory_notifications -> customers (customer_id));

diesel::allow_tables_to_appear_in_same_query!(
    inventory,
    customers,
    orders,
    transactions,
    inventory_notifications,
    high_water_mark,
    processed_events,
);
