diesel::table! {
    products (id) {
        id -> Uuid,
        shop_id -> Uuid,
        name -> Varchar,
        sku -> Varchar,
        price -> Numeric,
        is_active -> Bool,
    }
}

diesel::table! {
    inventory_lots (id) {
        id -> Uuid,
        product_id -> Uuid,
        shop_id -> Uuid,
        quantity -> Int4,
        batch_number -> Nullable<Varchar>,
        expiry_date -> Nullable<Date>,
        reorder_threshold -> Int4,
    }
}

diesel::table! {
    customer_credit (customer_id) {
        customer_id -> Uuid,
        credit_limit -> Numeric,
        balance -> Numeric,
        auto_approval_limit -> Numeric,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        order_number -> Varchar,
        customer_id -> Uuid,
        shop_id -> Uuid,
        status -> Varchar,
        order_type -> Varchar,
        payment_status -> Varchar,
        total_amount -> Numeric,
        discount_amount -> Numeric,
        notes -> Nullable<Text>,
        idempotency_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        unit_price -> Numeric,
        line_total -> Numeric,
    }
}

diesel::table! {
    order_allocations (id) {
        id -> Uuid,
        order_id -> Uuid,
        lot_id -> Uuid,
        quantity -> Int4,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_type -> Varchar,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        payload -> Jsonb,
        status -> Varchar,
        retry_count -> Int4,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    outbox_dead_letters (id) {
        id -> Uuid,
        event_id -> Uuid,
        aggregate_type -> Varchar,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        payload -> Jsonb,
        attempts -> Int4,
        last_error -> Text,
        failed_at -> Timestamptz,
    }
}

diesel::table! {
    idempotency_keys (key) {
        key -> Varchar,
        response -> Nullable<Jsonb>,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(order_items -> products (product_id));
diesel::joinable!(order_allocations -> orders (order_id));
diesel::joinable!(order_allocations -> inventory_lots (lot_id));
diesel::joinable!(inventory_lots -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    inventory_lots,
    customer_credit,
    orders,
    order_items,
    order_allocations,
    outbox_events,
    outbox_dead_letters,
    idempotency_keys,
);
