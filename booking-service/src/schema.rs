diesel::table! {
    bookings (id) {
        id -> Uuid,
        booking_number -> Varchar,
        external_booking_number -> Nullable<Varchar>,
        start_at -> Timestamptz,
        end_at -> Timestamptz,
        license_plate -> Varchar,
        client_name -> Varchar,
        client_email -> Nullable<Varchar>,
        client_phone -> Nullable<Varchar>,
        amount -> Numeric,
        payment_reference -> Nullable<Varchar>,
        payment_status -> Varchar,
        status -> Varchar,
        source -> Varchar,
        last_request_payload -> Nullable<Text>,
        last_response -> Nullable<Text>,
        last_error_code -> Nullable<Varchar>,
        last_external_call_at -> Nullable<Timestamptz>,
        reconcile_attempts -> Int4,
        next_reconcile_at -> Nullable<Timestamptz>,
        notification_status -> Varchar,
        notification_attempts -> Int4,
        notification_sent_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    notification_queue (id) {
        id -> Uuid,
        booking_id -> Uuid,
        attempts -> Int4,
        max_attempts -> Int4,
        status -> Varchar,
        next_retry_at -> Timestamptz,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservation_settings (id) {
        id -> Int4,
        max_capacity -> Int8,
        bookings_enabled -> Bool,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reservation_stats (id) {
        id -> Int4,
        active_count -> Int8,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(notification_queue -> bookings (booking_id));

diesel::allow_tables_to_appear_in_same_query!(
    bookings,
    notification_queue,
    reservation_settings,
    reservation_stats,
);
