//! Database schema for the booking core.
//!
//! Catalog tables (businesses through cancellation_policies) are read-only
//! providers maintained by the CRUD surface; the core only consumes them.
//! The overlap-exclusion constraint on `bookings` lives in the migrations
//! and is the final authority for double-booking prevention.

pub mod schema {
    diesel::table! {
        businesses (id) {
            id -> Uuid,
            name -> Text,
            timezone -> Text,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        services (id) {
            id -> Uuid,
            business_id -> Uuid,
            name -> Text,
            duration_minutes -> Int4,
            price_amount -> Int8,
            currency -> Text,
            requires_deposit -> Bool,
            deposit_percent -> Int4,
            deposit_due_hours -> Int4,
            buffer_before_minutes -> Int4,
            buffer_after_minutes -> Int4,
            policy_id -> Nullable<Uuid>,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        resources (id) {
            id -> Uuid,
            business_id -> Uuid,
            name -> Text,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        business_hours (id) {
            id -> Uuid,
            business_id -> Uuid,
            weekday -> Int4,
            opens_at -> Time,
            closes_at -> Time,
            is_closed -> Bool,
        }
    }

    diesel::table! {
        business_holidays (id) {
            id -> Uuid,
            business_id -> Uuid,
            holiday_on -> Date,
            name -> Nullable<Text>,
        }
    }

    diesel::table! {
        staff_schedules (id) {
            id -> Uuid,
            resource_id -> Uuid,
            weekday -> Int4,
            starts_at -> Time,
            ends_at -> Time,
        }
    }

    diesel::table! {
        schedule_exceptions (id) {
            id -> Uuid,
            resource_id -> Uuid,
            day_on -> Date,
            is_available -> Bool,
            starts_at -> Nullable<Time>,
            ends_at -> Nullable<Time>,
        }
    }

    diesel::table! {
        cancellation_policies (id) {
            id -> Uuid,
            business_id -> Uuid,
            name -> Text,
            hours_before -> Int4,
            penalty_percent -> Int4,
            is_default -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        bookings (id) {
            id -> Uuid,
            business_id -> Uuid,
            service_id -> Nullable<Uuid>,
            resource_id -> Nullable<Uuid>,
            customer_id -> Nullable<Uuid>,
            start_at -> Timestamptz,
            end_at -> Timestamptz,
            status -> Text,
            source -> Text,
            price_amount -> Int8,
            currency -> Text,
            deposit_percent -> Int4,
            deposit_amount -> Int8,
            balance_amount -> Int8,
            policy_hours_before -> Int4,
            policy_penalty_percent -> Int4,
            metadata -> Jsonb,
            reminded_at -> Nullable<Timestamptz>,
            deleted_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        booking_history (id) {
            id -> Uuid,
            booking_id -> Uuid,
            from_status -> Nullable<Text>,
            to_status -> Text,
            actor -> Text,
            note -> Nullable<Text>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        booking_payments (id) {
            id -> Uuid,
            booking_id -> Uuid,
            provider -> Text,
            intent_id -> Nullable<Text>,
            charge_id -> Nullable<Text>,
            amount -> Int8,
            currency -> Text,
            mode -> Text,
            is_deposit -> Bool,
            status -> Text,
            provider_response -> Nullable<Jsonb>,
            refunded_amount -> Int8,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        idempotency_keys (id) {
            id -> Uuid,
            scope -> Text,
            request_hash -> Text,
            status -> Text,
            response -> Nullable<Jsonb>,
            expires_at -> Timestamptz,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        payment_webhooks (id) {
            id -> Uuid,
            provider -> Text,
            event_id -> Text,
            event_type -> Text,
            signature -> Text,
            payload -> Jsonb,
            processed_at -> Nullable<Timestamptz>,
            retry_count -> Int4,
            last_error -> Nullable<Text>,
            permanently_failed -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::allow_tables_to_appear_in_same_query!(bookings, booking_payments);
    diesel::allow_tables_to_appear_in_same_query!(bookings, booking_history);
    diesel::allow_tables_to_appear_in_same_query!(services, cancellation_policies);
}

pub use schema::*;
