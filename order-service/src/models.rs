use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub shop_id: Uuid,
    pub name: String,
    pub sku: String,
    pub price: BigDecimal,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct InventoryLot {
    pub id: Uuid,
    pub product_id: Uuid,
    pub shop_id: Uuid,
    pub quantity: i32,
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub reorder_threshold: i32,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct CustomerCredit {
    pub customer_id: Uuid,
    pub credit_limit: BigDecimal,
    pub balance: BigDecimal,
    pub auto_approval_limit: BigDecimal,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub shop_id: Uuid,
    pub status: String,
    pub order_type: String,
    pub payment_status: String,
    pub total_amount: BigDecimal,
    pub discount_amount: BigDecimal,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub shop_id: Uuid,
    pub status: String,
    pub order_type: String,
    pub payment_status: String,
    pub total_amount: BigDecimal,
    pub discount_amount: BigDecimal,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

#[derive(Debug, Clone, Queryable)]
pub struct OrderAllocation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub lot_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_allocations)]
pub struct NewOrderAllocation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub lot_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_dead_letters)]
pub struct NewDeadLetter {
    pub id: Uuid,
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: String,
}

#[derive(Debug, Clone, Queryable)]
pub struct IdempotencyRecord {
    pub key: String,
    pub response: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::idempotency_keys)]
pub struct NewIdempotencyRecord {
    pub key: String,
    pub response: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}
