use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_STATUS_UPDATED: &str = "order.status_updated";
pub const ORDER_CANCELLED: &str = "order.cancelled";
pub const ORDER_APPROVED: &str = "order.approved";
pub const ORDER_REJECTED: &str = "order.rejected";
pub const INVENTORY_LOW_STOCK: &str = "inventory.low_stock";

pub const AGGREGATE_ORDER: &str = "order";
pub const AGGREGATE_INVENTORY: &str = "inventory";
pub const AGGREGATE_PURCHASE_ORDER: &str = "purchase_order";

/// Wire format published to the bus. Consumers deduplicate on `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

pub fn topic_for_aggregate(aggregate_type: &str) -> &'static str {
    match aggregate_type {
        AGGREGATE_ORDER => "orders",
        AGGREGATE_INVENTORY => "inventory",
        AGGREGATE_PURCHASE_ORDER => "purchase_orders",
        _ => "domain-events",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PendingApproval,
    Confirmed,
    Preparing,
    Ready,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PendingApproval => "pending_approval",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "pending_approval" => Some(OrderStatus::PendingApproval),
            "confirmed" => Some(OrderStatus::Confirmed),
            "preparing" => Some(OrderStatus::Preparing),
            "ready" => Some(OrderStatus::Ready),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Legal transitions. Cancellation is reachable from every non-terminal
    /// state; approval moves a parked order to confirmed.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if next == OrderStatus::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Confirmed)
                | (OrderStatus::PendingApproval, OrderStatus::Confirmed)
                | (OrderStatus::Confirmed, OrderStatus::Preparing)
                | (OrderStatus::Preparing, OrderStatus::Ready)
                | (OrderStatus::Ready, OrderStatus::Delivered)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    WalkIn,
    Online,
    B2b,
    D2d,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::WalkIn => "walk_in",
            OrderType::Online => "online",
            OrderType::B2b => "b2b",
            OrderType::D2d => "d2d",
        }
    }

    pub fn parse(s: &str) -> Option<OrderType> {
        match s {
            "walk_in" => Some(OrderType::WalkIn),
            "online" => Some(OrderType::Online),
            "b2b" => Some(OrderType::B2b),
            "d2d" => Some(OrderType::D2d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_follow_the_pipeline() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Preparing));
        assert!(OrderStatus::Preparing.can_transition_to(OrderStatus::Ready));
        assert!(OrderStatus::Ready.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Ready));
        assert!(!OrderStatus::Confirmed.can_transition_to(OrderStatus::Delivered));
    }

    #[test]
    fn approval_branch_joins_the_same_machine() {
        assert!(OrderStatus::PendingApproval.can_transition_to(OrderStatus::Confirmed));
        assert!(OrderStatus::PendingApproval.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::PendingApproval.can_transition_to(OrderStatus::Preparing));
    }

    #[test]
    fn cancel_is_blocked_from_terminal_states() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Ready.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::PendingApproval,
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("shipped"), None);
    }

    #[test]
    fn topics_are_routed_per_aggregate_type() {
        assert_eq!(topic_for_aggregate(AGGREGATE_ORDER), "orders");
        assert_eq!(topic_for_aggregate(AGGREGATE_INVENTORY), "inventory");
        assert_eq!(topic_for_aggregate("unknown"), "domain-events");
    }

    #[test]
    fn envelope_serializes_with_snake_case_fields() {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: ORDER_CREATED.to_string(),
            aggregate_type: AGGREGATE_ORDER.to_string(),
            aggregate_id: Uuid::new_v4(),
            payload: serde_json::json!({"total_amount": "120.50"}),
            occurred_at: Utc::now(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("event_id").is_some());
        assert!(value.get("aggregate_id").is_some());
        assert_eq!(value["event_type"], "order.created");
    }
}
