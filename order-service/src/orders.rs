use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time;
use tracing::{info, warn};
use uuid::Uuid;

use shared::{
    OrderStatus, OrderType, PaymentStatus, AGGREGATE_INVENTORY, AGGREGATE_ORDER,
    INVENTORY_LOW_STOCK, ORDER_APPROVED, ORDER_CANCELLED, ORDER_CREATED, ORDER_REJECTED,
    ORDER_STATUS_UPDATED,
};

use crate::allocator;
use crate::catalog;
use crate::credit;
use crate::error::{backoff_delay, is_transient, AppError};
use crate::idempotency::{self, Begin};
use crate::models::{
    NewOrder, NewOrderAllocation, NewOrderItem, Order, OrderAllocation, OrderItem,
};
use crate::outbox::{self, DomainEvent};
use crate::schema::{order_allocations, order_items, orders};

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderItemInput {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub customer_id: Uuid,
    pub shop_id: Uuid,
    pub items: Vec<OrderItemInput>,
    pub order_type: OrderType,
    pub discount_amount: Option<BigDecimal>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(OrderDetails),
    /// The idempotency key matched a completed request; this is the cached
    /// response from the first execution.
    Replayed(serde_json::Value),
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub customer_id: Option<Uuid>,
    pub shop_id: Option<Uuid>,
    pub page: i64,
    pub limit: i64,
}

#[derive(Clone)]
pub struct OrderService {
    pool: DbPool,
    idempotency_ttl_secs: i64,
    max_tx_retries: u32,
}

impl OrderService {
    pub fn new(pool: DbPool, idempotency_ttl_secs: i64, max_tx_retries: u32) -> Self {
        Self {
            pool,
            idempotency_ttl_secs,
            max_tx_retries,
        }
    }

    pub async fn create_order(&self, input: CreateOrderInput) -> Result<CreateOutcome, AppError> {
        validate_input(&input)?;

        if let Some(key) = input.idempotency_key.clone() {
            // Reservation runs on its own connection, outside the business
            // transaction, so concurrent holders of the same key see it
            // immediately.
            {
                let mut conn = self.conn().await?;
                match idempotency::begin(&mut conn, &key, self.idempotency_ttl_secs).await? {
                    Begin::Fresh => {}
                    Begin::InFlight => return Err(AppError::RequestInFlight),
                    Begin::Done(cached) => {
                        info!("replaying cached response for idempotency key {}", key);
                        return Ok(CreateOutcome::Replayed(cached));
                    }
                }
            }

            match self.create_with_retry(&input).await {
                Ok(details) => {
                    let response = serde_json::to_value(&details)?;
                    let mut conn = self.conn().await?;
                    idempotency::complete(&mut conn, &key, &response).await?;
                    Ok(CreateOutcome::Created(details))
                }
                Err(e) => {
                    // Free the key so a client retry is not wedged behind a
                    // reservation that will never complete.
                    match self.conn().await {
                        Ok(mut conn) => {
                            if let Err(release_err) = idempotency::release(&mut conn, &key).await {
                                warn!("failed to release idempotency key {}: {}", key, release_err);
                            }
                        }
                        Err(pool_err) => {
                            warn!("failed to release idempotency key {}: {}", key, pool_err);
                        }
                    }
                    Err(e)
                }
            }
        } else {
            let details = self.create_with_retry(&input).await?;
            Ok(CreateOutcome::Created(details))
        }
    }

    async fn create_with_retry(&self, input: &CreateOrderInput) -> Result<OrderDetails, AppError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn().await?;
            match create_tx(&mut conn, input).await {
                Err(e) if is_transient(&e) && attempt < self.max_tx_retries => {
                    attempt += 1;
                    warn!("transient storage error on order create, attempt {}: {}", attempt, e);
                    time::sleep(backoff_delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<Order, AppError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn().await?;
            match update_status_tx(&mut conn, order_id, new_status).await {
                Err(e) if is_transient(&e) && attempt < self.max_tx_retries => {
                    attempt += 1;
                    time::sleep(backoff_delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn cancel(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<Order, AppError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn().await?;
            match cancel_tx(&mut conn, order_id, reason.as_deref(), ORDER_CANCELLED, None).await {
                Err(e) if is_transient(&e) && attempt < self.max_tx_retries => {
                    attempt += 1;
                    time::sleep(backoff_delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn approve(&self, order_id: Uuid) -> Result<Order, AppError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn().await?;
            match approve_tx(&mut conn, order_id).await {
                Err(e) if is_transient(&e) && attempt < self.max_tx_retries => {
                    attempt += 1;
                    time::sleep(backoff_delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn reject(&self, order_id: Uuid, reason: Option<String>) -> Result<Order, AppError> {
        let mut attempt = 0;
        loop {
            let mut conn = self.conn().await?;
            match reject_tx(&mut conn, order_id, reason.as_deref()).await {
                Err(e) if is_transient(&e) && attempt < self.max_tx_retries => {
                    attempt += 1;
                    time::sleep(backoff_delay(attempt)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, AppError> {
        let mut conn = self.conn().await?;
        let order: Order = orders::table
            .find(order_id)
            .first(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("order {}", order_id)))?;
        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .load(&mut conn)
            .await?;
        Ok(OrderDetails { order, items })
    }

    pub async fn list_orders(&self, filter: &OrderFilter) -> Result<(Vec<Order>, i64), AppError> {
        let mut conn = self.conn().await?;
        let page = filter.page.max(1);
        let limit = filter.limit.clamp(1, 100);

        let mut query = orders::table.into_boxed();
        let mut count_query = orders::table.count().into_boxed();
        if let Some(status) = filter.status {
            query = query.filter(orders::status.eq(status.as_str()));
            count_query = count_query.filter(orders::status.eq(status.as_str()));
        }
        if let Some(customer_id) = filter.customer_id {
            query = query.filter(orders::customer_id.eq(customer_id));
            count_query = count_query.filter(orders::customer_id.eq(customer_id));
        }
        if let Some(shop_id) = filter.shop_id {
            query = query.filter(orders::shop_id.eq(shop_id));
            count_query = count_query.filter(orders::shop_id.eq(shop_id));
        }

        let total: i64 = count_query.get_result(&mut conn).await?;
        let rows = query
            .order(orders::created_at.desc())
            .offset((page - 1) * limit)
            .limit(limit)
            .load(&mut conn)
            .await?;
        Ok((rows, total))
    }

    async fn conn(
        &self,
    ) -> Result<
        bb8::PooledConnection<
            '_,
            diesel_async::pooled_connection::AsyncDieselConnectionManager<AsyncPgConnection>,
        >,
        AppError,
    > {
        self.pool
            .get()
            .await
            .map_err(|e| AppError::Pool(e.to_string()))
    }
}

pub fn validate_input(input: &CreateOrderInput) -> Result<(), AppError> {
    if input.items.is_empty() {
        return Err(AppError::Validation(
            "order must have at least one item".to_string(),
        ));
    }
    for item in &input.items {
        if item.quantity <= 0 {
            return Err(AppError::Validation(format!(
                "quantity for product {} must be positive",
                item.product_id
            )));
        }
    }
    if let Some(discount) = &input.discount_amount {
        if *discount < BigDecimal::from(0) {
            return Err(AppError::Validation(
                "discount must not be negative".to_string(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTotals {
    /// Gross sum of the item line totals; this is what `orders.total_amount`
    /// stores, so the order row always reconciles against its items.
    pub total: BigDecimal,
    /// Amount the customer actually owes after the discount. The credit gate
    /// and credit release work with this figure, never with `total`.
    pub net_due: BigDecimal,
}

pub fn compute_totals(
    line_totals: &[BigDecimal],
    discount: &BigDecimal,
) -> Result<OrderTotals, AppError> {
    let mut total = BigDecimal::from(0);
    for line in line_totals {
        total = total + line;
    }
    if *discount > total {
        return Err(AppError::Validation(
            "discount exceeds order total".to_string(),
        ));
    }
    Ok(OrderTotals {
        net_due: &total - discount,
        total,
    })
}

pub fn generate_order_number() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("ORD{}{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

fn parse_status(raw: &str) -> Result<OrderStatus, AppError> {
    OrderStatus::parse(raw)
        .ok_or_else(|| AppError::Validation(format!("unknown order status '{}' in storage", raw)))
}

async fn load_order_for_update(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
) -> Result<Order, AppError> {
    orders::table
        .find(order_id)
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("order {}", order_id)))
}

async fn create_tx(
    conn: &mut AsyncPgConnection,
    input: &CreateOrderInput,
) -> Result<OrderDetails, AppError> {
    let input = input.clone();
    conn.transaction::<OrderDetails, AppError, _>(|conn| {
        Box::pin(async move {
            let order_id = Uuid::new_v4();
            let order_number = generate_order_number();

            let mut new_items = Vec::with_capacity(input.items.len());
            let mut allocations = Vec::new();
            let mut low_stock: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();

            for item in &input.items {
                let product = catalog::get_product(conn, item.product_id, input.shop_id).await?;
                let line_total = &product.price * BigDecimal::from(item.quantity);

                let outcome =
                    allocator::allocate(conn, item.product_id, input.shop_id, item.quantity)
                        .await?;
                for line in outcome.lines {
                    allocations.push(NewOrderAllocation {
                        id: Uuid::new_v4(),
                        order_id,
                        lot_id: line.lot_id,
                        quantity: line.quantity,
                    });
                }
                if !outcome.low_stock_lots.is_empty() {
                    low_stock
                        .entry(item.product_id)
                        .or_default()
                        .extend(outcome.low_stock_lots);
                }

                new_items.push(NewOrderItem {
                    id: Uuid::new_v4(),
                    order_id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: product.price,
                    line_total,
                });
            }

            let discount = input.discount_amount.clone().unwrap_or_else(|| BigDecimal::from(0));
            let line_totals: Vec<BigDecimal> =
                new_items.iter().map(|i| i.line_total.clone()).collect();
            let totals = compute_totals(&line_totals, &discount)?;

            let mut status = OrderStatus::Pending;
            if input.order_type == OrderType::B2b {
                let profile = credit::get_profile_for_update(conn, input.customer_id).await?;
                match credit::evaluate(&profile, &totals.net_due) {
                    credit::CreditDecision::Reject { available } => {
                        return Err(AppError::CreditExceeded {
                            total: totals.net_due.clone(),
                            available,
                        });
                    }
                    credit::CreditDecision::RequireApproval => {
                        status = OrderStatus::PendingApproval;
                    }
                    credit::CreditDecision::AutoApprove => {
                        status = OrderStatus::Confirmed;
                        credit::increment_balance(conn, input.customer_id, &totals.net_due)
                            .await?;
                    }
                }
            }

            let new_order = NewOrder {
                id: order_id,
                order_number: order_number.clone(),
                customer_id: input.customer_id,
                shop_id: input.shop_id,
                status: status.as_str().to_string(),
                order_type: input.order_type.as_str().to_string(),
                payment_status: PaymentStatus::Pending.as_str().to_string(),
                total_amount: totals.total.clone(),
                discount_amount: discount.clone(),
                notes: input.notes.clone(),
                idempotency_key: input.idempotency_key.clone(),
            };
            diesel::insert_into(orders::table)
                .values(&new_order)
                .execute(conn)
                .await?;
            diesel::insert_into(order_items::table)
                .values(&new_items)
                .execute(conn)
                .await?;
            diesel::insert_into(order_allocations::table)
                .values(&allocations)
                .execute(conn)
                .await?;

            outbox::append(
                conn,
                DomainEvent {
                    aggregate_type: AGGREGATE_ORDER,
                    aggregate_id: order_id,
                    event_type: ORDER_CREATED,
                    payload: serde_json::json!({
                        "order_id": order_id,
                        "order_number": order_number,
                        "customer_id": input.customer_id,
                        "shop_id": input.shop_id,
                        "status": status,
                        "order_type": input.order_type,
                        "total_amount": totals.total,
                        "discount_amount": discount,
                        "items": new_items.iter().map(|i| serde_json::json!({
                            "product_id": i.product_id,
                            "quantity": i.quantity,
                            "unit_price": i.unit_price,
                        })).collect::<Vec<_>>(),
                    }),
                },
            )
            .await?;

            for (product_id, lots) in low_stock {
                outbox::append(
                    conn,
                    DomainEvent {
                        aggregate_type: AGGREGATE_INVENTORY,
                        aggregate_id: product_id,
                        event_type: INVENTORY_LOW_STOCK,
                        payload: serde_json::json!({
                            "product_id": product_id,
                            "shop_id": input.shop_id,
                            "lot_ids": lots,
                        }),
                    },
                )
                .await?;
            }

            let order: Order = orders::table.find(order_id).first(conn).await?;
            let items: Vec<OrderItem> = order_items::table
                .filter(order_items::order_id.eq(order_id))
                .load(conn)
                .await?;
            info!("created order {} with status {}", order_number, status);
            Ok(OrderDetails { order, items })
        })
    })
    .await
}

async fn update_status_tx(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    new_status: OrderStatus,
) -> Result<Order, AppError> {
    conn.transaction::<Order, AppError, _>(|conn| {
        Box::pin(async move {
            let order = load_order_for_update(conn, order_id).await?;
            let current = parse_status(&order.status)?;

            // Cancellation restores inventory and approval moves credit;
            // both have dedicated operations and are refused here.
            if new_status == OrderStatus::Cancelled
                || current == OrderStatus::PendingApproval
                || !current.can_transition_to(new_status)
            {
                return Err(AppError::StateConflict {
                    current,
                    requested: new_status.as_str().to_string(),
                });
            }

            diesel::update(orders::table.find(order_id))
                .set((
                    orders::status.eq(new_status.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

            outbox::append(
                conn,
                DomainEvent {
                    aggregate_type: AGGREGATE_ORDER,
                    aggregate_id: order_id,
                    event_type: ORDER_STATUS_UPDATED,
                    payload: serde_json::json!({
                        "order_id": order_id,
                        "order_number": order.order_number,
                        "previous_status": current,
                        "status": new_status,
                    }),
                },
            )
            .await?;

            let order = orders::table.find(order_id).first(conn).await?;
            Ok(order)
        })
    })
    .await
}

async fn cancel_tx(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    reason: Option<&str>,
    event_type: &'static str,
    required_status: Option<OrderStatus>,
) -> Result<Order, AppError> {
    let reason = reason.map(str::to_owned);
    conn.transaction::<Order, AppError, _>(|conn| {
        Box::pin(async move {
            let order = load_order_for_update(conn, order_id).await?;
            let current = parse_status(&order.status)?;
            if !current.can_transition_to(OrderStatus::Cancelled) {
                return Err(AppError::StateConflict {
                    current,
                    requested: OrderStatus::Cancelled.as_str().to_string(),
                });
            }
            if let Some(required) = required_status {
                if current != required {
                    return Err(AppError::StateConflict {
                        current,
                        requested: OrderStatus::Cancelled.as_str().to_string(),
                    });
                }
            }

            let allocations: Vec<OrderAllocation> = order_allocations::table
                .filter(order_allocations::order_id.eq(order_id))
                .load(conn)
                .await?;
            for allocation in &allocations {
                allocator::restore(conn, allocation.lot_id, allocation.quantity).await?;
            }

            // A confirmed B2B order has already consumed credit; release it.
            let is_b2b = order.order_type == OrderType::B2b.as_str();
            if is_b2b && current != OrderStatus::Pending && current != OrderStatus::PendingApproval
            {
                let net_due = &order.total_amount - &order.discount_amount;
                credit::increment_balance(conn, order.customer_id, &(-net_due)).await?;
            }

            let note = match (&order.notes, &reason) {
                (Some(existing), Some(r)) => Some(format!("{} | Cancelled: {}", existing, r)),
                (None, Some(r)) => Some(format!("Cancelled: {}", r)),
                (notes, None) => notes.clone(),
            };
            diesel::update(orders::table.find(order_id))
                .set((
                    orders::status.eq(OrderStatus::Cancelled.as_str()),
                    orders::notes.eq(note),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

            outbox::append(
                conn,
                DomainEvent {
                    aggregate_type: AGGREGATE_ORDER,
                    aggregate_id: order_id,
                    event_type,
                    payload: serde_json::json!({
                        "order_id": order_id,
                        "order_number": order.order_number,
                        "previous_status": current,
                        "reason": reason,
                        "lots_restored": allocations.len(),
                    }),
                },
            )
            .await?;

            let order = orders::table.find(order_id).first(conn).await?;
            info!("cancelled order {}", order_id);
            Ok(order)
        })
    })
    .await
}

async fn approve_tx(conn: &mut AsyncPgConnection, order_id: Uuid) -> Result<Order, AppError> {
    conn.transaction::<Order, AppError, _>(|conn| {
        Box::pin(async move {
            let order = load_order_for_update(conn, order_id).await?;
            let current = parse_status(&order.status)?;
            if current != OrderStatus::PendingApproval {
                return Err(AppError::StateConflict {
                    current,
                    requested: OrderStatus::Confirmed.as_str().to_string(),
                });
            }

            // The deferred credit increment happens here, not at creation.
            // Credit consumes what the customer owes, net of the discount.
            let net_due = &order.total_amount - &order.discount_amount;
            credit::increment_balance(conn, order.customer_id, &net_due).await?;

            diesel::update(orders::table.find(order_id))
                .set((
                    orders::status.eq(OrderStatus::Confirmed.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

            outbox::append(
                conn,
                DomainEvent {
                    aggregate_type: AGGREGATE_ORDER,
                    aggregate_id: order_id,
                    event_type: ORDER_APPROVED,
                    payload: serde_json::json!({
                        "order_id": order_id,
                        "order_number": order.order_number,
                        "total_amount": order.total_amount,
                    }),
                },
            )
            .await?;

            let order = orders::table.find(order_id).first(conn).await?;
            info!("approved order {}", order_id);
            Ok(order)
        })
    })
    .await
}

async fn reject_tx(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    reason: Option<&str>,
) -> Result<Order, AppError> {
    // Rejection is a cancellation restricted to parked orders. The credit
    // balance was never incremented for them, so only inventory unwinds.
    cancel_tx(
        conn,
        order_id,
        reason,
        ORDER_REJECTED,
        Some(OrderStatus::PendingApproval),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(items: Vec<OrderItemInput>) -> CreateOrderInput {
        CreateOrderInput {
            customer_id: Uuid::new_v4(),
            shop_id: Uuid::new_v4(),
            items,
            order_type: OrderType::WalkIn,
            discount_amount: None,
            notes: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn empty_item_list_is_rejected() {
        let err = validate_input(&input(vec![])).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let err = validate_input(&input(vec![OrderItemInput {
            product_id: Uuid::new_v4(),
            quantity: 0,
        }]))
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = validate_input(&input(vec![OrderItemInput {
            product_id: Uuid::new_v4(),
            quantity: -3,
        }]))
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn negative_discount_is_rejected() {
        let mut req = input(vec![OrderItemInput {
            product_id: Uuid::new_v4(),
            quantity: 1,
        }]);
        req.discount_amount = Some(BigDecimal::from(-5));
        assert!(matches!(
            validate_input(&req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn valid_input_passes() {
        let req = input(vec![OrderItemInput {
            product_id: Uuid::new_v4(),
            quantity: 2,
        }]);
        assert!(validate_input(&req).is_ok());
    }

    #[test]
    fn total_amount_stays_gross_when_discounted() {
        // Two units at 100 with a 50 discount: the order total must still
        // reconcile against the line totals, with the discount carried
        // separately and only the net figure reduced.
        let line_totals = vec![BigDecimal::from(200)];
        let totals = compute_totals(&line_totals, &BigDecimal::from(50)).unwrap();
        assert_eq!(totals.total, BigDecimal::from(200));
        assert_eq!(totals.net_due, BigDecimal::from(150));
    }

    #[test]
    fn total_amount_equals_sum_of_line_totals() {
        let line_totals = vec![
            BigDecimal::from(200),
            BigDecimal::from(75),
            BigDecimal::from(25),
        ];
        let totals = compute_totals(&line_totals, &BigDecimal::from(0)).unwrap();
        assert_eq!(totals.total, BigDecimal::from(300));
        assert_eq!(totals.net_due, totals.total);
    }

    #[test]
    fn discount_exceeding_the_total_is_rejected() {
        let line_totals = vec![BigDecimal::from(100)];
        assert!(matches!(
            compute_totals(&line_totals, &BigDecimal::from(101)),
            Err(AppError::Validation(_))
        ));
        // Exactly the total is allowed and nets to zero.
        let totals = compute_totals(&line_totals, &BigDecimal::from(100)).unwrap();
        assert_eq!(totals.net_due, BigDecimal::from(0));
    }

    #[test]
    fn order_numbers_are_prefixed_and_unique_enough() {
        let a = generate_order_number();
        let b = generate_order_number();
        assert!(a.starts_with("ORD"));
        assert_eq!(a.len(), "ORD".len() + 14 + 6);
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_stored_status_is_surfaced() {
        assert!(parse_status("pending").is_ok());
        assert!(matches!(
            parse_status("shipped"),
            Err(AppError::Validation(_))
        ));
    }
}
