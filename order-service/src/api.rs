use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::{OrderStatus, OrderType};

use crate::error::AppError;
use crate::orders::{
    CreateOrderInput, CreateOutcome, OrderFilter, OrderItemInput, OrderService,
};

#[derive(Clone)]
pub struct AppState {
    pub orders: OrderService,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub shop_id: Uuid,
    pub items: Vec<OrderItemInput>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub discount_amount: Option<BigDecimal>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub shop_id: Option<Uuid>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_)
            | AppError::InsufficientStock { .. }
            | AppError::CreditExceeded { .. } => StatusCode::BAD_REQUEST,
            AppError::StateConflict { .. } | AppError::RequestInFlight => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(_) | AppError::Pool(_) | AppError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn create_router(state: AppState, request_timeout: std::time::Duration) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", put(update_status))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/approve", post(approve_order))
        .route("/orders/:id/reject", post(reject_order))
        .route("/health", get(health_check))
        .with_state(state)
        // Requests that outlive this window get a 408 instead of holding a
        // pool connection indefinitely.
        .layer(tower_http::timeout::TimeoutLayer::new(request_timeout))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, AppError> {
    let input = CreateOrderInput {
        customer_id: request.customer_id,
        shop_id: request.shop_id,
        items: request.items,
        order_type: request.order_type.unwrap_or(OrderType::WalkIn),
        discount_amount: request.discount_amount,
        notes: request.notes,
        idempotency_key: request.idempotency_key,
    };

    match state.orders.create_order(input).await? {
        CreateOutcome::Created(details) => {
            Ok((StatusCode::CREATED, Json(details)).into_response())
        }
        CreateOutcome::Replayed(cached) => Ok((StatusCode::OK, Json(cached)).into_response()),
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let details = state.orders.get_order(id).await?;
    Ok(Json(details).into_response())
}

#[derive(Debug, Serialize)]
pub struct ListOrdersResponse {
    pub orders: Vec<crate::models::Order>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Response, AppError> {
    let filter = OrderFilter {
        status: query.status,
        customer_id: query.customer_id,
        shop_id: query.shop_id,
        page: query.page,
        limit: query.limit,
    };
    let (orders, total) = state.orders.list_orders(&filter).await?;
    Ok(Json(ListOrdersResponse {
        orders,
        total,
        page: filter.page.max(1),
        limit: filter.limit.clamp(1, 100),
    })
    .into_response())
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Response, AppError> {
    let order = state.orders.update_status(id, request.status).await?;
    Ok(Json(order).into_response())
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Response, AppError> {
    let order = state.orders.cancel(id, request.reason).await?;
    Ok(Json(order).into_response())
}

pub async fn approve_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let order = state.orders.approve(id).await?;
    Ok(Json(order).into_response())
}

pub async fn reject_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Response, AppError> {
    let order = state.orders.reject(id, request.reason).await?;
    Ok(Json(order).into_response())
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_minimal_body() {
        let body = serde_json::json!({
            "customer_id": Uuid::new_v4(),
            "shop_id": Uuid::new_v4(),
            "items": [{"product_id": Uuid::new_v4(), "quantity": 2}],
        });
        let request: CreateOrderRequest = serde_json::from_value(body).unwrap();
        assert!(request.order_type.is_none());
        assert!(request.idempotency_key.is_none());
        assert_eq!(request.items[0].quantity, 2);
    }

    #[test]
    fn create_request_parses_b2b_order_type() {
        let body = serde_json::json!({
            "customer_id": Uuid::new_v4(),
            "shop_id": Uuid::new_v4(),
            "items": [{"product_id": Uuid::new_v4(), "quantity": 1}],
            "order_type": "b2b",
            "idempotency_key": "req-1234",
        });
        let request: CreateOrderRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.order_type, Some(OrderType::B2b));
        assert_eq!(request.idempotency_key.as_deref(), Some("req-1234"));
    }

    #[test]
    fn status_request_uses_storage_vocabulary() {
        let request: UpdateStatusRequest =
            serde_json::from_value(serde_json::json!({"status": "preparing"})).unwrap();
        assert_eq!(request.status, OrderStatus::Preparing);
    }
}
