use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Product;
use crate::schema::products;

/// Catalog lookup used during order validation. The unit price snapshot on
/// each order item comes from here, never from the client.
pub async fn get_product(
    conn: &mut AsyncPgConnection,
    product_id: Uuid,
    shop_id: Uuid,
) -> Result<Product, AppError> {
    let product: Option<Product> = products::table
        .filter(products::id.eq(product_id))
        .filter(products::shop_id.eq(shop_id))
        .first(conn)
        .await
        .optional()?;

    let product =
        product.ok_or_else(|| AppError::NotFound(format!("product {}", product_id)))?;

    if !product.is_active {
        return Err(AppError::Validation(format!(
            "product {} is not active",
            product.name
        )));
    }

    Ok(product)
}
