use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::InventoryLot;
use crate::schema::inventory_lots;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationLine {
    pub lot_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub lines: Vec<AllocationLine>,
    /// Lots whose post-allocation quantity fell to or below their reorder
    /// threshold, for the low-stock event.
    pub low_stock_lots: Vec<Uuid>,
}

/// Greedy FIFO-by-expiry plan over the candidate lots. Soonest expiry is
/// consumed first, lots without an expiry date last, ties broken by lot id
/// so the result is deterministic. Returns `None` when the lots together
/// cannot cover the request; no partial plan is ever produced.
pub fn plan_allocation(lots: &[InventoryLot], requested: i32) -> Option<Vec<AllocationLine>> {
    let mut candidates: Vec<&InventoryLot> = lots.iter().filter(|l| l.quantity > 0).collect();
    candidates.sort_by(|a, b| match (a.expiry_date, b.expiry_date) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });

    let available: i64 = candidates.iter().map(|l| l.quantity as i64).sum();
    if available < requested as i64 {
        return None;
    }

    let mut remaining = requested;
    let mut lines = Vec::new();
    for lot in candidates {
        if remaining == 0 {
            break;
        }
        let take = lot.quantity.min(remaining);
        lines.push(AllocationLine {
            lot_id: lot.id,
            quantity: take,
        });
        remaining -= take;
    }
    Some(lines)
}

/// Deducts `requested` units from the lots of (product, shop), oldest expiry
/// first. Locks the candidate rows with FOR UPDATE so concurrent orders for
/// the same product serialize instead of losing updates. Must be called
/// inside the order-creation transaction.
pub async fn allocate(
    conn: &mut AsyncPgConnection,
    product_id: Uuid,
    shop_id: Uuid,
    requested: i32,
) -> Result<AllocationOutcome, AppError> {
    let lots: Vec<InventoryLot> = inventory_lots::table
        .filter(inventory_lots::product_id.eq(product_id))
        .filter(inventory_lots::shop_id.eq(shop_id))
        .filter(inventory_lots::quantity.gt(0))
        .order((inventory_lots::expiry_date.asc(), inventory_lots::id.asc()))
        .for_update()
        .load(conn)
        .await?;

    let lines = plan_allocation(&lots, requested).ok_or_else(|| {
        let available: i64 = lots.iter().map(|l| l.quantity as i64).sum();
        AppError::InsufficientStock {
            product_id,
            requested,
            available: available as i32,
        }
    })?;

    let mut low_stock_lots = Vec::new();
    for line in &lines {
        diesel::update(inventory_lots::table.filter(inventory_lots::id.eq(line.lot_id)))
            .set(inventory_lots::quantity.eq(inventory_lots::quantity - line.quantity))
            .execute(conn)
            .await?;

        if let Some(lot) = lots.iter().find(|l| l.id == line.lot_id) {
            if lot.quantity - line.quantity <= lot.reorder_threshold {
                low_stock_lots.push(lot.id);
            }
        }
    }

    Ok(AllocationOutcome {
        lines,
        low_stock_lots,
    })
}

/// Adds quantity back to the specific lot it was taken from. Used by the
/// cancellation path, which replays the persisted allocation lines.
pub async fn restore(
    conn: &mut AsyncPgConnection,
    lot_id: Uuid,
    quantity: i32,
) -> Result<(), AppError> {
    diesel::update(inventory_lots::table.filter(inventory_lots::id.eq(lot_id)))
        .set(inventory_lots::quantity.eq(inventory_lots::quantity + quantity))
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn lot(id: u128, qty: i32, expiry: Option<(i32, u32, u32)>) -> InventoryLot {
        InventoryLot {
            id: Uuid::from_u128(id),
            product_id: Uuid::from_u128(1),
            shop_id: Uuid::from_u128(2),
            quantity: qty,
            batch_number: None,
            expiry_date: expiry.map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap()),
            reorder_threshold: 0,
        }
    }

    #[test]
    fn consumes_soonest_expiry_first() {
        // Lot A: 5 units expiring 2025-01-01, lot B: 10 units expiring
        // 2025-06-01. A request for 8 drains A and takes 3 from B.
        let lots = vec![
            lot(0xB, 10, Some((2025, 6, 1))),
            lot(0xA, 5, Some((2025, 1, 1))),
        ];
        let lines = plan_allocation(&lots, 8).unwrap();
        assert_eq!(
            lines,
            vec![
                AllocationLine {
                    lot_id: Uuid::from_u128(0xA),
                    quantity: 5
                },
                AllocationLine {
                    lot_id: Uuid::from_u128(0xB),
                    quantity: 3
                },
            ]
        );
    }

    #[test]
    fn lots_without_expiry_are_consumed_last() {
        let lots = vec![lot(0x1, 4, None), lot(0x2, 4, Some((2026, 1, 1)))];
        let lines = plan_allocation(&lots, 6).unwrap();
        assert_eq!(lines[0].lot_id, Uuid::from_u128(0x2));
        assert_eq!(lines[0].quantity, 4);
        assert_eq!(lines[1].lot_id, Uuid::from_u128(0x1));
        assert_eq!(lines[1].quantity, 2);
    }

    #[test]
    fn ties_break_on_lot_id_for_determinism() {
        let lots = vec![
            lot(0x9, 3, Some((2025, 3, 1))),
            lot(0x3, 3, Some((2025, 3, 1))),
        ];
        let lines = plan_allocation(&lots, 4).unwrap();
        assert_eq!(lines[0].lot_id, Uuid::from_u128(0x3));
        assert_eq!(lines[1].lot_id, Uuid::from_u128(0x9));
    }

    #[test]
    fn insufficient_stock_yields_no_plan() {
        let lots = vec![lot(0x1, 2, None), lot(0x2, 3, Some((2025, 1, 1)))];
        assert!(plan_allocation(&lots, 6).is_none());
    }

    #[test]
    fn empty_and_zero_quantity_lots_are_ignored() {
        let lots = vec![lot(0x1, 0, Some((2024, 1, 1)))];
        assert!(plan_allocation(&lots, 1).is_none());
        assert_eq!(plan_allocation(&[], 0), Some(vec![]));
    }

    #[test]
    fn exact_fit_consumes_a_single_lot() {
        let lots = vec![lot(0x1, 5, Some((2025, 1, 1))), lot(0x2, 5, None)];
        let lines = plan_allocation(&lots, 5).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 5);
    }
}
