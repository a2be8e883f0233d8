use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::CustomerCredit;
use crate::schema::customer_credit;

#[derive(Debug, Clone, PartialEq)]
pub enum CreditDecision {
    AutoApprove,
    RequireApproval,
    Reject { available: BigDecimal },
}

/// Policy gate in front of order creation for B2B customers. Rejection is a
/// business refusal, not a fault; approval routing depends only on the
/// customer's auto-approval limit.
pub fn evaluate(profile: &CustomerCredit, order_total: &BigDecimal) -> CreditDecision {
    let available = &profile.credit_limit - &profile.balance;
    if *order_total > available {
        CreditDecision::Reject { available }
    } else if *order_total > profile.auto_approval_limit {
        CreditDecision::RequireApproval
    } else {
        CreditDecision::AutoApprove
    }
}

/// Loads the credit profile with FOR UPDATE so the balance increment
/// serializes against concurrent orders for the same customer.
pub async fn get_profile_for_update(
    conn: &mut AsyncPgConnection,
    customer_id: Uuid,
) -> Result<CustomerCredit, AppError> {
    customer_credit::table
        .filter(customer_credit::customer_id.eq(customer_id))
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("credit profile for customer {}", customer_id)))
}

pub async fn increment_balance(
    conn: &mut AsyncPgConnection,
    customer_id: Uuid,
    amount: &BigDecimal,
) -> Result<(), AppError> {
    diesel::update(customer_credit::table.filter(customer_credit::customer_id.eq(customer_id)))
        .set(customer_credit::balance.eq(customer_credit::balance + amount.clone()))
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(limit: i64, balance: i64, auto: i64) -> CustomerCredit {
        CustomerCredit {
            customer_id: Uuid::new_v4(),
            credit_limit: BigDecimal::from(limit),
            balance: BigDecimal::from(balance),
            auto_approval_limit: BigDecimal::from(auto),
        }
    }

    #[test]
    fn order_above_auto_limit_requires_approval() {
        // Limit 50_000, balance 40_000, auto-approval 5_000. An 8_000 order
        // fits the remaining credit but exceeds the auto-approval threshold.
        let p = profile(50_000, 40_000, 5_000);
        assert_eq!(
            evaluate(&p, &BigDecimal::from(8_000)),
            CreditDecision::RequireApproval
        );
    }

    #[test]
    fn order_above_available_credit_is_rejected() {
        let p = profile(50_000, 40_000, 5_000);
        assert_eq!(
            evaluate(&p, &BigDecimal::from(12_000)),
            CreditDecision::Reject {
                available: BigDecimal::from(10_000)
            }
        );
    }

    #[test]
    fn small_order_auto_approves() {
        let p = profile(50_000, 40_000, 5_000);
        assert_eq!(
            evaluate(&p, &BigDecimal::from(4_000)),
            CreditDecision::AutoApprove
        );
    }

    #[test]
    fn boundary_values_do_not_reject() {
        let p = profile(50_000, 40_000, 5_000);
        // Exactly the available credit passes the gate, exactly the
        // auto-approval limit still auto-approves.
        assert_eq!(
            evaluate(&p, &BigDecimal::from(10_000)),
            CreditDecision::RequireApproval
        );
        assert_eq!(
            evaluate(&p, &BigDecimal::from(5_000)),
            CreditDecision::AutoApprove
        );
    }
}
