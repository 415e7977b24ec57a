//! Payments and refunds.
//!
//! ```text
//! paid ──────────────► paid_amount += amount        0 ≤ paid − refunded ≤ total
//! refund ────────────► refunded_amount += amount    0 ≤ refunded ≤ paid
//!   └─ credit charged and order live ─► credit_used −= amount
//! ```

use keel_core::order::{Order, OrderStatus};
use keel_core::validation::{validate_text, MAX_REASON_LEN};
use keel_core::{Money, ValidationError};

use super::lifecycle::{close_if_refunded, release_credit, Transition};
use super::{OrderService, PaymentRequest, RefundRequest};
use crate::context::RequestContext;
use crate::error::EngineResult;
use crate::ledger::StockTx;

const MAX_PAYMENT_REFERENCE_LEN: usize = 200;

impl OrderService {
    /// Records money received against the order.
    pub async fn record_payment(
        &self,
        ctx: &RequestContext,
        id: &str,
        req: PaymentRequest,
    ) -> EngineResult<Order> {
        validate_text("reference", req.reference.as_deref(), MAX_PAYMENT_REFERENCE_LEN)?;
        self.run(ctx, id, Transition::RecordPayment(req)).await
    }

    /// Refunds `amount`, or everything refundable when no amount is given.
    pub async fn refund(&self, ctx: &RequestContext, id: &str, req: RefundRequest) -> EngineResult<Order> {
        self.run(ctx, id, Transition::Refund(req)).await
    }

    /// Refunds part of what was paid. The amount must be below the
    /// refundable amount; use [`refund`](Self::refund) for the rest.
    pub async fn partial_refund(
        &self,
        ctx: &RequestContext,
        id: &str,
        amount: Money,
        reason: Option<String>,
    ) -> EngineResult<Order> {
        let req = RefundRequest {
            amount: Some(amount),
            reason,
        };
        self.run(ctx, id, Transition::PartialRefund(req)).await
    }

    pub(super) async fn refund_in(
        &self,
        stx: &mut StockTx<'_>,
        order: &mut Order,
        req: &RefundRequest,
        partial: bool,
    ) -> EngineResult<()> {
        validate_text("reason", req.reason.as_deref(), MAX_REASON_LEN)?;
        let refundable = order.refundable();
        let amount = req.amount.unwrap_or(refundable);
        if partial && amount >= refundable {
            return Err(ValidationError::Invalid {
                field: "amount".into(),
                reason: format!(
                    "partial refund of {} must be less than the refundable amount {}",
                    amount, refundable
                ),
            }
            .into());
        }

        let holds_credit = order.credit_charged() && order.status != OrderStatus::Cancelled;
        let now = stx.now();
        order.refund(amount, now)?;
        if holds_credit {
            let customer_id = order.customer_id.clone();
            release_credit(stx, &customer_id, amount).await?;
        }
        close_if_refunded(order, now)?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use keel_core::order::PaymentStatus;
    use keel_core::ErrorCode;

    fn pay(cents: i64) -> PaymentRequest {
        PaymentRequest {
            amount: Money::from_cents(cents),
            reference: Some("txn-1".into()),
        }
    }

    #[tokio::test]
    async fn test_payment_status_follows_amounts() {
        let t = TestEngine::new().await;
        t.stock(20).await;
        let ctx = RequestContext::new("alice");
        let order = t.confirmed_order(vec![t.line(&t.product, 2)]).await;
        let total = order.total.cents();

        let order = t.engine.orders.record_payment(&ctx, &order.id, pay(1000)).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Partial);
        assert_eq!(order.balance_due(), Money::from_cents(total - 1000));

        let err = t
            .engine
            .orders
            .record_payment(&ctx, &order.id, pay(total))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let order = t
            .engine
            .orders
            .record_payment(&ctx, &order.id, pay(total - 1000))
            .await
            .unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert!(order.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_payment_rejected_on_draft() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("alice");
        let draft = t
            .engine
            .orders
            .create(&ctx, t.new_order(vec![t.line(&t.product, 1)]))
            .await
            .unwrap();
        let err = t
            .engine
            .orders
            .record_payment(&ctx, &draft.id, pay(100))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
    }

    #[tokio::test]
    async fn test_refunds_release_credit() {
        let t = TestEngine::new().await;
        t.stock(20).await;
        let ctx = RequestContext::new("alice");
        let order = t.confirmed_order(vec![t.line(&t.product, 2)]).await;
        let total = order.total;
        assert_eq!(t.credit_used().await, total);

        t.engine
            .orders
            .record_payment(&ctx, &order.id, pay(total.cents()))
            .await
            .unwrap();

        let err = t
            .engine
            .orders
            .partial_refund(&ctx, &order.id, total, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let order = t
            .engine
            .orders
            .partial_refund(&ctx, &order.id, Money::from_cents(500), Some("damaged box".into()))
            .await
            .unwrap();
        assert_eq!(order.refunded_amount, Money::from_cents(500));
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert_eq!(t.credit_used().await, total - Money::from_cents(500));

        let order = t
            .engine
            .orders
            .refund(&ctx, &order.id, RefundRequest::default())
            .await
            .unwrap();
        assert_eq!(order.refunded_amount, total);
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert_eq!(t.credit_used().await, Money::zero());
        assert!(order.check_invariants().is_ok());

        let err = t
            .engine
            .orders
            .refund(&ctx, &order.id, RefundRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_keyed_payment_is_applied_once() {
        let t = TestEngine::new().await;
        t.stock(20).await;
        let order = t.confirmed_order(vec![t.line(&t.product, 1)]).await;
        let ctx = RequestContext::new("alice").with_idempotency_key(Some("pay-1".into()));

        let first = t.engine.orders.record_payment(&ctx, &order.id, pay(300)).await.unwrap();
        let again = t.engine.orders.record_payment(&ctx, &order.id, pay(300)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(
            t.engine.orders.get(&order.id).await.unwrap().paid_amount,
            Money::from_cents(300)
        );

        let err = t
            .engine
            .orders
            .record_payment(&ctx, &order.id, pay(400))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }
}
