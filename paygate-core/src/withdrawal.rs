//! Clear-account and merchant withdrawals.
//!
//! Two entry flows -- the admin clear-account sweep and the merchant's
//! own withdrawal application -- feed one status machine. The platform's
//! prepaid advance is always offset first; rejecting, canceling, or
//! failing a withdrawal puts both components back.

use std::sync::Arc;

use paygate_common::{
    Amount, Error,
    enums::{WalletChangeType, WithdrawalStatus},
    error::PayResult,
    ids::{MerchantId, WithdrawalId},
    time::now,
};
use tracing::instrument;

use crate::{ctx::Ctx, ledger, models::MerchantWithdrawalRecord};

pub struct WithdrawalEngine {
    ctx: Arc<Ctx>,
}

impl WithdrawalEngine {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Admin clear-account: sweep the whole available balance.
    ///
    /// When the balance fits inside the prepaid advance the sweep is pure
    /// offset -- both shrink, nothing is paid out, and no withdrawal
    /// record exists. Otherwise a `PROCESSING` withdrawal is created for
    /// the payout portion.
    #[instrument(skip_all, name = "(settle-account)", fields(merchant_id = %merchant_id))]
    pub async fn settle_account(
        &self,
        merchant_id: MerchantId,
        payee_info: serde_json::Value,
    ) -> PayResult<Option<MerchantWithdrawalRecord>> {
        let mut txn = self.ctx.store.begin().await?;
        let wallet = txn.wallet_for_update(merchant_id).await?;
        let available = wallet.available;
        let prepaid = wallet.prepaid;
        if available.is_zero() {
            return Err(Error::insufficient_funds(
                "no available balance to clear",
            ));
        }

        if available <= prepaid {
            // Pure offset; the merchant receives nothing.
            ledger::change_available(
                txn.as_mut(),
                merchant_id,
                -available.get(),
                WalletChangeType::SettleAccount,
                None,
                Some("clear account: prepaid offset".to_owned()),
                false,
            )
            .await?;
            ledger::change_prepaid(
                txn.as_mut(),
                merchant_id,
                -available.get(),
                Some("clear account: prepaid offset".to_owned()),
            )
            .await?;
            txn.commit().await?;
            return Ok(None);
        }

        let mut record = MerchantWithdrawalRecord {
            id: WithdrawalId(0),
            merchant_id,
            payee_info,
            amount: available,
            prepaid_deducted: prepaid,
            received_amount: available - prepaid,
            fee: Amount::ZERO,
            fee_type: false,
            status: WithdrawalStatus::Processing,
            reject_reason: None,
            create_time: now(),
        };
        record.id = txn.insert_withdrawal(&record).await?;

        ledger::change_available(
            txn.as_mut(),
            merchant_id,
            -available.get(),
            WalletChangeType::SettleAccount,
            None,
            Some(format!("clear account: withdrawal {}", record.id)),
            false,
        )
        .await?;
        if !prepaid.is_zero() {
            ledger::change_prepaid(
                txn.as_mut(),
                merchant_id,
                -prepaid.get(),
                Some(format!("clear account: withdrawal {}", record.id)),
            )
            .await?;
        }
        txn.commit().await?;
        Ok(Some(record))
    }

    /// Merchant-initiated withdrawal of a chosen amount.
    #[instrument(skip_all, name = "(apply-withdrawal)", fields(merchant_id = %merchant_id))]
    pub async fn apply_withdrawal(
        &self,
        merchant_id: MerchantId,
        payee_info: serde_json::Value,
        amount: Amount,
    ) -> PayResult<MerchantWithdrawalRecord> {
        if amount.is_zero() {
            return Err(Error::invalid_request(
                "withdrawal amount must be positive",
            ));
        }

        let mut txn = self.ctx.store.begin().await?;
        let wallet = txn.wallet_for_update(merchant_id).await?;
        if amount > wallet.available {
            return Err(Error::insufficient_funds(
                "withdrawal exceeds the available balance",
            ));
        }

        let mut record = MerchantWithdrawalRecord {
            id: WithdrawalId(0),
            merchant_id,
            payee_info,
            amount,
            prepaid_deducted: Amount::ZERO,
            received_amount: amount,
            fee: Amount::ZERO,
            fee_type: false,
            status: WithdrawalStatus::Pending,
            reject_reason: None,
            create_time: now(),
        };
        record.id = txn.insert_withdrawal(&record).await?;

        ledger::change_available(
            txn.as_mut(),
            merchant_id,
            -amount.get(),
            WalletChangeType::Withdrawal,
            None,
            Some(format!("withdrawal {}", record.id)),
            false,
        )
        .await?;
        txn.commit().await?;
        Ok(record)
    }

    /// Drive the status machine. Transitions into `REJECTED`, `CANCELED`,
    /// or `FAILED` credit the amount back to available and the offset
    /// portion back to prepaid.
    #[instrument(skip_all, name = "(withdrawal-status)", fields(id = %id))]
    pub async fn change_status(
        &self,
        id: WithdrawalId,
        target: WithdrawalStatus,
        reason: Option<String>,
    ) -> PayResult<MerchantWithdrawalRecord> {
        let pre = self
            .ctx
            .store
            .withdrawal(id)
            .await?
            .ok_or_else(|| Error::not_found("withdrawal not found"))?;

        let mut txn = self.ctx.store.begin().await?;
        txn.wallet_for_update(pre.merchant_id).await?;
        let mut record = txn
            .withdrawal_for_update(id)
            .await?
            .ok_or_else(|| Error::not_found("withdrawal not found"))?;

        if !record.status.can_transition(target) {
            return Err(Error::conflict(format!(
                "withdrawal cannot move from {} to {target}",
                record.status
            )));
        }

        if target.refunds_wallet() {
            ledger::change_available(
                txn.as_mut(),
                record.merchant_id,
                record.amount.get(),
                WalletChangeType::WithdrawalRefund,
                None,
                Some(format!("withdrawal {} {target}", record.id)),
                false,
            )
            .await?;
            if !record.prepaid_deducted.is_zero() {
                ledger::change_prepaid(
                    txn.as_mut(),
                    record.merchant_id,
                    record.prepaid_deducted.get(),
                    Some(format!("withdrawal {} {target}", record.id)),
                )
                .await?;
            }
        }

        record.status = target;
        if matches!(
            target,
            WithdrawalStatus::Rejected | WithdrawalStatus::Failed
        ) {
            record.reject_reason = reason;
        }
        txn.update_withdrawal(&record).await?;
        txn.commit().await?;
        Ok(record)
    }
}
