//! Row-locked wallet mutations and their append-only records.
//!
//! Every monetary movement goes through one of these three functions,
//! inside a [`StoreTxn`] the *caller* opened -- wallet ops and the order /
//! refund / withdrawal rows they pay for must commit together. The
//! functions lock the wallet row, refuse anything that would drive a
//! balance negative, persist the new balances, and append a record
//! capturing before / delta / after.

use chrono::Utc;
use paygate_common::{
    Error,
    amount::round_money,
    enums::WalletChangeType,
    error::PayResult,
    ids::{MerchantId, TradeNo},
};
use rust_decimal::Decimal;

use crate::{
    models::{MerchantWallet, MerchantWalletPrepaidRecord, MerchantWalletRecord},
    store::StoreTxn,
};

/// Apply `delta` to the available balance.
///
/// With `reduce_unavailable` set and `delta > 0`, the same magnitude is
/// simultaneously removed from the unavailable balance -- the settlement
/// move. Fails without side effects when either balance would go
/// negative; the caller's transaction rolls back whatever else it did.
pub async fn change_available(
    txn: &mut dyn StoreTxn,
    merchant_id: MerchantId,
    delta: Decimal,
    change_type: WalletChangeType,
    trade_no: Option<TradeNo>,
    remark: Option<String>,
    reduce_unavailable: bool,
) -> PayResult<MerchantWallet> {
    let mut wallet = txn.wallet_for_update(merchant_id).await?;
    let delta = round_money(delta);
    if delta.is_zero() {
        return Ok(wallet);
    }

    let old_available = wallet.available;
    let old_unavailable = wallet.unavailable;

    wallet.available =
        old_available.checked_add_signed(delta).ok_or_else(|| {
            Error::insufficient_funds("available balance insufficient")
        })?;

    let delta_unavailable = if reduce_unavailable && delta > Decimal::ZERO {
        wallet.unavailable =
            old_unavailable.checked_add_signed(-delta).ok_or_else(|| {
                Error::insufficient_funds("unavailable balance insufficient")
            })?;
        -delta
    } else {
        Decimal::ZERO
    };

    txn.update_wallet(&wallet).await?;
    txn.insert_wallet_record(MerchantWalletRecord {
        id: 0,
        merchant_id,
        change_type,
        old_available,
        delta_available: delta,
        new_available: wallet.available,
        old_unavailable,
        delta_unavailable,
        new_unavailable: wallet.unavailable,
        trade_no,
        remark,
        created_at: Utc::now(),
    })
    .await?;
    Ok(wallet)
}

/// Apply `delta` to the unavailable balance; the mirror of
/// [`change_available`]. With `reduce_available` set and `delta > 0`, the
/// same magnitude is removed from the available balance.
pub async fn change_unavailable(
    txn: &mut dyn StoreTxn,
    merchant_id: MerchantId,
    delta: Decimal,
    change_type: WalletChangeType,
    trade_no: Option<TradeNo>,
    remark: Option<String>,
    reduce_available: bool,
) -> PayResult<MerchantWallet> {
    let mut wallet = txn.wallet_for_update(merchant_id).await?;
    let delta = round_money(delta);
    if delta.is_zero() {
        return Ok(wallet);
    }

    let old_available = wallet.available;
    let old_unavailable = wallet.unavailable;

    wallet.unavailable =
        old_unavailable.checked_add_signed(delta).ok_or_else(|| {
            Error::insufficient_funds("unavailable balance insufficient")
        })?;

    let delta_available = if reduce_available && delta > Decimal::ZERO {
        wallet.available =
            old_available.checked_add_signed(-delta).ok_or_else(|| {
                Error::insufficient_funds("available balance insufficient")
            })?;
        -delta
    } else {
        Decimal::ZERO
    };

    txn.update_wallet(&wallet).await?;
    txn.insert_wallet_record(MerchantWalletRecord {
        id: 0,
        merchant_id,
        change_type,
        old_available,
        delta_available,
        new_available: wallet.available,
        old_unavailable,
        delta_unavailable: delta,
        new_unavailable: wallet.unavailable,
        trade_no,
        remark,
        created_at: Utc::now(),
    })
    .await?;
    Ok(wallet)
}

/// Apply `delta` to the prepaid balance.
pub async fn change_prepaid(
    txn: &mut dyn StoreTxn,
    merchant_id: MerchantId,
    delta: Decimal,
    remark: Option<String>,
) -> PayResult<MerchantWallet> {
    let mut wallet = txn.wallet_for_update(merchant_id).await?;
    let delta = round_money(delta);
    if delta.is_zero() {
        return Ok(wallet);
    }

    let old_prepaid = wallet.prepaid;
    wallet.prepaid =
        old_prepaid.checked_add_signed(delta).ok_or_else(|| {
            Error::insufficient_funds("prepaid balance insufficient")
        })?;

    txn.update_wallet(&wallet).await?;
    txn.insert_prepaid_record(MerchantWalletPrepaidRecord {
        id: 0,
        merchant_id,
        old_prepaid,
        delta_prepaid: delta,
        new_prepaid: wallet.prepaid,
        remark,
        created_at: Utc::now(),
    })
    .await?;
    Ok(wallet)
}

#[cfg(test)]
mod test {
    use paygate_common::{Amount, ErrorKind};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{
        models::MerchantWallet,
        store::{Store, mem::MemStore},
    };

    async fn store_with_wallet(
        available: Amount,
        unavailable: Amount,
    ) -> MemStore {
        let store = MemStore::new();
        store
            .seed_wallet(MerchantWallet {
                merchant_id: MerchantId(1),
                available,
                unavailable,
                prepaid: Amount::ZERO,
                margin: Amount::ZERO,
            })
            .await;
        store
    }

    #[tokio::test]
    async fn credit_and_debit_with_records() {
        let store =
            store_with_wallet(Amount::from_cents(10_000), Amount::ZERO).await;
        let mut txn = store.begin().await.unwrap();

        let wallet = change_available(
            txn.as_mut(),
            MerchantId(1),
            dec!(-40.00),
            WalletChangeType::OrderRefund,
            None,
            Some("refund".to_owned()),
            false,
        )
        .await
        .unwrap();
        assert_eq!(wallet.available, Amount::from_cents(6_000));
        txn.commit().await.unwrap();

        let records = store.all_wallet_records().await;
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.old_available, Amount::from_cents(10_000));
        assert_eq!(r.delta_available, dec!(-40.00));
        assert_eq!(r.new_available, Amount::from_cents(6_000));
        assert_eq!(r.delta_unavailable, Decimal::ZERO);
    }

    #[tokio::test]
    async fn overdraft_refused_and_rolled_back() {
        let store =
            store_with_wallet(Amount::from_cents(100), Amount::ZERO).await;
        let mut txn = store.begin().await.unwrap();

        let err = change_available(
            txn.as_mut(),
            MerchantId(1),
            dec!(-1.01),
            WalletChangeType::Withdrawal,
            None,
            None,
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientFunds);
        txn.rollback().await.unwrap();

        let wallet = store.wallet(MerchantId(1)).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(100));
        assert!(store.all_wallet_records().await.is_empty());
    }

    #[tokio::test]
    async fn settle_move_reduces_unavailable() {
        let store = store_with_wallet(
            Amount::ZERO,
            Amount::from_cents(9_750),
        )
        .await;
        let mut txn = store.begin().await.unwrap();

        let wallet = change_available(
            txn.as_mut(),
            MerchantId(1),
            dec!(97.50),
            WalletChangeType::OrderSettle,
            None,
            None,
            true,
        )
        .await
        .unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
        assert_eq!(wallet.unavailable, Amount::ZERO);
        txn.commit().await.unwrap();

        let records = store.all_wallet_records().await;
        assert_eq!(records[0].delta_unavailable, dec!(-97.50));
        assert_eq!(records[0].delta_available, dec!(97.50));
    }

    #[tokio::test]
    async fn settle_move_refuses_when_unavailable_short() {
        let store = store_with_wallet(
            Amount::ZERO,
            Amount::from_cents(100),
        )
        .await;
        let mut txn = store.begin().await.unwrap();

        let err = change_available(
            txn.as_mut(),
            MerchantId(1),
            dec!(2.00),
            WalletChangeType::OrderSettle,
            None,
            None,
            true,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientFunds);
    }

    #[tokio::test]
    async fn zero_delta_is_a_noop() {
        let store =
            store_with_wallet(Amount::from_cents(500), Amount::ZERO).await;
        let mut txn = store.begin().await.unwrap();
        change_available(
            txn.as_mut(),
            MerchantId(1),
            Decimal::ZERO,
            WalletChangeType::Adjust,
            None,
            None,
            false,
        )
        .await
        .unwrap();
        txn.commit().await.unwrap();
        assert!(store.all_wallet_records().await.is_empty());
    }

    #[tokio::test]
    async fn prepaid_floor_at_zero() {
        let store =
            store_with_wallet(Amount::ZERO, Amount::ZERO).await;
        let mut txn = store.begin().await.unwrap();
        change_prepaid(txn.as_mut(), MerchantId(1), dec!(50.00), None)
            .await
            .unwrap();
        let err =
            change_prepaid(txn.as_mut(), MerchantId(1), dec!(-50.01), None)
                .await
                .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientFunds);
        let wallet =
            change_prepaid(txn.as_mut(), MerchantId(1), dec!(-50.00), None)
                .await
                .unwrap();
        assert_eq!(wallet.prepaid, Amount::ZERO);
        txn.commit().await.unwrap();
        assert_eq!(store.all_prepaid_records().await.len(), 2);
    }
}
