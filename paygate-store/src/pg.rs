//! Postgres implementation of the [`Store`] / [`StoreTxn`] ports.
//!
//! Runtime-bound queries with hand-mapped projection rows; no ORM. All
//! `*_for_update` queries take `SELECT … FOR UPDATE` row locks, and
//! unique-key violations surface as `CONFLICT` so engines can retry
//! generated identifiers.

use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use paygate_common::{
    Amount, Error, Rate,
    enums::{
        BlacklistEntityType, BlacklistOrigin, CertType, EncryptionMode,
        NotifyState, PaymentType, RefundInitiateType, RefundStatus, RollMode,
        SettleCycle, SettleState, SignType, TradeState, WalletChangeType,
        WithdrawalStatus,
    },
    error::PayResult,
    ids::{AccountId, ChannelId, MerchantId, MerchantNumber, RefundId, TradeNo, WithdrawalId},
};
use paygate_core::{
    models::{
        Blacklist, Merchant, MerchantEncryption, MerchantWallet,
        MerchantWalletPrepaidRecord, MerchantWalletRecord,
        MerchantWithdrawalRecord, Order, OrderBuyer, OrderNotification,
        OrderRefund, PaymentChannel, PaymentChannelAccount, RiskLog,
    },
    store::{BuyerIdentifiers, Store, StoreTxn},
};
use rust_decimal::Decimal;
use sqlx::{
    PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
};

/// Pool wrapper implementing [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .context("connecting to Postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

// --- Error helpers --- //

fn db_err(err: sqlx::Error) -> Error {
    if is_unique_violation(&err) {
        return Error::conflict("duplicate key");
    }
    Error::internal(anyhow::Error::new(err).context("database error"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn corrupt(what: &str) -> Error {
    Error::internal(anyhow::anyhow!("corrupt row: bad {what}"))
}

// --- Column helpers --- //

fn col_amount(row: &PgRow, col: &str) -> PayResult<Amount> {
    let value: Decimal = row.try_get(col).map_err(db_err)?;
    Amount::from_decimal_round(value).map_err(|_| corrupt(col))
}

fn col_amount_opt(row: &PgRow, col: &str) -> PayResult<Option<Amount>> {
    let value: Option<Decimal> = row.try_get(col).map_err(db_err)?;
    value
        .map(|v| Amount::from_decimal_round(v).map_err(|_| corrupt(col)))
        .transpose()
}

fn col_rate(row: &PgRow, col: &str) -> PayResult<Rate> {
    let value: Decimal = row.try_get(col).map_err(db_err)?;
    Rate::try_from_decimal(value).map_err(|_| corrupt(col))
}

fn col_enum<T: FromStr>(row: &PgRow, col: &str) -> PayResult<T> {
    let value: String = row.try_get(col).map_err(db_err)?;
    T::from_str(&value).map_err(|_| corrupt(col))
}

fn col_enum_opt<T: FromStr>(row: &PgRow, col: &str) -> PayResult<Option<T>> {
    let value: Option<String> = row.try_get(col).map_err(db_err)?;
    value
        .map(|v| T::from_str(&v).map_err(|_| corrupt(col)))
        .transpose()
}

fn col_trade_no(row: &PgRow, col: &str) -> PayResult<TradeNo> {
    let value: String = row.try_get(col).map_err(db_err)?;
    TradeNo::try_from(value).map_err(|_| corrupt(col))
}

// --- Row mappers --- //

fn merchant_from_row(row: &PgRow) -> PayResult<Merchant> {
    let number: String = row.try_get("merchant_number").map_err(db_err)?;
    let competence: serde_json::Value =
        row.try_get("competence").map_err(db_err)?;
    let whitelist: serde_json::Value =
        row.try_get("channel_whitelist").map_err(db_err)?;
    Ok(Merchant {
        id: MerchantId(row.try_get("id").map_err(db_err)?),
        merchant_number: MerchantNumber::try_from(number)
            .map_err(|_| corrupt("merchant_number"))?,
        email: row.try_get("email").map_err(db_err)?,
        mobile: row.try_get("mobile").map_err(db_err)?,
        status: row.try_get("status").map_err(db_err)?,
        risk_status: row.try_get("risk_status").map_err(db_err)?,
        buyer_pay_fee: row.try_get("buyer_pay_fee").map_err(db_err)?,
        competence: serde_json::from_value(competence)
            .map_err(|_| corrupt("competence"))?,
        channel_whitelist: serde_json::from_value(whitelist)
            .map_err(|_| corrupt("channel_whitelist"))?,
        password_salt: row.try_get("password_salt").map_err(db_err)?,
        password_hash: row.try_get("password_hash").map_err(db_err)?,
        deleted_at: row.try_get("deleted_at").map_err(db_err)?,
    })
}

const MERCHANT_COLS: &str = "id, merchant_number, email, mobile, status, \
    risk_status, buyer_pay_fee, competence, channel_whitelist, \
    password_salt, password_hash, deleted_at";

fn wallet_from_row(row: &PgRow) -> PayResult<MerchantWallet> {
    Ok(MerchantWallet {
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        available: col_amount(row, "available")?,
        unavailable: col_amount(row, "unavailable")?,
        prepaid: col_amount(row, "prepaid")?,
        margin: col_amount(row, "margin")?,
    })
}

fn wallet_record_from_row(row: &PgRow) -> PayResult<MerchantWalletRecord> {
    let trade_no: Option<String> = row.try_get("trade_no").map_err(db_err)?;
    Ok(MerchantWalletRecord {
        id: row.try_get("id").map_err(db_err)?,
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        change_type: col_enum::<WalletChangeType>(row, "change_type")?,
        old_available: col_amount(row, "old_available")?,
        delta_available: row.try_get("delta_available").map_err(db_err)?,
        new_available: col_amount(row, "new_available")?,
        old_unavailable: col_amount(row, "old_unavailable")?,
        delta_unavailable: row.try_get("delta_unavailable").map_err(db_err)?,
        new_unavailable: col_amount(row, "new_unavailable")?,
        trade_no: trade_no
            .map(|t| TradeNo::try_from(t).map_err(|_| corrupt("trade_no")))
            .transpose()?,
        remark: row.try_get("remark").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn prepaid_record_from_row(
    row: &PgRow,
) -> PayResult<MerchantWalletPrepaidRecord> {
    Ok(MerchantWalletPrepaidRecord {
        id: row.try_get("id").map_err(db_err)?,
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        old_prepaid: col_amount(row, "old_prepaid")?,
        delta_prepaid: row.try_get("delta_prepaid").map_err(db_err)?,
        new_prepaid: col_amount(row, "new_prepaid")?,
        remark: row.try_get("remark").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn encryption_from_row(row: &PgRow) -> PayResult<MerchantEncryption> {
    Ok(MerchantEncryption {
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        mode: col_enum::<EncryptionMode>(row, "mode")?,
        hash_key: row.try_get("hash_key").map_err(db_err)?,
        aes_key: row.try_get("aes_key").map_err(db_err)?,
        rsa_public_key: row.try_get("rsa_public_key").map_err(db_err)?,
    })
}

fn channel_from_row(row: &PgRow) -> PayResult<PaymentChannel> {
    let roll_mode: i16 = row.try_get("roll_mode").map_err(db_err)?;
    let settle_cycle: i16 = row.try_get("settle_cycle").map_err(db_err)?;
    Ok(PaymentChannel {
        id: ChannelId(row.try_get("id").map_err(db_err)?),
        code: row.try_get("code").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        payment_type: col_enum::<PaymentType>(row, "payment_type")?,
        gateway: row.try_get("gateway").map_err(db_err)?,
        costs: col_rate(row, "costs")?,
        fixed_costs: col_amount(row, "fixed_costs")?,
        rate: col_rate(row, "rate")?,
        fixed_fee: col_amount(row, "fixed_fee")?,
        min_fee: col_amount(row, "min_fee")?,
        max_fee: col_amount_opt(row, "max_fee")?,
        min_amount: col_amount_opt(row, "min_amount")?,
        max_amount: col_amount_opt(row, "max_amount")?,
        daily_limit: col_amount_opt(row, "daily_limit")?,
        earliest_time: row.try_get("earliest_time").map_err(db_err)?,
        latest_time: row.try_get("latest_time").map_err(db_err)?,
        roll_mode: RollMode::from_i16(roll_mode)
            .ok_or_else(|| corrupt("roll_mode"))?,
        settle_cycle: SettleCycle::from_i16(settle_cycle)
            .ok_or_else(|| corrupt("settle_cycle"))?,
        status: row.try_get("status").map_err(db_err)?,
        diy_order_subject: row.try_get("diy_order_subject").map_err(db_err)?,
    })
}

const CHANNEL_COLS: &str = "id, code, name, payment_type, gateway, costs, \
    fixed_costs, rate, fixed_fee, min_fee, max_fee, min_amount, max_amount, \
    daily_limit, earliest_time, latest_time, roll_mode, settle_cycle, \
    status, diy_order_subject";

fn account_from_row(row: &PgRow) -> PayResult<PaymentChannelAccount> {
    let config: serde_json::Value = row.try_get("config").map_err(db_err)?;
    let config = match config {
        serde_json::Value::Object(map) => map,
        _ => return Err(corrupt("config")),
    };
    let roll_weight: i32 = row.try_get("roll_weight").map_err(db_err)?;
    Ok(PaymentChannelAccount {
        id: AccountId(row.try_get("id").map_err(db_err)?),
        channel_id: ChannelId(row.try_get("channel_id").map_err(db_err)?),
        name: row.try_get("name").map_err(db_err)?,
        inherit_config: row.try_get("inherit_config").map_err(db_err)?,
        roll_weight: u32::try_from(roll_weight)
            .map_err(|_| corrupt("roll_weight"))?,
        rate: col_rate(row, "rate")?,
        min_amount: col_amount_opt(row, "min_amount")?,
        max_amount: col_amount_opt(row, "max_amount")?,
        daily_limit: col_amount_opt(row, "daily_limit")?,
        earliest_time: row.try_get("earliest_time").map_err(db_err)?,
        latest_time: row.try_get("latest_time").map_err(db_err)?,
        config,
        status: row.try_get("status").map_err(db_err)?,
        maintenance: row.try_get("maintenance").map_err(db_err)?,
        diy_order_subject: row.try_get("diy_order_subject").map_err(db_err)?,
    })
}

const ACCOUNT_COLS: &str = "id, channel_id, name, inherit_config, \
    roll_weight, rate, min_amount, max_amount, daily_limit, earliest_time, \
    latest_time, config, status, maintenance, diy_order_subject";

fn order_from_row(row: &PgRow) -> PayResult<Order> {
    let settle_cycle: i16 = row.try_get("settle_cycle").map_err(db_err)?;
    let notify_retry_count: i32 =
        row.try_get("notify_retry_count").map_err(db_err)?;
    Ok(Order {
        trade_no: col_trade_no(row, "trade_no")?,
        out_trade_no: row.try_get("out_trade_no").map_err(db_err)?,
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        payment_type: col_enum::<PaymentType>(row, "payment_type")?,
        payment_channel_account_id: AccountId(
            row.try_get("payment_channel_account_id").map_err(db_err)?,
        ),
        subject: row.try_get("subject").map_err(db_err)?,
        total_amount: col_amount(row, "total_amount")?,
        buyer_pay_amount: col_amount(row, "buyer_pay_amount")?,
        receipt_amount: col_amount(row, "receipt_amount")?,
        fee_amount: col_amount(row, "fee_amount")?,
        profit_amount: row.try_get("profit_amount").map_err(db_err)?,
        notify_url: row.try_get("notify_url").map_err(db_err)?,
        return_url: row.try_get("return_url").map_err(db_err)?,
        attach: row.try_get("attach").map_err(db_err)?,
        settle_cycle: SettleCycle::from_i16(settle_cycle)
            .ok_or_else(|| corrupt("settle_cycle"))?,
        sign_type: col_enum::<SignType>(row, "sign_type")?,
        trade_state: col_enum::<TradeState>(row, "trade_state")?,
        settle_state: col_enum::<SettleState>(row, "settle_state")?,
        notify_state: col_enum::<NotifyState>(row, "notify_state")?,
        notify_retry_count: u32::try_from(notify_retry_count)
            .map_err(|_| corrupt("notify_retry_count"))?,
        notify_next_retry_time: row
            .try_get("notify_next_retry_time")
            .map_err(db_err)?,
        create_time: row.try_get("create_time").map_err(db_err)?,
        payment_time: row.try_get("payment_time").map_err(db_err)?,
        close_time: row.try_get("close_time").map_err(db_err)?,
        api_trade_no: row.try_get("api_trade_no").map_err(db_err)?,
        bill_trade_no: row.try_get("bill_trade_no").map_err(db_err)?,
        mch_trade_no: row.try_get("mch_trade_no").map_err(db_err)?,
    })
}

const ORDER_COLS: &str = "trade_no, out_trade_no, merchant_id, \
    payment_type, payment_channel_account_id, subject, total_amount, \
    buyer_pay_amount, receipt_amount, fee_amount, profit_amount, \
    notify_url, return_url, attach, settle_cycle, sign_type, trade_state, \
    settle_state, notify_state, notify_retry_count, \
    notify_next_retry_time, create_time, payment_time, close_time, \
    api_trade_no, bill_trade_no, mch_trade_no";

fn buyer_from_row(row: &PgRow) -> PayResult<OrderBuyer> {
    let min_age: Option<i16> = row.try_get("min_age").map_err(db_err)?;
    Ok(OrderBuyer {
        trade_no: col_trade_no(row, "trade_no")?,
        ip: row.try_get("ip").map_err(db_err)?,
        user_agent: row.try_get("user_agent").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        buyer_open_id: row.try_get("buyer_open_id").map_err(db_err)?,
        mobile: row.try_get("mobile").map_err(db_err)?,
        real_name: row.try_get("real_name").map_err(db_err)?,
        cert_no: row.try_get("cert_no").map_err(db_err)?,
        cert_type: col_enum_opt::<CertType>(row, "cert_type")?,
        min_age: min_age
            .map(|a| u8::try_from(a).map_err(|_| corrupt("min_age")))
            .transpose()?,
    })
}

fn refund_from_row(row: &PgRow) -> PayResult<OrderRefund> {
    let id: String = row.try_get("id").map_err(db_err)?;
    Ok(OrderRefund {
        id: RefundId::try_from(id).map_err(|_| corrupt("id"))?,
        trade_no: col_trade_no(row, "trade_no")?,
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        initiate_type: col_enum::<RefundInitiateType>(row, "initiate_type")?,
        refund_type: row.try_get("refund_type").map_err(db_err)?,
        amount: col_amount(row, "amount")?,
        refund_fee_amount: col_amount(row, "refund_fee_amount")?,
        fee_bearer: row.try_get("fee_bearer").map_err(db_err)?,
        out_biz_no: row.try_get("out_biz_no").map_err(db_err)?,
        api_refund_no: row.try_get("api_refund_no").map_err(db_err)?,
        reason: row.try_get("reason").map_err(db_err)?,
        status: col_enum::<RefundStatus>(row, "status")?,
        create_time: row.try_get("create_time").map_err(db_err)?,
    })
}

const REFUND_COLS: &str = "id, trade_no, merchant_id, initiate_type, \
    refund_type, amount, refund_fee_amount, fee_bearer, out_biz_no, \
    api_refund_no, reason, status, create_time";

fn blacklist_from_row(row: &PgRow) -> PayResult<Blacklist> {
    Ok(Blacklist {
        id: row.try_get("id").map_err(db_err)?,
        entity_type: col_enum::<BlacklistEntityType>(row, "entity_type")?,
        entity_value: row.try_get("entity_value").map_err(db_err)?,
        entity_hash: row.try_get("entity_hash").map_err(db_err)?,
        reason: row.try_get("reason").map_err(db_err)?,
        origin: col_enum::<BlacklistOrigin>(row, "origin")?,
        expired_at: row.try_get("expired_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn withdrawal_from_row(row: &PgRow) -> PayResult<MerchantWithdrawalRecord> {
    Ok(MerchantWithdrawalRecord {
        id: WithdrawalId(row.try_get("id").map_err(db_err)?),
        merchant_id: MerchantId(row.try_get("merchant_id").map_err(db_err)?),
        payee_info: row.try_get("payee_info").map_err(db_err)?,
        amount: col_amount(row, "amount")?,
        prepaid_deducted: col_amount(row, "prepaid_deducted")?,
        received_amount: col_amount(row, "received_amount")?,
        fee: col_amount(row, "fee")?,
        fee_type: row.try_get("fee_type").map_err(db_err)?,
        status: col_enum::<WithdrawalStatus>(row, "status")?,
        reject_reason: row.try_get("reject_reason").map_err(db_err)?,
        create_time: row.try_get("create_time").map_err(db_err)?,
    })
}

const WITHDRAWAL_COLS: &str = "id, merchant_id, payee_info, amount, \
    prepaid_deducted, received_amount, fee, fee_type, status, \
    reject_reason, create_time";

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> PayResult<Box<dyn StoreTxn>> {
        let txn = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgTxn { txn }))
    }

    async fn merchant(&self, id: MerchantId) -> PayResult<Option<Merchant>> {
        let sql =
            format!("SELECT {MERCHANT_COLS} FROM merchant WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| merchant_from_row(&row))
            .transpose()
    }

    async fn merchant_by_number(
        &self,
        number: &MerchantNumber,
    ) -> PayResult<Option<Merchant>> {
        let sql = format!(
            "SELECT {MERCHANT_COLS} FROM merchant \
             WHERE merchant_number = $1 AND deleted_at IS NULL"
        );
        sqlx::query(&sql)
            .bind(number.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| merchant_from_row(&row))
            .transpose()
    }

    async fn merchant_encryption(
        &self,
        id: MerchantId,
    ) -> PayResult<Option<MerchantEncryption>> {
        sqlx::query(
            "SELECT merchant_id, mode, hash_key, aes_key, rsa_public_key \
             FROM merchant_encryption WHERE merchant_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| encryption_from_row(&row))
        .transpose()
    }

    async fn update_merchant_rsa_public_key(
        &self,
        id: MerchantId,
        public_key: Option<String>,
    ) -> PayResult<()> {
        let updated = sqlx::query(
            "UPDATE merchant_encryption SET rsa_public_key = $2 \
             WHERE merchant_id = $1",
        )
        .bind(id.0)
        .bind(public_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(Error::not_found("merchant encryption not found"));
        }
        Ok(())
    }

    async fn wallet(
        &self,
        id: MerchantId,
    ) -> PayResult<Option<MerchantWallet>> {
        sqlx::query(
            "SELECT merchant_id, available, unavailable, prepaid, margin \
             FROM merchant_wallet WHERE merchant_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| wallet_from_row(&row))
        .transpose()
    }

    async fn wallet_records(
        &self,
        id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWalletRecord>> {
        let rows = sqlx::query(
            "SELECT id, merchant_id, change_type, old_available, \
             delta_available, new_available, old_unavailable, \
             delta_unavailable, new_unavailable, trade_no, remark, \
             created_at \
             FROM merchant_wallet_record WHERE merchant_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(wallet_record_from_row).collect()
    }

    async fn prepaid_records(
        &self,
        id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWalletPrepaidRecord>> {
        let rows = sqlx::query(
            "SELECT id, merchant_id, old_prepaid, delta_prepaid, \
             new_prepaid, remark, created_at \
             FROM merchant_wallet_prepaid_record WHERE merchant_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(prepaid_record_from_row).collect()
    }

    async fn order(&self, trade_no: &TradeNo) -> PayResult<Option<Order>> {
        let sql =
            format!("SELECT {ORDER_COLS} FROM \"order\" WHERE trade_no = $1");
        sqlx::query(&sql)
            .bind(trade_no.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn order_buyer(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<OrderBuyer>> {
        sqlx::query(
            "SELECT trade_no, ip, user_agent, user_id, buyer_open_id, \
             mobile, real_name, cert_no, cert_type, min_age \
             FROM order_buyer WHERE trade_no = $1",
        )
        .bind(trade_no.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| buyer_from_row(&row))
        .transpose()
    }

    async fn recent_order_by_out_trade_no(
        &self,
        merchant_id: MerchantId,
        out_trade_no: &str,
        since: DateTime<Utc>,
    ) -> PayResult<Option<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLS} FROM \"order\" \
             WHERE merchant_id = $1 AND out_trade_no = $2 \
               AND create_time >= $3 \
             ORDER BY create_time DESC LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(merchant_id.0)
            .bind(out_trade_no)
            .bind(since)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn channels_for_selection(
        &self,
        payment_type: PaymentType,
        code: Option<&str>,
    ) -> PayResult<Vec<PaymentChannel>> {
        let sql = format!(
            "SELECT {CHANNEL_COLS} FROM payment_channel \
             WHERE status AND payment_type = $1 \
               AND ($2::text IS NULL OR code = $2) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(payment_type.as_ref())
            .bind(code)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(channel_from_row).collect()
    }

    async fn channel(
        &self,
        id: ChannelId,
    ) -> PayResult<Option<PaymentChannel>> {
        let sql = format!(
            "SELECT {CHANNEL_COLS} FROM payment_channel WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| channel_from_row(&row))
            .transpose()
    }

    async fn channel_account(
        &self,
        id: AccountId,
    ) -> PayResult<Option<PaymentChannelAccount>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLS} FROM payment_channel_account \
             WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| account_from_row(&row))
            .transpose()
    }

    async fn eligible_accounts(
        &self,
        channel_id: ChannelId,
        amount: Option<Amount>,
        at_local: NaiveTime,
    ) -> PayResult<Vec<PaymentChannelAccount>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLS} FROM payment_channel_account \
             WHERE channel_id = $1 AND status AND NOT maintenance \
               AND (inherit_config OR ( \
                 ($2::numeric IS NULL \
                    OR min_amount IS NULL OR min_amount <= $2) \
                 AND ($2::numeric IS NULL \
                    OR max_amount IS NULL OR max_amount >= $2) \
                 AND (earliest_time IS NULL OR earliest_time <= $3) \
                 AND (latest_time IS NULL OR latest_time >= $3))) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(channel_id.0)
            .bind(amount.map(|a| a.get()))
            .bind(at_local)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn blacklist_by_hash(
        &self,
        entity_hash: &str,
    ) -> PayResult<Option<Blacklist>> {
        sqlx::query(
            "SELECT id, entity_type, entity_value, entity_hash, reason, \
             origin, expired_at, created_at \
             FROM blacklist WHERE entity_hash = $1",
        )
        .bind(entity_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| blacklist_from_row(&row))
        .transpose()
    }

    async fn insert_risk_log(&self, log: RiskLog) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO risk_log (merchant_id, type, content, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(log.merchant_id.0)
        .bind(log.log_type.as_i16())
        .bind(&log.content)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn count_orders_by_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> PayResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM order_buyer b \
             JOIN \"order\" o USING (trade_no) \
             WHERE b.ip = $1 AND o.create_time >= $2",
        )
        .bind(ip)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn count_orders_by_account_since(
        &self,
        user_id: Option<&str>,
        buyer_open_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> PayResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM order_buyer b \
             JOIN \"order\" o USING (trade_no) \
             WHERE o.create_time >= $3 \
               AND (($1::text IS NOT NULL AND b.user_id = $1) \
                 OR ($2::text IS NOT NULL AND b.buyer_open_id = $2))",
        )
        .bind(user_id)
        .bind(buyer_open_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn buyer_order_states(
        &self,
        idents: &BuyerIdentifiers,
    ) -> PayResult<Vec<TradeState>> {
        if idents.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT o.trade_state FROM order_buyer b \
             JOIN \"order\" o USING (trade_no) \
             WHERE ($1::text IS NOT NULL AND b.user_id = $1) \
                OR ($2::text IS NOT NULL AND b.buyer_open_id = $2) \
                OR ($3::text IS NOT NULL AND b.mobile = $3) \
                OR ($4::text IS NOT NULL AND b.cert_no = $4)",
        )
        .bind(idents.user_id.as_deref())
        .bind(idents.buyer_open_id.as_deref())
        .bind(idents.mobile.as_deref())
        .bind(idents.cert_no.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|s| {
                TradeState::from_str(s).map_err(|_| corrupt("trade_state"))
            })
            .collect()
    }

    async fn refund(&self, id: &RefundId) -> PayResult<Option<OrderRefund>> {
        let sql =
            format!("SELECT {REFUND_COLS} FROM order_refund WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| refund_from_row(&row))
            .transpose()
    }

    async fn refund_by_out_biz_no(
        &self,
        merchant_id: MerchantId,
        out_biz_no: &str,
    ) -> PayResult<Option<OrderRefund>> {
        let sql = format!(
            "SELECT {REFUND_COLS} FROM order_refund \
             WHERE merchant_id = $1 AND out_biz_no = $2"
        );
        sqlx::query(&sql)
            .bind(merchant_id.0)
            .bind(out_biz_no)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| refund_from_row(&row))
            .transpose()
    }

    async fn refunds_for_order(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Vec<OrderRefund>> {
        let sql = format!(
            "SELECT {REFUND_COLS} FROM order_refund \
             WHERE trade_no = $1 ORDER BY create_time"
        );
        let rows = sqlx::query(&sql)
            .bind(trade_no.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(refund_from_row).collect()
    }

    async fn withdrawal(
        &self,
        id: WithdrawalId,
    ) -> PayResult<Option<MerchantWithdrawalRecord>> {
        let sql = format!(
            "SELECT {WITHDRAWAL_COLS} FROM merchant_withdrawal_record \
             WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| withdrawal_from_row(&row))
            .transpose()
    }

    async fn withdrawals_for_merchant(
        &self,
        merchant_id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWithdrawalRecord>> {
        let sql = format!(
            "SELECT {WITHDRAWAL_COLS} FROM merchant_withdrawal_record \
             WHERE merchant_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(merchant_id.0)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(withdrawal_from_row).collect()
    }

    async fn insert_notification(
        &self,
        row: OrderNotification,
    ) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO order_notification \
             (id, trade_no, status, request_duration_ms, response, \
              created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&row.id)
        .bind(row.trade_no.as_str())
        .bind(row.status)
        .bind(row.request_duration_ms)
        .bind(&row.response)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_order_notify(
        &self,
        trade_no: &TradeNo,
        state: NotifyState,
        retry_count: u32,
        next_retry: Option<DateTime<Utc>>,
    ) -> PayResult<()> {
        let updated = sqlx::query(
            "UPDATE \"order\" SET notify_state = $2, \
             notify_retry_count = $3, notify_next_retry_time = $4 \
             WHERE trade_no = $1",
        )
        .bind(trade_no.as_str())
        .bind(state.as_ref())
        .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
        .bind(next_retry)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(Error::not_found("order not found"));
        }
        Ok(())
    }
}

/// One Postgres transaction implementing [`StoreTxn`].
pub struct PgTxn {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTxn for PgTxn {
    async fn wallet_for_update(
        &mut self,
        merchant_id: MerchantId,
    ) -> PayResult<MerchantWallet> {
        let row = sqlx::query(
            "SELECT merchant_id, available, unavailable, prepaid, margin \
             FROM merchant_wallet WHERE merchant_id = $1 FOR UPDATE",
        )
        .bind(merchant_id.0)
        .fetch_optional(&mut *self.txn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found("merchant wallet not found"))?;
        wallet_from_row(&row)
    }

    async fn update_wallet(
        &mut self,
        wallet: &MerchantWallet,
    ) -> PayResult<()> {
        sqlx::query(
            "UPDATE merchant_wallet SET available = $2, unavailable = $3, \
             prepaid = $4, margin = $5 WHERE merchant_id = $1",
        )
        .bind(wallet.merchant_id.0)
        .bind(wallet.available.get())
        .bind(wallet.unavailable.get())
        .bind(wallet.prepaid.get())
        .bind(wallet.margin.get())
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_wallet_record(
        &mut self,
        record: MerchantWalletRecord,
    ) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO merchant_wallet_record \
             (merchant_id, change_type, old_available, delta_available, \
              new_available, old_unavailable, delta_unavailable, \
              new_unavailable, trade_no, remark, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.merchant_id.0)
        .bind(record.change_type.as_ref())
        .bind(record.old_available.get())
        .bind(record.delta_available)
        .bind(record.new_available.get())
        .bind(record.old_unavailable.get())
        .bind(record.delta_unavailable)
        .bind(record.new_unavailable.get())
        .bind(record.trade_no.as_ref().map(|t| t.as_str()))
        .bind(&record.remark)
        .bind(record.created_at)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_prepaid_record(
        &mut self,
        record: MerchantWalletPrepaidRecord,
    ) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO merchant_wallet_prepaid_record \
             (merchant_id, old_prepaid, delta_prepaid, new_prepaid, \
              remark, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.merchant_id.0)
        .bind(record.old_prepaid.get())
        .bind(record.delta_prepaid)
        .bind(record.new_prepaid.get())
        .bind(&record.remark)
        .bind(record.created_at)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn order_for_update(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLS} FROM \"order\" WHERE trade_no = $1 \
             FOR UPDATE"
        );
        sqlx::query(&sql)
            .bind(trade_no.as_str())
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(db_err)?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn insert_order(&mut self, order: &Order) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO \"order\" (trade_no, out_trade_no, merchant_id, \
             payment_type, payment_channel_account_id, subject, \
             total_amount, buyer_pay_amount, receipt_amount, fee_amount, \
             profit_amount, notify_url, return_url, attach, settle_cycle, \
             sign_type, trade_state, settle_state, notify_state, \
             notify_retry_count, notify_next_retry_time, create_time, \
             payment_time, close_time, api_trade_no, bill_trade_no, \
             mch_trade_no) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, \
             $25, $26, $27)",
        )
        .bind(order.trade_no.as_str())
        .bind(&order.out_trade_no)
        .bind(order.merchant_id.0)
        .bind(order.payment_type.as_ref())
        .bind(order.payment_channel_account_id.0)
        .bind(&order.subject)
        .bind(order.total_amount.get())
        .bind(order.buyer_pay_amount.get())
        .bind(order.receipt_amount.get())
        .bind(order.fee_amount.get())
        .bind(order.profit_amount)
        .bind(&order.notify_url)
        .bind(&order.return_url)
        .bind(&order.attach)
        .bind(order.settle_cycle.as_i16())
        .bind(order.sign_type.as_ref())
        .bind(order.trade_state.as_ref())
        .bind(order.settle_state.as_ref())
        .bind(order.notify_state.as_ref())
        .bind(i32::try_from(order.notify_retry_count).unwrap_or(i32::MAX))
        .bind(order.notify_next_retry_time)
        .bind(order.create_time)
        .bind(order.payment_time)
        .bind(order.close_time)
        .bind(&order.api_trade_no)
        .bind(&order.bill_trade_no)
        .bind(&order.mch_trade_no)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> PayResult<()> {
        sqlx::query(
            "UPDATE \"order\" SET trade_state = $2, settle_state = $3, \
             notify_state = $4, notify_retry_count = $5, \
             notify_next_retry_time = $6, buyer_pay_amount = $7, \
             payment_time = $8, close_time = $9, api_trade_no = $10, \
             bill_trade_no = $11, mch_trade_no = $12 \
             WHERE trade_no = $1",
        )
        .bind(order.trade_no.as_str())
        .bind(order.trade_state.as_ref())
        .bind(order.settle_state.as_ref())
        .bind(order.notify_state.as_ref())
        .bind(i32::try_from(order.notify_retry_count).unwrap_or(i32::MAX))
        .bind(order.notify_next_retry_time)
        .bind(order.buyer_pay_amount.get())
        .bind(order.payment_time)
        .bind(order.close_time)
        .bind(&order.api_trade_no)
        .bind(&order.bill_trade_no)
        .bind(&order.mch_trade_no)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_order_buyer(
        &mut self,
        buyer: &OrderBuyer,
    ) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO order_buyer (trade_no, ip, user_agent, user_id, \
             buyer_open_id, mobile, real_name, cert_no, cert_type, \
             min_age) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(buyer.trade_no.as_str())
        .bind(&buyer.ip)
        .bind(&buyer.user_agent)
        .bind(&buyer.user_id)
        .bind(&buyer.buyer_open_id)
        .bind(&buyer.mobile)
        .bind(&buyer.real_name)
        .bind(&buyer.cert_no)
        .bind(buyer.cert_type.map(|c| c.as_ref().to_owned()))
        .bind(buyer.min_age.map(i16::from))
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn order_buyer(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<OrderBuyer>> {
        sqlx::query(
            "SELECT trade_no, ip, user_agent, user_id, buyer_open_id, \
             mobile, real_name, cert_no, cert_type, min_age \
             FROM order_buyer WHERE trade_no = $1",
        )
        .bind(trade_no.as_str())
        .fetch_optional(&mut *self.txn)
        .await
        .map_err(db_err)?
        .map(|row| buyer_from_row(&row))
        .transpose()
    }

    async fn update_order_buyer(
        &mut self,
        buyer: &OrderBuyer,
    ) -> PayResult<()> {
        sqlx::query(
            "UPDATE order_buyer SET ip = $2, user_agent = $3, \
             user_id = $4, buyer_open_id = $5, mobile = $6, \
             real_name = $7, cert_no = $8, cert_type = $9, min_age = $10 \
             WHERE trade_no = $1",
        )
        .bind(buyer.trade_no.as_str())
        .bind(&buyer.ip)
        .bind(&buyer.user_agent)
        .bind(&buyer.user_id)
        .bind(&buyer.buyer_open_id)
        .bind(&buyer.mobile)
        .bind(&buyer.real_name)
        .bind(&buyer.cert_no)
        .bind(buyer.cert_type.map(|c| c.as_ref().to_owned()))
        .bind(buyer.min_age.map(i16::from))
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn refunds_for_order(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Vec<OrderRefund>> {
        let sql = format!(
            "SELECT {REFUND_COLS} FROM order_refund \
             WHERE trade_no = $1 ORDER BY create_time"
        );
        let rows = sqlx::query(&sql)
            .bind(trade_no.as_str())
            .fetch_all(&mut *self.txn)
            .await
            .map_err(db_err)?;
        rows.iter().map(refund_from_row).collect()
    }

    async fn insert_refund(&mut self, refund: &OrderRefund) -> PayResult<()> {
        sqlx::query(
            "INSERT INTO order_refund (id, trade_no, merchant_id, \
             initiate_type, refund_type, amount, refund_fee_amount, \
             fee_bearer, out_biz_no, api_refund_no, reason, status, \
             create_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13)",
        )
        .bind(refund.id.as_str())
        .bind(refund.trade_no.as_str())
        .bind(refund.merchant_id.0)
        .bind(refund.initiate_type.as_ref())
        .bind(refund.refund_type)
        .bind(refund.amount.get())
        .bind(refund.refund_fee_amount.get())
        .bind(refund.fee_bearer)
        .bind(&refund.out_biz_no)
        .bind(&refund.api_refund_no)
        .bind(&refund.reason)
        .bind(refund.status.as_ref())
        .bind(refund.create_time)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_refund(&mut self, refund: &OrderRefund) -> PayResult<()> {
        sqlx::query(
            "UPDATE order_refund SET status = $2, api_refund_no = $3, \
             reason = $4 WHERE id = $1",
        )
        .bind(refund.id.as_str())
        .bind(refund.status.as_ref())
        .bind(&refund.api_refund_no)
        .bind(&refund.reason)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn insert_withdrawal(
        &mut self,
        record: &MerchantWithdrawalRecord,
    ) -> PayResult<WithdrawalId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO merchant_withdrawal_record (merchant_id, \
             payee_info, amount, prepaid_deducted, received_amount, fee, \
             fee_type, status, reject_reason, create_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING id",
        )
        .bind(record.merchant_id.0)
        .bind(&record.payee_info)
        .bind(record.amount.get())
        .bind(record.prepaid_deducted.get())
        .bind(record.received_amount.get())
        .bind(record.fee.get())
        .bind(record.fee_type)
        .bind(record.status.as_ref())
        .bind(&record.reject_reason)
        .bind(record.create_time)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(WithdrawalId(id))
    }

    async fn withdrawal_for_update(
        &mut self,
        id: WithdrawalId,
    ) -> PayResult<Option<MerchantWithdrawalRecord>> {
        let sql = format!(
            "SELECT {WITHDRAWAL_COLS} FROM merchant_withdrawal_record \
             WHERE id = $1 FOR UPDATE"
        );
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(db_err)?
            .map(|row| withdrawal_from_row(&row))
            .transpose()
    }

    async fn update_withdrawal(
        &mut self,
        record: &MerchantWithdrawalRecord,
    ) -> PayResult<()> {
        sqlx::query(
            "UPDATE merchant_withdrawal_record SET status = $2, \
             reject_reason = $3 WHERE id = $1",
        )
        .bind(record.id.0)
        .bind(record.status.as_ref())
        .bind(&record.reject_reason)
        .execute(&mut *self.txn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> PayResult<()> {
        self.txn.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> PayResult<()> {
        self.txn.rollback().await.map_err(db_err)
    }
}
