//! Russian fiscal regime: FFD attributes, tax and payment tables, line
//! amounts and marking-code preparation.
//!
//! These tables are shared by every Russian driver; each driver then maps
//! the normalized values onto its own wire codes.

use crate::config::FfdVersion;
use crate::error::{KkmError, KkmResult};
use crate::kkm::receipt::ReceiptPayment;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Group separator inside GS1 DataMatrix marking codes.
pub const GS: char = '\u{1d}';

const AIM_PREFIXES: &[&str] = &["]C1", "]d2", "]Q3"];
const GS_SPELLINGS: &[&str] = &["\\u001d", "\\u001D", "\\x1d", "\\x1D", "<GS>"];

// ---------------------------------------------------------------------------
// Regime data carried on receipts and items
// ---------------------------------------------------------------------------

/// Receipt-level Russian data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuReceiptData {
    /// E-mail or phone the digital receipt is sent to.
    #[serde(default)]
    pub digital_receipt_address: Option<String>,
    /// Taxation system (tag 1055) index.
    #[serde(default)]
    pub tax_variant_index: i32,
}

/// FFD attributes of a line item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FfdData {
    /// Calculation subject (tag 1212).
    #[serde(default)]
    pub subject: i32,
    /// Calculation method (tag 1214).
    #[serde(default)]
    pub method: i32,
    /// Measure of quantity (tag 2108), FFD 1.2 only.
    #[serde(default)]
    pub unit: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkingInfo {
    pub raw_code: String,
    /// Planned item status (tag 2003).
    #[serde(default)]
    pub estimated_status: i32,
    /// Result of the register's own code check (tag 2106).
    #[serde(default)]
    pub validation_result_kkm: i32,
}

/// Item-level Russian data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuItemData {
    #[serde(default)]
    pub ffd_data: Option<FfdData>,
    #[serde(default)]
    pub marking_info: Option<MarkingInfo>,
}

// ---------------------------------------------------------------------------
// Tax rates
// ---------------------------------------------------------------------------

/// VAT rate of a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaxRate {
    NoTax,
    Vat0,
    Vat10,
    Vat20,
    /// Compound rate 10/110.
    Vat110,
    /// Compound rate 20/120.
    Vat120,
}

impl TaxRate {
    /// Map a tax-rate index. Anything outside 1..=6 falls back to `NoTax`.
    // TODO: confirm with the accounting side whether unknown indices should be
    // rejected instead of mapped to NoTax.
    pub fn from_index(index: i32) -> Self {
        match index {
            1 => TaxRate::NoTax,
            2 => TaxRate::Vat0,
            3 => TaxRate::Vat10,
            4 => TaxRate::Vat20,
            5 => TaxRate::Vat110,
            6 => TaxRate::Vat120,
            _ => TaxRate::NoTax,
        }
    }
}

// ---------------------------------------------------------------------------
// Payment methods
// ---------------------------------------------------------------------------

/// Payment bucket on a fiscal receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentBucket {
    Cash,
    Electronic,
    Advance,
    Credit,
}

impl PaymentBucket {
    /// Map a payment method index. There is no default bucket.
    pub fn from_method_index(index: i32) -> KkmResult<Self> {
        match index {
            1 => Ok(PaymentBucket::Cash),
            2 => Ok(PaymentBucket::Electronic),
            103 => Ok(PaymentBucket::Advance),
            104 => Ok(PaymentBucket::Credit),
            other => Err(KkmError::InvalidArgument(format!(
                "Unknown payment method index {other}"
            ))),
        }
    }
}

/// Validate a payment and resolve its bucket.
pub fn payment_bucket(payment: &ReceiptPayment) -> KkmResult<PaymentBucket> {
    if payment.sum <= Decimal::ZERO {
        return Err(KkmError::InvalidArgument(format!(
            "Payment sum must be positive, got {}",
            payment.sum
        )));
    }
    PaymentBucket::from_method_index(payment.method_index)
}

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// `price × quantity` rounded to kopecks, half away from zero.
pub fn line_amount(price: Decimal, quantity: Decimal) -> KkmResult<Decimal> {
    price
        .checked_mul(quantity)
        .map(|amount| amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .ok_or_else(|| {
            KkmError::InvalidArgument(format!("Line amount {price} x {quantity} is out of range"))
        })
}

// ---------------------------------------------------------------------------
// FFD item shapes
// ---------------------------------------------------------------------------

/// Which attributes an item registration carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemShape {
    /// Offline / FFD 1.0: name, quantity, price, tax, department.
    Legacy,
    /// FFD 1.05 / 1.1: plus calculation subject and method.
    Mid,
    /// FFD 1.2: plus marking code and measure of quantity.
    Latest,
}

impl ItemShape {
    pub fn for_version(version: Option<FfdVersion>) -> Self {
        match version {
            Some(FfdVersion::Ffd105) | Some(FfdVersion::Ffd110) => ItemShape::Mid,
            Some(FfdVersion::Ffd120) => ItemShape::Latest,
            Some(FfdVersion::Offline) | Some(FfdVersion::Ffd100) | None => ItemShape::Legacy,
        }
    }
}

// ---------------------------------------------------------------------------
// Marking codes
// ---------------------------------------------------------------------------

/// Normalize a scanned marking code for FFD 1.2 registration.
///
/// May return an empty string; callers skip marking in that case.
pub fn prepare_mark_code(raw: &str) -> String {
    let mut code = raw.trim().to_string();

    if let Some(rest) = AIM_PREFIXES.iter().find_map(|p| code.strip_prefix(p)) {
        code = rest.to_string();
    }

    for spelling in GS_SPELLINGS {
        if code.contains(spelling) {
            code = code.replace(spelling, &GS.to_string());
        }
    }

    code.chars()
        .filter(|c| *c == GS || !c.is_control())
        .collect::<String>()
        .trim_matches(' ')
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
