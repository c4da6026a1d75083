//! Generic receipt model shared by every fiscal registrar driver.
//!
//! Regime-specific data (e.g. Russian FFD attributes) travels as an opaque
//! [`RegimeExtension`] and is decoded only by drivers that understand it.

use crate::error::{KkmError, KkmResult};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cashier {
    pub name: String,
    /// Taxpayer id (INN) of the cashier.
    #[serde(default)]
    pub tax_id: Option<String>,
}

/// Buyer / supplier printed on the receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counterparty {
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Receipt kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Sale,
    ReturnSale,
    Buy,
    ReturnBuy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FiscalType {
    Fiscal,
    NonFiscal,
}

// ---------------------------------------------------------------------------
// Regime extension
// ---------------------------------------------------------------------------

/// Regime-specific payload keyed by regime identifier.
///
/// The payload stays raw JSON until a driver for that regime asks for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "regime", content = "data", rename_all = "camelCase")]
pub enum RegimeExtension {
    Russia(serde_json::Value),
}

/// Decode the Russian payload of an optional extension.
///
/// A missing extension (or one for another regime) is `Ok(None)`, never an
/// error; a present but malformed payload is `InvalidArgument`.
pub fn decode_russia<T: DeserializeOwned>(ext: Option<&RegimeExtension>) -> KkmResult<Option<T>> {
    match ext {
        Some(RegimeExtension::Russia(serde_json::Value::Null)) | None => Ok(None),
        Some(RegimeExtension::Russia(raw)) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| KkmError::InvalidArgument(format!("Invalid Russian regime data: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptItem {
    pub name: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Index into the tax-rate table; unknown values fall back to "no tax".
    #[serde(default)]
    pub tax_rate_index: i32,
    #[serde(default)]
    pub department_index: u32,
    #[serde(default)]
    pub country_specific_data: Option<RegimeExtension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPayment {
    /// 1 cash, 2 electronic, 103 advance, 104 credit.
    pub method_index: i32,
    pub sum: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptData {
    pub cashier: Cashier,
    #[serde(default)]
    pub contractor: Option<Counterparty>,
    pub operation_type: OperationType,
    pub fiscal_type: FiscalType,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
    #[serde(default)]
    pub payments: Vec<ReceiptPayment>,
    #[serde(default = "default_print_receipt")]
    pub is_print_receipt: bool,
    #[serde(default)]
    pub country_specific_data: Option<RegimeExtension>,
}

fn default_print_receipt() -> bool {
    true
}

impl ReceiptData {
    pub fn is_fiscal(&self) -> bool {
        self.fiscal_type == FiscalType::Fiscal
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TaxNote {
        tax_variant_index: i32,
    }

    #[test]
    fn test_receipt_deserializes_with_defaults() {
        let receipt: ReceiptData = serde_json::from_value(json!({
            "cashier": { "name": "Ivanova" },
            "operationType": "sale",
            "fiscalType": "fiscal",
            "items": [{ "name": "Milk", "price": 100.005, "quantity": 2 }],
            "payments": [{ "methodIndex": 1, "sum": 200.01 }]
        }))
        .unwrap();

        assert!(receipt.is_print_receipt);
        assert!(receipt.contractor.is_none());
        assert!(receipt.country_specific_data.is_none());
        assert_eq!(receipt.items[0].price, Decimal::from_str("100.005").unwrap());
        assert_eq!(receipt.items[0].tax_rate_index, 0);
        assert_eq!(receipt.payments[0].sum, Decimal::from_str("200.01").unwrap());
    }

    #[test]
    fn test_decode_russia_absent_is_none() {
        let decoded: Option<TaxNote> = decode_russia(None).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_decode_russia_present() {
        let ext: RegimeExtension =
            serde_json::from_value(json!({ "regime": "russia", "data": { "taxVariantIndex": 2 } }))
                .unwrap();
        let decoded: Option<TaxNote> = decode_russia(Some(&ext)).unwrap();
        assert_eq!(decoded.unwrap().tax_variant_index, 2);
    }

    #[test]
    fn test_decode_russia_malformed_is_invalid_argument() {
        let ext = RegimeExtension::Russia(json!({ "taxVariantIndex": "two" }));
        let err = decode_russia::<TaxNote>(Some(&ext)).unwrap_err();
        assert!(matches!(err, KkmError::InvalidArgument(_)));
    }
}
