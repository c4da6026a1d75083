//! Fiscal registrar driver trait and shared types.
//!
//! Defines the `KkmDriver` trait every vendor backend implements, the
//! `KkmStatus` snapshot, and the per-driver receipt lifecycle slot.

use crate::error::{KkmError, KkmResult};
use crate::kkm::receipt::{Cashier, ReceiptData, ReceiptItem, ReceiptPayment};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportType {
    /// Closes the fiscal session.
    ZReport,
    XReport,
    /// Recognized but not implemented by any driver.
    XReportWithGoods,
}

// ---------------------------------------------------------------------------
// Device status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Closed,
    Open,
    OpenMoreThan24h,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckStatus {
    Open,
    #[default]
    Closed,
}

/// Snapshot of a fiscal registrar's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KkmStatus {
    pub session_status: SessionStatus,
    pub check_status: CheckStatus,
    pub session_number: Option<u32>,
    pub check_number: Option<u32>,
    pub factory_number: Option<String>,
    pub software_version: Option<String>,
    pub model: Option<String>,
    pub session_started: Option<NaiveDateTime>,
    /// Fiscal storage (FN) expiry.
    pub fn_date_end: Option<NaiveDateTime>,
    /// Cash drawer balance.
    pub cash_sum: Option<Decimal>,
    pub driver_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Receipt lifecycle
// ---------------------------------------------------------------------------

/// Holds the driver's in-progress receipt between `open_receipt` and
/// `close_receipt` / `cancel_receipt`. At most one receipt is open.
#[derive(Debug)]
pub struct ReceiptSlot<T> {
    current: Option<T>,
}

impl<T> ReceiptSlot<T> {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn ensure_idle(&self) -> KkmResult<()> {
        if self.current.is_some() {
            return Err(KkmError::InvalidState("A receipt is already open".into()));
        }
        Ok(())
    }

    pub fn open(&mut self, receipt: T) -> KkmResult<()> {
        self.ensure_idle()?;
        self.current = Some(receipt);
        Ok(())
    }

    pub fn current(&self) -> KkmResult<&T> {
        self.current
            .as_ref()
            .ok_or_else(|| KkmError::InvalidState("No receipt is open".into()))
    }

    pub fn current_mut(&mut self) -> KkmResult<&mut T> {
        self.current
            .as_mut()
            .ok_or_else(|| KkmError::InvalidState("No receipt is open".into()))
    }

    pub fn take(&mut self) -> KkmResult<T> {
        self.current
            .take()
            .ok_or_else(|| KkmError::InvalidState("No receipt is open".into()))
    }
}

impl<T> Default for ReceiptSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// Driver trait: every fiscal registrar backend implements this.
///
/// A driver instance is stateful: it owns its transport and at most one
/// in-progress receipt. Batching drivers transmit the receipt at
/// `close_receipt`; direct-hardware drivers transmit each registration.
pub trait KkmDriver: Send {
    /// Driver name (for logging).
    fn name(&self) -> &str;

    fn connect(&mut self) -> KkmResult<()>;

    fn disconnect(&mut self) -> KkmResult<()>;

    fn get_status(&mut self) -> KkmResult<KkmStatus>;

    fn open_session(&mut self, cashier: &Cashier) -> KkmResult<()>;

    /// `XReportWithGoods` must fail with `UnsupportedOperation`.
    fn get_report(&mut self, report: ReportType, cashier: &Cashier) -> KkmResult<()>;

    /// Start a receipt. `None` is rejected with `InvalidArgument`; an already
    /// open receipt with `InvalidState`.
    fn open_receipt(&mut self, receipt: Option<&ReceiptData>) -> KkmResult<()>;

    fn register_item(&mut self, item: &ReceiptItem) -> KkmResult<()>;

    fn register_payment(&mut self, payment: &ReceiptPayment) -> KkmResult<()>;

    fn close_receipt(&mut self) -> KkmResult<()>;

    fn cancel_receipt(&mut self) -> KkmResult<()>;

    /// Deposit cash into the drawer. The sum is sent as a positive magnitude.
    fn cash_in(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()>;

    /// Withdraw cash from the drawer. The sum is sent as a positive magnitude.
    fn cash_out(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()>;

    fn cut_paper(&mut self) -> KkmResult<()> {
        Err(KkmError::unsupported(format!("{}: paper cut", self.name())))
    }

    fn open_cash_box(&mut self) -> KkmResult<()> {
        Err(KkmError::unsupported(format!("{}: cash box", self.name())))
    }

    fn print_text(&mut self, text: &str) -> KkmResult<()>;
}

/// Reject a missing receipt with `InvalidArgument`.
pub fn require_receipt(receipt: Option<&ReceiptData>) -> KkmResult<&ReceiptData> {
    receipt.ok_or_else(|| KkmError::InvalidArgument("Receipt data is missing".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_receipt_slot_lifecycle() {
        let mut slot: ReceiptSlot<u32> = ReceiptSlot::new();
        assert!(!slot.is_open());
        assert_eq!(slot.current().unwrap_err().kind(), ErrorKind::InvalidState);

        slot.open(7).unwrap();
        assert!(slot.is_open());
        assert_eq!(slot.open(8).unwrap_err().kind(), ErrorKind::InvalidState);

        *slot.current_mut().unwrap() += 1;
        assert_eq!(slot.take().unwrap(), 8);
        assert!(!slot.is_open());
        assert_eq!(slot.take().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_require_receipt_none_is_invalid_argument() {
        assert_eq!(require_receipt(None).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = KkmStatus {
            session_status: SessionStatus::OpenMoreThan24h,
            session_number: Some(12),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["sessionStatus"], "openMoreThan24h");
        assert_eq!(json["checkStatus"], "closed");
        assert_eq!(json["sessionNumber"], 12);
    }
}
