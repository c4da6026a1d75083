//! Fiscal registrar command set carried in the command envelope.

use crate::error::{KkmError, KkmResult};
use crate::kkm::facade::FiscalRegistrarFacade;
use crate::kkm::protocol::{KkmDriver, ReportType};
use crate::kkm::receipt::{Cashier, ReceiptData};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One fiscal registrar command, selected by the envelope's `command` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum KkmCommand {
    GetStatus,
    OpenSession {
        cashier: Cashier,
    },
    /// Signed sum: positive deposits, negative withdraws.
    CashInOut {
        sum: Decimal,
        cashier: Cashier,
    },
    GetReport {
        report_type: ReportType,
        cashier: Cashier,
    },
    PrintFiscalReceipt {
        receipt: ReceiptData,
    },
    PrintText {
        text: String,
    },
    CutPaper,
    OpenCashBox,
    CancelReceipt,
}

impl KkmCommand {
    /// Decode the command from a full envelope (extra envelope fields are
    /// ignored).
    pub fn from_payload(payload: &Value) -> KkmResult<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| KkmError::InvalidArgument(format!("Invalid command: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            KkmCommand::GetStatus => "getStatus",
            KkmCommand::OpenSession { .. } => "openSession",
            KkmCommand::CashInOut { .. } => "cashInOut",
            KkmCommand::GetReport { .. } => "getReport",
            KkmCommand::PrintFiscalReceipt { .. } => "printFiscalReceipt",
            KkmCommand::PrintText { .. } => "printText",
            KkmCommand::CutPaper => "cutPaper",
            KkmCommand::OpenCashBox => "openCashBox",
            KkmCommand::CancelReceipt => "cancelReceipt",
        }
    }

    /// Run the command. Only `getStatus` produces a result document.
    pub fn execute(&self, driver: &mut dyn KkmDriver) -> KkmResult<Option<Value>> {
        let mut facade = FiscalRegistrarFacade::new(driver);
        match self {
            KkmCommand::GetStatus => {
                let status = facade.get_status()?;
                let value = serde_json::to_value(status)
                    .map_err(|e| KkmError::InvalidState(format!("Cannot encode status: {e}")))?;
                return Ok(Some(value));
            }
            KkmCommand::OpenSession { cashier } => facade.open_session(cashier)?,
            KkmCommand::CashInOut { sum, cashier } => facade.cash_in_out(*sum, cashier)?,
            KkmCommand::GetReport {
                report_type,
                cashier,
            } => facade.get_report(*report_type, cashier)?,
            KkmCommand::PrintFiscalReceipt { receipt } => facade.print_fiscal_receipt(receipt)?,
            KkmCommand::PrintText { text } => facade.print_text(text)?,
            KkmCommand::CutPaper => facade.cut_paper()?,
            KkmCommand::OpenCashBox => facade.open_cash_box()?,
            KkmCommand::CancelReceipt => facade.cancel_receipt()?,
        }
        Ok(None)
    }
}
