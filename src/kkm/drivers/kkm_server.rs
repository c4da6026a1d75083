//! KKM fiscal server driver.
//!
//! The server fronts one or more registers and accepts JSON commands
//! (`{Command, IdCommand, NumDevice, ...}`) over HTTP. A receipt is built
//! locally and sent as a single `RegisterCheck` at close.
//!
//! Answer `Status`: 0 = done, 1 = still running, 2 = error, 3 = unknown id.

use crate::config::{FfdVersion, KkmConfig};
use crate::error::{DeviceErrorKind, KkmError, KkmResult};
use crate::kkm::protocol::*;
use crate::kkm::receipt::{
    decode_russia, Cashier, OperationType, ReceiptData, ReceiptItem, ReceiptPayment,
};
use crate::kkm::russia::{
    line_amount, payment_bucket, prepare_mark_code, ItemShape, PaymentBucket, RuItemData,
    RuReceiptData, TaxRate,
};
use crate::kkm::transport::JsonTransport;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const DRIVER_NAME: &str = "KKM Server";

// ---------------------------------------------------------------------------
// Wire model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterCheck {
    is_fiscal_check: bool,
    type_check: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_print: Option<bool>,
    cashier_name: String,
    #[serde(rename = "CashierVATIN", skip_serializing_if = "Option::is_none")]
    cashier_vatin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_info: Option<String>,
    #[serde(rename = "ClientINN", skip_serializing_if = "Option::is_none")]
    client_inn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tax_variant: Option<i32>,
    check_strings: Vec<CheckString>,
    #[serde(with = "rust_decimal::serde::float")]
    cash: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    electronic_payment: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    advance_payment: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    credit: Decimal,
    #[serde(skip)]
    shape: ItemShape,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckString {
    #[serde(skip_serializing_if = "Option::is_none")]
    register: Option<Register>,
    #[serde(skip_serializing_if = "Option::is_none")]
    print_text: Option<PrintTextLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Register {
    name: String,
    #[serde(with = "rust_decimal::serde::float")]
    quantity: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    department: u32,
    tax: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sign_method_calculation: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sign_calculation_object: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    measure_of_quantity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    good_code_data: Option<GoodCodeData>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GoodCodeData {
    bar_code: String,
    accept_on_bad: bool,
    contains_serial_number: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PrintTextLine {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CashierFields<'a> {
    cashier_name: &'a str,
    #[serde(rename = "CashierVATIN", skip_serializing_if = "Option::is_none")]
    cashier_vatin: Option<&'a str>,
}

impl<'a> From<&'a Cashier> for CashierFields<'a> {
    fn from(c: &'a Cashier) -> Self {
        Self {
            cashier_name: &c.name,
            cashier_vatin: c.tax_id.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CashMovement<'a> {
    #[serde(flatten)]
    cashier: CashierFields<'a>,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
}

#[derive(Debug, Default, Deserialize)]
struct KktInfoAnswer {
    #[serde(rename = "CheckNumber", default)]
    check_number: Option<u32>,
    #[serde(rename = "SessionNumber", default)]
    session_number: Option<u32>,
    #[serde(rename = "Info", default)]
    info: KktInfo,
}

#[derive(Debug, Default, Deserialize)]
struct KktInfo {
    #[serde(rename = "SessionState", default)]
    session_state: i32,
    #[serde(rename = "FN_DateEnd", default)]
    fn_date_end: Option<String>,
    #[serde(rename = "Firmware_Version", default)]
    firmware_version: Option<String>,
    #[serde(rename = "BalanceCash", default)]
    balance_cash: Option<Decimal>,
    #[serde(rename = "KktNumber", default)]
    kkt_number: Option<String>,
}

// ---------------------------------------------------------------------------
// Code tables
// ---------------------------------------------------------------------------

fn type_check(op: OperationType) -> i32 {
    match op {
        OperationType::Sale => 0,
        OperationType::ReturnSale => 1,
        OperationType::Buy => 10,
        OperationType::ReturnBuy => 11,
    }
}

fn tax_code(rate: TaxRate) -> i32 {
    match rate {
        TaxRate::NoTax => -1,
        TaxRate::Vat0 => 0,
        TaxRate::Vat10 => 10,
        TaxRate::Vat20 => 20,
        TaxRate::Vat110 => 110,
        TaxRate::Vat120 => 120,
    }
}

fn parse_server_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct KkmServerDriver {
    transport: Box<dyn JsonTransport>,
    num_device: u32,
    ffd_version: FfdVersion,
    receipt: ReceiptSlot<RegisterCheck>,
}

impl KkmServerDriver {
    pub fn new(transport: Box<dyn JsonTransport>, config: &KkmConfig) -> Self {
        Self {
            transport,
            num_device: config.num_device.unwrap_or(0),
            // The server negotiates the format with the register itself.
            ffd_version: config.ffd_version.unwrap_or(FfdVersion::Ffd120),
            receipt: ReceiptSlot::new(),
        }
    }

    /// Send one command and validate the answer `Status`.
    fn send<T: Serialize>(&mut self, command: &str, body: &T) -> KkmResult<Value> {
        let mut request = match serde_json::to_value(body) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => serde_json::Map::new(),
            Ok(other) => {
                return Err(KkmError::InvalidArgument(format!(
                    "{command}: request body must be an object, got {other}"
                )))
            }
            Err(e) => {
                return Err(KkmError::InvalidArgument(format!(
                    "{command}: cannot encode request: {e}"
                )))
            }
        };
        request.insert("Command".into(), Value::from(command));
        request.insert(
            "IdCommand".into(),
            Value::from(uuid::Uuid::new_v4().to_string()),
        );
        request.insert("NumDevice".into(), Value::from(self.num_device));

        debug!(command, num_device = self.num_device, "KKM server request");
        let answer = self.transport.execute(&Value::Object(request))?;
        check_answer(command, answer)
    }

    fn send_command(&mut self, command: &str) -> KkmResult<Value> {
        self.send(command, &Value::Null)
    }
}

fn check_answer(command: &str, answer: Value) -> KkmResult<Value> {
    let status = answer
        .get("Status")
        .and_then(Value::as_i64)
        .ok_or_else(|| KkmError::Transport(format!("{command}: answer without Status")))?;
    let message = answer
        .get("Error")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match status {
        0 => Ok(answer),
        1 => Err(KkmError::device(
            DeviceErrorKind::Unknown,
            1,
            format!("{command}: command is still running"),
        )),
        2 => {
            let lower = message.to_lowercase();
            let kind = if lower.contains("24 час") || lower.contains("24 hours") {
                DeviceErrorKind::SessionMore24Hours
            } else {
                DeviceErrorKind::Unknown
            };
            Err(KkmError::device(kind, 2, format!("{command}: {message}")))
        }
        other => Err(KkmError::device(
            DeviceErrorKind::Unknown,
            other as i32,
            format!("{command}: {message}"),
        )),
    }
}

impl KkmDriver for KkmServerDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn connect(&mut self) -> KkmResult<()> {
        info!(target_url = %self.transport.description(), num_device = self.num_device, "KKM server driver ready");
        Ok(())
    }

    fn disconnect(&mut self) -> KkmResult<()> {
        if self.receipt.is_open() {
            warn!("Disconnecting with an unsent receipt; discarding it");
            let _ = self.receipt.take();
        }
        Ok(())
    }

    fn get_status(&mut self) -> KkmResult<KkmStatus> {
        let answer = self.send_command("GetDataKKT")?;
        let info: KktInfoAnswer = serde_json::from_value(answer)
            .map_err(|e| KkmError::Transport(format!("GetDataKKT: malformed answer: {e}")))?;

        Ok(KkmStatus {
            session_status: match info.info.session_state {
                1 => SessionStatus::Closed,
                2 => SessionStatus::Open,
                3 => SessionStatus::OpenMoreThan24h,
                _ => SessionStatus::Unknown,
            },
            check_status: if self.receipt.is_open() {
                CheckStatus::Open
            } else {
                CheckStatus::Closed
            },
            session_number: info.session_number,
            check_number: info.check_number,
            factory_number: info.info.kkt_number,
            software_version: info.info.firmware_version,
            model: None,
            session_started: None,
            fn_date_end: info.info.fn_date_end.as_deref().and_then(parse_server_date),
            cash_sum: info.info.balance_cash,
            driver_version: None,
        })
    }

    fn open_session(&mut self, cashier: &Cashier) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        self.send("OpenShift", &CashierFields::from(cashier))?;
        Ok(())
    }

    fn get_report(&mut self, report: ReportType, cashier: &Cashier) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        match report {
            ReportType::ZReport => self.send("CloseShift", &CashierFields::from(cashier))?,
            ReportType::XReport => self.send_command("XReport")?,
            ReportType::XReportWithGoods => {
                return Err(KkmError::unsupported("KKM Server: X report with goods"))
            }
        };
        Ok(())
    }

    fn open_receipt(&mut self, receipt: Option<&ReceiptData>) -> KkmResult<()> {
        let receipt = require_receipt(receipt)?;
        self.receipt.ensure_idle()?;

        let ru: Option<RuReceiptData> = decode_russia(receipt.country_specific_data.as_ref())?;

        let mut check = RegisterCheck {
            is_fiscal_check: receipt.is_fiscal(),
            type_check: type_check(receipt.operation_type),
            not_print: None,
            cashier_name: receipt.cashier.name.clone(),
            cashier_vatin: receipt.cashier.tax_id.clone(),
            client_address: None,
            client_info: receipt.contractor.as_ref().map(|c| c.name.clone()),
            client_inn: receipt.contractor.as_ref().and_then(|c| c.tax_id.clone()),
            tax_variant: None,
            check_strings: Vec::new(),
            cash: Decimal::ZERO,
            electronic_payment: Decimal::ZERO,
            advance_payment: Decimal::ZERO,
            credit: Decimal::ZERO,
            shape: ItemShape::for_version(Some(self.ffd_version)),
        };

        if let Some(ru) = ru {
            check.client_address = ru.digital_receipt_address;
            check.tax_variant = Some(ru.tax_variant_index);
            check.not_print = Some(!receipt.is_print_receipt);
        }

        debug!(type_check = check.type_check, fiscal = check.is_fiscal_check, "Receipt opened");
        self.receipt.open(check)
    }

    fn register_item(&mut self, item: &ReceiptItem) -> KkmResult<()> {
        let check = self.receipt.current_mut()?;
        let ru: Option<RuItemData> = decode_russia(item.country_specific_data.as_ref())?;

        let mut register = Register {
            name: item.name.clone(),
            quantity: item.quantity,
            price: item.price,
            amount: line_amount(item.price, item.quantity)?,
            department: item.department_index,
            tax: tax_code(TaxRate::from_index(item.tax_rate_index)),
            sign_method_calculation: None,
            sign_calculation_object: None,
            measure_of_quantity: None,
            good_code_data: None,
        };

        if let Some(ru) = ru {
            if check.shape != ItemShape::Legacy {
                if let Some(ffd) = ru.ffd_data {
                    register.sign_method_calculation = Some(ffd.method);
                    register.sign_calculation_object = Some(ffd.subject);
                    if check.shape == ItemShape::Latest {
                        register.measure_of_quantity = Some(ffd.unit);
                    }
                }
            }
            if check.shape == ItemShape::Latest {
                if let Some(marking) = ru.marking_info {
                    let code = prepare_mark_code(&marking.raw_code);
                    if code.is_empty() {
                        warn!(item = %item.name, "Marking code is empty after normalization; skipping");
                    } else {
                        register.good_code_data = Some(GoodCodeData {
                            bar_code: code,
                            accept_on_bad: true,
                            contains_serial_number: false,
                        });
                    }
                }
            }
        }

        check.check_strings.push(CheckString {
            register: Some(register),
            print_text: None,
        });
        Ok(())
    }

    fn register_payment(&mut self, payment: &ReceiptPayment) -> KkmResult<()> {
        let check = self.receipt.current_mut()?;
        let bucket = match payment_bucket(payment)? {
            PaymentBucket::Cash => &mut check.cash,
            PaymentBucket::Electronic => &mut check.electronic_payment,
            PaymentBucket::Advance => &mut check.advance_payment,
            PaymentBucket::Credit => &mut check.credit,
        };
        *bucket = bucket.checked_add(payment.sum).ok_or_else(|| {
            KkmError::InvalidArgument(format!("Payment total overflows at {}", payment.sum))
        })?;
        Ok(())
    }

    fn close_receipt(&mut self) -> KkmResult<()> {
        let check = self.receipt.current()?.clone();
        self.send("RegisterCheck", &check)?;
        self.receipt.take()?;
        info!(lines = check.check_strings.len(), "Receipt registered");
        Ok(())
    }

    fn cancel_receipt(&mut self) -> KkmResult<()> {
        // Nothing reaches the server before close.
        if self.receipt.take().is_ok() {
            debug!("Receipt batch discarded");
        }
        Ok(())
    }

    fn cash_in(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        let body = CashMovement {
            cashier: cashier.into(),
            amount: sum.abs(),
        };
        self.send("DepositingCash", &body)?;
        Ok(())
    }

    fn cash_out(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        let body = CashMovement {
            cashier: cashier.into(),
            amount: sum.abs(),
        };
        self.send("PaymentCash", &body)?;
        Ok(())
    }

    fn open_cash_box(&mut self) -> KkmResult<()> {
        self.send_command("OpenCashDrawer")?;
        Ok(())
    }

    fn print_text(&mut self, text: &str) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        let check = serde_json::json!({
            "IsFiscalCheck": false,
            "NotPrint": false,
            "CheckStrings": text
                .lines()
                .map(|line| CheckString {
                    register: None,
                    print_text: Some(PrintTextLine { text: line.to_string() }),
                })
                .collect::<Vec<_>>(),
        });
        self.send("RegisterCheck", &check)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
