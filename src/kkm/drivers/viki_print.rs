//! VikiPrint fiscal registrar driver (Pirit command set).
//!
//! Every operation goes to the register immediately; the driver only keeps
//! enough receipt state to pick the item registration shape and to enforce
//! the open/close lifecycle.

use crate::config::{FfdVersion, KkmConfig};
use crate::error::{DeviceErrorKind, KkmError, KkmResult};
use crate::kkm::drivers::pirit::{PiritPort, PiritReply};
use crate::kkm::protocol::*;
use crate::kkm::receipt::{
    decode_russia, Cashier, OperationType, ReceiptData, ReceiptItem, ReceiptPayment,
};
use crate::kkm::russia::{
    line_amount, payment_bucket, prepare_mark_code, FfdData, ItemShape, PaymentBucket,
    RuItemData, RuReceiptData, TaxRate,
};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

const DRIVER_NAME: &str = "VikiPrint";

/// Vendor result code for "session open longer than 24 hours".
const RESULT_SESSION_OVER_24H: u8 = 10;

// ---------------------------------------------------------------------------
// Pirit commands
// ---------------------------------------------------------------------------

const CMD_STATUS_FLAGS: u8 = 0x00;
const CMD_COUNTERS: u8 = 0x01;
const CMD_KKT_INFO: u8 = 0x02;
const CMD_START_WORK: u8 = 0x10;
const CMD_X_REPORT: u8 = 0x20;
const CMD_Z_REPORT: u8 = 0x21;
const CMD_OPEN_DOCUMENT: u8 = 0x30;
const CMD_CLOSE_DOCUMENT: u8 = 0x31;
const CMD_CANCEL_DOCUMENT: u8 = 0x32;
const CMD_PRINT_TEXT: u8 = 0x40;
const CMD_ADD_POSITION: u8 = 0x42;
const CMD_PAYMENT: u8 = 0x47;
const CMD_CASH_IN_OUT: u8 = 0x48;
const CMD_CLIENT_ADDRESS: u8 = 0x57;
const CMD_MARKING_CODE: u8 = 0x79;

// Counters (0x01) and register info (0x02) request numbers.
const COUNTER_SESSION_NUMBER: u32 = 1;
const COUNTER_CHECK_NUMBER: u32 = 2;
const INFO_FACTORY_NUMBER: u32 = 1;
const INFO_FIRMWARE: u32 = 2;
const INFO_CASH_SUM: u32 = 7;
const INFO_FN_DATE_END: u32 = 14;
const INFO_SESSION_START: u32 = 17;
const INFO_MODEL: u32 = 21;

// Status flags (0x00, field 1).
const FLAG_NEEDS_START: i64 = 1 << 0;
const FLAG_SESSION_OPEN: i64 = 1 << 2;
const FLAG_SESSION_OVER_24H: i64 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum DocType {
    Service = 1,
    Sale = 2,
    Return = 3,
    CashIncome = 4,
    CashOutcome = 5,
}

// ---------------------------------------------------------------------------
// Code tables
// ---------------------------------------------------------------------------

/// Pirit tax register number.
fn tax_code(rate: TaxRate) -> u8 {
    match rate {
        TaxRate::Vat20 => 0,
        TaxRate::Vat10 => 1,
        TaxRate::Vat120 => 2,
        TaxRate::Vat110 => 3,
        TaxRate::Vat0 => 4,
        TaxRate::NoTax => 5,
    }
}

fn payment_code(bucket: PaymentBucket) -> u8 {
    match bucket {
        PaymentBucket::Cash => 0,
        PaymentBucket::Electronic => 1,
        PaymentBucket::Advance => 13,
        PaymentBucket::Credit => 14,
    }
}

fn doc_type(op: OperationType) -> KkmResult<DocType> {
    match op {
        OperationType::Sale => Ok(DocType::Sale),
        OperationType::ReturnSale => Ok(DocType::Return),
        OperationType::Buy | OperationType::ReturnBuy => Err(KkmError::unsupported(format!(
            "{DRIVER_NAME}: {op:?} receipts"
        ))),
    }
}

/// Cashier as the register expects it: `INN&Name` when the INN is known.
fn cashier_field(cashier: &Cashier) -> String {
    match cashier.tax_id.as_deref().map(str::trim) {
        Some(inn) if !inn.is_empty() => format!("{inn}&{}", cashier.name),
        _ => cashier.name.clone(),
    }
}

/// Kopecks, always with two decimals.
fn money(sum: Decimal) -> String {
    let mut value = sum.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    value.rescale(2);
    value.to_string()
}

fn parse_pirit_datetime(date: &str, time: Option<&str>) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date.trim(), "%d%m%y").ok()?;
    let time = time
        .and_then(|t| NaiveTime::parse_from_str(t.trim(), "%H%M%S").ok())
        .unwrap_or(NaiveTime::MIN);
    Some(date.and_time(time))
}

fn check_result(reply: &PiritReply, what: &str) -> KkmResult<()> {
    match reply.code {
        0 => Ok(()),
        RESULT_SESSION_OVER_24H => Err(KkmError::device(
            DeviceErrorKind::SessionMore24Hours,
            i32::from(reply.code),
            format!("{what}: session is open longer than 24 hours"),
        )),
        code => Err(KkmError::device(
            DeviceErrorKind::Unknown,
            i32::from(code),
            format!("{what}: register returned error {code}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OpenDocument {
    fiscal: bool,
    shape: ItemShape,
}

pub struct VikiPrintDriver {
    port: Box<dyn PiritPort>,
    ffd_version: Option<FfdVersion>,
    receipt: ReceiptSlot<OpenDocument>,
}

impl VikiPrintDriver {
    pub fn new(port: Box<dyn PiritPort>, config: &KkmConfig) -> Self {
        Self {
            port,
            ffd_version: config.ffd_version,
            receipt: ReceiptSlot::new(),
        }
    }

    fn call(&mut self, command: u8, fields: Vec<String>, what: &str) -> KkmResult<PiritReply> {
        debug!(command = format!("{command:02X}"), what, "VikiPrint call");
        let reply = self.port.execute(command, &fields)?;
        check_result(&reply, what)?;
        Ok(reply)
    }

    /// Informational request; a vendor refusal means "value unknown".
    fn info(&mut self, command: u8, number: u32) -> KkmResult<Option<PiritReply>> {
        let reply = self.port.execute(command, &[number.to_string()])?;
        if reply.code != 0 {
            debug!(command = format!("{command:02X}"), number, code = reply.code, "Info request refused");
            return Ok(None);
        }
        Ok(Some(reply))
    }

    fn info_value(&mut self, command: u8, number: u32) -> KkmResult<Option<String>> {
        Ok(self
            .info(command, number)?
            .and_then(|r| r.value().map(str::to_string)))
    }

    fn status_flags(&mut self) -> KkmResult<(i64, i64)> {
        let reply = self.call(CMD_STATUS_FLAGS, Vec::new(), "status flags")?;
        let current = reply.field_i64(1).unwrap_or(0);
        let document = reply.field_i64(2).unwrap_or(0);
        Ok((current, document))
    }

    fn open_document(&mut self, doc: DocType, cashier: &str, tax_variant: i32) -> KkmResult<()> {
        self.call(
            CMD_OPEN_DOCUMENT,
            vec![
                (doc as u8).to_string(),
                "1".into(),
                cashier.to_string(),
                String::new(),
                tax_variant.to_string(),
            ],
            "open document",
        )?;
        Ok(())
    }

    /// Cancel the register's open document after a failed step.
    fn abandon_document(&mut self) {
        if let Err(e) = self.call(CMD_CANCEL_DOCUMENT, Vec::new(), "cancel document") {
            warn!(error = %e, "Cancel after failure also failed");
        }
    }

    fn close_document(&mut self) -> KkmResult<()> {
        self.call(CMD_CLOSE_DOCUMENT, vec!["0".into()], "close document")?;
        Ok(())
    }

    fn print_line(&mut self, line: &str) -> KkmResult<()> {
        self.call(CMD_PRINT_TEXT, vec![line.to_string(), "0".into()], "print text")?;
        Ok(())
    }

    fn cash_document(&mut self, doc: DocType, sum: Decimal, cashier: &Cashier) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        self.open_document(doc, &cashier_field(cashier), 0)?;
        if let Err(e) = self.call(
            CMD_CASH_IN_OUT,
            vec![String::new(), money(sum.abs())],
            "cash in/out",
        ) {
            self.abandon_document();
            return Err(e);
        }
        self.close_document()
    }

    fn add_position(&mut self, item: &ReceiptItem, ffd: Option<FfdData>, with_unit: bool) -> KkmResult<()> {
        let mut fields = vec![
            item.name.clone(),
            String::new(),
            item.quantity.to_string(),
            item.price.to_string(),
            tax_code(TaxRate::from_index(item.tax_rate_index)).to_string(),
            String::new(),
            item.department_index.to_string(),
        ];
        if let Some(ffd) = ffd {
            fields.extend([
                "0".into(),
                String::new(),
                "0".into(),
                ffd.method.to_string(),
                ffd.subject.to_string(),
            ]);
            if with_unit {
                fields.push(ffd.unit.to_string());
            }
        }
        self.call(CMD_ADD_POSITION, fields, "add position")?;
        Ok(())
    }
}

/// FFD 1.2: every marked item must carry FFD attributes.
fn validate_marked_items(receipt: &ReceiptData) -> KkmResult<()> {
    for item in &receipt.items {
        let ru: Option<RuItemData> = decode_russia(item.country_specific_data.as_ref())?;
        if let Some(ru) = ru {
            if ru.marking_info.is_some() && ru.ffd_data.is_none() {
                return Err(KkmError::InvalidArgument(format!(
                    "Marked item '{}' has no FFD data",
                    item.name
                )));
            }
        }
    }
    Ok(())
}

fn require_ffd(item: &ReceiptItem, ru: Option<&RuItemData>) -> KkmResult<FfdData> {
    ru.and_then(|r| r.ffd_data).ok_or_else(|| {
        KkmError::InvalidArgument(format!("Item '{}' has no FFD data", item.name))
    })
}

impl KkmDriver for VikiPrintDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn connect(&mut self) -> KkmResult<()> {
        self.port.open()?;
        let (current, _) = self.status_flags()?;
        if current & FLAG_NEEDS_START != 0 {
            let now = Local::now();
            info!("VikiPrint needs initialization; starting work");
            self.call(
                CMD_START_WORK,
                vec![now.format("%d%m%y").to_string(), now.format("%H%M%S").to_string()],
                "start work",
            )?;
        }
        info!("VikiPrint connected");
        Ok(())
    }

    fn disconnect(&mut self) -> KkmResult<()> {
        let _ = self.receipt.take();
        self.port.close()
    }

    fn get_status(&mut self) -> KkmResult<KkmStatus> {
        let (current, document) = self.status_flags()?;

        let session_status = if current & FLAG_SESSION_OVER_24H != 0 {
            SessionStatus::OpenMoreThan24h
        } else if current & FLAG_SESSION_OPEN != 0 {
            SessionStatus::Open
        } else {
            SessionStatus::Closed
        };
        let check_status = if document & 0x0F != 0 {
            CheckStatus::Open
        } else {
            CheckStatus::Closed
        };

        let session_number = self
            .info_value(CMD_COUNTERS, COUNTER_SESSION_NUMBER)?
            .and_then(|v| v.trim().parse().ok());
        let check_number = self
            .info_value(CMD_COUNTERS, COUNTER_CHECK_NUMBER)?
            .and_then(|v| v.trim().parse().ok());
        let factory_number = self.info_value(CMD_KKT_INFO, INFO_FACTORY_NUMBER)?;
        let software_version = self.info_value(CMD_KKT_INFO, INFO_FIRMWARE)?;
        let model = self.info_value(CMD_KKT_INFO, INFO_MODEL)?;

        let session_started = self
            .info(CMD_KKT_INFO, INFO_SESSION_START)?
            .and_then(|r| {
                let date = r.fields.get(1)?.clone();
                parse_pirit_datetime(&date, r.fields.get(2).map(|s| s.as_str()))
            });
        let fn_date_end = self
            .info_value(CMD_KKT_INFO, INFO_FN_DATE_END)?
            .and_then(|d| parse_pirit_datetime(&d, None));

        // Register reports the balance with an optional decimal point; kopecks.
        let cash_sum = self
            .info_value(CMD_KKT_INFO, INFO_CASH_SUM)?
            .and_then(|v| v.trim().replace('.', "").parse::<i64>().ok())
            .map(|kopecks| Decimal::new(kopecks, 2));

        Ok(KkmStatus {
            session_status,
            check_status,
            session_number,
            check_number,
            factory_number,
            software_version,
            model,
            session_started,
            fn_date_end,
            cash_sum,
            driver_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        })
    }

    fn open_session(&mut self, _cashier: &Cashier) -> KkmResult<()> {
        // The register opens a session with the first fiscal document.
        Ok(())
    }

    fn get_report(&mut self, report: ReportType, cashier: &Cashier) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        let cashier = cashier_field(cashier);
        match report {
            ReportType::ZReport => self.call(CMD_Z_REPORT, vec![cashier], "Z report")?,
            ReportType::XReport => self.call(CMD_X_REPORT, vec![cashier], "X report")?,
            ReportType::XReportWithGoods => {
                return Err(KkmError::unsupported("VikiPrint: X report with goods"))
            }
        };
        Ok(())
    }

    fn open_receipt(&mut self, receipt: Option<&ReceiptData>) -> KkmResult<()> {
        let receipt = require_receipt(receipt)?;
        self.receipt.ensure_idle()?;

        let fiscal = receipt.is_fiscal();
        let (doc, cashier) = if fiscal {
            (doc_type(receipt.operation_type)?, cashier_field(&receipt.cashier))
        } else {
            (DocType::Service, receipt.cashier.name.clone())
        };

        let ru: Option<RuReceiptData> = decode_russia(receipt.country_specific_data.as_ref())?;
        let shape = ItemShape::for_version(self.ffd_version);
        if shape == ItemShape::Latest {
            validate_marked_items(receipt)?;
        }

        let tax_variant = ru.as_ref().map(|r| r.tax_variant_index).unwrap_or(0);
        self.open_document(doc, &cashier, tax_variant)?;

        if fiscal {
            if let Some(address) = ru
                .and_then(|r| r.digital_receipt_address)
                .filter(|a| !a.trim().is_empty())
            {
                if let Err(e) = self.call(CMD_CLIENT_ADDRESS, vec![address], "client address") {
                    self.abandon_document();
                    return Err(e);
                }
            }
        }
        self.receipt.open(OpenDocument { fiscal, shape })?;
        debug!(doc = ?doc, fiscal, shape = ?shape, "VikiPrint document opened");
        Ok(())
    }

    fn register_item(&mut self, item: &ReceiptItem) -> KkmResult<()> {
        let (fiscal, shape) = {
            let doc = self.receipt.current()?;
            (doc.fiscal, doc.shape)
        };

        if !fiscal {
            let amount = line_amount(item.price, item.quantity)?;
            return self.print_line(&format!(
                "{} {} x {} = {}",
                item.name,
                item.quantity,
                item.price,
                money(amount)
            ));
        }

        let ru: Option<RuItemData> = decode_russia(item.country_specific_data.as_ref())?;
        match shape {
            ItemShape::Legacy => self.add_position(item, None, false),
            ItemShape::Mid => {
                let ffd = require_ffd(item, ru.as_ref())?;
                self.add_position(item, Some(ffd), false)
            }
            ItemShape::Latest => {
                let ffd = require_ffd(item, ru.as_ref())?;
                if let Some(marking) = ru.as_ref().and_then(|r| r.marking_info.as_ref()) {
                    let code = prepare_mark_code(&marking.raw_code);
                    if code.is_empty() {
                        warn!(item = %item.name, "Marking code is empty after normalization; skipping");
                    } else {
                        self.call(
                            CMD_MARKING_CODE,
                            vec![
                                code,
                                marking.estimated_status.to_string(),
                                ffd.unit.to_string(),
                                marking.validation_result_kkm.to_string(),
                            ],
                            "marking code",
                        )?;
                    }
                }
                self.add_position(item, Some(ffd), true)
            }
        }
    }

    fn register_payment(&mut self, payment: &ReceiptPayment) -> KkmResult<()> {
        let fiscal = self.receipt.current()?.fiscal;
        let bucket = payment_bucket(payment)?;
        if !fiscal {
            return self.print_line(&format!("{bucket:?}: {}", money(payment.sum)));
        }
        self.call(
            CMD_PAYMENT,
            vec![payment_code(bucket).to_string(), money(payment.sum), String::new()],
            "payment",
        )?;
        Ok(())
    }

    fn close_receipt(&mut self) -> KkmResult<()> {
        self.receipt.current()?;
        self.close_document()?;
        self.receipt.take()?;
        Ok(())
    }

    fn cancel_receipt(&mut self) -> KkmResult<()> {
        // Also clears a document left open on the register by an earlier run.
        self.call(CMD_CANCEL_DOCUMENT, Vec::new(), "cancel document")?;
        let _ = self.receipt.take();
        Ok(())
    }

    fn cash_in(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()> {
        self.cash_document(DocType::CashIncome, sum, cashier)
    }

    fn cash_out(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()> {
        self.cash_document(DocType::CashOutcome, sum, cashier)
    }

    fn print_text(&mut self, text: &str) -> KkmResult<()> {
        self.receipt.ensure_idle()?;
        self.open_document(DocType::Service, "", 0)?;
        for line in text.lines() {
            if let Err(e) = self.print_line(line) {
                self.abandon_document();
                return Err(e);
            }
        }
        self.close_document()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KkmType;
    use crate::error::ErrorKind;
    use crate::kkm::receipt::{FiscalType, RegimeExtension};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(u8, Vec<String>)>>>;

    /// Answers every command with code 0 unless scripted otherwise.
    struct MockPirit {
        calls: Calls,
        replies: HashMap<u8, PiritReply>,
    }

    impl PiritPort for MockPirit {
        fn open(&mut self) -> KkmResult<()> {
            Ok(())
        }
        fn close(&mut self) -> KkmResult<()> {
            Ok(())
        }
        fn execute(&mut self, command: u8, fields: &[String]) -> KkmResult<PiritReply> {
            self.calls.lock().unwrap().push((command, fields.to_vec()));
            Ok(self
                .replies
                .get(&command)
                .cloned()
                .unwrap_or_else(|| PiritReply::ok(Vec::new())))
        }
    }

    fn driver(ffd: Option<FfdVersion>, replies: HashMap<u8, PiritReply>) -> (VikiPrintDriver, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let config = KkmConfig {
            kkm_type: KkmType::VikiPrint,
            ffd_version: ffd,
            num_device: None,
            timeout_ms: None,
        };
        let port = MockPirit {
            calls: calls.clone(),
            replies,
        };
        (VikiPrintDriver::new(Box::new(port), &config), calls)
    }

    fn commands(calls: &Calls) -> Vec<u8> {
        calls.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn cashier() -> Cashier {
        Cashier {
            name: "Petrov".into(),
            tax_id: Some("500100732259".into()),
        }
    }

    fn receipt(op: OperationType, fiscal: FiscalType) -> ReceiptData {
        ReceiptData {
            cashier: cashier(),
            contractor: None,
            operation_type: op,
            fiscal_type: fiscal,
            items: vec![],
            payments: vec![],
            is_print_receipt: true,
            country_specific_data: None,
        }
    }

    fn item(ru: Option<Value>) -> ReceiptItem {
        ReceiptItem {
            name: "Shoes".into(),
            price: dec("2500"),
            quantity: dec("1"),
            tax_rate_index: 4,
            department_index: 1,
            country_specific_data: ru.map(RegimeExtension::Russia),
        }
    }

    #[test]
    fn test_sale_sequence() {
        let (mut d, calls) = driver(None, HashMap::new());
        d.open_receipt(Some(&receipt(OperationType::Sale, FiscalType::Fiscal)))
            .unwrap();
        d.register_item(&item(None)).unwrap();
        d.register_payment(&ReceiptPayment { method_index: 2, sum: dec("2500") })
            .unwrap();
        d.close_receipt().unwrap();

        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_ADD_POSITION, CMD_PAYMENT, CMD_CLOSE_DOCUMENT]
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].1[0], "2");
        assert_eq!(calls[0].1[2], "500100732259&Petrov");
        // Legacy shape: seven fields, VAT 20% is register 0.
        assert_eq!(calls[1].1.len(), 7);
        assert_eq!(calls[1].1[4], "0");
        assert_eq!(calls[2].1[0], "1");
        assert_eq!(calls[2].1[1], "2500.00");
    }

    #[test]
    fn test_buy_is_unsupported() {
        let (mut d, calls) = driver(None, HashMap::new());
        let err = d
            .open_receipt(Some(&receipt(OperationType::Buy, FiscalType::Fiscal)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(calls.lock().unwrap().is_empty());
        assert!(!d.receipt.is_open());
    }

    #[test]
    fn test_lifecycle_errors() {
        let (mut d, _) = driver(None, HashMap::new());
        assert_eq!(d.register_item(&item(None)).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(d.close_receipt().unwrap_err().kind(), ErrorKind::InvalidState);

        let r = receipt(OperationType::ReturnSale, FiscalType::Fiscal);
        d.open_receipt(Some(&r)).unwrap();
        assert_eq!(d.open_receipt(Some(&r)).unwrap_err().kind(), ErrorKind::InvalidState);
        d.cancel_receipt().unwrap();
        d.open_receipt(Some(&r)).unwrap();
    }

    #[test]
    fn test_ffd120_marking_and_unit() {
        let (mut d, calls) = driver(Some(FfdVersion::Ffd120), HashMap::new());
        let ru = json!({
            "ffdData": { "subject": 33, "method": 4, "unit": 0 },
            "markingInfo": { "rawCode": "]C10104600439931256215iTqP8<GS>93dGVz", "estimatedStatus": 1 }
        });
        let mut r = receipt(OperationType::Sale, FiscalType::Fiscal);
        r.items.push(item(Some(ru.clone())));
        d.open_receipt(Some(&r)).unwrap();
        d.register_item(&item(Some(ru))).unwrap();

        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_MARKING_CODE, CMD_ADD_POSITION]
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls[1].1[0], "0104600439931256215iTqP8\u{1d}93dGVz");
        assert_eq!(calls[1].1[1], "1");
        let position = &calls[2].1;
        assert_eq!(position.len(), 13);
        assert_eq!(position[10], "4");
        assert_eq!(position[11], "33");
    }

    #[test]
    fn test_ffd120_empty_marking_is_skipped() {
        let (mut d, calls) = driver(Some(FfdVersion::Ffd120), HashMap::new());
        let ru = json!({
            "ffdData": { "subject": 1, "method": 4, "unit": 0 },
            "markingInfo": { "rawCode": "]C1" }
        });
        d.open_receipt(Some(&receipt(OperationType::Sale, FiscalType::Fiscal)))
            .unwrap();
        d.register_item(&item(Some(ru))).unwrap();
        assert_eq!(commands(&calls), vec![CMD_OPEN_DOCUMENT, CMD_ADD_POSITION]);
    }

    #[test]
    fn test_ffd120_rejects_marked_item_without_ffd_data_before_opening() {
        let (mut d, calls) = driver(Some(FfdVersion::Ffd120), HashMap::new());
        let mut r = receipt(OperationType::Sale, FiscalType::Fiscal);
        r.items.push(item(Some(json!({ "markingInfo": { "rawCode": "010460" } }))));
        let err = d.open_receipt(Some(&r)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mid_shape_requires_ffd_data() {
        let (mut d, _) = driver(Some(FfdVersion::Ffd105), HashMap::new());
        d.open_receipt(Some(&receipt(OperationType::Sale, FiscalType::Fiscal)))
            .unwrap();
        assert_eq!(d.register_item(&item(None)).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_non_fiscal_receipt_prints_lines() {
        let (mut d, calls) = driver(None, HashMap::new());
        d.open_receipt(Some(&receipt(OperationType::Sale, FiscalType::NonFiscal)))
            .unwrap();
        d.register_item(&item(None)).unwrap();
        d.close_receipt().unwrap();
        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_PRINT_TEXT, CMD_CLOSE_DOCUMENT]
        );
        assert_eq!(calls.lock().unwrap()[0].1[0], "1");
    }

    #[test]
    fn test_session_over_24h_result_code() {
        let mut replies = HashMap::new();
        replies.insert(CMD_OPEN_DOCUMENT, PiritReply { code: 10, fields: vec![] });
        let (mut d, _) = driver(None, replies);
        match d
            .open_receipt(Some(&receipt(OperationType::Sale, FiscalType::Fiscal)))
            .unwrap_err()
        {
            KkmError::Device { kind, code, .. } => {
                assert_eq!(kind, DeviceErrorKind::SessionMore24Hours);
                assert_eq!(code, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!d.receipt.is_open());
    }

    #[test]
    fn test_rejected_client_address_cancels_and_leaves_driver_idle() {
        let mut replies = HashMap::new();
        replies.insert(CMD_CLIENT_ADDRESS, PiritReply { code: 3, fields: vec![] });
        let (mut d, calls) = driver(None, replies);

        let mut r = receipt(OperationType::Sale, FiscalType::Fiscal);
        r.country_specific_data = Some(RegimeExtension::Russia(json!({
            "digitalReceiptAddress": "buyer@example.com"
        })));
        let err = d.open_receipt(Some(&r)).unwrap_err();
        assert!(matches!(err, KkmError::Device { code: 3, .. }));
        assert!(!d.receipt.is_open());
        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_CLIENT_ADDRESS, CMD_CANCEL_DOCUMENT]
        );

        // The next receipt on the same driver goes through.
        d.open_receipt(Some(&receipt(OperationType::Sale, FiscalType::Fiscal)))
            .unwrap();
        d.register_item(&item(None)).unwrap();
        d.close_receipt().unwrap();
    }

    #[test]
    fn test_failed_text_line_cancels_service_document() {
        let mut replies = HashMap::new();
        replies.insert(CMD_PRINT_TEXT, PiritReply { code: 2, fields: vec![] });
        let (mut d, calls) = driver(None, replies);
        assert!(d.print_text("hello").is_err());
        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_PRINT_TEXT, CMD_CANCEL_DOCUMENT]
        );
    }

    #[test]
    fn test_failed_cash_movement_cancels_document() {
        let mut replies = HashMap::new();
        replies.insert(CMD_CASH_IN_OUT, PiritReply { code: 5, fields: vec![] });
        let (mut d, calls) = driver(None, replies);
        assert!(d.cash_in(dec("100"), &cashier()).is_err());
        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_CASH_IN_OUT, CMD_CANCEL_DOCUMENT]
        );
    }

    #[test]
    fn test_money_rounds_half_away_from_zero() {
        assert_eq!(money(dec("200.005")), "200.01");
        assert_eq!(money(dec("300.5")), "300.50");
    }

    #[test]
    fn test_cash_out_sends_positive_amount() {
        let (mut d, calls) = driver(None, HashMap::new());
        d.cash_out(dec("-300.5"), &cashier()).unwrap();
        assert_eq!(
            commands(&calls),
            vec![CMD_OPEN_DOCUMENT, CMD_CASH_IN_OUT, CMD_CLOSE_DOCUMENT]
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].1[0], "5");
        assert_eq!(calls[1].1[1], "300.50");
    }

    #[test]
    fn test_unsupported_operations() {
        let (mut d, _) = driver(None, HashMap::new());
        let c = cashier();
        assert_eq!(
            d.get_report(ReportType::XReportWithGoods, &c).unwrap_err().kind(),
            ErrorKind::UnsupportedOperation
        );
        assert_eq!(d.cut_paper().unwrap_err().kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(d.open_cash_box().unwrap_err().kind(), ErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_connect_runs_start_work_when_needed() {
        let mut replies = HashMap::new();
        replies.insert(
            CMD_STATUS_FLAGS,
            PiritReply::ok(vec!["0".into(), "1".into(), "0".into()]),
        );
        let (mut d, calls) = driver(None, replies);
        d.connect().unwrap();
        assert_eq!(commands(&calls), vec![CMD_STATUS_FLAGS, CMD_START_WORK]);
    }

    #[test]
    fn test_get_status() {
        let mut replies = HashMap::new();
        replies.insert(
            CMD_STATUS_FLAGS,
            PiritReply::ok(vec!["0".into(), "12".into(), "0".into()]),
        );
        replies.insert(CMD_COUNTERS, PiritReply::ok(vec!["1".into(), "57".into()]));
        replies.insert(
            CMD_KKT_INFO,
            PiritReply::ok(vec!["17".into(), "150326".into(), "083000".into()]),
        );
        let (mut d, _) = driver(None, replies);
        let status = d.get_status().unwrap();
        assert_eq!(status.session_status, SessionStatus::OpenMoreThan24h);
        assert_eq!(status.check_status, CheckStatus::Closed);
        assert_eq!(status.session_number, Some(57));
        let started = status.session_started.unwrap();
        assert_eq!(started.format("%Y-%m-%d %H:%M").to_string(), "2026-03-15 08:30");
        assert!(status.driver_version.is_some());
    }

    #[test]
    fn test_tax_code_table() {
        assert_eq!(tax_code(TaxRate::from_index(1)), 5);
        assert_eq!(tax_code(TaxRate::from_index(4)), 0);
        assert_eq!(tax_code(TaxRate::from_index(7)), 5);
    }
}
