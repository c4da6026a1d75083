//! Higher-level fiscal operations composed from driver calls.

use crate::error::KkmResult;
use crate::kkm::protocol::{KkmDriver, KkmStatus, ReportType};
use crate::kkm::receipt::{Cashier, ReceiptData};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Orchestrates one driver for the duration of a command.
pub struct FiscalRegistrarFacade<'a> {
    driver: &'a mut dyn KkmDriver,
}

impl<'a> FiscalRegistrarFacade<'a> {
    pub fn new(driver: &'a mut dyn KkmDriver) -> Self {
        Self { driver }
    }

    pub fn get_status(&mut self) -> KkmResult<KkmStatus> {
        self.driver.get_status()
    }

    pub fn open_session(&mut self, cashier: &Cashier) -> KkmResult<()> {
        self.driver.open_session(cashier)
    }

    pub fn get_report(&mut self, report: ReportType, cashier: &Cashier) -> KkmResult<()> {
        self.driver.get_report(report, cashier)
    }

    /// Positive sums deposit, negative sums withdraw, zero does nothing.
    pub fn cash_in_out(&mut self, sum: Decimal, cashier: &Cashier) -> KkmResult<()> {
        if sum > Decimal::ZERO {
            self.driver.cash_in(sum, cashier)
        } else if sum < Decimal::ZERO {
            self.driver.cash_out(-sum, cashier)
        } else {
            debug!("Zero cash movement ignored");
            Ok(())
        }
    }

    /// Open, register every item then every payment, and close.
    ///
    /// A failure after the receipt was opened cancels it, so the driver is
    /// idle again for the next command. The original error is returned.
    pub fn print_fiscal_receipt(&mut self, receipt: &ReceiptData) -> KkmResult<()> {
        self.driver.open_receipt(Some(receipt))?;

        if let Err(e) = self.fill_and_close(receipt) {
            warn!(error = %e, "Receipt failed; cancelling");
            if let Err(cancel) = self.driver.cancel_receipt() {
                warn!(error = %cancel, "Cancel after failure also failed");
            }
            return Err(e);
        }

        info!(
            items = receipt.items.len(),
            payments = receipt.payments.len(),
            driver = self.driver.name(),
            "Receipt printed"
        );
        Ok(())
    }

    fn fill_and_close(&mut self, receipt: &ReceiptData) -> KkmResult<()> {
        for item in &receipt.items {
            self.driver.register_item(item)?;
        }
        for payment in &receipt.payments {
            self.driver.register_payment(payment)?;
        }
        self.driver.close_receipt()
    }

    pub fn print_text(&mut self, text: &str) -> KkmResult<()> {
        self.driver.print_text(text)
    }

    pub fn cut_paper(&mut self) -> KkmResult<()> {
        self.driver.cut_paper()
    }

    pub fn open_cash_box(&mut self) -> KkmResult<()> {
        self.driver.open_cash_box()
    }

    pub fn cancel_receipt(&mut self) -> KkmResult<()> {
        self.driver.cancel_receipt()
    }
}
