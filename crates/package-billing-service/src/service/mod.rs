//! 业务服务层
//!
//! - `billing_service`: 发票行套餐抵扣、冲正、查询与分配
//! - `invoice_billing`: 发票级计费与作废

mod billing_service;
pub mod dto;
mod invoice_billing;

pub use billing_service::PackageBillingService;
pub use invoice_billing::{
    BilledLine, BillingEngine, InvoiceBillingRequest, InvoiceBillingSummary, InvoiceLine,
    InvoiceVoidSummary,
};
