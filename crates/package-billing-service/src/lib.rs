//! 套餐计费服务
//!
//! 门店开票时决定客户的储值、赠送次数、折扣卡或无限次会员是否适用于某个发票行，
//! 扣减相应余量，并留下可审计的使用与冲正流水。
//!
//! ## 核心功能
//!
//! - **套餐查找**：按客户、服务和时间点找出可用套餐
//! - **优先级选取**：无限次 > 赠送 > 折扣 > 储值，支持前台手动指定
//! - **抵扣**：行锁保护下计算价格拆分并扣减余量，同一发票行只抵扣一次
//! - **冲正**：按原记录精确恢复余量，拒绝重复冲正
//! - **发票级计费**：逐行抵扣并汇总应收金额，作废时批量冲正
//! - **过期处理**：后台定期停用过期套餐
//!
//! ## 模块结构
//!
//! - `models`: 领域模型定义
//! - `error`: 错误类型定义
//! - `engine`: 覆盖判断、优先级与抵扣计算
//! - `repository`: 存储层（PostgreSQL / 内存）
//! - `service`: 业务服务层
//! - `worker`: 后台任务

pub mod engine;
pub mod error;
pub mod models;
pub mod repository;
pub mod service;
pub mod worker;

pub use error::{BillingError, Result};
pub use models::*;
pub use repository::{
    BillingTransaction, MemoryPackageStore, PackageStore, PgBillingTransaction, PgPackageStore,
};
pub use service::{
    BillingEngine, InvoiceBillingRequest, InvoiceBillingSummary, InvoiceLine, InvoiceVoidSummary,
    PackageBillingService, dto,
};
pub use worker::ExpireWorker;
