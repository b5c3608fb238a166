//! 套餐规则引擎
//!
//! 纯计算，不涉及存储：
//! - `coverage`: 覆盖判断与候选查找
//! - `priority`: 候选排序与选取
//! - `deduction`: 价格拆分与余量变更

pub mod coverage;
pub mod deduction;
pub mod priority;

pub use coverage::{covers_service, locate};
pub use deduction::{
    Deduction, MAX_MONEY, check_money, consume, plan_deduction, restore, round_money,
};
pub use priority::{rank, select};
