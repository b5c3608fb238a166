//! 数据访问层

mod memory_store;
mod pg_store;
mod traits;

pub use memory_store::{MemoryPackageStore, MemoryTransaction};
pub use pg_store::{PgBillingTransaction, PgPackageStore};
pub use traits::{BillingTransaction, PackageStore};

#[cfg(test)]
pub use traits::MockPackageStore;
