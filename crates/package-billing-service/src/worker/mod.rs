//! 后台任务

mod expire_worker;

pub use expire_worker::ExpireWorker;
