//! 领域模型定义

mod enums;
mod grant;
mod template;
mod usage;

pub use enums::*;
pub use grant::*;
pub use template::*;
pub use usage::*;
