mod batch_router;
mod catalog;
mod service;
mod storage;
mod warehouse;

pub use batch_router::*;
pub use catalog::*;
pub use service::*;
pub use storage::*;
pub use warehouse::*;
