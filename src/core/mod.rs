//! 核心层：错误类型、请求/响应关联器、重试控制

pub mod correlator;
pub mod error;
pub mod recovery;

pub use correlator::{CorrelationKey, Correlator, IdSpace, Owner, Resolution, Waiter};
pub use error::{CorrelationError, WorkflowError};
pub use recovery::{RetryController, RetryDecision};
