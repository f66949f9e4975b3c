pub mod config;
pub mod domain;
pub mod errors;

pub use domain::conversation::{Message, MessageRole, ThreadId};
pub use domain::order::{OrderId, OrderRecord, OrderStatus};
pub use errors::{ApplicationError, DomainError, InterfaceError};
