pub mod conversation;
pub mod order;
