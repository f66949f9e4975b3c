//! Conversation loop for the returns assistant.
//!
//! A turn flows through a fixed sequence:
//! 1. **Routing** (`router`) - classify the message as policy, data, both, or general
//! 2. **Context** (`branches`) - policy passages from `retrieval`, order rows from
//!    a generated and validated (`guardrails`) read-only query
//! 3. **Return action** (`returns`) - only after an explicit customer confirmation
//! 4. **Answer** (`composer`) - one completion over the gathered context
//!
//! # Safety Principle
//!
//! The model never writes to the order store. Generated SQL is read-only and
//! checked before it runs; the single permitted write (status to `returned`)
//! goes through `ReturnExecutor`, which checks the order itself.

pub mod branches;
pub mod composer;
pub mod errors;
pub mod guardrails;
pub mod llm;
pub mod locks;
pub mod prompts;
pub mod retrieval;
pub mod returns;
pub mod router;
pub mod runtime;

pub use runtime::{AgentDependencies, AgentRuntime, AssemblyError, ChatTurn, ChatTurnRequest};
