//! twophase - two-phase commit across independent transactional participants
//!
//! A client opens a distributed transaction at the coordinator, runs named operations at
//! any number of participants, then commits or rolls back. Every node persists each status
//! step to its own transaction log first, so a node that restarts mid-protocol can finish
//! what it started.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Client (TransactionSession, invokers)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                           │
//! │      (touched participants, prepare / commit fan-out)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    ┌─────────┴─────────┐
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │      Participant A       │ │         Participant B          │
//! │ (worker thread, resource)│ │  (worker thread, resource)     │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                    │                   │
//!                    └─────────┬─────────┘
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Transaction logs (one JSON file per id)          │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Background processing is left to the host: call `recover()` once at start-up and
//! `sweep()` periodically on every node.

pub mod api;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod node;
pub mod participant;
pub mod transaction_log;
pub mod types;

pub use api::{
    OperationExecutor, ResourceTransactionProvider, SessionTokenProvider, TransactionCoordinator,
    TransactionParticipant,
};
pub use client::{DirectInvoker, ServiceInvoker, TransactionSession, TransactionalInvoker};
pub use config::TransactionConfig;
pub use coordinator::Coordinator;
pub use error::{Result, TransactionError};
pub use memory::MemoryStore;
pub use participant::Participant;
pub use transaction_log::{FileTransactionLog, TransactionLogEntry, TransactionLogStore};
pub use types::{TransactionId, TransactionStatus, Value};
