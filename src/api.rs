//! Collaborator traits and the call surfaces of coordinator and participant nodes
//!
//! Nodes never talk to a transport directly. A host wires them together through these
//! traits: in-process by handing a [`Participant`](crate::participant::Participant) to the
//! coordinator as `Arc<dyn TransactionParticipant>`, or remotely through an RPC client that
//! implements the same trait.

use crate::error::Result;
use crate::types::{TransactionId, Value};

/// Validates end-user session tokens
pub trait SessionTokenProvider: Send + Sync {
    fn is_valid(&self, session_token: &str) -> bool;

    /// Admins and the system user may act on any transaction
    fn is_admin_or_system(&self, session_token: &str) -> bool;
}

/// The local transactional resource wrapped by a participant (a database, a file store).
///
/// All calls for one transaction run on that transaction's worker thread.
pub trait ResourceTransactionProvider: Send + Sync + 'static {
    /// Opaque local transaction object returned by `begin`
    type Handle: Clone + Send + Sync + 'static;

    fn begin(&self, transaction_id: TransactionId) -> Result<Self::Handle>;

    /// Vote phase of a two-phase transaction. The handle is `None` for transactions
    /// rebuilt from the log after a restart.
    fn prepare(&self, transaction_id: TransactionId, handle: Option<&Self::Handle>) -> Result<()>;

    /// Must accept a repeated commit of an already committed transaction
    fn commit(
        &self,
        transaction_id: TransactionId,
        handle: Option<&Self::Handle>,
        two_phase: bool,
    ) -> Result<()>;

    /// Only called when a handle exists
    fn rollback(
        &self,
        transaction_id: TransactionId,
        handle: &Self::Handle,
        two_phase: bool,
    ) -> Result<()>;
}

/// Resolves and runs a named business operation.
///
/// `transaction_id` is `None` for direct calls made outside any transaction. Errors returned
/// here are business failures; participants report them as operation errors.
pub trait OperationExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        session_token: &str,
        transaction_id: Option<TransactionId>,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value>;
}

/// Calls a coordinator makes on a participant.
///
/// Client calls are authenticated by session token and interactive session key; recovery
/// calls by interactive session key and coordinator key.
pub trait TransactionParticipant: Send + Sync {
    fn participant_id(&self) -> &str;

    /// `coordinator_key` is `None` for a one-phase (local only) transaction
    fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()>;

    fn execute_operation(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value>;

    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    /// Ids of two-phase transactions still waiting for the coordinator's decision
    fn recover_transactions(
        &self,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<Vec<TransactionId>>;

    fn commit_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;

    fn rollback_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()>;
}

/// Calls a client makes on the coordinator
pub trait TransactionCoordinator: Send + Sync {
    fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    fn execute_operation(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        participant_id: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value>;

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;

    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()>;
}
