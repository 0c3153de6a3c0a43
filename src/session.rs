//! Logical sessions and transaction state, passed explicitly by the caller.

use bson::{rawdoc, spec::BinarySubtype, Binary};
use uuid::Uuid;

use crate::{
    conn::Command,
    error::{Error, Result},
    pool::ConnectionPool,
    read_preference::ReadPreference,
};

/// A logical session: an identity plus at most one transaction at a time.
///
/// Sessions are plain values threaded through calls; they are not shared between concurrent
/// callers. While a transaction is active, commands stamped with this session carry its id and
/// transaction number, and reads through
/// [`ConnectionPool::check_out_in_session`](crate::pool::ConnectionPool::check_out_in_session)
/// are forced to the primary.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    txn_number: i64,
    transaction: TransactionState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransactionState {
    None,
    /// `start_transaction` ran but no command has been stamped yet.
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl Session {
    /// Creates a session with a fresh identity and no active transaction.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            txn_number: 0,
            transaction: TransactionState::None,
        }
    }

    /// This session's identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether a transaction is currently active.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Starts a transaction. Starting a second transaction while one is active is an error.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::invalid_argument(
                "a transaction is already in progress for this session",
            ));
        }
        self.txn_number += 1;
        self.transaction = TransactionState::Starting;
        Ok(())
    }

    /// Stamps `command` with this session's identity and, while a transaction is active, its
    /// transaction state. The first command stamped after `start_transaction` carries the
    /// server-side transaction start.
    pub fn apply_to_command(&mut self, command: &mut Command) {
        command.append("lsid", rawdoc! { "id": self.id_binary() });

        if !self.in_transaction() {
            return;
        }

        command.append("txnNumber", self.txn_number);
        command.append("autocommit", false);
        if self.transaction == TransactionState::Starting {
            command.append("startTransaction", true);
            self.transaction = TransactionState::InProgress;
        }
    }

    /// Commits the active transaction on the primary.
    ///
    /// A transaction in which no command ever ran has nothing to commit server-side and is
    /// completed locally.
    pub async fn commit_transaction(&mut self, pool: &ConnectionPool) -> Result<()> {
        match self.transaction {
            TransactionState::Starting => {
                self.transaction = TransactionState::Committed;
                return Ok(());
            }
            TransactionState::InProgress => {}
            _ => {
                return Err(Error::invalid_argument(
                    "no transaction is in progress for this session",
                ))
            }
        }

        let mut command = Command::new("commitTransaction", "admin", rawdoc! { "commitTransaction": 1 });
        command.append("lsid", rawdoc! { "id": self.id_binary() });
        command.append("txnNumber", self.txn_number);
        command.append("autocommit", false);

        self.run_on_primary(pool, command).await?;
        self.transaction = TransactionState::Committed;
        Ok(())
    }

    /// Aborts the active transaction. Server-side failures are logged and swallowed; the
    /// transaction is abandoned either way and will time out on the server if the abort never
    /// arrived.
    pub async fn abort_transaction(&mut self, pool: &ConnectionPool) -> Result<()> {
        match self.transaction {
            TransactionState::Starting => {
                self.transaction = TransactionState::Aborted;
                return Ok(());
            }
            TransactionState::InProgress => {}
            _ => {
                return Err(Error::invalid_argument(
                    "no transaction is in progress for this session",
                ))
            }
        }

        let mut command = Command::new("abortTransaction", "admin", rawdoc! { "abortTransaction": 1 });
        command.append("lsid", rawdoc! { "id": self.id_binary() });
        command.append("txnNumber", self.txn_number);
        command.append("autocommit", false);

        if let Err(err) = self.run_on_primary(pool, command).await {
            tracing::warn!(error = %err, "failed to abort transaction on the server");
        }
        self.transaction = TransactionState::Aborted;
        Ok(())
    }

    async fn run_on_primary(&self, pool: &ConnectionPool, command: Command) -> Result<()> {
        pool.retry()
            .run(|| {
                let command = command.clone();
                async move {
                    let conn = pool.check_out(ReadPreference::Primary).await?;
                    let result = conn.run_command(command).await;
                    pool.check_in(conn);
                    result.map(|_| ())
                }
            })
            .await
    }

    fn id_binary(&self) -> Binary {
        Binary {
            subtype: BinarySubtype::Uuid,
            bytes: self.id.into_bytes().to_vec(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
