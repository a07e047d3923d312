use std::sync::Arc;

use guildhall_db::{CreditOutcome, Database, TransferOutcome};
use guildhall_types::models::{ROLE_BANKER, Transaction, User};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::notify::Notifier;
use crate::{Error, Result, blocking, required_text};

const MAX_REASON_LEN: usize = 200;
const MAX_NOTE_LEN: usize = 120;
const MAX_HISTORY: u32 = 100;

/// Outcome of a transfer: both ledger entries and the resulting balances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub debit: Transaction,
    pub credit: Transaction,
    pub from_balance: i64,
    pub to_balance: i64,
}

pub struct WalletEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
}

impl WalletEngine {
    pub(crate) fn new(db: Arc<Database>, clock: Arc<dyn Clock>, notifier: Notifier) -> Self {
        Self {
            db,
            clock,
            notifier,
        }
    }

    /// Apply a signed change to a user's wallet.
    pub async fn credit(&self, user_id: Uuid, delta: i64, reason: &str) -> Result<Transaction> {
        if delta == 0 {
            return Err(Error::invalid("delta must not be zero"));
        }
        let reason = required_text("reason", reason, MAX_REASON_LEN)?;
        let now = self.clock.now();

        let outcome = {
            let reason = reason.clone();
            blocking(&self.db, move |db| db.credit(user_id, delta, &reason, now)).await?
        };
        match outcome {
            CreditOutcome::Applied {
                transaction,
                balance,
            } => {
                info!(%user_id, delta, "Wallet credited: {}", reason);
                self.announce(&transaction, balance);
                Ok(transaction)
            }
            CreditOutcome::InsufficientFunds { balance } => Err(Error::InsufficientFunds {
                balance,
                needed: -delta,
            }),
        }
    }

    /// Privileged credit issued by a banker.
    pub async fn grant(
        &self,
        actor: &User,
        user_id: Uuid,
        delta: i64,
        reason: &str,
    ) -> Result<Transaction> {
        if !actor.has_role(ROLE_BANKER) {
            return Err(Error::Unauthorised(format!(
                "granting tokens requires the '{}' role",
                ROLE_BANKER
            )));
        }
        self.ensure_user(user_id).await?;
        self.credit(user_id, delta, reason).await
    }

    /// Move tokens between two users. Both ledger entries commit together.
    pub async fn transfer(
        &self,
        from: &User,
        to_id: Uuid,
        amount: i64,
        note: Option<&str>,
    ) -> Result<Transfer> {
        if amount <= 0 {
            return Err(Error::invalid("amount must be positive"));
        }
        if from.id == to_id {
            return Err(Error::invalid("cannot transfer to yourself"));
        }
        let to = self.ensure_user(to_id).await?;

        let suffix = match note.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => format!(": {}", required_text("note", n, MAX_NOTE_LEN)?),
            None => String::new(),
        };
        let debit_reason = format!("ceded to {}{}", to.mention(), suffix);
        let credit_reason = format!("received from {}{}", from.mention(), suffix);

        let now = self.clock.now();
        let from_id = from.id;
        let outcome = blocking(&self.db, move |db| {
            db.transfer(from_id, to_id, amount, &debit_reason, &credit_reason, now)
        })
        .await?;

        match outcome {
            TransferOutcome::Applied {
                debit,
                credit,
                from_balance,
                to_balance,
            } => {
                info!(from = %from_id, to = %to_id, amount, "Transfer committed");
                self.announce(&debit, from_balance);
                self.announce(&credit, to_balance);
                Ok(Transfer {
                    debit,
                    credit,
                    from_balance,
                    to_balance,
                })
            }
            TransferOutcome::InsufficientFunds { balance } => Err(Error::InsufficientFunds {
                balance,
                needed: amount,
            }),
        }
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64> {
        blocking(&self.db, move |db| db.balance(user_id)).await
    }

    /// Balance plus the most recent ledger entries, newest first.
    pub async fn history(&self, user_id: Uuid, limit: u32) -> Result<(i64, Vec<Transaction>)> {
        let limit = limit.clamp(1, MAX_HISTORY);
        blocking(&self.db, move |db| {
            Ok((db.balance(user_id)?, db.transactions(user_id, limit)?))
        })
        .await
    }

    async fn ensure_user(&self, user_id: Uuid) -> Result<User> {
        blocking(&self.db, move |db| db.get_user(user_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))
    }

    /// Tell the wallet owner about a committed ledger entry.
    pub(crate) fn announce(&self, transaction: &Transaction, balance: i64) {
        debug!(user_id = %transaction.user_id, tx = transaction.id, "Announcing wallet change");
        let text = format!(
            "{:+} tokens ({}). Balance: {}",
            transaction.delta, transaction.reason, balance
        );
        self.notifier.notify_user(transaction.user_id, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use crate::test_support::{db, user};
    use crate::ErrorKind;
    use tokio_util::sync::CancellationToken;

    fn engine(db: Arc<Database>, sink: MemorySink) -> WalletEngine {
        let notifier = Notifier::new(
            db.clone(),
            Arc::new(sink),
            RetryPolicy::interactive(),
            CancellationToken::new(),
        );
        WalletEngine::new(db, Arc::new(SystemClock), notifier)
    }

    #[tokio::test]
    async fn transfer_moves_tokens_and_notifies_both_parties() {
        let db = db();
        let sink = MemorySink::new();
        let wallet = engine(db.clone(), sink.clone());
        let alice = user(&db, "alice", &[]);
        let bob = user(&db, "bob", &[]);
        wallet.credit(alice.id, 10, "seed").await.unwrap();

        let t = wallet.transfer(&alice, bob.id, 3, None).await.unwrap();
        assert_eq!((t.from_balance, t.to_balance), (7, 3));
        assert_eq!(t.debit.delta, -3);
        assert_eq!(t.debit.reason, "ceded to @bob");
        assert_eq!(t.credit.reason, "received from @alice");
        assert_eq!(db.total_supply().unwrap(), 10);
        assert_eq!(db.ledger_sum(alice.id).unwrap(), 7);

        wallet.notifier.settled().await;
        let to_bob = sink.sent_to(&format!("user:{}", bob.id)).await;
        assert_eq!(to_bob.len(), 1);
        assert!(to_bob[0].contains("+3"));
        let to_alice = sink.sent_to(&format!("user:{}", alice.id)).await;
        assert_eq!(to_alice.len(), 2);
        assert!(to_alice.contains(&"-3 tokens (ceded to @bob). Balance: 7".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn credit_does_not_wait_for_an_unreachable_owner() {
        let db = db();
        let sink = MemorySink::new();
        let notifier = Notifier::new(
            db.clone(),
            Arc::new(sink.clone()),
            RetryPolicy::default(),
            CancellationToken::new(),
        );
        let wallet = WalletEngine::new(db.clone(), Arc::new(SystemClock), notifier);
        let alice = user(&db, "alice", &[]);
        sink.break_target(
            &format!("user:{}", alice.id),
            crate::sink::SinkError::Transient("offline".into()),
        )
        .await;

        let started = tokio::time::Instant::now();
        wallet.credit(alice.id, 5, "seed").await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(wallet.balance(alice.id).await.unwrap(), 5);

        // the retries still run in the background: 1 + 2 + 4 + 8 seconds
        wallet.notifier.settled().await;
        assert!(started.elapsed() >= std::time::Duration::from_secs(15));
        assert!(sink.sent_to(&format!("user:{}", alice.id)).await.is_empty());
    }

    #[tokio::test]
    async fn transfer_boundaries() {
        let db = db();
        let wallet = engine(db.clone(), MemorySink::new());
        let a = user(&db, "a", &[]);
        let b = user(&db, "b", &[]);
        wallet.credit(a.id, 5, "seed").await.unwrap();

        let err = wallet.transfer(&a, b.id, 6, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert_eq!(wallet.balance(b.id).await.unwrap(), 0);

        wallet.transfer(&a, b.id, 5, Some("rent")).await.unwrap();
        assert_eq!(wallet.balance(a.id).await.unwrap(), 0);

        for (amount, to) in [(0, b.id), (-1, b.id), (1, a.id)] {
            let err = wallet.transfer(&a, to, amount, None).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        let err = wallet
            .transfer(&a, Uuid::new_v4(), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn credit_validates_and_survives_sink_failure() {
        let db = db();
        let sink = MemorySink::new();
        let wallet = engine(db.clone(), sink.clone());
        let a = user(&db, "a", &[]);

        assert!(wallet.credit(a.id, 0, "nothing").await.is_err());
        assert!(wallet.credit(a.id, 1, "   ").await.is_err());

        sink.break_target(
            &format!("user:{}", a.id),
            crate::sink::SinkError::Permanent("blocked".into()),
        )
        .await;
        wallet.credit(a.id, 4, "gift").await.unwrap();
        assert_eq!(wallet.balance(a.id).await.unwrap(), 4);

        let (balance, history) = wallet.history(a.id, 0).await.unwrap();
        assert_eq!(balance, 4);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn grant_requires_banker() {
        let db = db();
        let wallet = engine(db.clone(), MemorySink::new());
        let pleb = user(&db, "pleb", &[]);
        let banker = user(&db, "banker", &[ROLE_BANKER]);

        let err = wallet.grant(&pleb, pleb.id, 5, "free money").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorised);
        wallet.grant(&banker, pleb.id, 5, "prize").await.unwrap();
        assert_eq!(wallet.balance(pleb.id).await.unwrap(), 5);
    }
}
