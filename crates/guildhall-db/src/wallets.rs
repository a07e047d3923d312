use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use guildhall_types::models::Transaction;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::Database;
use crate::codec::{get_ts, ts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied { transaction: Transaction, balance: i64 },
    InsufficientFunds { balance: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Applied {
        debit: Transaction,
        credit: Transaction,
        from_balance: i64,
        to_balance: i64,
    },
    InsufficientFunds { balance: i64 },
}

impl Database {
    pub fn credit(
        &self,
        user_id: Uuid,
        delta: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome> {
        self.with_tx(|tx| credit_in(tx, user_id, delta, reason, now))
    }

    /// Move `amount` between two wallets as a pair of ledger entries in one
    /// transaction. Wallet rows are touched in id order.
    pub fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        amount: i64,
        debit_reason: &str,
        credit_reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TransferOutcome> {
        self.with_tx(|tx| {
            let (first, second) = if from < to { (from, to) } else { (to, from) };
            ensure_wallet(tx, first)?;
            ensure_wallet(tx, second)?;

            let debit = match credit_in(tx, from, -amount, debit_reason, now)? {
                CreditOutcome::Applied {
                    transaction,
                    balance,
                } => (transaction, balance),
                CreditOutcome::InsufficientFunds { balance } => {
                    return Ok(TransferOutcome::InsufficientFunds { balance });
                }
            };
            let credit = match credit_in(tx, to, amount, credit_reason, now)? {
                CreditOutcome::Applied {
                    transaction,
                    balance,
                } => (transaction, balance),
                CreditOutcome::InsufficientFunds { .. } => {
                    return Err(anyhow!("positive credit reported insufficient funds"));
                }
            };

            Ok(TransferOutcome::Applied {
                debit: debit.0,
                credit: credit.0,
                from_balance: debit.1,
                to_balance: credit.1,
            })
        })
    }

    /// Balance of a wallet; 0 when the user has none.
    pub fn balance(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| query_balance(conn, user_id).map(|b| b.unwrap_or(0)))
    }

    /// Ledger entries for a wallet, newest first.
    pub fn transactions(&self, user_id: Uuid, limit: u32) -> Result<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, delta, reason, created_at FROM transactions
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], transaction_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn ledger_sum(&self, user_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(delta), 0) FROM transactions WHERE user_id = ?1",
                [user_id],
                |r| r.get(0),
            )?)
        })
    }

    /// Sum of all wallet balances.
    pub fn total_supply(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COALESCE(SUM(balance), 0) FROM wallets", [], |r| {
                r.get(0)
            })?)
        })
    }
}

fn ensure_wallet(conn: &Connection, user_id: Uuid) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO wallets (user_id, balance) VALUES (?1, 0)",
        [user_id],
    )?;
    Ok(())
}

fn query_balance(conn: &Connection, user_id: Uuid) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT balance FROM wallets WHERE user_id = ?1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Apply one ledger entry inside an open transaction. Creates the wallet on
/// first use.
pub(crate) fn credit_in(
    conn: &Connection,
    user_id: Uuid,
    delta: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<CreditOutcome> {
    ensure_wallet(conn, user_id)?;
    let balance = query_balance(conn, user_id)?.unwrap_or(0);
    let updated = balance
        .checked_add(delta)
        .ok_or_else(|| anyhow!("balance overflow for wallet {}", user_id))?;
    if updated < 0 {
        return Ok(CreditOutcome::InsufficientFunds { balance });
    }

    conn.execute(
        "UPDATE wallets SET balance = ?1 WHERE user_id = ?2",
        rusqlite::params![updated, user_id],
    )?;
    conn.execute(
        "INSERT INTO transactions (user_id, delta, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![user_id, delta, reason, ts(now)],
    )?;

    Ok(CreditOutcome::Applied {
        transaction: Transaction {
            id: conn.last_insert_rowid(),
            user_id,
            delta,
            reason: reason.to_string(),
            created_at: now,
        },
        balance: updated,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        delta: row.get(2)?,
        reason: row.get(3)?,
        created_at: get_ts(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, user};

    #[test]
    fn credit_creates_wallet_and_keeps_ledger_in_sync() {
        let db = db();
        let alice = user(&db, "alice");
        assert_eq!(db.balance(alice.id).unwrap(), 0);

        db.credit(alice.id, 10, "gift", Utc::now()).unwrap();
        db.credit(alice.id, -4, "spent", Utc::now()).unwrap();
        assert_eq!(db.balance(alice.id).unwrap(), 6);
        assert_eq!(db.ledger_sum(alice.id).unwrap(), 6);

        let history = db.transactions(alice.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, "spent");
    }

    #[test]
    fn overdraft_leaves_no_trace() {
        let db = db();
        let alice = user(&db, "alice");
        db.credit(alice.id, 5, "gift", Utc::now()).unwrap();
        let out = db.credit(alice.id, -6, "too much", Utc::now()).unwrap();
        assert_eq!(out, CreditOutcome::InsufficientFunds { balance: 5 });
        assert_eq!(db.transactions(alice.id, 10).unwrap().len(), 1);
    }

    #[test]
    fn transfer_failure_touches_neither_side() {
        let db = db();
        let a = user(&db, "a");
        let b = user(&db, "b");
        db.credit(a.id, 3, "seed", Utc::now()).unwrap();

        let out = db.transfer(a.id, b.id, 4, "out", "in", Utc::now()).unwrap();
        assert_eq!(out, TransferOutcome::InsufficientFunds { balance: 3 });
        assert_eq!(db.balance(a.id).unwrap(), 3);
        assert_eq!(db.balance(b.id).unwrap(), 0);
        assert!(db.transactions(b.id, 10).unwrap().is_empty());

        match db.transfer(a.id, b.id, 3, "out", "in", Utc::now()).unwrap() {
            TransferOutcome::Applied {
                from_balance,
                to_balance,
                ..
            } => assert_eq!((from_balance, to_balance), (0, 3)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(db.total_supply().unwrap(), 3);
    }

    #[test]
    fn ledger_rows_are_immutable() {
        let db = db();
        let a = user(&db, "a");
        db.credit(a.id, 1, "seed", Utc::now()).unwrap();
        let err = db.with_conn_mut(|conn| {
            conn.execute("DELETE FROM transactions", [])?;
            Ok(())
        });
        assert!(err.is_err());
    }
}
