use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use guildhall_types::models::{Transaction, Treasure};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::Database;
use crate::codec::{get_opt_ts, get_ts, ts};
use crate::wallets::{CreditOutcome, credit_in};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MintOutcome {
    Minted {
        treasure: Treasure,
        /// Creator's debit when the treasure was funded from their wallet.
        funding: Option<Transaction>,
    },
    DuplicateCode,
    InsufficientFunds { balance: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed {
        treasure: Treasure,
        transaction: Transaction,
        balance: i64,
    },
    NotFound,
    AlreadyRedeemed(Treasure),
}

const TREASURE_COLUMNS: &str =
    "code, value, creator_id, creator_paid, redeemed_by, created_at, redeemed_at";

/// Ledger reason for the credit a redemption produces.
pub fn redeem_reason(code: &str) -> String {
    format!("treasure:{}", code)
}

pub fn funding_reason(code: &str) -> String {
    format!("funded treasure:{}", code)
}

impl Database {
    pub fn mint_treasure(
        &self,
        code: &str,
        value: i64,
        creator_id: Uuid,
        creator_paid: bool,
        now: DateTime<Utc>,
    ) -> Result<MintOutcome> {
        self.with_tx(|tx| {
            if query_treasure(tx, code)?.is_some() {
                return Ok(MintOutcome::DuplicateCode);
            }

            let funding = if creator_paid {
                match credit_in(tx, creator_id, -value, &funding_reason(code), now)? {
                    CreditOutcome::Applied { transaction, .. } => Some(transaction),
                    CreditOutcome::InsufficientFunds { balance } => {
                        return Ok(MintOutcome::InsufficientFunds { balance });
                    }
                }
            } else {
                None
            };

            tx.execute(
                "INSERT INTO treasures (code, value, creator_id, creator_paid, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![code, value, creator_id, creator_paid, ts(now)],
            )?;

            Ok(MintOutcome::Minted {
                treasure: Treasure {
                    code: code.to_string(),
                    value,
                    creator_id,
                    creator_paid,
                    redeemed_by: None,
                    created_at: now,
                    redeemed_at: None,
                },
                funding,
            })
        })
    }

    /// Claim a treasure. The conditional update on `redeemed_by IS NULL`
    /// picks a single winner; the credit commits with it or not at all.
    pub fn redeem_treasure(
        &self,
        code: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome> {
        self.with_tx(|tx| {
            let Some(mut treasure) = query_treasure(tx, code)? else {
                return Ok(RedeemOutcome::NotFound);
            };
            if treasure.is_redeemed() {
                return Ok(RedeemOutcome::AlreadyRedeemed(treasure));
            }

            let changed = tx.execute(
                "UPDATE treasures SET redeemed_by = ?1, redeemed_at = ?2
                 WHERE code = ?3 AND redeemed_by IS NULL",
                rusqlite::params![user_id, ts(now), code],
            )?;
            if changed != 1 {
                let current = query_treasure(tx, code)?
                    .ok_or_else(|| anyhow!("treasure {} vanished during redeem", code))?;
                return Ok(RedeemOutcome::AlreadyRedeemed(current));
            }

            match credit_in(tx, user_id, treasure.value, &redeem_reason(code), now)? {
                CreditOutcome::Applied {
                    transaction,
                    balance,
                } => {
                    treasure.redeemed_by = Some(user_id);
                    treasure.redeemed_at = Some(now);
                    Ok(RedeemOutcome::Redeemed {
                        treasure,
                        transaction,
                        balance,
                    })
                }
                CreditOutcome::InsufficientFunds { .. } => {
                    Err(anyhow!("positive credit reported insufficient funds"))
                }
            }
        })
    }

    pub fn get_treasure(&self, code: &str) -> Result<Option<Treasure>> {
        self.with_conn(|conn| query_treasure(conn, code))
    }

    pub fn list_treasures_by_creator(&self, creator_id: Uuid) -> Result<Vec<Treasure>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM treasures WHERE creator_id = ?1 ORDER BY created_at DESC",
                TREASURE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([creator_id], treasure_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_treasure(conn: &Connection, code: &str) -> Result<Option<Treasure>> {
    let sql = format!("SELECT {} FROM treasures WHERE code = ?1", TREASURE_COLUMNS);
    Ok(conn.query_row(&sql, [code], treasure_from_row).optional()?)
}

fn treasure_from_row(row: &Row<'_>) -> rusqlite::Result<Treasure> {
    Ok(Treasure {
        code: row.get(0)?,
        value: row.get(1)?,
        creator_id: row.get(2)?,
        creator_paid: row.get(3)?,
        redeemed_by: row.get(4)?,
        created_at: get_ts(row, 5)?,
        redeemed_at: get_opt_ts(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{db, user};

    #[test]
    fn second_redeem_gets_no_credit() {
        let db = db();
        let admin = user(&db, "admin");
        let alice = user(&db, "alice");
        db.mint_treasure("GOLD01", 10, admin.id, false, Utc::now())
            .unwrap();

        match db.redeem_treasure("GOLD01", alice.id, Utc::now()).unwrap() {
            RedeemOutcome::Redeemed { balance, .. } => assert_eq!(balance, 10),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            db.redeem_treasure("GOLD01", alice.id, Utc::now()).unwrap(),
            RedeemOutcome::AlreadyRedeemed(t) if t.redeemed_by == Some(alice.id)
        ));
        assert_eq!(db.transactions(alice.id, 10).unwrap().len(), 1);
        assert_eq!(
            db.redeem_treasure("NOPE", alice.id, Utc::now()).unwrap(),
            RedeemOutcome::NotFound
        );
    }

    #[test]
    fn funded_mint_debits_creator_atomically() {
        let db = db();
        let bob = user(&db, "bob");
        assert_eq!(
            db.mint_treasure("X1", 5, bob.id, true, Utc::now()).unwrap(),
            MintOutcome::InsufficientFunds { balance: 0 }
        );
        assert!(db.get_treasure("X1").unwrap().is_none());

        db.credit(bob.id, 5, "seed", Utc::now()).unwrap();
        assert!(matches!(
            db.mint_treasure("X1", 5, bob.id, true, Utc::now()).unwrap(),
            MintOutcome::Minted { funding: Some(_), .. }
        ));
        assert_eq!(db.balance(bob.id).unwrap(), 0);
        assert_eq!(
            db.mint_treasure("X1", 1, bob.id, false, Utc::now()).unwrap(),
            MintOutcome::DuplicateCode
        );
        assert_eq!(db.list_treasures_by_creator(bob.id).unwrap().len(), 1);
    }
}
