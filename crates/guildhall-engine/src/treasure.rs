use std::sync::Arc;

use guildhall_db::{Database, MintOutcome, RedeemOutcome};
use guildhall_types::models::{ROLE_BANKER, Transaction, Treasure, User};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::wallet::WalletEngine;
use crate::{Error, Result, blocking};

/// Generated codes avoid look-alike characters (0/O, 1/I).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GENERATED_CODE_LEN: usize = 8;
const MAX_CODE_LEN: usize = 32;
const GENERATE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub treasure: Treasure,
    pub transaction: Transaction,
    pub balance: i64,
}

pub struct TreasureEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    wallet: Arc<WalletEngine>,
}

impl TreasureEngine {
    pub(crate) fn new(db: Arc<Database>, clock: Arc<dyn Clock>, wallet: Arc<WalletEngine>) -> Self {
        Self { db, clock, wallet }
    }

    /// Create a redeemable code. Unfunded treasures mint tokens from nothing
    /// and need the banker role; funded ones debit the creator in the same
    /// transaction.
    pub async fn mint(
        &self,
        creator: &User,
        code: Option<&str>,
        value: i64,
        creator_paid: bool,
    ) -> Result<Treasure> {
        if value <= 0 {
            return Err(Error::invalid("treasure value must be positive"));
        }
        if !creator_paid && !creator.has_role(ROLE_BANKER) {
            return Err(Error::Unauthorised(format!(
                "minting unfunded treasures requires the '{}' role",
                ROLE_BANKER
            )));
        }

        let (mut code, generated) = match code {
            Some(c) => (normalize_code(c)?, false),
            None => (generate_code(), true),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let now = self.clock.now();
            let creator_id = creator.id;
            let attempt_code = code.clone();
            let outcome = blocking(&self.db, move |db| {
                db.mint_treasure(&attempt_code, value, creator_id, creator_paid, now)
            })
            .await?;

            match outcome {
                MintOutcome::Minted { treasure, funding } => {
                    info!(code = %treasure.code, value, creator_paid, "Treasure minted");
                    if let Some(tx) = funding {
                        let balance = self.wallet.balance(creator_id).await?;
                        self.wallet.announce(&tx, balance);
                    }
                    return Ok(treasure);
                }
                MintOutcome::DuplicateCode if generated && attempts < GENERATE_ATTEMPTS => {
                    warn!(%code, "Generated treasure code collided, retrying");
                    code = generate_code();
                }
                MintOutcome::DuplicateCode => return Err(Error::DuplicateCode(code)),
                MintOutcome::InsufficientFunds { balance } => {
                    return Err(Error::InsufficientFunds {
                        balance,
                        needed: value,
                    });
                }
            }
        }
    }

    /// Claim a treasure. Exactly one caller wins; everyone after that sees
    /// `AlreadyRedeemed` and no ledger entry is written for them.
    pub async fn redeem(&self, user: &User, code: &str) -> Result<Redemption> {
        let code = normalize_code(code)?;
        let now = self.clock.now();
        let user_id = user.id;
        let lookup = code.clone();
        let outcome =
            blocking(&self.db, move |db| db.redeem_treasure(&lookup, user_id, now)).await?;

        match outcome {
            RedeemOutcome::Redeemed {
                treasure,
                transaction,
                balance,
            } => {
                info!(%code, %user_id, value = treasure.value, "Treasure redeemed");
                self.wallet.announce(&transaction, balance);
                Ok(Redemption {
                    treasure,
                    transaction,
                    balance,
                })
            }
            RedeemOutcome::NotFound => Err(Error::NotFound(format!("treasure {}", code))),
            RedeemOutcome::AlreadyRedeemed(_) => Err(Error::AlreadyRedeemed(code)),
        }
    }

    pub async fn get(&self, code: &str) -> Result<Treasure> {
        let code = normalize_code(code)?;
        let lookup = code.clone();
        blocking(&self.db, move |db| db.get_treasure(&lookup))
            .await?
            .ok_or_else(|| Error::NotFound(format!("treasure {}", code)))
    }

    pub async fn list_by_creator(&self, creator_id: Uuid) -> Result<Vec<Treasure>> {
        blocking(&self.db, move |db| db.list_treasures_by_creator(creator_id)).await
    }
}

/// Codes are case-insensitive and stored upper-case.
fn normalize_code(raw: &str) -> Result<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(Error::invalid(format!(
            "treasure code must be 1 to {} characters",
            MAX_CODE_LEN
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::invalid("malformed treasure code"));
    }
    Ok(code)
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..GENERATED_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::clock::SystemClock;
    use crate::notify::Notifier;
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use crate::test_support::{db, user};
    use tokio_util::sync::CancellationToken;

    fn engines(db: Arc<Database>) -> (Arc<WalletEngine>, TreasureEngine) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifier = Notifier::new(
            db.clone(),
            Arc::new(MemorySink::new()),
            RetryPolicy::interactive(),
            CancellationToken::new(),
        );
        let wallet = Arc::new(WalletEngine::new(db.clone(), clock.clone(), notifier));
        (wallet.clone(), TreasureEngine::new(db, clock, wallet))
    }

    #[tokio::test]
    async fn mint_and_redeem_once() {
        let db = db();
        let (wallet, treasures) = engines(db.clone());
        let admin = user(&db, "admin", &[ROLE_BANKER]);
        let alice = user(&db, "alice", &[]);

        treasures
            .mint(&admin, Some("GOLD01"), 10, false)
            .await
            .unwrap();
        let won = treasures.redeem(&alice, "gold01").await.unwrap();
        assert_eq!(won.balance, 10);
        assert_eq!(wallet.balance(alice.id).await.unwrap(), 10);

        let (_, history) = wallet.history(alice.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].delta, 10);
        assert!(history[0].reason.contains("GOLD01"));

        let err = treasures.redeem(&alice, "GOLD01").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRedeemed);
        assert_eq!(wallet.history(alice.id, 10).await.unwrap().1.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_redeemers_have_one_winner() {
        let db = db();
        let (wallet, treasures) = engines(db.clone());
        let treasures = Arc::new(treasures);
        let admin = user(&db, "admin", &[ROLE_BANKER]);
        treasures.mint(&admin, Some("RACE"), 5, false).await.unwrap();

        let mut handles = Vec::new();
        let mut users = Vec::new();
        for i in 0..8 {
            let u = user(&db, &format!("u{}", i), &[]);
            users.push(u.id);
            let treasures = treasures.clone();
            handles.push(tokio::spawn(async move { treasures.redeem(&u, "RACE").await }));
        }

        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadyRedeemed),
            }
        }
        assert_eq!(winners, 1);

        let mut total = 0;
        for id in users {
            total += wallet.balance(id).await.unwrap();
        }
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn mint_rules() {
        let db = db();
        let (wallet, treasures) = engines(db.clone());
        let bob = user(&db, "bob", &[]);

        let err = treasures.mint(&bob, Some("FREE"), 5, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorised);
        let err = treasures.mint(&bob, Some("PAID"), 5, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        let err = treasures.mint(&bob, Some("bad code!"), 1, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = treasures.mint(&bob, None, 0, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        wallet.credit(bob.id, 5, "seed").await.unwrap();
        let t = treasures.mint(&bob, None, 5, true).await.unwrap();
        assert_eq!(t.code.len(), GENERATED_CODE_LEN);
        assert_eq!(wallet.balance(bob.id).await.unwrap(), 0);

        wallet.credit(bob.id, 1, "seed").await.unwrap();
        let err = treasures
            .mint(&bob, Some(&t.code.to_lowercase()), 1, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateCode);
        assert_eq!(wallet.balance(bob.id).await.unwrap(), 1);
        assert_eq!(treasures.list_by_creator(bob.id).await.unwrap().len(), 1);
    }
}
