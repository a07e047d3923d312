use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;

/// Role allowed to mint tokens out of thin air.
pub const ROLE_BANKER: &str = "banker";
/// Role allowed to act on other users' polls, lobbies and reminders.
pub const ROLE_ADMIN: &str = "admin";

/// Unknown textual value for one of the enumerations below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

fn unknown(kind: &'static str, value: &str) -> UnknownVariant {
    UnknownVariant {
        kind,
        value: value.to_string(),
    }
}

// -- Users --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub handle: String,
    pub roles: BTreeSet<String>,
    /// Route used for personal notifications (wallet changes, poll results).
    pub contact: Option<Address>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    pub fn mention(&self) -> String {
        format!("@{}", self.handle)
    }
}

// -- Wallets --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub balance: i64,
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// -- Treasures --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treasure {
    pub code: String,
    pub value: i64,
    pub creator_id: Uuid,
    pub creator_paid: bool,
    pub redeemed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl Treasure {
    pub fn is_redeemed(&self) -> bool {
        self.redeemed_by.is_some()
    }
}

// -- Polls --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollChoice {
    Yes,
    Maybe,
    No,
}

impl PollChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::Maybe => "maybe",
            Self::No => "no",
        }
    }
}

impl FromStr for PollChoice {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(Self::Yes),
            "maybe" => Ok(Self::Maybe),
            "no" => Ok(Self::No),
            other => Err(unknown("poll choice", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Positive,
    Neutral,
    Negative,
}

impl Mood {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

impl FromStr for Mood {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            other => Err(unknown("mood", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub question: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Set once the closing snapshot has been taken.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Poll {
    /// OPEN while `now` is before the expiry (or there is none) and no
    /// explicit close happened.
    pub fn state_at(&self, now: DateTime<Utc>) -> PollState {
        if self.closed_at.is_some() || self.expires_at.is_some_and(|exp| now >= exp) {
            PollState::Closed
        } else {
            PollState::Open
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollVote {
    pub poll_id: Uuid,
    pub voter_id: Uuid,
    pub choice: PollChoice,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollComment {
    pub id: i64,
    pub poll_id: Uuid,
    pub author_id: Uuid,
    pub mood: Mood,
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub yes: u32,
    pub maybe: u32,
    pub no: u32,
}

impl Tally {
    pub fn record(&mut self, choice: PollChoice) {
        match choice {
            PollChoice::Yes => self.yes += 1,
            PollChoice::Maybe => self.maybe += 1,
            PollChoice::No => self.no += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.yes + self.maybe + self.no
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "yes {} / maybe {} / no {}", self.yes, self.maybe, self.no)
    }
}

// -- Matchmaking --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmChoice {
    Yes,
    LateShort,
    LateMedium,
    LateLong,
    Maybe,
    No,
}

impl MmChoice {
    pub const ALL: [MmChoice; 6] = [
        Self::Yes,
        Self::LateShort,
        Self::LateMedium,
        Self::LateLong,
        Self::Maybe,
        Self::No,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::LateShort => "late_short",
            Self::LateMedium => "late_medium",
            Self::LateLong => "late_long",
            Self::Maybe => "maybe",
            Self::No => "no",
        }
    }

    /// Display order on the lobby prompt.
    pub fn rank(self) -> u8 {
        match self {
            Self::Yes => 0,
            Self::LateShort => 1,
            Self::LateMedium => 2,
            Self::LateLong => 3,
            Self::Maybe => 4,
            Self::No => 5,
        }
    }

    /// Expected delay after the scheduled start.
    pub fn late_by(self) -> Option<Duration> {
        match self {
            Self::LateShort => Some(Duration::minutes(10)),
            Self::LateMedium => Some(Duration::minutes(30)),
            Self::LateLong => Some(Duration::minutes(60)),
            _ => None,
        }
    }

    pub fn is_late(self) -> bool {
        self.late_by().is_some()
    }

    /// Pinged by the "starting now" notice.
    pub fn is_attending(self) -> bool {
        self == Self::Yes || self.is_late()
    }

    /// Pinged by the pre-start reminders.
    pub fn is_undecided(self) -> bool {
        self == Self::Maybe || self.is_late()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Yes => "[yes]",
            Self::LateShort => "[+10]",
            Self::LateMedium => "[+30]",
            Self::LateLong => "[+60]",
            Self::Maybe => "[maybe]",
            Self::No => "[no]",
        }
    }
}

impl FromStr for MmChoice {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| unknown("matchmaking choice", s))
    }
}

/// Lifecycle of a lobby. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmPhase {
    Created,
    OpenUnbounded,
    Announced,
    Reminding,
    Starting,
    Closed,
    Cancelled,
}

impl MmPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::OpenUnbounded => "open_unbounded",
            Self::Announced => "announced",
            Self::Reminding => "reminding",
            Self::Starting => "starting",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

impl FromStr for MmPhase {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "open_unbounded" => Ok(Self::OpenUnbounded),
            "announced" => Ok(Self::Announced),
            "reminding" => Ok(Self::Reminding),
            "starting" => Ok(Self::Starting),
            "closed" => Ok(Self::Closed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(unknown("matchmaking phase", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmEvent {
    pub id: i64,
    pub creator_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Scheduled start; `None` means open-ended.
    pub when: Option<DateTime<Utc>>,
    pub interface: String,
    pub interrupted: bool,
    pub phase: MmPhase,
    /// Interface-specific state (message handles), opaque to the store.
    #[serde(skip)]
    pub interface_data: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmResponse {
    pub event_id: i64,
    pub user_id: Uuid,
    pub choice: MmChoice,
    pub updated_at: DateTime<Utc>,
}

// -- Reminders --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub creator_id: Uuid,
    pub address: Address,
    pub fire_at: DateTime<Utc>,
    pub text: String,
    pub attempts: u32,
    pub failed: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_strings_round_trip() {
        for choice in MmChoice::ALL {
            assert_eq!(choice.as_str().parse::<MmChoice>().unwrap(), choice);
        }
        assert!("later".parse::<MmChoice>().is_err());
        assert_eq!("maybe".parse::<PollChoice>().unwrap(), PollChoice::Maybe);
    }

    #[test]
    fn poll_closes_exactly_at_expiry() {
        let now = Utc::now();
        let poll = Poll {
            id: Uuid::new_v4(),
            creator_id: Uuid::new_v4(),
            question: "q".into(),
            description: None,
            created_at: now,
            expires_at: Some(now + Duration::hours(1)),
            closed_at: None,
        };
        let expiry = now + Duration::hours(1);
        assert_eq!(poll.state_at(expiry - Duration::nanoseconds(1)), PollState::Open);
        assert_eq!(poll.state_at(expiry), PollState::Closed);
    }

    #[test]
    fn attending_and_undecided_sets() {
        assert!(MmChoice::LateMedium.is_attending());
        assert!(MmChoice::LateMedium.is_undecided());
        assert!(!MmChoice::Maybe.is_attending());
        assert!(!MmChoice::No.is_undecided());
    }
}
