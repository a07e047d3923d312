use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    MmChoice, MmEvent, MmResponse, Mood, Poll, PollChoice, PollComment, PollState, Reminder, Tally,
    Transaction, Treasure,
};

// -- JWT Claims --

/// Bearer token claims, shared by the REST middleware and the WebSocket
/// gateway. Users are provisioned externally; the token is the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: usize,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub error: String,
}

// -- Wallet --

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: i64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransferRequest {
    pub to: Uuid,
    pub amount: i64,
    /// Free-form note appended to both ledger reasons.
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GrantRequest {
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub debit: Transaction,
    pub balance: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub balance: i64,
    pub transactions: Vec<Transaction>,
}

// -- Treasures --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MintTreasureRequest {
    pub code: Option<String>,
    pub value: i64,
    #[serde(default)]
    pub creator_paid: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedeemResponse {
    pub code: String,
    pub value: i64,
    pub balance: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TreasureListResponse {
    pub treasures: Vec<Treasure>,
}

// -- Polls --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePollRequest {
    pub question: String,
    pub description: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VoteRequest {
    pub choice: PollChoice,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CommentRequest {
    pub mood: Mood,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// False when the vote repeated the stored choice.
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClosePollResponse {
    pub poll: Poll,
    pub tally: Tally,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub poll: Poll,
    pub state: PollState,
    pub tally: Tally,
    pub comments: Vec<PollComment>,
}

// -- Matchmaking --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub when: Option<DateTime<Utc>>,
    pub interface: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RespondRequest {
    pub choice: MmChoice,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RsvpResponse {
    pub changed: bool,
    pub awarded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub event: MmEvent,
    pub responses: Vec<MmResponse>,
}

// -- Reminders --

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleReminderRequest {
    pub interface: String,
    pub target: String,
    pub fire_at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduledReminderResponse {
    pub reminder: Reminder,
    pub failed: Vec<Reminder>,
}

/// Reminder listings also carry (and acknowledge) reminders whose delivery
/// gave up since the caller last looked.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemindersResponse {
    pub reminders: Vec<Reminder>,
    pub failed: Vec<Reminder>,
}
