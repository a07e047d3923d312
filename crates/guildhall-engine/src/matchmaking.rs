//! Matchmaking lobbies.
//!
//! Every live lobby is driven by exactly one task. On each wake-up the task
//! reloads the event, derives where it should be from the clock, performs
//! the side effects it has not yet recorded (reminder nudges, the start
//! notice, prompt edits) and persists its progress in the event's
//! `interface_data`. A restarted task therefore picks up where the previous
//! one stopped and re-edits the prompt it already posted.

mod render;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use guildhall_db::{Database, NewEvent, RespondOutcome};
use guildhall_types::api::EventResponse;
use guildhall_types::models::{MmChoice, MmEvent, MmPhase, MmResponse, User};
use guildhall_types::{Address, MessageHandle};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::retry::RetryPolicy;
use crate::sink::{MessageSink, SinkError};
use crate::tasks::{TaskCtx, TaskRegistry};
use crate::wallet::WalletEngine;
use crate::{Error, Result, blocking, required_text};

use render::Roster;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct MatchmakingPolicy {
    /// Interface used when a lobby does not name one.
    pub default_interface: String,
    /// Target the lobby prompt is posted to.
    pub lobby_target: String,
    /// Target for start and cancellation notices.
    pub announce_target: String,
    /// How long after the start RSVPs are still accepted.
    pub grace: Duration,
    /// Reminder offsets before the start.
    pub reminder_offsets: Vec<Duration>,
    pub max_ahead: Duration,
    /// Percent chance that a first response earns a token.
    pub award_chance: u8,
    pub ui_retry: RetryPolicy,
}

impl Default for MatchmakingPolicy {
    fn default() -> Self {
        Self {
            default_interface: "gateway".into(),
            lobby_target: "matchmaking".into(),
            announce_target: "general".into(),
            grace: Duration::minutes(30),
            reminder_offsets: vec![
                Duration::minutes(30),
                Duration::minutes(10),
                Duration::minutes(1),
            ],
            max_ahead: Duration::days(365),
            award_chance: 10,
            ui_retry: RetryPolicy::interactive(),
        }
    }
}

/// Result of an RSVP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rsvp {
    pub changed: bool,
    /// A participation token was credited.
    pub awarded: bool,
}

/// Progress of a lobby task, persisted as JSON in `interface_data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LobbyState {
    #[serde(default)]
    prompt: Option<MessageHandle>,
    #[serde(default)]
    start_notice: Option<MessageHandle>,
    #[serde(default)]
    started: bool,
    /// Reminder offsets already handled, counted from the largest.
    #[serde(default)]
    reminders_sent: usize,
}

impl LobbyState {
    fn decode(raw: Option<&[u8]>) -> Self {
        match raw.map(|bytes| serde_json::from_slice::<LobbyState>(bytes)) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                warn!("Discarding unreadable lobby state: {}", e);
                Self::default()
            }
            None => Self::default(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(anyhow::Error::from)?)
    }
}

pub struct MatchmakingEngine {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MessageSink>,
    wallet: Arc<WalletEngine>,
    policy: MatchmakingPolicy,
    tasks: TaskRegistry<i64>,
    shutdown: CancellationToken,
}

impl MatchmakingEngine {
    pub(crate) fn new(
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MessageSink>,
        wallet: Arc<WalletEngine>,
        mut policy: MatchmakingPolicy,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        policy.reminder_offsets.retain(|o| *o > Duration::zero());
        policy.reminder_offsets.sort_by(|a, b| b.cmp(a));
        policy.reminder_offsets.dedup();
        Arc::new(Self {
            db,
            clock,
            sink,
            wallet,
            policy,
            tasks: TaskRegistry::new(),
            shutdown,
        })
    }

    /// Open a lobby, post its prompt and start its task.
    pub async fn create(
        self: &Arc<Self>,
        creator: &User,
        title: &str,
        description: Option<&str>,
        when: Option<DateTime<Utc>>,
        interface: Option<&str>,
    ) -> Result<MmEvent> {
        let title = required_text("title", title, MAX_TITLE_LEN)?;
        let description = match description.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => Some(required_text("description", d, MAX_DESCRIPTION_LEN)?),
            None => None,
        };
        let now = self.clock.now();
        if let Some(when) = when {
            if when <= now {
                return Err(Error::InvalidTime(format!(
                    "start time {} is not in the future",
                    when
                )));
            }
            if when > now + self.policy.max_ahead {
                return Err(Error::UnreasonablyFar(when));
            }
        }
        let interface = interface
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(self.policy.default_interface.as_str())
            .to_string();
        if !self.sink.supports(&interface) {
            return Err(Error::invalid(format!("unknown interface '{}'", interface)));
        }

        let creator_id = creator.id;
        let mut event = blocking(&self.db, move |db| {
            db.create_event(
                &NewEvent {
                    creator_id,
                    title: &title,
                    description: description.as_deref(),
                    when,
                    interface: &interface,
                },
                now,
            )
        })
        .await?;
        info!(event_id = event.id, %creator_id, ?when, "Lobby created");

        let mut state = LobbyState {
            reminders_sent: when.map_or(0, |w| self.offsets_reached(w, now)),
            ..LobbyState::default()
        };
        let phase = self.phase_at(event.when, now, &state);
        let roster: Roster = [(creator.id, creator.clone())].into_iter().collect();
        let text = render::prompt(&event, phase, &[], &roster, now, self.policy.grace);
        state.prompt = self
            .post(&self.lobby_address(&event), &text, &self.shutdown)
            .await;

        let data = state.encode()?;
        event.phase = phase;
        event.interface_data = Some(data.clone());
        let id = event.id;
        blocking(&self.db, move |db| {
            db.update_event_state(id, phase, Some(data.as_slice()))
        })
        .await?;

        let last_render = state.prompt.is_some().then_some(text);
        self.spawn_lobby(id, last_render);
        Ok(event)
    }

    /// Record an RSVP. The first response of a user may earn a token.
    pub async fn respond(&self, event_id: i64, user: &User, choice: MmChoice) -> Result<Rsvp> {
        let now = self.clock.now();
        let user_id = user.id;
        let grace = self.policy.grace;
        let outcome = blocking(&self.db, move |db| {
            db.upsert_response(event_id, user_id, choice, now, grace)
        })
        .await?;

        let (first, changed) = match outcome {
            RespondOutcome::Recorded { first, changed } => (first, changed),
            RespondOutcome::NotFound => {
                return Err(Error::NotFound(format!("matchmaking event {}", event_id)));
            }
            RespondOutcome::Closed => return Err(Error::EventClosed(event_id)),
        };
        if changed {
            debug!(event_id, %user_id, choice = choice.as_str(), "RSVP recorded");
            self.tasks.wake(event_id);
        }

        let awarded = first && self.roll_award() && self.award(event_id, user_id).await;
        Ok(Rsvp { changed, awarded })
    }

    /// Cancel a lobby. Open-ended lobbies end as `Closed`.
    pub async fn cancel(&self, event_id: i64, requester: &User) -> Result<MmEvent> {
        let event = self.fetch(event_id).await?;
        authorize(&event, requester, "cancel")?;
        if event.interrupted {
            return Err(Error::EventClosed(event_id));
        }

        let phase = if event.when.is_some() {
            MmPhase::Cancelled
        } else {
            MmPhase::Closed
        };
        if !blocking(&self.db, move |db| db.set_event_interrupted(event_id, phase)).await? {
            return Err(Error::EventClosed(event_id));
        }
        self.tasks.cancel_and_wait(event_id).await;
        info!(event_id, by = %requester.id, "Lobby cancelled");

        let event = self.fetch(event_id).await?;
        self.finish_ui(&event, phase, false).await?;
        Ok(event)
    }

    /// Start a lobby immediately. Starting a lobby that already started is a
    /// no-op. Open-ended lobbies close right after their start notice.
    pub async fn start_now(self: &Arc<Self>, event_id: i64, requester: &User) -> Result<MmEvent> {
        let event = self.fetch(event_id).await?;
        authorize(&event, requester, "start")?;
        if event.interrupted {
            return Err(Error::EventClosed(event_id));
        }
        let now = self.clock.now();

        match event.when {
            Some(when) if when <= now => return Ok(event),
            Some(_) => {
                if !blocking(&self.db, move |db| db.set_event_start(event_id, now)).await? {
                    return Err(Error::EventClosed(event_id));
                }
                info!(event_id, "Lobby started early");
                if self.tasks.contains(event_id) {
                    self.tasks.wake(event_id);
                } else {
                    self.spawn_lobby(event_id, None);
                }
            }
            None => {
                let closed = blocking(&self.db, move |db| {
                    db.set_event_interrupted(event_id, MmPhase::Closed)
                })
                .await?;
                if !closed {
                    return Err(Error::EventClosed(event_id));
                }
                self.tasks.cancel_and_wait(event_id).await;
                info!(event_id, "Open-ended lobby started and closed");
                let event = self.fetch(event_id).await?;
                self.finish_ui(&event, MmPhase::Closed, true).await?;
            }
        }
        self.fetch(event_id).await
    }

    pub async fn get(&self, event_id: i64) -> Result<EventResponse> {
        let found = blocking(&self.db, move |db| {
            match db.get_event(event_id)? {
                Some(event) => Ok(Some((event, db.list_responses(event_id)?))),
                None => Ok(None),
            }
        })
        .await?;
        let (event, responses) =
            found.ok_or_else(|| Error::NotFound(format!("matchmaking event {}", event_id)))?;
        Ok(EventResponse { event, responses })
    }

    pub async fn list_live(&self) -> Result<Vec<MmEvent>> {
        blocking(&self.db, |db| db.list_live_events()).await
    }

    /// Start a task for every live lobby without one. Returns how many were
    /// started.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let live = self.list_live().await?;
        let started = live
            .iter()
            .filter(|event| self.spawn_lobby(event.id, None))
            .count();
        if started > 0 {
            info!(started, "Matchmaking lobbies resumed");
        }
        Ok(started)
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    // -- Task --

    fn spawn_lobby(self: &Arc<Self>, event_id: i64, last_render: Option<String>) -> bool {
        let engine = self.clone();
        self.tasks.spawn(event_id, &self.shutdown, move |ctx| {
            engine.supervise(event_id, ctx, last_render)
        })
    }

    /// Runs the lobby loop as its own task so a failure or panic is
    /// observed here and the event is taken out of circulation.
    async fn supervise(self: Arc<Self>, event_id: i64, ctx: TaskCtx, last_render: Option<String>) {
        let inner = tokio::spawn(self.clone().run_lobby(event_id, ctx, last_render));
        match inner.await {
            Ok(Ok(())) => debug!(event_id, "Lobby task finished"),
            Ok(Err(e)) => {
                error!(event_id, "Lobby task failed: {}", e);
                self.mark_interrupted(event_id).await;
            }
            Err(e) if e.is_cancelled() => debug!(event_id, "Lobby task aborted"),
            Err(e) => {
                error!(event_id, "Lobby task panicked: {}", e);
                self.mark_interrupted(event_id).await;
            }
        }
    }

    async fn mark_interrupted(&self, event_id: i64) {
        match blocking(&self.db, move |db| db.interrupt_event(event_id)).await {
            Ok(true) => warn!(event_id, "Lobby marked interrupted"),
            Ok(false) => {}
            Err(e) => error!(event_id, "Failed to mark lobby interrupted: {}", e),
        }
    }

    async fn run_lobby(
        self: Arc<Self>,
        event_id: i64,
        ctx: TaskCtx,
        mut last_render: Option<String>,
    ) -> Result<()> {
        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let Some(event) = blocking(&self.db, move |db| db.get_event(event_id)).await? else {
                return Ok(());
            };
            if event.interrupted {
                return Ok(());
            }

            let stored = LobbyState::decode(event.interface_data.as_deref());
            let mut state = stored.clone();
            let now = self.clock.now();
            let (responses, roster) = self.roster(&event).await?;

            let next_wake = match event.when {
                None => {
                    self.refresh_prompt(
                        &event,
                        MmPhase::OpenUnbounded,
                        &responses,
                        &roster,
                        &mut state,
                        &mut last_render,
                        &ctx.cancel,
                    )
                    .await;
                    if !self
                        .persist(&event, MmPhase::OpenUnbounded, &state, &stored)
                        .await?
                    {
                        return Ok(());
                    }
                    None
                }
                Some(when) => {
                    if now >= when {
                        state.reminders_sent = self.policy.reminder_offsets.len();
                    } else {
                        let reached = self.offsets_reached(when, now);
                        if reached > state.reminders_sent {
                            state.reminders_sent = reached;
                            let nudge = render::nudge(&event, when, now, &responses, &roster);
                            if let Some(text) = nudge {
                                let address = self.announce_address(&event);
                                self.post(&address, &text, &ctx.cancel).await;
                            }
                        }
                    }

                    let phase = self.phase_at(Some(when), now, &state);
                    if phase >= MmPhase::Starting && !state.started {
                        state.started = true;
                        let text = render::start_notice(&event, &responses, &roster);
                        state.start_notice = self
                            .post(&self.announce_address(&event), &text, &ctx.cancel)
                            .await;
                        info!(event_id, "Lobby starting");
                        let starting = phase.min(MmPhase::Starting);
                        if !self.persist(&event, starting, &state, &stored).await? {
                            return Ok(());
                        }
                    }

                    self.refresh_prompt(
                        &event,
                        phase,
                        &responses,
                        &roster,
                        &mut state,
                        &mut last_render,
                        &ctx.cancel,
                    )
                    .await;

                    if phase == MmPhase::Closed {
                        self.persist(&event, MmPhase::Starting, &state, &stored).await?;
                        blocking(&self.db, move |db| {
                            db.set_event_interrupted(event_id, MmPhase::Closed)
                        })
                        .await?;
                        info!(event_id, "Lobby closed");
                        return Ok(());
                    }
                    if !self.persist(&event, phase, &state, &stored).await? {
                        return Ok(());
                    }
                    Some(self.next_threshold(when, &state))
                }
            };

            let clock = self.clock.clone();
            let sleep = async move {
                match next_wake {
                    Some(deadline) => clock.sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = ctx.wake.notified() => {}
                _ = sleep => {}
            }
        }
    }

    /// Store phase and state if either changed. Returns false once the lobby
    /// has been interrupted elsewhere.
    async fn persist(
        &self,
        event: &MmEvent,
        phase: MmPhase,
        state: &LobbyState,
        stored: &LobbyState,
    ) -> Result<bool> {
        if phase == event.phase && state == stored {
            return Ok(true);
        }
        let id = event.id;
        let data = state.encode()?;
        blocking(&self.db, move |db| db.update_event_state(id, phase, Some(data.as_slice()))).await
    }

    /// Bring the posted prompt in line with the current state, reposting it
    /// if the old message is gone.
    #[allow(clippy::too_many_arguments)]
    async fn refresh_prompt(
        &self,
        event: &MmEvent,
        phase: MmPhase,
        responses: &[MmResponse],
        roster: &Roster,
        state: &mut LobbyState,
        last_render: &mut Option<String>,
        cancel: &CancellationToken,
    ) {
        let now = self.clock.now();
        let text = render::prompt(event, phase, responses, roster, now, self.policy.grace);
        if state.prompt.is_some() && last_render.as_deref() == Some(text.as_str()) {
            return;
        }

        if let Some(handle) = &state.prompt {
            let edited = self
                .policy
                .ui_retry
                .run("lobby prompt edit", cancel, || self.sink.edit(handle, &text))
                .await;
            match edited {
                Ok(()) => {}
                Err(SinkError::Permanent(e)) => {
                    warn!(event_id = event.id, "Lobby prompt lost ({}), reposting", e);
                    state.prompt = None;
                }
                Err(e) => {
                    warn!(event_id = event.id, "Lobby prompt edit failed: {}", e);
                    return;
                }
            }
        }
        if state.prompt.is_none() {
            state.prompt = self.post(&self.lobby_address(event), &text, cancel).await;
        }
        if state.prompt.is_some() {
            *last_render = Some(text);
        }
    }

    async fn finish_ui(&self, event: &MmEvent, phase: MmPhase, started: bool) -> Result<()> {
        let state = LobbyState::decode(event.interface_data.as_deref());
        let (responses, roster) = self.roster(event).await?;
        let announce = self.announce_address(event);

        if started {
            let text = render::start_notice(event, &responses, &roster);
            self.post(&announce, &text, &self.shutdown).await;
        }
        if let Some(handle) = &state.prompt {
            let now = self.clock.now();
            let text = render::prompt(event, phase, &responses, &roster, now, self.policy.grace);
            let edited = self
                .policy
                .ui_retry
                .run("lobby prompt edit", &self.shutdown, || self.sink.edit(handle, &text))
                .await;
            if let Err(e) = edited {
                warn!(event_id = event.id, "Final lobby prompt edit failed: {}", e);
            }
        }
        // a start notice for a lobby that is now cancelled is stale
        if let (MmPhase::Cancelled, Some(notice)) = (phase, &state.start_notice) {
            let removed = self
                .policy
                .ui_retry
                .run("start notice removal", &self.shutdown, || self.sink.delete(notice))
                .await;
            if let Err(e) = removed {
                warn!(event_id = event.id, "Start notice not removed: {}", e);
            }
        }
        if !started {
            self.post(&announce, &render::ended_notice(event, phase), &self.shutdown)
                .await;
        }
        Ok(())
    }

    async fn post(
        &self,
        address: &Address,
        text: &str,
        cancel: &CancellationToken,
    ) -> Option<MessageHandle> {
        let sent = self
            .policy
            .ui_retry
            .run("lobby message", cancel, || self.sink.send(address, text))
            .await;
        match sent {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(%address, "Lobby message not delivered: {}", e);
                None
            }
        }
    }

    async fn roster(&self, event: &MmEvent) -> Result<(Vec<MmResponse>, Roster)> {
        let id = event.id;
        let creator_id = event.creator_id;
        blocking(&self.db, move |db| {
            let responses = db.list_responses(id)?;
            let mut ids: Vec<Uuid> = responses.iter().map(|r| r.user_id).collect();
            ids.push(creator_id);
            let roster = db.get_users(&ids)?.into_iter().map(|u| (u.id, u)).collect();
            Ok((responses, roster))
        })
        .await
    }

    async fn fetch(&self, event_id: i64) -> Result<MmEvent> {
        blocking(&self.db, move |db| db.get_event(event_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("matchmaking event {}", event_id)))
    }

    fn roll_award(&self) -> bool {
        let chance = self.policy.award_chance;
        chance > 0 && rand::rng().random_range(0..100u8) < chance
    }

    async fn award(&self, event_id: i64, user_id: Uuid) -> bool {
        let reason = format!("responded to matchmaking #{}", event_id);
        match self.wallet.credit(user_id, 1, &reason).await {
            Ok(_) => true,
            Err(e) => {
                warn!(event_id, %user_id, "Participation award failed: {}", e);
                false
            }
        }
    }

    // -- Timeline --

    fn offsets_reached(&self, when: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        self.policy
            .reminder_offsets
            .iter()
            .filter(|offset| now >= when - **offset)
            .count()
    }

    fn phase_at(
        &self,
        when: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        state: &LobbyState,
    ) -> MmPhase {
        match when {
            None => MmPhase::OpenUnbounded,
            Some(w) if now >= w + self.policy.grace => MmPhase::Closed,
            Some(w) if now >= w => MmPhase::Starting,
            Some(_) if state.reminders_sent > 0 => MmPhase::Reminding,
            Some(_) => MmPhase::Announced,
        }
    }

    fn next_threshold(&self, when: DateTime<Utc>, state: &LobbyState) -> DateTime<Utc> {
        if state.started {
            return when + self.policy.grace;
        }
        match self.policy.reminder_offsets.get(state.reminders_sent) {
            Some(offset) => when - *offset,
            None => when,
        }
    }

    fn lobby_address(&self, event: &MmEvent) -> Address {
        Address::new(event.interface.clone(), self.policy.lobby_target.clone())
    }

    fn announce_address(&self, event: &MmEvent) -> Address {
        Address::new(event.interface.clone(), self.policy.announce_target.clone())
    }
}

fn authorize(event: &MmEvent, requester: &User, action: &str) -> Result<()> {
    if event.creator_id == requester.id || requester.is_admin() {
        Ok(())
    } else {
        Err(Error::Unauthorised(format!(
            "only the creator or an admin can {} this lobby",
            action
        )))
    }
}
