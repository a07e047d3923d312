use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use guildhall_types::models::{MmChoice, MmEvent, MmPhase, MmResponse, User};
use uuid::Uuid;

pub(super) type Roster = HashMap<Uuid, User>;

fn clock_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Whole minutes until `when`, rounded up.
pub(super) fn minutes_left(when: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (when - now).num_seconds().max(0);
    (secs + 59) / 60
}

fn header(event: &MmEvent) -> String {
    format!("[Matchmaking #{}] {}", event.id, event.title)
}

fn name(roster: &Roster, user_id: Uuid, mention: bool) -> String {
    match roster.get(&user_id) {
        Some(u) if mention => u.mention(),
        Some(u) => u.handle.clone(),
        None => user_id.to_string(),
    }
}

fn mentions<'a>(
    roster: &Roster,
    responses: impl Iterator<Item = &'a MmResponse>,
) -> Vec<String> {
    responses.map(|r| name(roster, r.user_id, true)).collect()
}

fn status_line(event: &MmEvent, phase: MmPhase, now: DateTime<Utc>, grace: Duration) -> String {
    match (phase, event.when) {
        (MmPhase::Cancelled, _) => "Cancelled.".to_string(),
        (MmPhase::Closed, _) => "Closed.".to_string(),
        (_, None) => "Open-ended, no fixed start time.".to_string(),
        (MmPhase::Starting, Some(w)) => format!(
            "Started at {}. Late responses accepted until {}.",
            clock_time(w),
            clock_time(w + grace)
        ),
        (MmPhase::Reminding, Some(w)) => format!(
            "Starts in {} min, at {}.",
            minutes_left(w, now),
            clock_time(w)
        ),
        (_, Some(w)) => format!("Starts at {}.", clock_time(w)),
    }
}

/// The lobby prompt: header, status, then one line per response.
pub(super) fn prompt(
    event: &MmEvent,
    phase: MmPhase,
    responses: &[MmResponse],
    roster: &Roster,
    now: DateTime<Utc>,
    grace: Duration,
) -> String {
    let mut out = header(event);
    if let Some(desc) = &event.description {
        out.push('\n');
        out.push_str(desc);
    }
    out.push('\n');
    out.push_str(&status_line(event, phase, now, grace));
    out.push('\n');

    if responses.is_empty() {
        out.push_str("\nNo responses yet.");
        return out;
    }

    let mut sorted: Vec<&MmResponse> = responses.iter().collect();
    sorted.sort_by_key(|r| (r.choice.rank(), r.updated_at));
    for r in sorted {
        out.push('\n');
        out.push_str(r.choice.symbol());
        out.push(' ');
        out.push_str(&name(roster, r.user_id, r.choice != MmChoice::No));
        if let (Some(w), Some(late)) = (event.when, r.choice.late_by()) {
            out.push_str(&format!(" (around {})", clock_time(w + late)));
        }
        if r.user_id == event.creator_id {
            out.push_str(" (creator)");
        }
    }
    out
}

/// Pre-start nudge. `None` when nobody is undecided.
pub(super) fn nudge(
    event: &MmEvent,
    when: DateTime<Utc>,
    now: DateTime<Utc>,
    responses: &[MmResponse],
    roster: &Roster,
) -> Option<String> {
    let undecided = mentions(roster, responses.iter().filter(|r| r.choice.is_undecided()));
    if undecided.is_empty() {
        return None;
    }
    Some(format!(
        "{} starts in {} min. Still undecided: {}",
        header(event),
        minutes_left(when, now),
        undecided.join(" ")
    ))
}

pub(super) fn start_notice(event: &MmEvent, responses: &[MmResponse], roster: &Roster) -> String {
    let attending = mentions(roster, responses.iter().filter(|r| r.choice.is_attending()));
    if attending.is_empty() {
        format!("{} is starting now! Nobody signed up.", header(event))
    } else {
        format!("{} is starting now! {}", header(event), attending.join(" "))
    }
}

pub(super) fn ended_notice(event: &MmEvent, phase: MmPhase) -> String {
    match phase {
        MmPhase::Cancelled => format!("{} has been cancelled.", header(event)),
        _ => format!("{} has been closed.", header(event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn person(handle: &str) -> User {
        User {
            id: Uuid::new_v4(),
            handle: handle.into(),
            roles: BTreeSet::new(),
            contact: None,
        }
    }

    #[test]
    fn prompt_orders_responses_and_marks_creator() {
        let now = Utc::now();
        let when = now + Duration::minutes(30);
        let creator = person("host");
        let late = person("slow");
        let no = person("nope");
        let event = MmEvent {
            id: 4,
            creator_id: creator.id,
            title: "Deep Rock".into(),
            description: None,
            when: Some(when),
            interface: "gateway".into(),
            interrupted: false,
            phase: MmPhase::Announced,
            interface_data: None,
            created_at: now,
        };
        let resp = |u: &User, choice| MmResponse {
            event_id: 4,
            user_id: u.id,
            choice,
            updated_at: now,
        };
        let responses = vec![
            resp(&no, MmChoice::No),
            resp(&late, MmChoice::LateShort),
            resp(&creator, MmChoice::Yes),
        ];
        let roster: Roster = [creator.clone(), late.clone(), no.clone()]
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        let text = prompt(
            &event,
            MmPhase::Announced,
            &responses,
            &roster,
            now,
            Duration::minutes(30),
        );
        let lines: Vec<&str> = text.lines().skip(3).collect();
        assert_eq!(lines[0], "[yes] @host (creator)");
        assert!(lines[1].starts_with("[+10] @slow (around "));
        assert_eq!(lines[2], "[no] nope");

        let note = start_notice(&event, &responses, &roster);
        assert!(note.contains("@host") && note.contains("@slow") && !note.contains("nope"));
        assert!(nudge(&event, when, now, &responses, &roster).unwrap().contains("@slow"));
    }

    #[test]
    fn minutes_round_up() {
        let now = Utc::now();
        assert_eq!(minutes_left(now + Duration::seconds(60), now), 1);
        assert_eq!(minutes_left(now + Duration::seconds(61), now), 2);
        assert_eq!(minutes_left(now - Duration::seconds(5), now), 0);
    }
}
