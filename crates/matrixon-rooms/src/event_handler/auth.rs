// =============================================================================
// Matrixon Matrix NextServer - Authorization Replay Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Default room authorisation rules and the replay that checks a backward
//   extremity against its freshly resolved state, fetching auth events the
//   state turned out to be missing.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use matrixon_common::MatrixonError;
use matrixon_core::{AuthFailure, EventAuthorizer, PduEvent, Rejection, ResolvedState, Result};
use ruma::{events::TimelineEventType, OwnedEventId};
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use super::missing_state::GapResolutionRequest;
use crate::metrics;

const CREATE: &str = "m.room.create";
const POWER_LEVELS: &str = "m.room.power_levels";
const MEMBER: &str = "m.room.member";
const JOIN_RULES: &str = "m.room.join_rules";

/// The subset of room authorisation rules needed to replay a backward
/// extremity: creation, membership and power levels.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthEventsAuthorizer;

/// Auth-relevant state, indexed by `(type, state_key)`. The first event
/// listed for a key wins; later ones only count as present.
struct AuthState<'a> {
    by_key: HashMap<(&'static str, String), &'a PduEvent>,
    present: HashSet<&'a OwnedEventId>,
}

impl<'a> AuthState<'a> {
    fn new(events: &'a [Arc<PduEvent>]) -> Self {
        let mut by_key = HashMap::new();
        let mut present = HashSet::new();
        for event in events {
            present.insert(&event.event_id);
            if let (Some(kind), Some(state_key)) = (auth_type(event), event.state_key.as_ref()) {
                by_key
                    .entry((kind, state_key.clone()))
                    .or_insert(event.as_ref());
            }
        }
        Self { by_key, present }
    }

    fn get(&self, kind: &'static str, state_key: &str) -> Option<&'a PduEvent> {
        self.by_key.get(&(kind, state_key.to_owned())).copied()
    }

    /// First declared auth event not already in the state, or `Forbidden`
    fn missing_or_forbidden(&self, event: &PduEvent, reason: &str) -> AuthFailure {
        match event.auth_events.iter().find(|id| !self.present.contains(id)) {
            Some(id) => AuthFailure::MissingAuthEvent(id.clone()),
            None => AuthFailure::Forbidden(reason.to_owned()),
        }
    }
}

fn auth_type(event: &PduEvent) -> Option<&'static str> {
    match &event.kind {
        TimelineEventType::RoomCreate => Some(CREATE),
        TimelineEventType::RoomPowerLevels => Some(POWER_LEVELS),
        TimelineEventType::RoomMember => Some(MEMBER),
        TimelineEventType::RoomJoinRules => Some(JOIN_RULES),
        _ => None,
    }
}

fn membership(event: &PduEvent) -> Option<&str> {
    event.content.get("membership").and_then(Value::as_str)
}

fn creator(create: &PduEvent) -> &str {
    create
        .content
        .get("creator")
        .and_then(Value::as_str)
        .unwrap_or_else(|| create.sender.as_str())
}

fn int_field(content: &Value, field: &str) -> Option<i64> {
    match content.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

struct PowerLevels<'a> {
    content: Option<&'a Value>,
    creator: &'a str,
}

impl PowerLevels<'_> {
    fn user_level(&self, user: &str) -> i64 {
        match self.content {
            Some(content) => content
                .get("users")
                .and_then(|users| int_field(users, user))
                .or_else(|| int_field(content, "users_default"))
                .unwrap_or(0),
            None if user == self.creator => 100,
            None => 0,
        }
    }

    /// Level needed to send `kind`; without a power levels event everything is 0
    fn event_level(&self, kind: &str, is_state: bool) -> i64 {
        let Some(content) = self.content else {
            return 0;
        };
        content
            .get("events")
            .and_then(|events| int_field(events, kind))
            .unwrap_or_else(|| {
                if is_state {
                    int_field(content, "state_default").unwrap_or(50)
                } else {
                    int_field(content, "events_default").unwrap_or(0)
                }
            })
    }

    fn named_level(&self, field: &str, default: i64) -> i64 {
        self.content
            .and_then(|content| int_field(content, field))
            .unwrap_or(default)
    }
}

impl EventAuthorizer for AuthEventsAuthorizer {
    fn allowed(
        &self,
        event: &PduEvent,
        auth_events: &[Arc<PduEvent>],
    ) -> std::result::Result<(), AuthFailure> {
        if event.is_create() {
            return if event.prev_events.is_empty() {
                Ok(())
            } else {
                Err(AuthFailure::Forbidden("create event has prev events".into()))
            };
        }

        let state = AuthState::new(auth_events);
        let Some(create) = state.get(CREATE, "") else {
            return Err(state.missing_or_forbidden(event, "no create event in state"));
        };
        let creator = creator(create);
        let power = PowerLevels {
            content: state.get(POWER_LEVELS, "").map(|pl| &pl.content),
            creator,
        };

        let sender = event.sender.as_str();
        let sender_member = state.get(MEMBER, sender);
        let sender_joined = sender_member.and_then(membership) == Some("join");
        let sender_level = power.user_level(sender);

        if event.kind == TimelineEventType::RoomMember {
            let target = event
                .state_key
                .as_deref()
                .ok_or_else(|| AuthFailure::Forbidden("membership event without state key".into()))?;
            let wanted = membership(event)
                .ok_or_else(|| AuthFailure::Forbidden("membership event without membership".into()))?;

            if wanted == "join" {
                if target != sender {
                    return Err(AuthFailure::Forbidden("cannot join on behalf of another user".into()));
                }
                if sender_joined {
                    return Ok(());
                }
                if sender == creator && sender_member.is_none() {
                    return Ok(());
                }
                return match state.get(JOIN_RULES, "") {
                    Some(rules)
                        if rules.content.get("join_rule").and_then(Value::as_str)
                            == Some("public") =>
                    {
                        Ok(())
                    }
                    Some(_) => Err(AuthFailure::Forbidden(format!("{sender} may not join"))),
                    None => Err(state.missing_or_forbidden(event, "no join rules in state")),
                };
            }

            if sender_member.is_none() {
                return Err(state.missing_or_forbidden(event, "sender has no membership"));
            }
            if !sender_joined {
                return Err(AuthFailure::Forbidden(format!("{sender} is not joined")));
            }
            let required = match wanted {
                "invite" => power.named_level("invite", 0),
                "ban" => power.named_level("ban", 50),
                "leave" if target == sender => 0,
                "leave" => power.named_level("kick", 50),
                other => {
                    return Err(AuthFailure::Forbidden(format!("unknown membership {other}")))
                }
            };
            if sender_level < required {
                return Err(AuthFailure::Forbidden(format!(
                    "{sender} has power {sender_level}, {wanted} needs {required}"
                )));
            }
            return Ok(());
        }

        if sender_member.is_none() {
            return Err(state.missing_or_forbidden(event, "sender has no membership"));
        }
        if !sender_joined {
            return Err(AuthFailure::Forbidden(format!("{sender} is not joined")));
        }

        let required = power.event_level(&event.kind.to_string(), event.is_state());
        if sender_level < required {
            return Err(AuthFailure::Forbidden(format!(
                "{sender} has power {sender_level}, {} needs {required}",
                event.kind
            )));
        }
        Ok(())
    }
}

impl GapResolutionRequest<'_> {
    /// Runs the oracle over the union of `states`, then replays authorisation
    /// of `boundary` against the result, fetching each missing auth event at
    /// most once.
    ///
    /// A `Forbidden` verdict does not fail the request: the rejection is
    /// returned alongside the computed state.
    #[instrument(skip_all, fields(event_id = %boundary.event_id, states = states.len()))]
    pub(super) async fn resolve_states_and_check(
        &self,
        states: Vec<ResolvedState>,
        boundary: &PduEvent,
    ) -> Result<(ResolvedState, Option<Rejection>)> {
        let mut auth_events = Vec::new();
        let mut state_events = Vec::new();
        for state in states {
            auth_events.extend(state.auth_events);
            state_events.extend(state.state_events);
        }

        debug!(
            "🔧 Resolving {} state events ({} auth events)",
            state_events.len(),
            auth_events.len()
        );
        metrics::record_state_resolution();
        let mut resolved = self
            .service
            .resolver
            .resolve_conflicts(&self.room_version, state_events, auth_events.clone())
            .await
            .map_err(|e| {
                warn!("❌ State resolution failed in {}: {}", self.room_id, e);
                e
            })?;

        // Fetched auth events whose slot the oracle already filled. They are
        // shown to the authorizer but never enter the resolved state.
        let mut superseded: Vec<Arc<PduEvent>> = Vec::new();
        let mut fetched = HashSet::new();
        loop {
            let verdict = if superseded.is_empty() {
                self.service.authorizer.allowed(boundary, &resolved)
            } else {
                let mut candidates = resolved.clone();
                candidates.extend(superseded.iter().cloned());
                self.service.authorizer.allowed(boundary, &candidates)
            };
            let missing = match verdict {
                Ok(()) => break,
                Err(AuthFailure::MissingAuthEvent(missing)) => missing,
                Err(AuthFailure::Forbidden(reason)) => {
                    warn!("⚠️ {} is not allowed by its resolved state: {}", boundary.event_id, reason);
                    metrics::record_rejected_event("auth_replay");
                    let rejection = Rejection {
                        event_id: boundary.event_id.clone(),
                        reason,
                    };
                    return Ok((ResolvedState::new(auth_events, resolved), Some(rejection)));
                }
            };

            if !fetched.insert(missing.clone()) {
                return Err(MatrixonError::MissingAuthEvent {
                    event_id: boundary.event_id.clone(),
                    auth_event_id: missing,
                    reason: "still missing after it was fetched".into(),
                });
            }

            match self.lookup_event(&missing, false).await {
                Ok(event) => {
                    let slot = event.state_tuple();
                    let taken = slot.is_some()
                        && resolved.iter().any(|existing| existing.state_tuple() == slot);
                    if taken {
                        debug!(
                            "Auth event {} is superseded in the resolved state, not adding it",
                            missing
                        );
                        superseded.push(event);
                    } else {
                        trace!("Fetched auth event {}", missing);
                        resolved.push(event);
                    }
                }
                Err(e) if e.is_signature_failure() => {
                    warn!(
                        "⚠️ Auth event {} failed signature checks, continuing with computed state",
                        missing
                    );
                    break;
                }
                Err(e) => {
                    return Err(MatrixonError::MissingAuthEvent {
                        event_id: boundary.event_id.clone(),
                        auth_event_id: missing,
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok((ResolvedState::new(auth_events, resolved), None))
    }
}
