//! Room relay: fans real-time events out to the endpoints of active sessions.
//!
//! A room exists exactly while its session is active; the session manager
//! opens and closes rooms inside the same critical section as the state
//! transition. `join` checks that the room exists and, under the room's
//! members lock, that it has not been closed since it was looked up.
//!
//! Delivery is a non-blocking enqueue onto each endpoint's outbound channel.
//! Sends into one room are serialized, so every recipient observes a given
//! sender's events in the order they were sent.

mod room;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dedup::Claim;
use crate::error::{EngineError, Result};
use crate::models::{EndReason, Envelope, ParticipantId, RelayEvent, SessionId};
use room::{Member, Room};

/// Presence changes reported to the session manager.
///
/// These are signals only: the manager decides whether a departure ends the
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayHint {
    Joined {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    Left {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub seq: u64,
    pub delivered: usize,
    /// Recipients whose endpoint could not take the event.
    pub failed: Vec<ParticipantId>,
    /// The event repeated an already relayed client message id.
    pub duplicate: bool,
}

/// Handle returned by a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub id: u64,
}

/// Registry of active rooms.
pub struct Relay {
    rooms: RwLock<HashMap<SessionId, Arc<Room>>>,
    hints: mpsc::UnboundedSender<RelayHint>,
    next_connection: AtomicU64,
}

impl Relay {
    /// Create a relay and the receiving end of its presence hints.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RelayHint>) {
        let (hints, rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            hints,
            next_connection: AtomicU64::new(1),
        });
        (relay, rx)
    }

    /// Open the room for a session that just became active.
    pub fn open_room(&self, session_id: &str, client_id: &str, consultant_id: &str) {
        let room = Arc::new(Room::new(
            session_id,
            [client_id.to_string(), consultant_id.to_string()],
        ));
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), room);
        info!(session_id, "room opened");
    }

    /// Tear a room down, telling every connected endpoint why.
    pub fn close_room(&self, session_id: &str, reason: Option<EndReason>) -> bool {
        let Some(room) = self
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
        else {
            return false;
        };

        let members = room.close();
        let envelope = Envelope {
            session_id: session_id.to_string(),
            from: None,
            seq: room.next_seq(),
            sent_at: Utc::now(),
            event: RelayEvent::SessionEnd { reason },
        };
        for (participant_id, member) in members {
            if member.tx.try_send(envelope.clone()).is_err() {
                debug!(session_id, %participant_id, "session end notice not delivered");
            }
        }
        info!(session_id, reason = reason.map_or("-", EndReason::as_str), "room closed");
        true
    }

    pub fn has_room(&self, session_id: &str) -> bool {
        self.room(session_id).is_some()
    }

    /// Participants currently connected to a room.
    pub fn members(&self, session_id: &str) -> Vec<ParticipantId> {
        self.room(session_id)
            .map(|room| room.members().keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Attach an authenticated endpoint to a session's room.
    ///
    /// A participant connecting from a second device replaces the first
    /// connection.
    pub fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<Connection> {
        let room = self
            .room(session_id)
            .ok_or_else(|| EngineError::SessionNotActive(session_id.to_string()))?;
        self.join_room(&room, participant_id, tx)
    }

    fn join_room(
        &self,
        room: &Room,
        participant_id: &str,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<Connection> {
        let session_id = room.session_id.as_str();
        if !room.admits(participant_id) {
            return Err(EngineError::NotParticipant {
                session_id: session_id.to_string(),
                participant: participant_id.to_string(),
            });
        }

        let connection = Connection {
            id: self.next_connection.fetch_add(1, Ordering::SeqCst),
        };
        {
            let mut members = room.members();
            if room.is_closed() {
                return Err(EngineError::SessionNotActive(session_id.to_string()));
            }
            if members
                .insert(
                    participant_id.to_string(),
                    Member {
                        connection_id: connection.id,
                        tx,
                    },
                )
                .is_some()
            {
                debug!(session_id, participant_id, "replaced existing connection");
            }
            fan_out(
                room,
                &members,
                None,
                Some(participant_id),
                RelayEvent::ParticipantJoined {
                    participant_id: participant_id.to_string(),
                },
            );
        }

        info!(session_id, participant_id, connection_id = connection.id, "participant joined");
        let _ = self.hints.send(RelayHint::Joined {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
        });
        Ok(connection)
    }

    /// Detach an endpoint. A stale connection that was already replaced by a
    /// newer one is ignored.
    pub fn leave(&self, session_id: &str, participant_id: &str, connection: Connection) -> bool {
        let Some(room) = self.room(session_id) else {
            return false;
        };
        {
            let mut members = room.members();
            match members.get(participant_id) {
                Some(member) if member.connection_id == connection.id => {
                    members.remove(participant_id);
                }
                _ => return false,
            }
            fan_out(
                &room,
                &members,
                None,
                None,
                RelayEvent::ParticipantLeft {
                    participant_id: participant_id.to_string(),
                },
            );
        }

        info!(session_id, participant_id, "participant left");
        let _ = self.hints.send(RelayHint::Left {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
        });
        true
    }

    /// Relay an event from a connected participant to the room.
    pub fn broadcast(
        &self,
        session_id: &str,
        from: &str,
        event: RelayEvent,
        exclude_self: bool,
    ) -> Result<DeliveryReport> {
        let room = self
            .room(session_id)
            .ok_or_else(|| EngineError::SessionNotActive(session_id.to_string()))?;
        let members = room.members();
        if room.is_closed() {
            return Err(EngineError::SessionNotActive(session_id.to_string()));
        }
        if !members.contains_key(from) {
            return Err(EngineError::NotParticipant {
                session_id: session_id.to_string(),
                participant: from.to_string(),
            });
        }

        // Claims are taken under the members lock, so InFlight cannot be
        // observed here; treat it like a replay all the same.
        let ticket = match &event {
            RelayEvent::Chat {
                client_msg_id: Some(msg_id),
                ..
            } => match room.delivered.claim((from.to_string(), msg_id.clone())) {
                Claim::Fresh(ticket) => Some(ticket),
                Claim::Replay(seq) => return Ok(duplicate(session_id, from, msg_id, seq)),
                Claim::InFlight => return Ok(duplicate(session_id, from, msg_id, 0)),
            },
            _ => None,
        };

        let exclude = exclude_self.then_some(from);
        let report = fan_out(&room, &members, Some(from), exclude, event);
        if let Some(ticket) = ticket {
            ticket.complete(report.seq);
        }

        if !report.failed.is_empty() {
            warn!(session_id, from, failed = ?report.failed, "relay delivery failed");
            if let Some(sender) = members.get(from) {
                let notice = Envelope {
                    session_id: session_id.to_string(),
                    from: None,
                    seq: room.next_seq(),
                    sent_at: Utc::now(),
                    event: RelayEvent::DeliveryFailed {
                        seq: report.seq,
                        recipients: report.failed.clone(),
                    },
                };
                let _ = sender.tx.try_send(notice);
            }
        }
        Ok(report)
    }

    fn room(&self, session_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }
}

fn duplicate(session_id: &str, from: &str, msg_id: &str, seq: u64) -> DeliveryReport {
    debug!(session_id, from, msg_id, seq, "dropped duplicate chat message");
    DeliveryReport {
        seq,
        delivered: 0,
        failed: Vec::new(),
        duplicate: true,
    }
}

/// Enqueue one event to every member except `exclude`. Callers hold the
/// members lock, which keeps sequence numbers in delivery order.
fn fan_out(
    room: &Room,
    members: &HashMap<ParticipantId, Member>,
    from: Option<&str>,
    exclude: Option<&str>,
    event: RelayEvent,
) -> DeliveryReport {
    let envelope = Envelope {
        session_id: room.session_id.clone(),
        from: from.map(String::from),
        seq: room.next_seq(),
        sent_at: Utc::now(),
        event,
    };

    let mut delivered = 0;
    let mut failed = Vec::new();
    for (participant_id, member) in members {
        if Some(participant_id.as_str()) == exclude {
            continue;
        }
        match member.tx.try_send(envelope.clone()) {
            Ok(()) => delivered += 1,
            Err(_) => failed.push(participant_id.clone()),
        }
    }
    failed.sort();

    DeliveryReport {
        seq: envelope.seq,
        delivered,
        failed,
        duplicate: false,
    }
}
