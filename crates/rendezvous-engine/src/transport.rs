use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;

use crate::error::TransportError;
use crate::model::{LocalPresence, PresenceRecord, SessionId, SignalingEnvelope};
use crate::relay::{PollRequest, PollResponse, RelayClient};

/// A prepared upload. Produced by [`RendezvousTransport::begin`] and consumed
/// by [`RendezvousTransport::round_trip`].
#[derive(Debug)]
pub struct PollTicket {
    request: PollRequest,
    highest_envelope: Option<u64>,
}

impl PollTicket {
    pub fn record(&self) -> &PresenceRecord {
        &self.request.record
    }
}

/// Result of one relay round trip, posted back to the owner of the transport.
#[derive(Debug)]
pub struct PollOutcome {
    highest_envelope: Option<u64>,
    result: Result<PollResponse, TransportError>,
}

/// Publishes the local presence record and collects everyone else's.
///
/// Envelopes stay queued until an upload that carried them is confirmed by
/// the relay, so a failed or timed out round trip simply resends them on the
/// next poll.
pub struct RendezvousTransport {
    relay: Arc<dyn RelayClient>,
    room_id: String,
    local_session: SessionId,
    round_trip_timeout: Duration,
    outbox: VecDeque<SignalingEnvelope>,
    next_envelope_id: u64,
    sequence: u64,
    cursor: Option<u64>,
    in_flight: bool,
}

impl RendezvousTransport {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        room_id: impl Into<String>,
        local_session: SessionId,
        round_trip_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            room_id: room_id.into(),
            local_session,
            round_trip_timeout,
            outbox: VecDeque::new(),
            next_envelope_id: 1,
            sequence: 0,
            cursor: None,
            in_flight: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn pending_envelopes(&self) -> usize {
        self.outbox.len()
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Queue a signal for `to`; it rides along with every upload until one
    /// is confirmed.
    pub fn enqueue(&mut self, to: SessionId, from_epoch: u64, to_epoch: u64, payload: Value) -> u64 {
        let id = self.next_envelope_id;
        self.next_envelope_id += 1;
        self.outbox.push_back(SignalingEnvelope {
            id,
            from: self.local_session.clone(),
            to,
            from_epoch,
            to_epoch,
            payload,
        });
        id
    }

    /// Forget unsent signals for a peer whose connection is gone.
    pub fn drop_envelopes_to(&mut self, to: &SessionId) -> usize {
        let before = self.outbox.len();
        self.outbox.retain(|envelope| &envelope.to != to);
        before - self.outbox.len()
    }

    /// Start a round trip. Returns `None` while another one is in flight.
    pub fn begin(&mut self, local: &LocalPresence) -> Option<PollTicket> {
        if self.in_flight {
            return None;
        }
        self.in_flight = true;
        self.sequence += 1;
        let envelopes: Vec<SignalingEnvelope> = self.outbox.iter().cloned().collect();
        let highest_envelope = envelopes.last().map(|envelope| envelope.id);
        Some(PollTicket {
            request: PollRequest {
                room_id: self.room_id.clone(),
                record: PresenceRecord::new(local, self.sequence, envelopes),
                cursor: self.cursor,
            },
            highest_envelope,
        })
    }

    /// The network half of a round trip. Owns everything it needs so it can
    /// be spawned.
    pub fn round_trip(&self, ticket: PollTicket) -> impl Future<Output = PollOutcome> + Send + use<> {
        let relay = Arc::clone(&self.relay);
        let limit = self.round_trip_timeout;
        async move {
            let PollTicket {
                request,
                highest_envelope,
            } = ticket;
            let result = match timeout(limit, relay.poll(request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(limit)),
            };
            PollOutcome {
                highest_envelope,
                result,
            }
        }
    }

    /// Forget a round trip whose task died without reporting back.
    pub fn abandon(&mut self) {
        self.in_flight = false;
    }

    /// Apply a finished round trip. On success the confirmed envelopes leave
    /// the queue and the records of other sessions are returned in relay order.
    pub fn finish(&mut self, outcome: PollOutcome) -> Result<Vec<PresenceRecord>, TransportError> {
        self.in_flight = false;
        let response = match outcome.result {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(
                    target = "rendezvous::transport",
                    room = %self.room_id,
                    pending = self.outbox.len(),
                    error = %err,
                    "relay round trip failed; keeping queued envelopes"
                );
                return Err(err);
            }
        };

        if let Some(highest) = outcome.highest_envelope {
            self.outbox.retain(|envelope| envelope.id > highest);
        }
        if response.cursor.is_some() {
            self.cursor = response.cursor;
        }
        tracing::trace!(
            target = "rendezvous::transport",
            room = %self.room_id,
            cursor = ?self.cursor,
            records = response.records.len(),
            "relay round trip complete"
        );
        let local = &self.local_session;
        Ok(response
            .records
            .into_iter()
            .filter(|record| &record.session_id != local)
            .collect())
    }

    /// Final upload announcing that this session is leaving. Best effort:
    /// errors are logged and swallowed.
    pub fn departure(&mut self, local: &LocalPresence) -> impl Future<Output = ()> + Send + use<> {
        self.sequence += 1;
        let mut presence = local.clone();
        presence.departing = true;
        let request = PollRequest {
            room_id: self.room_id.clone(),
            record: PresenceRecord::new(&presence, self.sequence, Vec::new()),
            cursor: self.cursor,
        };
        let relay = Arc::clone(&self.relay);
        let limit = self.round_trip_timeout;
        let session = self.local_session.clone();
        async move {
            let room = request.room_id.clone();
            match timeout(limit, relay.poll(request)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::debug!(
                    target = "rendezvous::transport",
                    %room,
                    error = %err,
                    "departure record not published"
                ),
                Err(_) => tracing::debug!(
                    target = "rendezvous::transport",
                    %room,
                    "departure record timed out"
                ),
            }
            if let Ok(Err(err)) = timeout(limit, relay.leave(&room, &session)).await {
                tracing::debug!(
                    target = "rendezvous::transport",
                    %room,
                    error = %err,
                    "relay leave failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use serde_json::json;

    fn local(session: &str) -> LocalPresence {
        LocalPresence::new(SessionId::from(session), "alice".into(), "ctx".into())
    }

    fn transport(relay: &Arc<MemoryRelay>, session: &str) -> RendezvousTransport {
        RendezvousTransport::new(
            relay.clone(),
            "room1",
            SessionId::from(session),
            Duration::from_secs(1),
        )
    }

    async fn poll_once(
        transport: &mut RendezvousTransport,
        presence: &LocalPresence,
    ) -> Result<Vec<PresenceRecord>, TransportError> {
        let ticket = transport.begin(presence).expect("no poll in flight");
        let outcome = transport.round_trip(ticket).await;
        transport.finish(outcome)
    }

    #[tokio::test]
    async fn failed_uploads_keep_envelopes_until_confirmed() {
        let relay = Arc::new(MemoryRelay::new());
        let mut alice = transport(&relay, "alice-1");
        let presence = local("alice-1");
        alice.enqueue(SessionId::from("bob-1"), 0, 0, json!({"type": "offer"}));

        relay.fail_next_polls(1);
        assert!(poll_once(&mut alice, &presence).await.is_err());
        assert_eq!(alice.pending_envelopes(), 1);

        poll_once(&mut alice, &presence).await.expect("second poll");
        assert_eq!(alice.pending_envelopes(), 0);
    }

    #[tokio::test]
    async fn envelopes_queued_mid_flight_survive_confirmation() {
        let relay = Arc::new(MemoryRelay::new());
        let mut alice = transport(&relay, "alice-1");
        let presence = local("alice-1");
        alice.enqueue(SessionId::from("bob-1"), 0, 0, json!(1));

        let ticket = alice.begin(&presence).expect("ticket");
        assert!(alice.begin(&presence).is_none());
        alice.enqueue(SessionId::from("bob-1"), 0, 0, json!(2));
        let outcome = alice.round_trip(ticket).await;
        alice.finish(outcome).expect("poll");

        assert_eq!(alice.pending_envelopes(), 1);
        assert!(!alice.is_in_flight());
    }

    #[tokio::test]
    async fn own_records_are_filtered_and_cursor_advances() {
        let relay = Arc::new(MemoryRelay::new());
        let mut alice = transport(&relay, "alice-1");
        let mut bob = transport(&relay, "bob-1");
        let alice_presence = local("alice-1");
        let bob_presence = local("bob-1");

        poll_once(&mut alice, &alice_presence).await.unwrap();
        let seen = poll_once(&mut bob, &bob_presence).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_id.as_str(), "alice-1");

        let seen = poll_once(&mut alice, &alice_presence).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_id.as_str(), "bob-1");
        assert_eq!(alice.cursor(), Some(3));
    }

    #[tokio::test]
    async fn dropping_envelopes_targets_one_peer() {
        let relay = Arc::new(MemoryRelay::new());
        let mut alice = transport(&relay, "alice-1");
        alice.enqueue(SessionId::from("bob-1"), 0, 0, json!(1));
        alice.enqueue(SessionId::from("carol-1"), 0, 0, json!(2));
        alice.enqueue(SessionId::from("bob-1"), 0, 0, json!(3));
        assert_eq!(alice.drop_envelopes_to(&SessionId::from("bob-1")), 2);
        assert_eq!(alice.pending_envelopes(), 1);
    }

    #[tokio::test]
    async fn departure_removes_session_from_room() {
        let relay = Arc::new(MemoryRelay::new());
        let mut alice = transport(&relay, "alice-1");
        let presence = local("alice-1");
        poll_once(&mut alice, &presence).await.unwrap();
        assert_eq!(relay.present_sessions("room1").len(), 1);
        alice.departure(&presence).await;
        assert!(relay.present_sessions("room1").is_empty());
    }
}
