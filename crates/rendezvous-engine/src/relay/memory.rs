use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PollRequest, PollResponse, RelayClient};
use crate::error::TransportError;
use crate::model::{PresenceRecord, SessionId};

const ROOM_LOG_CAPACITY: usize = 4096;

/// In-process relay for tests and local demos. Behaves like the HTTP worker:
/// every poll appends the caller's record to the room log and returns the
/// entries other sessions appended after the caller's cursor.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    rooms: Mutex<HashMap<String, RoomLog>>,
    faults: Mutex<Faults>,
}

#[derive(Debug, Default)]
struct RoomLog {
    next_seq: u64,
    entries: VecDeque<(u64, PresenceRecord)>,
    latest: HashMap<SessionId, u64>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_polls: u32,
    isolated: HashSet<SessionId>,
    polls: HashMap<SessionId, u64>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` polls from anyone fail.
    pub fn fail_next_polls(&self, count: u32) {
        self.faults.lock().failing_polls = count;
    }

    /// Reject every poll from `session` until [`MemoryRelay::reconnect`].
    pub fn isolate(&self, session: &SessionId) {
        self.faults.lock().isolated.insert(session.clone());
    }

    pub fn reconnect(&self, session: &SessionId) {
        self.faults.lock().isolated.remove(session);
    }

    /// Polls received from `session`, failed ones included.
    pub fn poll_count(&self, session: &SessionId) -> u64 {
        self.faults.lock().polls.get(session).copied().unwrap_or(0)
    }

    /// Sessions whose latest record is visible in `room_id`.
    pub fn present_sessions(&self, room_id: &str) -> Vec<SessionId> {
        let rooms = self.rooms.lock();
        let Some(room) = rooms.get(room_id) else {
            return Vec::new();
        };
        let mut sessions: Vec<_> = room.latest.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    fn check_faults(&self, session: &SessionId) -> Result<(), TransportError> {
        let mut faults = self.faults.lock();
        *faults.polls.entry(session.clone()).or_default() += 1;
        if faults.isolated.contains(session) {
            return Err(TransportError::Unavailable(format!("session {session} isolated")));
        }
        if faults.failing_polls > 0 {
            faults.failing_polls -= 1;
            return Err(TransportError::Unavailable("injected relay failure".into()));
        }
        Ok(())
    }
}

impl RoomLog {
    fn append(&mut self, record: PresenceRecord) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        if record.departing {
            self.latest.remove(&record.session_id);
        } else {
            self.latest.insert(record.session_id.clone(), seq);
        }
        self.entries.push_back((seq, record));
        while self.entries.len() > ROOM_LOG_CAPACITY {
            self.entries.pop_front();
        }
        seq
    }

    fn since(&self, requester: &SessionId, cursor: Option<u64>) -> Vec<PresenceRecord> {
        match cursor {
            Some(cursor) => self
                .entries
                .iter()
                .filter(|(seq, record)| *seq > cursor && &record.session_id != requester)
                .map(|(_, record)| record.clone())
                .collect(),
            None => {
                let snapshot: HashSet<u64> = self
                    .latest
                    .iter()
                    .filter(|(session, _)| *session != requester)
                    .map(|(_, seq)| *seq)
                    .collect();
                self.entries
                    .iter()
                    .filter(|(seq, _)| snapshot.contains(seq))
                    .map(|(_, record)| record.clone())
                    .collect()
            }
        }
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError> {
        let requester = request.record.session_id.clone();
        self.check_faults(&requester)?;

        let mut rooms = self.rooms.lock();
        let room = rooms.entry(request.room_id).or_default();
        let records = room.since(&requester, request.cursor);
        let cursor = room.append(request.record);
        Ok(PollResponse {
            records,
            cursor: Some(cursor),
        })
    }

    async fn leave(&self, room_id: &str, session_id: &SessionId) -> Result<(), TransportError> {
        if let Some(room) = self.rooms.lock().get_mut(room_id) {
            room.latest.remove(session_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalPresence;

    fn request(session: &str, cursor: Option<u64>, sequence: u64) -> PollRequest {
        let local = LocalPresence::new(SessionId::from(session), session.into(), "ctx".into());
        PollRequest {
            room_id: "room1".into(),
            record: PresenceRecord::new(&local, sequence, Vec::new()),
            cursor,
        }
    }

    #[tokio::test]
    async fn first_poll_returns_latest_record_per_session() {
        let relay = MemoryRelay::new();
        relay.poll(request("aaaa", None, 1)).await.unwrap();
        relay.poll(request("aaaa", None, 2)).await.unwrap();
        relay.poll(request("bbbb", None, 1)).await.unwrap();

        let response = relay.poll(request("cccc", None, 1)).await.unwrap();
        let seen: Vec<(String, u64)> = response
            .records
            .iter()
            .map(|r| (r.session_id.to_string(), r.sequence))
            .collect();
        assert_eq!(seen, vec![("aaaa".into(), 2), ("bbbb".into(), 1)]);
        assert_eq!(response.cursor, Some(4));
    }

    #[tokio::test]
    async fn cursor_hides_own_and_already_seen_records() {
        let relay = MemoryRelay::new();
        let first = relay.poll(request("aaaa", None, 1)).await.unwrap();
        relay.poll(request("bbbb", None, 1)).await.unwrap();
        relay.poll(request("bbbb", Some(1), 2)).await.unwrap();

        let response = relay.poll(request("aaaa", first.cursor, 2)).await.unwrap();
        let sequences: Vec<u64> = response.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(response.records.iter().all(|r| r.session_id.as_str() == "bbbb"));
    }

    #[tokio::test]
    async fn departed_sessions_leave_the_snapshot() {
        let relay = MemoryRelay::new();
        relay.poll(request("aaaa", None, 1)).await.unwrap();
        relay.leave("room1", &SessionId::from("aaaa")).await.unwrap();
        assert!(relay.present_sessions("room1").is_empty());
        let response = relay.poll(request("bbbb", None, 1)).await.unwrap();
        assert!(response.records.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let relay = MemoryRelay::new();
        relay.fail_next_polls(1);
        assert!(relay.poll(request("aaaa", None, 1)).await.is_err());
        assert!(relay.poll(request("aaaa", None, 1)).await.is_ok());
        assert_eq!(relay.poll_count(&SessionId::from("aaaa")), 2);
    }
}
