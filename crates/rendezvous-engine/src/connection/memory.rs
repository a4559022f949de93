use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ConnectRequest, ConnectionEvents, PeerConnection, PeerConnector, SignalPayload};
use crate::error::NegotiationError;

/// Shared switchboard for in-process connections. Connectors handed out by
/// the same network can reach each other; the offer/answer pair still has to
/// travel through the relay like real session descriptions do.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    offers: Arc<Mutex<HashMap<String, Arc<MemoryConnection>>>>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("open_offers", &self.open_offers())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// Offers made but not yet answered or closed.
    pub fn open_offers(&self) -> usize {
        self.offers.lock().len()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let link = Uuid::new_v4().to_string();
        let connection = Arc::new(MemoryConnection {
            link: link.clone(),
            initiator: request.initiator,
            events: request.events,
            network: self.network.clone(),
            side: Arc::new(Mutex::new(Side::default())),
        });
        if connection.initiator {
            self.network
                .offers
                .lock()
                .insert(link.clone(), Arc::clone(&connection));
            connection.events.signal(MemorySignal::Offer { link }.to_value()?);
        }
        Ok(connection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MemorySignal {
    Offer { link: String },
    Answer { link: String },
}

impl MemorySignal {
    fn to_value(&self) -> Result<SignalPayload, NegotiationError> {
        serde_json::to_value(self).map_err(|err| NegotiationError::InvalidSignal(err.to_string()))
    }
}

#[derive(Debug, Default)]
struct Side {
    counterpart: Option<Counterpart>,
    bound_link: Option<String>,
    open: bool,
    closed: bool,
}

#[derive(Debug, Clone)]
struct Counterpart {
    events: ConnectionEvents,
    side: Arc<Mutex<Side>>,
}

#[derive(Debug)]
struct MemoryConnection {
    link: String,
    initiator: bool,
    events: ConnectionEvents,
    network: MemoryNetwork,
    side: Arc<Mutex<Side>>,
}

impl MemoryConnection {
    fn accept_offer(&self, link: String) -> Result<(), NegotiationError> {
        {
            let side = self.side.lock();
            if side.closed {
                return Err(NegotiationError::Closed);
            }
            match &side.bound_link {
                Some(bound) if *bound == link => return Ok(()),
                Some(_) => {
                    return Err(NegotiationError::InvalidSignal(
                        "offer for a different link".into(),
                    ));
                }
                None => {}
            }
        }
        let Some(offerer) = self.network.offers.lock().remove(&link) else {
            return Err(NegotiationError::Failed(format!("offer {link} is no longer open")));
        };

        {
            let mut theirs = offerer.side.lock();
            if theirs.closed {
                return Err(NegotiationError::Failed("offering side already closed".into()));
            }
            theirs.counterpart = Some(Counterpart {
                events: self.events.clone(),
                side: Arc::clone(&self.side),
            });
        }
        {
            let mut mine = self.side.lock();
            mine.bound_link = Some(link.clone());
            mine.counterpart = Some(Counterpart {
                events: offerer.events.clone(),
                side: Arc::clone(&offerer.side),
            });
            mine.open = true;
        }
        self.events.signal(MemorySignal::Answer { link }.to_value()?);
        self.events.connected();
        Ok(())
    }

    fn accept_answer(&self, link: String) -> Result<(), NegotiationError> {
        if link != self.link {
            return Err(NegotiationError::InvalidSignal("answer for a different link".into()));
        }
        let mut side = self.side.lock();
        if side.closed {
            return Err(NegotiationError::Closed);
        }
        if side.open {
            return Ok(());
        }
        if side.counterpart.is_none() {
            return Err(NegotiationError::Failed("answer arrived before the link was bound".into()));
        }
        side.open = true;
        drop(side);
        self.events.connected();
        Ok(())
    }
}

impl PeerConnection for MemoryConnection {
    fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        let signal: MemorySignal = serde_json::from_value(payload)
            .map_err(|err| NegotiationError::InvalidSignal(err.to_string()))?;
        match (self.initiator, signal) {
            (false, MemorySignal::Offer { link }) => self.accept_offer(link),
            (true, MemorySignal::Answer { link }) => self.accept_answer(link),
            (_, other) => Err(NegotiationError::InvalidSignal(format!(
                "unexpected {other:?} for {} side",
                if self.initiator { "offering" } else { "answering" }
            ))),
        }
    }

    fn send(&self, data: Bytes) -> Result<(), NegotiationError> {
        let side = self.side.lock();
        if side.closed {
            return Err(NegotiationError::Closed);
        }
        if !side.open {
            return Err(NegotiationError::NotOpen);
        }
        let Some(counterpart) = side.counterpart.clone() else {
            return Err(NegotiationError::NotOpen);
        };
        drop(side);
        if counterpart.side.lock().closed {
            return Err(NegotiationError::Closed);
        }
        counterpart.events.data(data);
        Ok(())
    }

    fn close(&self) {
        let counterpart = {
            let mut side = self.side.lock();
            if side.closed {
                return;
            }
            side.closed = true;
            side.open = false;
            side.counterpart.take()
        };
        if self.initiator {
            self.network.offers.lock().remove(&self.link);
        }
        if let Some(counterpart) = counterpart {
            let notify = {
                let mut theirs = counterpart.side.lock();
                let was_open = !theirs.closed;
                theirs.closed = true;
                theirs.open = false;
                theirs.counterpart = None;
                was_open
            };
            if notify {
                counterpart.events.closed();
            }
        }
    }
}
