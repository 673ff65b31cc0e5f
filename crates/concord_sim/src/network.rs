//! In-memory network with random per-packet delay.
//!
//! Every packet is serialized to JSON on send and parsed again on arrival, so
//! the wire codec is exercised on every hop. Packets are never lost, but the
//! jitter reorders them freely.

use concord::{Packet, ParticipantId, Transport};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Hands a packet to a site. Returns false if the site has stopped.
pub type Inbox = Box<dyn Fn(ParticipantId, Packet) -> bool + Send + Sync>;

pub struct Network {
    inboxes: RwLock<HashMap<ParticipantId, Inbox>>,
    rng: Mutex<StdRng>,
    max_delay_ms: u64,
    in_flight: AtomicUsize,
    delivered: AtomicUsize,
}

impl Network {
    pub fn new(rng: StdRng, max_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            inboxes: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
            max_delay_ms,
            in_flight: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        })
    }

    pub fn register(&self, site: ParticipantId, inbox: Inbox) {
        self.inboxes.write().insert(site, inbox);
    }

    /// A transport sending on behalf of `site`.
    pub fn transport(self: &Arc<Self>, site: ParticipantId) -> Arc<dyn Transport> {
        Arc::new(SiteTransport {
            local: site,
            network: Arc::clone(self),
        })
    }

    /// Packets sent but not yet handed to their recipient.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    fn post(self: &Arc<Self>, from: ParticipantId, to: ParticipantId, packet: Packet) {
        let json = match packet.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(%from, %to, error = %e, "packet could not be encoded");
                return;
            }
        };
        let delay = match self.max_delay_ms {
            0 => 0,
            max => self.rng.lock().gen_range(0..=max),
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let network = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            match Packet::from_json(&json) {
                Ok(packet) => network.deliver(from, to, packet),
                Err(e) => error!(%from, %to, error = %e, "packet could not be decoded"),
            }
            network.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn deliver(&self, from: ParticipantId, to: ParticipantId, packet: Packet) {
        let inboxes = self.inboxes.read();
        let Some(inbox) = inboxes.get(&to) else {
            warn!(%from, %to, "packet for unknown site dropped");
            return;
        };
        if inbox(from, packet) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!(%to, "site stopped, packet dropped");
        }
    }
}

struct SiteTransport {
    local: ParticipantId,
    network: Arc<Network>,
}

impl Transport for SiteTransport {
    fn send(&self, to: &ParticipantId, packet: Packet) {
        self.network.post(self.local.clone(), to.clone(), packet);
    }
}
