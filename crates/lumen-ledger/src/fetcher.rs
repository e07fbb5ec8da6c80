// Jet-tree updater: fetches the authoritative jet for an object when
// the local tree is stale.
//
// Concurrent lookups for the same (pulse, jet) are coalesced through a
// sequencer map: the first caller fires the remote fetch, later callers
// block on the per-key signal and re-check the tree on wake. The remote
// fetch fans out to light peers with a bounded worker pool and the
// first actual reply wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use lumen_core::bus::MessageBus;
use lumen_core::error::CoreError;
use lumen_core::message::{Message, Reply};
use lumen_core::node::Node;
use lumen_core::pulse::PulseNumber;
use lumen_core::reference::{JetId, NodeRef, ObjectId};

use crate::jet::JetTree;

/// Per-key wait signal. Closing the semaphore wakes every waiter, and a
/// waiter arriving after the close wakes immediately, so no wakeup is
/// lost between registration and the fetch completing.
type Sequencer = Arc<Semaphore>;

pub struct JetFetcher {
    tree: Arc<JetTree>,
    bus: Arc<dyn MessageBus>,
    parallelism: usize,
    sequencers: Mutex<HashMap<(PulseNumber, JetId), Sequencer>>,
    shutting_down: AtomicBool,
}

impl JetFetcher {
    pub fn new(tree: Arc<JetTree>, bus: Arc<dyn MessageBus>, parallelism: usize) -> JetFetcher {
        JetFetcher {
            tree,
            bus,
            parallelism: parallelism.max(1),
            sequencers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Resolve the actual jet for `object` at `pulse`, querying `peers`
    /// if the local tree is stale.
    pub async fn fetch_jet(
        &self,
        object: ObjectId,
        pulse: PulseNumber,
        peers: &[Node],
    ) -> Result<JetId, CoreError> {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(CoreError::ShuttingDown);
            }
            let (jet, actual) = self.tree.for_object(&object, pulse);
            if actual {
                return Ok(jet);
            }

            let key = (pulse, jet);
            let sequencer = {
                let mut map = self.sequencers.lock();
                match map.get(&key) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        map.insert(key, Arc::new(Semaphore::new(0)));
                        None
                    }
                }
            };
            if let Some(sequencer) = sequencer {
                // Another caller owns the fetch; wait and re-check.
                let _ = sequencer.acquire().await;
                continue;
            }

            let fetched = self.fetch_from_peers(object, pulse, peers).await;
            match fetched {
                Some((owner, remote_jet)) => {
                    self.tree.update(remote_jet, Some(owner), pulse);
                    self.release_jet(remote_jet, pulse);
                    // The fetched jet may differ from the stale local
                    // guess; release both keys.
                    if remote_jet != jet {
                        self.release_jet(jet, pulse);
                    }
                }
                None => {
                    self.release_jet(jet, pulse);
                    return Err(CoreError::NotFound(format!(
                        "no actual view of jet {jet} at pulse {pulse}"
                    )));
                }
            }
        }
    }

    /// Query all peers in parallel (bounded) and take the first reply
    /// with `actual = true`.
    async fn fetch_from_peers(
        &self,
        object: ObjectId,
        pulse: PulseNumber,
        peers: &[Node],
    ) -> Option<(NodeRef, JetId)> {
        if peers.is_empty() {
            return None;
        }
        let pool = Arc::new(Semaphore::new(self.parallelism));
        let (tx, mut rx) = mpsc::channel(peers.len());
        for peer in peers {
            let bus = self.bus.clone();
            let pool = pool.clone();
            let tx = tx.clone();
            let target = peer.reference;
            tokio::spawn(async move {
                let Ok(permit) = pool.acquire_owned().await else {
                    return;
                };
                let reply = bus.send(target, Message::GetJet { object, pulse }).await;
                drop(permit);
                if let Ok(Reply::Jet { jet, actual }) = reply {
                    let _ = tx.send((target, jet, actual)).await;
                }
            });
        }
        drop(tx);

        let mut winner = None;
        while let Some((from, jet, actual)) = rx.recv().await {
            if !actual {
                debug!("[JetFetcher] {from} replied with a non-actual jet {jet}");
                continue;
            }
            match winner {
                None => winner = Some((from, jet)),
                Some((_, first)) if first != jet => {
                    warn!(
                        "[JetFetcher] divergent actual replies: {first} (kept) vs {jet} from {from}"
                    );
                }
                Some(_) => {}
            }
        }
        winner
    }

    /// Wake all sequencers for this jet and its ancestors, so parent
    /// waiters that should now see a child also wake.
    pub fn release_jet(&self, jet: JetId, pulse: PulseNumber) {
        let mut map = self.sequencers.lock();
        let mut cursor = Some(jet);
        while let Some(current) = cursor {
            if let Some(sequencer) = map.remove(&(pulse, current)) {
                sequencer.close();
            }
            cursor = current.parent();
        }
    }

    /// Stop coalescing and wake every waiter; they observe the shutdown
    /// flag on re-check.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut map = self.sequencers.lock();
        for (_, sequencer) in map.drain() {
            sequencer.close();
        }
    }
}
