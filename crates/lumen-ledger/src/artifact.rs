// Light-material artifact handler: serves the ledger bus protocol for
// the jets this node owns.
//
// Two middleware layers run before any operation that targets an
// object:
//   1. Jet check - resolve the jet at the message's pulse (fetching if
//      the local tree is stale) and redirect with a delegation token
//      when another node owns it.
//   2. Hot-data gate - a jet newly assigned to this node blocks its
//      requests until the previous owner's HotRecords arrives.
//
// Index read-modify-write is serialized per object ID; no lock is held
// across a network suspension point.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use lumen_core::bus::{ExecutionContext, MessageBus};
use lumen_core::config::LedgerSettings;
use lumen_core::crypto::{hash_with_tag, tag, KeyPair};
use lumen_core::error::CoreError;
use lumen_core::lifeline::ObjectLifeline;
use lumen_core::message::{DelegationToken, HotData, Message, Reply};
use lumen_core::node::Node;
use lumen_core::pulse::PulseNumber;
use lumen_core::record::{Record, RecordKind};
use lumen_core::reference::{JetId, NodeRef, ObjectId, RecordId};

use crate::fetcher::JetFetcher;
use crate::jet::JetTree;
use crate::recent::RecentStorage;
use crate::storage::{drop_key, entry_key, LedgerStore, Namespace};

pub struct ArtifactHandler {
    origin: NodeRef,
    keypair: Arc<KeyPair>,
    settings: LedgerSettings,
    store: Arc<dyn LedgerStore>,
    bus: Arc<dyn MessageBus>,
    heavy: NodeRef,
    tree: Arc<JetTree>,
    fetcher: Arc<JetFetcher>,
    recent: Arc<RecentStorage>,
    /// Light peers queried by the jet fetcher.
    peers: RwLock<Vec<Node>>,
    /// Current virtual executor for abandoned-request notifications.
    executor: RwLock<Option<NodeRef>>,
    /// Jets assigned to this node but still awaiting HotRecords.
    hot_gates: DashMap<JetId, Arc<Semaphore>>,
    object_locks: DashMap<ObjectId, Arc<AsyncMutex<()>>>,
    /// Where a record ID lives: the key components we cannot recover
    /// from the ID alone. Heavy remains the authority on misses.
    record_locator: DashMap<RecordId, (JetId, PulseNumber)>,
    /// Current storage key of each object's lifeline snapshot.
    lifeline_keys: DashMap<ObjectId, Vec<u8>>,
    /// Records written per leaf jet; drives threshold splits.
    jet_counts: DashMap<JetId, usize>,
}

enum JetCheck {
    Owned(JetId),
    Redirect(Reply),
}

impl ArtifactHandler {
    pub fn new(
        origin: NodeRef,
        keypair: Arc<KeyPair>,
        settings: LedgerSettings,
        store: Arc<dyn LedgerStore>,
        bus: Arc<dyn MessageBus>,
        heavy: NodeRef,
    ) -> ArtifactHandler {
        let tree = Arc::new(JetTree::new());
        let fetcher = Arc::new(JetFetcher::new(
            tree.clone(),
            bus.clone(),
            settings.fetch_parallelism,
        ));
        let recent = Arc::new(RecentStorage::new(settings.recent_ttl_pulses));
        ArtifactHandler {
            origin,
            keypair,
            settings,
            store,
            bus,
            heavy,
            tree,
            fetcher,
            recent,
            peers: RwLock::new(Vec::new()),
            executor: RwLock::new(None),
            hot_gates: DashMap::new(),
            object_locks: DashMap::new(),
            record_locator: DashMap::new(),
            lifeline_keys: DashMap::new(),
            jet_counts: DashMap::new(),
        }
    }

    pub fn tree(&self) -> &Arc<JetTree> {
        &self.tree
    }

    pub fn fetcher(&self) -> &Arc<JetFetcher> {
        &self.fetcher
    }

    pub fn recent(&self) -> &Arc<RecentStorage> {
        &self.recent
    }

    pub fn set_peers(&self, peers: Vec<Node>) {
        *self.peers.write() = peers;
    }

    pub fn set_executor(&self, node: Option<NodeRef>) {
        *self.executor.write() = node;
    }

    /// Mark a jet as assigned to this node but not yet hydrated;
    /// requests for it block until `HotRecords` arrives.
    pub fn expect_hot_data(&self, jet: JetId) {
        self.hot_gates.insert(jet, Arc::new(Semaphore::new(0)));
    }

    /// Release the jet fetcher and every hot-data waiter.
    pub fn shutdown(&self) {
        self.fetcher.shutdown();
        for entry in self.hot_gates.iter() {
            entry.value().close();
        }
        self.hot_gates.clear();
    }

    /// Entry point for bus messages. Errors become typed `Error`
    /// replies rather than transport failures.
    pub async fn handle(&self, ctx: &ExecutionContext, message: Message) -> Reply {
        match self.dispatch(ctx, message).await {
            Ok(reply) => reply,
            Err(error) => Reply::Error(error),
        }
    }

    async fn dispatch(&self, ctx: &ExecutionContext, message: Message) -> Result<Reply, CoreError> {
        if let Some(object) = message.target_object() {
            match self.check_jet(ctx, object, &message).await? {
                JetCheck::Redirect(reply) => return Ok(reply),
                JetCheck::Owned(jet) => self.wait_for_hot_data(&jet).await,
            }
        }
        self.handle_inner(ctx, message, false).await
    }

    async fn check_jet(
        &self,
        ctx: &ExecutionContext,
        object: ObjectId,
        message: &Message,
    ) -> Result<JetCheck, CoreError> {
        let (jet, actual) = self.tree.for_object(&object, ctx.pulse);
        let jet = if actual {
            jet
        } else {
            let peers = self.peers.read().clone();
            self.fetcher.fetch_jet(object, ctx.pulse, &peers).await?
        };
        match self.tree.owner(&jet) {
            Some(owner) if owner == self.origin => Ok(JetCheck::Owned(jet)),
            owner => {
                let node = owner.unwrap_or(self.heavy);
                debug!(
                    "[Artifact] {} for jet {jet} redirected to {node}",
                    message.kind()
                );
                Ok(JetCheck::Redirect(Reply::Redirect {
                    node,
                    token: self.delegation_token(node, ctx.pulse, message),
                }))
            }
        }
    }

    async fn wait_for_hot_data(&self, jet: &JetId) {
        let gate = self.hot_gates.get(jet).map(|g| g.value().clone());
        if let Some(gate) = gate {
            // Closed by HotRecords; an already-closed gate passes
            // immediately.
            let _ = gate.acquire().await;
        }
    }

    fn delegation_token(
        &self,
        node: NodeRef,
        pulse: PulseNumber,
        message: &Message,
    ) -> DelegationToken {
        let payload = DelegationToken::signed_payload(&node, pulse, &message.hash());
        DelegationToken {
            node,
            pulse,
            signature: self.keypair.sign(&payload),
        }
    }

    async fn handle_inner(
        &self,
        ctx: &ExecutionContext,
        message: Message,
        replay: bool,
    ) -> Result<Reply, CoreError> {
        match message {
            Message::GetCode { code } => self.get_code(ctx, code).await,
            Message::GetObject {
                head,
                state,
                approved,
            } => self.get_object(ctx, head, state, approved).await,
            Message::GetDelegate { head, as_type } => {
                let index = self.ensure_lifeline(ctx, head).await?;
                let delegate = index
                    .delegates
                    .get(&as_type)
                    .copied()
                    .ok_or_else(|| CoreError::NotFound(format!("no delegate for {head}")))?;
                Ok(Reply::Delegate { head: delegate })
            }
            Message::GetChildren {
                parent,
                from_child,
                from_pulse: _,
                amount,
            } => self.get_children(ctx, parent, from_child, amount).await,
            Message::GetRequest { object, request } => {
                let record = self.load_record_or_heavy(ctx, object, request).await?;
                Ok(Reply::Request {
                    record_bytes: record.canonical(),
                })
            }
            Message::GetPendingRequests { object } => {
                let tracker = self.recent.for_jet(self.jet_of(&object, ctx.pulse));
                Ok(Reply::HasPendingRequests {
                    has: tracker.has_pending_requests(&object),
                })
            }
            Message::GetPendingRequestId { object } => {
                let tracker = self.recent.for_jet(self.jet_of(&object, ctx.pulse));
                let id = tracker
                    .oldest_pending_request(&object)
                    .ok_or_else(|| CoreError::NotFound(format!("no pending request for {object}")))?;
                Ok(Reply::Id { id })
            }
            Message::SetRecord { record_bytes } => self.set_record(ctx, &record_bytes),
            Message::UpdateObject {
                object,
                record_bytes,
                memory,
            } => self.update_object(ctx, object, &record_bytes, memory).await,
            Message::RegisterChild {
                parent,
                record_bytes,
            } => self.register_child(ctx, parent, &record_bytes).await,
            Message::SetBlob { object, memory } => {
                let id = RecordId(hash_with_tag(
                    tag::RECORD,
                    &[&ctx.pulse.to_be_bytes(), &memory],
                ));
                let jet = self.jet_of(&object, ctx.pulse);
                self.store
                    .put(entry_key(Namespace::Blob, &jet, ctx.pulse, id.as_bytes()), memory);
                Ok(Reply::Id { id })
            }
            Message::GetObjectIndex { object } => {
                let index = self.ensure_lifeline(ctx, object).await?;
                Ok(Reply::ObjectIndex {
                    index_bytes: index.encode(),
                })
            }
            Message::GetJet { object, pulse } => {
                let (jet, actual) = self.tree.for_object(&object, pulse);
                Ok(Reply::Jet { jet, actual })
            }
            Message::HotRecords(hot) => self.hot_records(hot),
            Message::JetDrop { jet, messages } => {
                if replay {
                    return Err(CoreError::Bus("nested jet drop".into()));
                }
                for inner in messages {
                    // Replayed messages skip the jet/hot-data middleware.
                    let result = Box::pin(self.handle_inner(ctx, inner, true)).await;
                    if let Err(error) = result {
                        warn!("[Artifact] jet drop replay failed for {jet}: {error}");
                    }
                }
                self.tree.update(jet, Some(self.origin), ctx.pulse);
                Ok(Reply::Ok)
            }
            Message::ValidateRecord {
                object,
                state,
                is_valid,
            } => self.validate_record(ctx, object, state, is_valid).await,
            Message::ValidationCheck {
                object,
                validated_state,
                latest_state_approved,
            } => {
                self.validation_check(ctx, object, validated_state, latest_state_approved)
                    .await
            }
            Message::AbandonedRequestsNotification { object } => {
                debug!("[Artifact] abandoned requests notified for {object}");
                Ok(Reply::Ok)
            }
        }
    }

    async fn get_code(&self, ctx: &ExecutionContext, code: RecordId) -> Result<Reply, CoreError> {
        match self.load_record(&code) {
            Ok(Record::Code { code: bytes, machine_type }) => Ok(Reply::Code { bytes, machine_type }),
            Ok(other) => Err(CoreError::InvalidState {
                from: "code".into(),
                to: format!("{:?}", other.kind()),
            }),
            Err(CoreError::NotFound(_)) => {
                let reply = self.bus.send(self.heavy, Message::GetCode { code }).await?;
                if let Reply::Code { bytes, machine_type } = &reply {
                    self.cache_record(
                        code,
                        &Record::Code {
                            code: bytes.clone(),
                            machine_type: *machine_type,
                        },
                        ctx.pulse,
                    );
                }
                Ok(reply)
            }
            Err(error) => Err(error),
        }
    }

    async fn get_object(
        &self,
        ctx: &ExecutionContext,
        head: ObjectId,
        state: Option<RecordId>,
        approved: bool,
    ) -> Result<Reply, CoreError> {
        let index = self.ensure_lifeline(ctx, head).await?;
        let state_id = match state {
            Some(id) => id,
            None => {
                let latest = if approved {
                    index.latest_state_approved
                } else {
                    index.latest_state
                };
                latest.ok_or_else(|| CoreError::NotFound(format!("{head} has no state")))?
            }
        };
        let record = self.load_record_or_heavy(ctx, head, state_id).await?;
        let reply = match record {
            Record::Activation {
                memory,
                is_prototype,
                prototype,
                ..
            } => Reply::Object {
                head,
                state: state_id,
                prototype,
                is_prototype,
                child_pointer: index.child_pointer,
                parent: index.parent,
                memory,
            },
            Record::Amend { memory, .. } => Reply::Object {
                head,
                state: state_id,
                prototype: None,
                is_prototype: false,
                child_pointer: index.child_pointer,
                parent: index.parent,
                memory,
            },
            Record::Deactivation { .. } => return Err(CoreError::Deactivated),
            other => {
                return Err(CoreError::InvalidState {
                    from: "object state".into(),
                    to: format!("{:?}", other.kind()),
                })
            }
        };
        Ok(reply)
    }

    /// Walk the child chain backward from the cursor. Children beyond
    /// the light retention window live on heavy.
    async fn get_children(
        &self,
        ctx: &ExecutionContext,
        parent: ObjectId,
        from_child: Option<RecordId>,
        amount: u32,
    ) -> Result<Reply, CoreError> {
        let index = self.ensure_lifeline(ctx, parent).await?;
        let mut cursor = from_child.or(index.child_pointer);
        let oldest_light = ctx.pulse.prev(self.settings.light_chain_limit);

        let mut refs = Vec::new();
        while let Some(id) = cursor {
            if refs.len() as u32 >= amount {
                break;
            }
            let located = self.record_locator.get(&id).map(|e| *e.value());
            let Some((_, record_pulse)) = located else {
                // Not held locally: the chain continues on heavy.
                let message = Message::GetChildren {
                    parent,
                    from_child: Some(id),
                    from_pulse: None,
                    amount: amount - refs.len() as u32,
                };
                return Ok(Reply::HeavyRedirect {
                    node: self.heavy,
                    token: self.delegation_token(self.heavy, ctx.pulse, &message),
                });
            };
            if record_pulse < oldest_light {
                let message = Message::GetChildren {
                    parent,
                    from_child: Some(id),
                    from_pulse: Some(record_pulse),
                    amount: amount - refs.len() as u32,
                };
                return Ok(Reply::HeavyRedirect {
                    node: self.heavy,
                    token: self.delegation_token(self.heavy, ctx.pulse, &message),
                });
            }
            let record = self.load_record(&id)?;
            let Record::Child { child, prev_child, .. } = record else {
                return Err(CoreError::InvalidState {
                    from: "child chain".into(),
                    to: format!("{:?}", record.kind()),
                });
            };
            refs.push(child);
            cursor = prev_child;
        }
        Ok(Reply::Children {
            refs,
            next_from: cursor,
        })
    }

    /// Persist a record computed from its canonical bytes. A duplicate
    /// write returns the same ID with no second physical write.
    fn set_record(&self, ctx: &ExecutionContext, record_bytes: &[u8]) -> Result<Reply, CoreError> {
        let record = Record::decode(record_bytes)?;
        let id = record.record_id(ctx.pulse);
        let jet = record
            .object()
            .map(|o| self.jet_of(&o, ctx.pulse))
            .unwrap_or(JetId::ROOT);

        match &record {
            Record::Request { object, .. } => {
                if self.recent.pending_count() >= self.settings.max_pending_requests {
                    return Err(CoreError::TooManyPendingRequests);
                }
                let tracker = self.recent.for_jet(jet);
                tracker.add_pending_request(*object, id, true);
                tracker.add_object(*object);
            }
            Record::Result { object, request, .. } => {
                self.recent.for_jet(jet).remove_pending_request(object, request);
            }
            _ => {}
        }

        let key = entry_key(Namespace::Record, &jet, ctx.pulse, id.as_bytes());
        if self.store.put(key, record.canonical()) {
            self.note_record_written(jet, ctx.pulse);
        } else {
            debug!("[Artifact] override write for record {id}");
        }
        self.record_locator.insert(id, (jet, ctx.pulse));
        Ok(Reply::Id { id })
    }

    async fn update_object(
        &self,
        ctx: &ExecutionContext,
        object: ObjectId,
        record_bytes: &[u8],
        memory: Vec<u8>,
    ) -> Result<Reply, CoreError> {
        let record = Record::decode(record_bytes)?;
        if !record.is_state() {
            return Err(CoreError::InvalidState {
                from: "object state".into(),
                to: format!("{:?}", record.kind()),
            });
        }
        let id = record.record_id(ctx.pulse);
        // Warm the index cache before taking the per-object lock, so no
        // lock spans the heavy round trip.
        if record.kind() != RecordKind::Activation {
            self.ensure_lifeline(ctx, object).await?;
        }

        let lock = self.object_lock(object);
        let _guard = lock.lock().await;
        let mut index = self.load_lifeline(&object).unwrap_or_default();
        index.apply_state(id, &record, ctx.pulse)?;

        let jet = self.jet_of(&object, ctx.pulse);
        if self.store.put(
            entry_key(Namespace::Record, &jet, ctx.pulse, id.as_bytes()),
            record.canonical(),
        ) {
            self.note_record_written(jet, ctx.pulse);
        }
        self.record_locator.insert(id, (jet, ctx.pulse));
        self.store.put(
            entry_key(Namespace::Blob, &jet, ctx.pulse, id.as_bytes()),
            memory.clone(),
        );
        self.save_lifeline(object, &index, ctx.pulse);
        self.recent.for_jet(jet).add_object(object);

        let (prototype, is_prototype) = match &record {
            Record::Activation {
                prototype,
                is_prototype,
                ..
            } => (*prototype, *is_prototype),
            _ => (None, false),
        };
        Ok(Reply::Object {
            head: object,
            state: id,
            prototype,
            is_prototype,
            child_pointer: index.child_pointer,
            parent: index.parent,
            memory,
        })
    }

    async fn register_child(
        &self,
        ctx: &ExecutionContext,
        parent: ObjectId,
        record_bytes: &[u8],
    ) -> Result<Reply, CoreError> {
        let record = Record::decode(record_bytes)?;
        let id = record.record_id(ctx.pulse);
        self.ensure_lifeline(ctx, parent).await?;

        let lock = self.object_lock(parent);
        let _guard = lock.lock().await;
        let mut index = self.load_lifeline(&parent).unwrap_or_default();
        index.apply_child(id, &record, ctx.pulse)?;

        let jet = self.jet_of(&parent, ctx.pulse);
        if self.store.put(
            entry_key(Namespace::Record, &jet, ctx.pulse, id.as_bytes()),
            record.canonical(),
        ) {
            self.note_record_written(jet, ctx.pulse);
        }
        self.record_locator.insert(id, (jet, ctx.pulse));
        self.save_lifeline(parent, &index, ctx.pulse);
        Ok(Reply::Id { id })
    }

    /// Hydrate a jet handed over by its previous owner.
    fn hot_records(&self, hot: HotData) -> Result<Reply, CoreError> {
        let HotData {
            jet,
            drop_bytes,
            recent_objects,
            pending_requests,
            pulse,
        } = hot;
        if !self.store.put(drop_key(&jet, pulse), drop_bytes) {
            debug!("[Artifact] drop for {jet} at {pulse} already present");
        }

        let tracker = self.recent.for_jet(jet);
        for pending in pending_requests {
            // Carried-over requests are abandoned work: kept, inactive,
            // and their executor is notified.
            tracker.add_pending_request(pending.object, pending.request, false);
            self.notify_abandoned(pending.object);
        }
        for entry in recent_objects {
            let index = ObjectLifeline::decode(&entry.index_bytes)?;
            self.save_lifeline(entry.object, &index, pulse);
            tracker.add_object_with_ttl(entry.object, entry.ttl_pulses);
        }

        self.tree.update(jet, Some(self.origin), pulse);
        if let Some((_, gate)) = self.hot_gates.remove(&jet) {
            gate.close();
        }
        self.fetcher.release_jet(jet, pulse);
        Ok(Reply::Ok)
    }

    async fn validate_record(
        &self,
        ctx: &ExecutionContext,
        object: ObjectId,
        state: RecordId,
        is_valid: bool,
    ) -> Result<Reply, CoreError> {
        if !is_valid {
            warn!("[Artifact] validation rejected state {state} of {object}");
            return Ok(Reply::NotOk);
        }
        self.ensure_lifeline(ctx, object).await?;
        let lock = self.object_lock(object);
        let _guard = lock.lock().await;
        let mut index = self.load_lifeline(&object)?;
        index.latest_state_approved = Some(state);
        self.save_lifeline(object, &index, ctx.pulse);
        Ok(Reply::Ok)
    }

    async fn validation_check(
        &self,
        ctx: &ExecutionContext,
        object: ObjectId,
        validated_state: RecordId,
        latest_state_approved: Option<RecordId>,
    ) -> Result<Reply, CoreError> {
        let index = self.ensure_lifeline(ctx, object).await?;
        if latest_state_approved != index.latest_state_approved {
            return Ok(Reply::NotOk);
        }
        match self.load_record(&validated_state) {
            Ok(record) if record.prev_state() == index.latest_state_approved => Ok(Reply::Ok),
            Ok(_) => Ok(Reply::NotOk),
            Err(CoreError::NotFound(_)) => Ok(Reply::NotOk),
            Err(error) => Err(error),
        }
    }

    fn notify_abandoned(&self, object: ObjectId) {
        let Some(executor) = *self.executor.read() else {
            return;
        };
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(error) = bus
                .send(executor, Message::AbandonedRequestsNotification { object })
                .await
            {
                warn!("[Artifact] abandoned notification for {object} failed: {error}");
            }
        });
    }

    fn jet_of(&self, object: &ObjectId, pulse: PulseNumber) -> JetId {
        self.tree.for_object(object, pulse).0
    }

    /// Count a record written into `jet` and split the leaf once its
    /// population crosses the threshold. Both children keep this node
    /// as owner; records land in the finer leaves from here on.
    fn note_record_written(&self, jet: JetId, pulse: PulseNumber) {
        let split = {
            let mut count = self.jet_counts.entry(jet).or_insert(0);
            *count += 1;
            *count >= self.settings.jet_split_threshold
        };
        if !split {
            return;
        }
        self.jet_counts.remove(&jet);
        match self.tree.split(jet, pulse) {
            Ok((left, right)) => {
                debug!("[Artifact] jet {jet} split into {left} and {right}");
            }
            Err(error) => warn!("[Artifact] split of {jet} failed: {error}"),
        }
    }

    fn object_lock(&self, object: ObjectId) -> Arc<AsyncMutex<()>> {
        self.object_locks
            .entry(object)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn load_record(&self, id: &RecordId) -> Result<Record, CoreError> {
        let (jet, pulse) = self
            .record_locator
            .get(id)
            .map(|e| *e.value())
            .ok_or_else(|| CoreError::NotFound(format!("record {id}")))?;
        let key = entry_key(Namespace::Record, &jet, pulse, id.as_bytes());
        let bytes = self
            .store
            .get(&key)
            .ok_or_else(|| CoreError::NotFound(format!("record {id}")))?;
        Record::decode(&bytes)
    }

    /// Local read with heavy fallback; a fetched record is cached
    /// before being returned.
    async fn load_record_or_heavy(
        &self,
        ctx: &ExecutionContext,
        object: ObjectId,
        id: RecordId,
    ) -> Result<Record, CoreError> {
        match self.load_record(&id) {
            Ok(record) => Ok(record),
            Err(CoreError::NotFound(_)) => {
                let reply = self
                    .bus
                    .send(self.heavy, Message::GetRequest { object, request: id })
                    .await?;
                let Reply::Request { record_bytes } = reply else {
                    return Err(CoreError::NotFound(format!("record {id}")));
                };
                let record = Record::decode(&record_bytes)?;
                self.cache_record(id, &record, ctx.pulse);
                Ok(record)
            }
            Err(error) => Err(error),
        }
    }

    fn cache_record(&self, id: RecordId, record: &Record, pulse: PulseNumber) {
        let jet = record
            .object()
            .map(|o| self.jet_of(&o, pulse))
            .unwrap_or(JetId::ROOT);
        self.store.put(
            entry_key(Namespace::Record, &jet, pulse, id.as_bytes()),
            record.canonical(),
        );
        self.record_locator.insert(id, (jet, pulse));
    }

    fn load_lifeline(&self, object: &ObjectId) -> Result<ObjectLifeline, CoreError> {
        let key = self
            .lifeline_keys
            .get(object)
            .map(|e| e.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("lifeline of {object}")))?;
        let bytes = self
            .store
            .get(&key)
            .ok_or_else(|| CoreError::NotFound(format!("lifeline of {object}")))?;
        ObjectLifeline::decode(&bytes)
    }

    /// Local read with heavy fallback for the object index.
    async fn ensure_lifeline(
        &self,
        ctx: &ExecutionContext,
        object: ObjectId,
    ) -> Result<ObjectLifeline, CoreError> {
        match self.load_lifeline(&object) {
            Ok(index) => Ok(index),
            Err(CoreError::NotFound(_)) => {
                let reply = self
                    .bus
                    .send(self.heavy, Message::GetObjectIndex { object })
                    .await?;
                let Reply::ObjectIndex { index_bytes } = reply else {
                    return Err(CoreError::NotFound(format!("lifeline of {object}")));
                };
                let index = ObjectLifeline::decode(&index_bytes)?;
                self.save_lifeline(object, &index, ctx.pulse);
                Ok(index)
            }
            Err(error) => Err(error),
        }
    }

    /// Store a lifeline snapshot keyed at `pulse`; older snapshots stay
    /// in place as replication history.
    fn save_lifeline(&self, object: ObjectId, index: &ObjectLifeline, pulse: PulseNumber) {
        let jet = self.jet_of(&object, pulse);
        let key = entry_key(Namespace::Lifeline, &jet, pulse, object.as_bytes());
        self.store.set(key.clone(), index.encode());
        self.lifeline_keys.insert(object, key);
    }
}
