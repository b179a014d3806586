//! Shared fixtures: an in-process host with scriptable behavior, and a
//! transport that can be counted, recorded and taken offline.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

use idsync_core::attributes::decode_attributes;
use idsync_core::cache::TtlAttributeCache;
use idsync_core::packet::{
    AuditEntry, Codec, DeclaredError, Method, MethodKind, Principal, Reply, ResponseAudit,
    StateSnapshot,
};
use idsync_core::transport::{LoopbackTransport, Transport};
use idsync_core::{
    Action, ActionRecord, ActionRegistry, Clock, HostEndpoint, HostKeypair, HostPublicKeys,
    Identity, MemoryErrorLedger, MethodHandler, ModuleId, PacketErrorKind, PairKey, ReplayGuard,
    Service, SetAttribute, StaticResolver, Storage, Subject, SyncConfig, SyncContext, SyncError,
    SyncResult, Timestamp,
};
use idsync_core::types::{ActionId, HostId};

pub const HOST: &str = "id.example.org";

/// Long enough that nothing expires during a test, even with a manual clock.
const TEST_CACHE_TTL_MS: i64 = 365 * 24 * 60 * 60 * 1_000;

/// Install a test subscriber once; honors RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast backoff and a short shutdown wait.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 200,
        shutdown_timeout_ms: 2_000,
        ..SyncConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Blocks action handling until opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    waiting: usize,
}

impl Gate {
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn open(&self) {
        self.state.lock().closed = false;
        self.changed.notify_all();
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        self.changed.notify_all();
        while state.closed {
            self.changed.wait(&mut state);
        }
        state.waiting -= 1;
        self.changed.notify_all();
    }
}

/// An action the host accepted.
#[derive(Debug, Clone)]
pub struct Logged {
    pub time: Timestamp,
    pub pair: PairKey,
    pub record: ActionRecord,
    pub bytes: Vec<u8>,
}

/// Host-side method handler that applies actions to its own store.
pub struct MockHost {
    storage: Storage,
    registry: ActionRegistry,
    clock: Arc<dyn Clock>,
    log: Mutex<Vec<Logged>>,
    last_time: Mutex<Timestamp>,
    refused: Mutex<HashSet<String>>,
    pub gate: Gate,
    delay: Mutex<Duration>,
    active: Mutex<HashMap<PairKey, usize>>,
    peak: Mutex<HashMap<PairKey, usize>>,
    state_queries: AtomicUsize,
}

struct ActiveGuard<'a> {
    host: &'a MockHost,
    pair: PairKey,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.host.active.lock().get_mut(&self.pair) {
            *count -= 1;
        }
    }
}

impl MockHost {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            registry: ActionRegistry::with_builtins(),
            clock,
            log: Mutex::new(Vec::new()),
            last_time: Mutex::new(0),
            refused: Mutex::new(HashSet::new()),
            gate: Gate::default(),
            delay: Mutex::new(Duration::ZERO),
            active: Mutex::new(HashMap::new()),
            peak: Mutex::new(HashMap::new()),
            state_queries: AtomicUsize::new(0),
        }
    }

    /// Refuse any attribute set to `value`.
    pub fn refuse_value(&self, value: &str) {
        self.refused.lock().insert(value.to_string());
    }

    /// Time spent on each action, to widen overlap windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn log(&self) -> Vec<Logged> {
        self.log.lock().clone()
    }

    /// Values of the attribute sets the host accepted on `pair`, in order.
    pub fn accepted_values(&self, pair: &PairKey) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|entry| &entry.pair == pair)
            .filter_map(|entry| {
                let action = self.registry.decode(&entry.record).ok()?;
                let set = action.as_any().downcast_ref::<SetAttribute>()?;
                Some(set.value.clone())
            })
            .collect()
    }

    pub fn attribute(&self, pair: &PairKey, module: &str, key: &str) -> Option<String> {
        let bytes = self.storage.module(pair, &ModuleId::new(module)).ok()??;
        decode_attributes(&bytes).ok()?.get(key).cloned()
    }

    /// Most senders ever seen at once on `pair`.
    pub fn peak_concurrency(&self, pair: &PairKey) -> usize {
        self.peak.lock().get(pair).copied().unwrap_or(0)
    }

    pub fn state_queries(&self) -> usize {
        self.state_queries.load(Ordering::SeqCst)
    }

    /// Apply an action as if another client of the same identity had sent it.
    pub fn apply_foreign(&self, mut action: Box<dyn Action>) -> SyncResult<()> {
        let pair = action.pair().clone();
        self.storage.write(|txn| action.execute_locally(txn))?;
        let record = ActionRecord::capture(ActionId::new(), action.as_ref())?;
        let bytes = record.encode()?;
        self.append(pair, record, bytes);
        Ok(())
    }

    fn append(&self, pair: PairKey, record: ActionRecord, bytes: Vec<u8>) {
        let time = {
            let mut last = self.last_time.lock();
            *last = self.clock.now().max(*last + 1);
            *last
        };
        self.log.lock().push(Logged {
            time,
            pair,
            record,
            bytes,
        });
    }

    fn watermark(&self) -> Timestamp {
        self.clock.now().max(*self.last_time.lock())
    }

    fn enter(&self, pair: &PairKey) -> ActiveGuard<'_> {
        let mut active = self.active.lock();
        let count = active.entry(pair.clone()).or_insert(0);
        *count += 1;
        let mut peak = self.peak.lock();
        let seen = peak.entry(pair.clone()).or_insert(0);
        *seen = (*seen).max(*count);
        ActiveGuard {
            host: self,
            pair: pair.clone(),
        }
    }

    fn apply(&self, pair: &PairKey, method: &Method) -> Result<Option<Reply>, DeclaredError> {
        let _active = self.enter(pair);
        self.gate.pass();
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let content = |e: SyncError| DeclaredError::new(PacketErrorKind::Content, e.to_string());
        let record = ActionRecord::decode(&method.payload).map_err(content)?;
        let mut action = self.registry.decode(&record).map_err(content)?;

        if let Some(set) = action.as_any().downcast_ref::<SetAttribute>() {
            if self.refused.lock().contains(&set.value) {
                return Err(DeclaredError::new(
                    PacketErrorKind::Content,
                    format!("{} may not be set to {}", set.key, set.value),
                ));
            }
        }
        self.storage
            .write(|txn| action.execute_locally(txn))
            .map_err(content)?;
        self.append(pair.clone(), record, method.payload.clone());

        if method.accepts_null_reply {
            Ok(None)
        } else {
            Ok(Some(Reply::empty(method.kind)))
        }
    }

    fn snapshot(&self, pair: &PairKey) -> Result<Option<Reply>, DeclaredError> {
        self.state_queries.fetch_add(1, Ordering::SeqCst);
        let modules = self
            .storage
            .modules(pair)
            .map_err(|e| DeclaredError::new(PacketErrorKind::Content, e.to_string()))?;
        let snapshot = StateSnapshot {
            time: self.watermark(),
            modules,
        };
        let payload = postcard::to_allocvec(&snapshot)
            .map_err(|e| DeclaredError::new(PacketErrorKind::Content, e.to_string()))?;
        Ok(Some(Reply::new(MethodKind::StateQuery, payload)))
    }
}

impl MethodHandler for MockHost {
    fn handle(
        &self,
        subject: &Subject,
        _principal: &Principal,
        method: &Method,
    ) -> Result<Option<Reply>, DeclaredError> {
        let Subject::Entity(identity) = subject else {
            return Err(DeclaredError::new(PacketErrorKind::Method, "not an entity"));
        };
        let pair = PairKey::new(identity.clone(), method.service.clone());
        match method.kind {
            MethodKind::Action | MethodKind::AccountOpen => self.apply(&pair, method),
            MethodKind::StateQuery => self.snapshot(&pair),
            other => Err(DeclaredError::new(
                PacketErrorKind::Method,
                format!("{} is not supported", other),
            )),
        }
    }

    fn audit(
        &self,
        identity: &Identity,
        service: &Service,
        since: Timestamp,
        own: &[Method],
    ) -> ResponseAudit {
        let pair = PairKey::new(identity.clone(), service.clone());
        let own: HashSet<&[u8]> = own.iter().map(|m| m.payload.as_slice()).collect();
        let log = self.log.lock();
        let foreign: Vec<&Logged> = log
            .iter()
            .filter(|entry| entry.pair == pair && entry.time > since)
            .filter(|entry| !own.contains(entry.bytes.as_slice()))
            .collect();

        let modules: BTreeSet<ModuleId> = foreign
            .iter()
            .filter_map(|entry| entry.record.module.clone())
            .collect();
        ResponseAudit {
            time: self.watermark(),
            entries: foreign
                .iter()
                .map(|entry| AuditEntry {
                    time: entry.time,
                    record: entry.bytes.clone(),
                })
                .collect(),
            state_mutated: !modules.is_empty(),
            modules,
        }
    }
}

/// Loopback transport with an exchange counter, a frame recorder and an
/// offline switch.
#[derive(Default)]
pub struct TestTransport {
    pub inner: LoopbackTransport,
    exchanges: AtomicUsize,
    offline: AtomicBool,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl TestTransport {
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }
}

impl Transport for TestTransport {
    fn exchange(&self, host: &HostId, request: &[u8]) -> SyncResult<Vec<u8>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Network(format!("{} unreachable", host)));
        }
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.frames.lock().push(request.to_vec());
        self.inner.exchange(host, request)
    }
}

/// One host, one client store and everything wired between them.
pub struct Harness {
    pub host_id: HostId,
    pub host: Arc<MockHost>,
    pub endpoint: Arc<HostEndpoint>,
    pub host_keys: HostPublicKeys,
    pub resolver: Arc<StaticResolver>,
    pub transport: Arc<TestTransport>,
    pub cache: Arc<TtlAttributeCache>,
    pub ledger: Arc<MemoryErrorLedger>,
    pub clock: Arc<dyn Clock>,
    pub storage: Storage,
    _dir: TempDir,
}

impl Harness {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_host_config(clock, test_config())
    }

    pub fn with_host_config(clock: Arc<dyn Clock>, host_config: SyncConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let host_storage = Storage::new(dir.path().join("host.redb")).unwrap();
        let storage = Storage::new(dir.path().join("client.redb")).unwrap();

        let host_id = HostId::new(HOST);
        let keys = Arc::new(HostKeypair::generate().unwrap());
        let host_keys = keys.public_keys();
        let host = Arc::new(MockHost::new(host_storage.clone(), clock.clone()));
        let resolver = Arc::new(StaticResolver::new());
        let replay = Arc::new(ReplayGuard::new(host_storage, clock.clone(), &host_config));
        let endpoint = Arc::new(HostEndpoint::new(
            host_id.clone(),
            keys,
            Codec::new(replay, &host_config),
            &host_config,
            resolver.clone(),
            host.clone(),
        ));

        let transport = Arc::new(TestTransport::default());
        transport.inner.register(host_id.clone(), endpoint.clone());

        Self {
            host_id,
            host,
            endpoint,
            host_keys,
            resolver,
            transport,
            cache: Arc::new(TtlAttributeCache::new(TEST_CACHE_TTL_MS, clock.clone())),
            ledger: Arc::new(MemoryErrorLedger::new()),
            clock,
            storage,
            _dir: dir,
        }
    }

    /// Serve `pair` from this host and tell the client where it lives.
    pub fn serve(&self, pair: &PairKey) {
        self.resolver
            .serve(&pair.identity, &[pair.service.as_str()]);
        self.cache.insert_service_host(pair, self.host_id.clone());
    }

    /// Skip the bootstrap key query by trusting the host keys up front.
    pub fn trust_host_keys(&self) {
        self.cache
            .insert_host_keys(&self.host_id, self.host_keys.clone());
    }

    pub fn context(&self, config: SyncConfig) -> Arc<SyncContext> {
        SyncContext::builder(config, self.storage.clone())
            .clock(self.clock.clone())
            .cache(self.cache.clone())
            .transport(self.transport.clone())
            .ledger(self.ledger.clone())
            .build()
            .unwrap()
    }

    /// The client's local value of an attribute.
    pub fn local_attribute(&self, pair: &PairKey, module: &str, key: &str) -> Option<String> {
        let bytes = self.storage.module(pair, &ModuleId::new(module)).ok()??;
        decode_attributes(&bytes).ok()?.get(key).cloned()
    }
}
