//! Process-scoped state shared by the synchronizer, its senders and
//! outgoing requests.
//!
//! Everything that would otherwise be global (suspension tokens, key
//! leases, credentials) lives in one [`SyncContext`] built at startup and
//! dropped at shutdown.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::action::{Action, ActionRecord, ActionRegistry};
use crate::cache::{AttributeCache, AttributeKind, AttributeValue, TtlAttributeCache};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Credentials, HostPublicKeys};
use crate::ledger::{ErrorLedger, LedgerEntry, MemoryErrorLedger};
use crate::packet::{Codec, KeyLeases, ReplayGuard, Request};
use crate::storage::Storage;
use crate::sync::{ShutdownSignal, SuspensionTokens};
use crate::transport::{TcpTransport, Transport};
use crate::types::HostId;

/// Lifetime of cached attributes when no cache is supplied.
const DEFAULT_ATTRIBUTE_TTL_MS: i64 = 60 * 60 * 1_000;

pub struct SyncContext {
    pub config: SyncConfig,
    pub clock: Arc<dyn Clock>,
    pub storage: Storage,
    pub cache: Arc<dyn AttributeCache>,
    pub codec: Codec,
    pub leases: KeyLeases,
    pub credentials: Credentials,
    pub tokens: Arc<SuspensionTokens>,
    pub ledger: Arc<dyn ErrorLedger>,
    pub transport: Arc<dyn Transport>,
    pub registry: ActionRegistry,
    pub shutdown: Arc<ShutdownSignal>,
}

impl SyncContext {
    pub fn builder(config: SyncConfig, storage: Storage) -> SyncContextBuilder {
        SyncContextBuilder {
            config,
            storage,
            clock: None,
            cache: None,
            transport: None,
            ledger: None,
            registry: None,
        }
    }

    /// Public keys of `host`, fetched with the plaintext bootstrap query
    /// and cached when not already known.
    pub fn host_keys(&self, host: &HostId) -> SyncResult<HostPublicKeys> {
        if let Ok(keys) = self.cache.host_keys(host) {
            return Ok(keys);
        }

        debug!(%host, "Fetching host keys");
        let response = Request::host_keys_query(host.clone())
            .send(self, self.config.verify_responses)?;
        let reply = response
            .check_reply(0)?
            .ok_or_else(|| SyncError::Attribute(format!("{} sent no keys", host)))?;
        let keys: HostPublicKeys = postcard::from_bytes(&reply.payload)
            .map_err(|e| SyncError::Serialization(format!("Invalid host keys: {}", e)))?;

        self.cache.put(
            &host.as_identity(),
            None,
            AttributeKind::HostKeys,
            AttributeValue::HostKeys(keys.clone()),
        );
        info!(%host, "Learned host keys");
        Ok(keys)
    }

    /// Run a local-only action on a detached thread.
    pub fn dispatch_local(&self, mut action: Box<dyn Action>) {
        let storage = self.storage.clone();
        let tag = action.type_tag();
        let spawned = std::thread::Builder::new()
            .name("idsync-local".to_string())
            .spawn(move || {
                if let Err(e) = storage.write(|txn| action.execute_locally(txn)) {
                    warn!(action = action.type_tag(), error = %e, "Local action failed");
                }
            });
        if let Err(e) = spawned {
            warn!(action = tag, error = %e, "Could not dispatch local action");
        }
    }

    /// Write a failed action to the error ledger.
    pub fn record_failure(&self, record: &ActionRecord, kind: &str, message: &str) {
        let entry = LedgerEntry::new(
            record.pair.identity.clone(),
            record.pair.service.clone(),
            record.id,
            record.type_tag.clone(),
            kind,
            message,
        );
        if let Err(e) = self.ledger.record(entry) {
            warn!(action = %record.id, error = %e, "Failed to write error ledger");
        }
    }
}

pub struct SyncContextBuilder {
    config: SyncConfig,
    storage: Storage,
    clock: Option<Arc<dyn Clock>>,
    cache: Option<Arc<dyn AttributeCache>>,
    transport: Option<Arc<dyn Transport>>,
    ledger: Option<Arc<dyn ErrorLedger>>,
    registry: Option<ActionRegistry>,
}

impl SyncContextBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn AttributeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn ErrorLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> SyncResult<Arc<SyncContext>> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(TtlAttributeCache::new(DEFAULT_ATTRIBUTE_TTL_MS, clock.clone()))
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new(&self.config)));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryErrorLedger::new()));

        let replay = Arc::new(ReplayGuard::new(
            self.storage.clone(),
            clock.clone(),
            &self.config,
        ));

        Ok(Arc::new(SyncContext {
            codec: Codec::new(replay, &self.config),
            leases: KeyLeases::new(self.config.key_lease_period_ms, clock.clone()),
            credentials: Credentials::new(clock.clone()),
            tokens: Arc::new(SuspensionTokens::new()),
            registry: self.registry.unwrap_or_else(ActionRegistry::with_builtins),
            shutdown: Arc::new(ShutdownSignal::new()),
            config: self.config,
            clock,
            storage: self.storage,
            cache,
            ledger,
            transport,
        }))
    }
}
