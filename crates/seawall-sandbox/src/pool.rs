//! Per-plugin instance pools.
//!
//! A [`VmPool`] owns a single actor task that exclusively holds the
//! `available` / `in-use` slot sets for one plugin.  `acquire`, `release` and
//! `ignore` are all messages into that task, so admission decisions and set
//! mutations are serialized by construction and no locking is layered on
//! top.
//!
//! # Admission
//!
//! Every admission action re-reads the plugin's configuration from the
//! [`PluginConfigSource`]: a missing config tears the pool down, a changed
//! content hash hot-swaps every existing slot.  When no slot is available
//! and capacity remains, instance creation runs single-flight on a blocking
//! thread and reports back as a message, so a large first-use compile never
//! stalls the admission pipeline.
//!
//! # Fairness
//!
//! Acquisitions that were already blocked once wait on a priority lane that
//! is drained ahead of the plain lane at a 99:1 ratio: blocked callers are
//! not starved, and fresh callers still make progress.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use wasmtime::Engine;

use crate::config::{PluginConfig, PluginConfigSource};
use crate::error::{Result, SandboxError};
use crate::instance::SandboxInstance;
use crate::lease::SlotLease;
use crate::slot::{CorruptionPolicy, VmSlot};
use crate::template::TemplateCache;

/// Options applied when an acquired slot is handed to the caller.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Export invoked once per slot lifetime before the first call, e.g. a
    /// plugin's `_start`-style setup function.
    pub start_function: Option<String>,
}

impl InitOptions {
    /// No initialization.
    pub fn none() -> Self {
        Self::default()
    }

    /// Run `function` once per fresh slot before it is used.
    pub fn with_start_function(function: impl Into<String>) -> Self {
        Self {
            start_function: Some(function.into()),
        }
    }
}

/// Snapshot of a pool's state, for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots ready to be checked out.
    pub available: usize,
    /// Slots currently checked out.
    pub in_use: usize,
    /// Acquisitions waiting in either lane.
    pub pending: usize,
    /// Whether an instance creation is in flight.
    pub creating: bool,
}

/// A caller's outstanding acquisition with its write-once result slot.
struct PendingAcquisition {
    reply: oneshot::Sender<Result<Arc<VmSlot>>>,
}

/// Messages into the pool actor.
enum PoolMessage {
    Acquire {
        reply: oneshot::Sender<Result<Arc<VmSlot>>>,
    },
    Release {
        slot: Arc<VmSlot>,
    },
    Ignore {
        slot: Arc<VmSlot>,
    },
    SlotCreated {
        result: Result<Arc<VmSlot>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown,
}

/// Handle to one plugin's instance pool.
///
/// Cheaply cloneable; all state lives in the actor task.
#[derive(Clone)]
pub struct VmPool {
    plugin_id: String,
    tx: mpsc::UnboundedSender<PoolMessage>,
}

impl VmPool {
    /// Spawn the pool actor for `plugin_id`.
    ///
    /// `pools` is the registry's shared map; the actor removes its own entry
    /// when the plugin's configuration disappears.
    pub(crate) fn spawn(
        plugin_id: String,
        source: Arc<dyn PluginConfigSource>,
        engine: Engine,
        templates: Arc<TemplateCache>,
        policy: CorruptionPolicy,
        pools: Arc<DashMap<String, VmPool>>,
    ) -> VmPool {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = VmPool {
            plugin_id: plugin_id.clone(),
            tx: tx.clone(),
        };

        let task = PoolTask {
            plugin_id,
            source,
            engine,
            templates,
            policy,
            pools,
            available: VecDeque::new(),
            in_use: HashMap::new(),
            plain: VecDeque::new(),
            priority: VecDeque::new(),
            creating: false,
            creation_waiter: None,
            last_hash: None,
            next_index: 0,
            admissions: 0,
            closed: false,
            tx,
            rx,
        };
        tokio::spawn(task.run());

        pool
    }

    /// Identifier of the plugin this pool serves.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Acquire a slot, waiting until one is available.
    ///
    /// Never fails synchronously; the request is resolved by the pool's
    /// sequential admission processing.  Callers that need a timeout apply
    /// their own around this future and treat expiry as abandonment.
    pub async fn acquire(&self, options: InitOptions) -> Result<SlotLease> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PoolMessage::Acquire { reply })
            .map_err(|_| SandboxError::PoolClosed)?;
        let slot = response.await.map_err(|_| SandboxError::PoolClosed)??;

        let lease = SlotLease::new(slot, self.clone());
        if let Some(function) = options.start_function {
            let outcome = lease.initialize_once(&function).await;
            if let Err(e) = outcome {
                lease.release();
                return Err(e);
            }
        }
        Ok(lease)
    }

    /// Return a slot to the pool (or destroy it if flagged for retirement).
    pub(crate) fn release_slot(&self, slot: Arc<VmSlot>) {
        let _ = self.tx.send(PoolMessage::Release { slot });
    }

    /// Drop a slot from the in-use set without returning or destroying it.
    pub(crate) fn ignore_slot(&self, slot: Arc<VmSlot>) {
        let _ = self.tx.send(PoolMessage::Ignore { slot });
    }

    /// Snapshot of the pool's current state.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PoolMessage::Stats { reply })
            .map_err(|_| SandboxError::PoolClosed)?;
        response.await.map_err(|_| SandboxError::PoolClosed)
    }

    /// Destroy all slots and fail every pending acquisition.
    pub fn shutdown(&self) {
        let _ = self.tx.send(PoolMessage::Shutdown);
    }
}

/// Outcome of one admission attempt.
enum Admission {
    /// Request fulfilled or moved aside; keep processing the lanes.
    Continue,
    /// Request requeued onto the priority lane; nothing will change until
    /// the next message, stop processing.
    Blocked,
    /// Pool torn down.
    Stop,
}

/// The actor that exclusively owns a pool's state.
struct PoolTask {
    plugin_id: String,
    source: Arc<dyn PluginConfigSource>,
    engine: Engine,
    templates: Arc<TemplateCache>,
    policy: CorruptionPolicy,
    pools: Arc<DashMap<String, VmPool>>,

    available: VecDeque<Arc<VmSlot>>,
    in_use: HashMap<u64, Arc<VmSlot>>,
    plain: VecDeque<PendingAcquisition>,
    priority: VecDeque<PendingAcquisition>,
    creating: bool,
    /// The acquisition that triggered the in-flight creation; the only one
    /// failed if creation fails.
    creation_waiter: Option<PendingAcquisition>,
    last_hash: Option<String>,
    next_index: u64,
    /// Admission counter driving the 99:1 lane ratio.
    admissions: u64,
    closed: bool,

    tx: mpsc::UnboundedSender<PoolMessage>,
    rx: mpsc::UnboundedReceiver<PoolMessage>,
}

impl PoolTask {
    async fn run(mut self) {
        tracing::debug!(plugin = %self.plugin_id, "pool started");
        while let Some(message) = self.rx.recv().await {
            match message {
                PoolMessage::Acquire { reply } => {
                    self.plain.push_back(PendingAcquisition { reply });
                    self.process_admissions().await;
                }
                PoolMessage::Release { slot } => {
                    self.handle_release(slot);
                    self.process_admissions().await;
                }
                PoolMessage::Ignore { slot } => {
                    self.in_use.remove(&slot.index());
                    tracing::debug!(plugin = %self.plugin_id, slot = slot.index(), "slot ignored");
                    self.process_admissions().await;
                }
                PoolMessage::SlotCreated { result } => {
                    self.handle_created(result);
                    self.process_admissions().await;
                }
                PoolMessage::Stats { reply } => {
                    let _ = reply.send(PoolStats {
                        available: self.available.len(),
                        in_use: self.in_use.len(),
                        pending: self.plain.len() + self.priority.len(),
                        creating: self.creating,
                    });
                }
                PoolMessage::Shutdown => {
                    self.teardown(SandboxError::PoolClosed);
                }
            }
            if self.closed {
                break;
            }
        }
        tracing::debug!(plugin = %self.plugin_id, "pool stopped");
    }

    /// Drain the admission lanes, one action at a time, until a request
    /// blocks or the lanes are empty.
    async fn process_admissions(&mut self) {
        while let Some(pending) = self.next_pending() {
            match self.admit_one(pending).await {
                Admission::Continue => continue,
                Admission::Blocked | Admission::Stop => break,
            }
        }
    }

    /// Pick the next acquisition to admit: priority lane first, except every
    /// 100th admission services the plain lane so fresh callers are never
    /// starved behind a permanently refilling priority lane.
    fn next_pending(&mut self) -> Option<PendingAcquisition> {
        self.admissions += 1;
        if self.admissions % 100 == 0
            && let Some(pending) = self.plain.pop_front()
        {
            return Some(pending);
        }
        self.priority
            .pop_front()
            .or_else(|| self.plain.pop_front())
    }

    /// Execute one admission action for `pending`.
    async fn admit_one(&mut self, pending: PendingAcquisition) -> Admission {
        // Config is read fresh on every action; external updates are
        // observed within one admission cycle.
        let Some(config) = self.source.config_for(&self.plugin_id).await else {
            let _ = pending.reply.send(Err(SandboxError::ConfigMissing {
                plugin_id: self.plugin_id.clone(),
            }));
            self.teardown(SandboxError::ConfigMissing {
                plugin_id: self.plugin_id.clone(),
            });
            return Admission::Stop;
        };

        let hash = config.content_hash();
        if self.last_hash.as_deref() != Some(hash.as_str()) {
            if self.last_hash.is_some() {
                self.hot_swap();
            }
            self.last_hash = Some(hash.clone());
        }

        if self.available.is_empty() {
            if self.creating || self.at_capacity(&config) {
                self.priority.push_back(pending);
                return Admission::Blocked;
            }
            self.begin_creation(config, hash, pending);
            return Admission::Continue;
        }

        // A slot is available: move it to in-use and fulfill the request.
        // The pop is guarded by the emptiness check above.
        if let Some(slot) = self.available.pop_front() {
            self.in_use.insert(slot.index(), Arc::clone(&slot));
            if let Err(unclaimed) = pending.reply.send(Ok(slot)) {
                // Caller abandoned the acquisition; put the slot back.
                if let Ok(slot) = unclaimed {
                    self.in_use.remove(&slot.index());
                    self.available.push_back(slot);
                }
            }
        }
        Admission::Continue
    }

    fn at_capacity(&self, config: &PluginConfig) -> bool {
        self.available.len() + self.in_use.len() >= config.instance_count.max(1)
    }

    /// Start single-flight creation of a new slot on a blocking thread.
    ///
    /// `pending` waits aside as the creation waiter: it is the only request
    /// failed if compilation or instantiation fails.
    fn begin_creation(&mut self, config: Arc<PluginConfig>, hash: String, pending: PendingAcquisition) {
        self.creating = true;
        self.creation_waiter = Some(pending);

        let index = self.next_index;
        self.next_index += 1;

        let engine = self.engine.clone();
        let templates = Arc::clone(&self.templates);
        let policy = self.policy.clone();
        let tx = self.tx.clone();
        let plugin_id = self.plugin_id.clone();

        tracing::debug!(plugin = %plugin_id, slot = index, hash = %hash, "creating slot");

        tokio::task::spawn_blocking(move || {
            let result = templates
                .get_or_compile(&engine, &hash, &config.source_bytes)
                .and_then(|template| SandboxInstance::new(&engine, &template, &config))
                .map(|instance| {
                    VmSlot::spawn(index, hash, config.call_budget, instance, policy)
                });
            // The actor clears the single-flight guard when this message
            // arrives, on success and on failure alike.
            let _ = tx.send(PoolMessage::SlotCreated { result });
        });
    }

    /// Creation finished: clear the single-flight guard and route the result.
    fn handle_created(&mut self, result: Result<Arc<VmSlot>>) {
        self.creating = false;
        let waiter = self.creation_waiter.take();

        match result {
            Ok(slot) => {
                tracing::debug!(plugin = %self.plugin_id, slot = slot.index(), "slot ready");
                // Slots built for an already-superseded config are destroyed
                // on arrival; the waiter re-enters admission and triggers a
                // fresh creation.
                if self.last_hash.as_deref() == Some(slot.config_hash()) {
                    self.available.push_back(slot);
                } else {
                    slot.submit_destroy();
                }
                if let Some(waiter) = waiter {
                    self.priority.push_front(waiter);
                }
            }
            Err(e) => {
                tracing::warn!(plugin = %self.plugin_id, error = %e, "slot creation failed");
                if let Some(waiter) = waiter {
                    let _ = waiter.reply.send(Err(e));
                }
            }
        }
    }

    fn handle_release(&mut self, slot: Arc<VmSlot>) {
        self.in_use.remove(&slot.index());

        let stale = self.last_hash.as_deref() != Some(slot.config_hash());
        if slot.is_retiring() || stale {
            tracing::debug!(
                plugin = %self.plugin_id,
                slot = slot.index(),
                stale,
                "destroying slot on release"
            );
            slot.submit_destroy();
        } else {
            self.available.push_back(slot);
        }
    }

    /// Destroy every existing slot and forget the template: the plugin's
    /// bytecode changed under us.
    ///
    /// Available slots die immediately.  In-use slots are flagged for
    /// retirement and dropped from the set so capacity frees up at once;
    /// their destruction runs through their own channels once released.
    fn hot_swap(&mut self) {
        tracing::info!(
            plugin = %self.plugin_id,
            available = self.available.len(),
            in_use = self.in_use.len(),
            "config hash changed, hot-swapping all slots"
        );
        for slot in self.available.drain(..) {
            slot.submit_destroy();
        }
        for (_, slot) in self.in_use.drain() {
            slot.flag_for_retirement();
        }
        if let Some(hash) = self.last_hash.take() {
            self.templates.forget(&hash);
        }
    }

    /// Terminal teardown: destroy all slots, drop out of the registry, fail
    /// everything that is still waiting.
    fn teardown(&mut self, error: SandboxError) {
        tracing::info!(plugin = %self.plugin_id, error = %error, "pool teardown");

        for slot in self.available.drain(..) {
            slot.submit_destroy();
        }
        for (_, slot) in self.in_use.drain() {
            slot.flag_for_retirement();
        }
        if let Some(hash) = self.last_hash.take() {
            self.templates.forget(&hash);
        }

        self.pools.remove(&self.plugin_id);

        for pending in self
            .priority
            .drain(..)
            .chain(self.plain.drain(..))
            .chain(self.creation_waiter.take())
        {
            let _ = pending.reply.send(Err(error.clone()));
        }

        self.closed = true;
    }
}
