//! Pool slots.
//!
//! A [`VmSlot`] wraps exactly one [`SandboxInstance`] and enforces the pool's
//! per-instance discipline: calls are serialized FIFO through a private
//! single-consumer channel whose worker task exclusively owns the instance,
//! a call budget bounds how long one instance lives, and a corruption
//! heuristic retires instances whose return codes fall outside the expected
//! range.  Destruction is itself a command on the channel, so it always runs
//! after any in-flight call.

use std::fmt;
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SandboxError};
use crate::instance::{CallContext, CallOutcome, SandboxInstance};

/// Injectable predicate deciding whether a guest return code suggests a
/// corrupted interpreter state.
///
/// The default flags codes outside `0..=7`, which is the plugin protocol's
/// normal range; concurrent native execution has been observed to leave
/// instances returning garbage codes, and retiring them bounds the blast
/// radius.
#[derive(Clone)]
pub struct CorruptionPolicy {
    predicate: Arc<dyn Fn(i32) -> bool + Send + Sync>,
}

impl CorruptionPolicy {
    /// Flag return codes for which `predicate` returns `true`.
    pub fn new(predicate: impl Fn(i32) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Flag return codes outside `expected`.
    pub fn expected_range(expected: RangeInclusive<i32>) -> Self {
        Self::new(move |code| !expected.contains(&code))
    }

    /// Never flag anything.
    pub fn disabled() -> Self {
        Self::new(|_| false)
    }

    /// Whether `code` should retire the instance after the current call.
    pub fn is_suspect(&self, code: i32) -> bool {
        (self.predicate)(code)
    }
}

impl Default for CorruptionPolicy {
    fn default() -> Self {
        Self::expected_range(0..=7)
    }
}

impl fmt::Debug for CorruptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CorruptionPolicy")
    }
}

/// Commands on a slot's private channel.
enum SlotCommand {
    Invoke {
        function: String,
        input: Vec<u8>,
        ctx: CallContext,
        reply: oneshot::Sender<Result<CallOutcome>>,
    },
    Destroy,
}

/// State shared between the slot handle and its worker task.
struct SlotShared {
    index: u64,
    config_hash: String,
    call_budget: u32,
    calls_made: AtomicU32,
    in_flight: AtomicU32,
    retire: AtomicBool,
    initialized: AtomicBool,
}

/// The pool's wrapper around one sandbox instance.
///
/// The instance itself lives inside the worker task; the handle only carries
/// the command channel and the bookkeeping counters.
pub struct VmSlot {
    shared: Arc<SlotShared>,
    tx: mpsc::UnboundedSender<SlotCommand>,
}

impl VmSlot {
    /// Wrap `instance` in a new slot and spawn its worker task.
    pub(crate) fn spawn(
        index: u64,
        config_hash: String,
        call_budget: u32,
        instance: SandboxInstance,
        policy: CorruptionPolicy,
    ) -> Arc<VmSlot> {
        let shared = Arc::new(SlotShared {
            index,
            config_hash,
            call_budget,
            calls_made: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            retire: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(rx, instance, Arc::clone(&shared), policy));

        tracing::debug!(slot = index, "slot created");
        Arc::new(VmSlot { shared, tx })
    }

    /// Submit a call to the slot's serialized execution channel and await the
    /// result.  Calls on one slot execute strictly in submission order and
    /// never overlap.
    pub async fn call(&self, function: &str, input: &[u8], ctx: CallContext) -> Result<CallOutcome> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(SlotCommand::Invoke {
                function: function.to_owned(),
                input: input.to_vec(),
                ctx,
                reply,
            })
            .map_err(|_| SandboxError::PoolClosed)?;
        response.await.map_err(|_| SandboxError::PoolClosed)?
    }

    /// Run `init` exactly once over this slot's lifetime.
    ///
    /// The exclusively-checked-out discipline means there is never a second
    /// caller racing this flag; a failed initialization rearms it so the next
    /// checkout can retry.
    pub async fn initialize_once<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .shared
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        if let Err(e) = init().await {
            self.shared.initialized.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Queue destruction behind any in-flight call.
    pub(crate) fn submit_destroy(&self) {
        let _ = self.tx.send(SlotCommand::Destroy);
    }

    /// Mark the slot so release destroys it instead of returning it.
    pub(crate) fn flag_for_retirement(&self) {
        self.shared.retire.store(true, Ordering::Release);
    }

    /// Whether the slot is flagged for retirement on release.
    pub fn is_retiring(&self) -> bool {
        self.shared.retire.load(Ordering::Acquire)
    }

    /// Stable identity of this slot within its pool.
    pub fn index(&self) -> u64 {
        self.shared.index
    }

    /// Content hash of the config this slot was built from.
    pub(crate) fn config_hash(&self) -> &str {
        &self.shared.config_hash
    }

    /// Calls executed since creation (or since the last budget rollover).
    pub fn calls_made(&self) -> u32 {
        self.shared.calls_made.load(Ordering::Acquire)
    }

    /// Number of calls currently executing. Never exceeds 1.
    pub fn in_flight(&self) -> u32 {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

/// Single-consumer loop that exclusively owns the sandbox instance.
async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<SlotCommand>,
    mut instance: SandboxInstance,
    shared: Arc<SlotShared>,
    policy: CorruptionPolicy,
) {
    while let Some(command) = rx.recv().await {
        match command {
            SlotCommand::Invoke {
                function,
                input,
                ctx,
                reply,
            } => {
                shared.in_flight.fetch_add(1, Ordering::AcqRel);

                let result = instance.invoke(&function, &input, ctx);

                if let Ok(outcome) = &result
                    && policy.is_suspect(outcome.code)
                {
                    shared.retire.store(true, Ordering::Release);
                    tracing::warn!(
                        slot = shared.index,
                        code = outcome.code,
                        "suspect return code, retiring slot after this call"
                    );
                }

                // Unconditional cleanup, even when the call failed.
                instance.reset();
                let made = shared.calls_made.fetch_add(1, Ordering::AcqRel) + 1;
                if made >= shared.call_budget {
                    shared.retire.store(true, Ordering::Release);
                    shared.calls_made.store(0, Ordering::Release);
                    tracing::debug!(
                        slot = shared.index,
                        budget = shared.call_budget,
                        "call budget exhausted, slot flagged for retirement"
                    );
                }
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);

                // The caller may have abandoned the call; that is its loss.
                let _ = reply.send(result);
            }
            SlotCommand::Destroy => break,
        }
    }
    instance.close();
    tracing::debug!(slot = shared.index, "slot destroyed");
}
