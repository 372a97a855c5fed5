// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Randomized client bootstrap.
//
// A client must come out the same whichever constructor path builds it:
// synchronous or asynchronous, inline or from a task dispatched on the
// ambient context, inside an extra event context or not. A trial is a pure
// function of its [`BootstrapChoice`]; [`BootstrapMatrix`] draws choices from a
// seeded RNG, and [`BootstrapChoice::all`] enumerates them.
//
// The ambient context is the tokio `LocalSet` the caller runs in. Trials must
// therefore be awaited from inside a `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle, LocalSet};

use crate::client::{Client, ClientError, ClientFactory, ErrorSlot};
use crate::config::BootstrapConfig;
use crate::error::HarnessError;

const EXTRA_CONTEXT_KEY: &str = "extra-context";
/// Upper bound on drawn nesting depth.
const MAX_EXTRA_CONTEXTS: u32 = 8;

// ---------------------------------------------------------------------------
// BootstrapChoice
// ---------------------------------------------------------------------------

/// Which synchronous constructor form to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStrategy {
    /// `ClientFactory::new_sync`.
    Factory,
    /// `ClientFactory::allocate` followed by `Client::init`.
    Initable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstructionMode {
    /// With `guard`, a task that must never run sits on the ambient context
    /// for the duration of the construction.
    Sync { strategy: SyncStrategy, guard: bool },
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dispatch {
    Direct,
    /// Construct from a task spawned on the ambient context.
    Idle,
}

/// Every random decision of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootstrapChoice {
    /// Number of extra event contexts wrapped around the construction.
    /// Inside one, construction is always synchronous and direct.
    pub extra_contexts: u32,
    pub mode: ConstructionMode,
    pub dispatch: Dispatch,
    pub error_slot: ErrorSlot,
}

impl BootstrapChoice {
    /// Plain synchronous factory construction.
    pub fn sync() -> Self {
        Self {
            extra_contexts: 0,
            mode: ConstructionMode::Sync { strategy: SyncStrategy::Factory, guard: false },
            dispatch: Dispatch::Direct,
            error_slot: ErrorSlot::Capture,
        }
    }

    /// Whether this choice iterates the ambient context.
    pub fn iterates_ambient(&self) -> bool {
        self.extra_contexts == 0
            && (self.mode == ConstructionMode::Async || self.dispatch == Dispatch::Idle)
    }

    /// Every distinct choice, with at most one extra context.
    pub fn all() -> Vec<Self> {
        let slots = [ErrorSlot::Capture, ErrorSlot::Discard];
        let mut sync_modes = Vec::new();
        for strategy in [SyncStrategy::Factory, SyncStrategy::Initable] {
            for guard in [false, true] {
                sync_modes.push(ConstructionMode::Sync { strategy, guard });
            }
        }

        let mut out = Vec::new();
        for dispatch in [Dispatch::Direct, Dispatch::Idle] {
            for mode in sync_modes.iter().copied().chain([ConstructionMode::Async]) {
                for error_slot in slots {
                    out.push(Self { extra_contexts: 0, mode, dispatch, error_slot });
                }
            }
        }
        for mode in sync_modes {
            for error_slot in slots {
                out.push(Self { extra_contexts: 1, mode, dispatch: Dispatch::Direct, error_slot });
            }
        }
        out
    }

    fn label(&self) -> &'static str {
        match self.mode {
            ConstructionMode::Sync { strategy: SyncStrategy::Factory, .. } => "sync factory",
            ConstructionMode::Sync { strategy: SyncStrategy::Initable, .. } => "allocate+init",
            ConstructionMode::Async => "async constructor",
        }
    }
}

// ---------------------------------------------------------------------------
// ClientUnderTest
// ---------------------------------------------------------------------------

/// A client produced by a trial, plus the integration sources that keep its
/// extra contexts running.
///
/// Dropping it cancels those sources.
pub struct ClientUnderTest<C> {
    client: C,
    choice: BootstrapChoice,
    integrations: BTreeMap<String, JoinHandle<()>>,
}

impl<C> ClientUnderTest<C> {
    fn new(client: C, choice: BootstrapChoice) -> Self {
        Self { client, choice, integrations: BTreeMap::new() }
    }

    pub fn choice(&self) -> BootstrapChoice {
        self.choice
    }

    /// Keys of the attached integration sources, in order.
    pub fn integration_keys(&self) -> Vec<&str> {
        self.integrations.keys().map(String::as_str).collect()
    }

    /// Attach under the first unused key. Returns the key.
    fn attach_integration(&mut self, source: JoinHandle<()>) -> String {
        let mut idx = 0u32;
        loop {
            let key = format!("{EXTRA_CONTEXT_KEY}-{idx}");
            if !self.integrations.contains_key(&key) {
                self.integrations.insert(key.clone(), source);
                return key;
            }
            idx += 1;
        }
    }
}

impl<C> Deref for ClientUnderTest<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.client
    }
}

impl<C> DerefMut for ClientUnderTest<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

impl<C> fmt::Debug for ClientUnderTest<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientUnderTest")
            .field("choice", &self.choice)
            .field("integrations", &self.integrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C> Drop for ClientUnderTest<C> {
    fn drop(&mut self) {
        for source in self.integrations.values() {
            source.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// LoopGuard
// ---------------------------------------------------------------------------

/// A task on the ambient context that records whether it ever ran.
///
/// Attach before a section that must not iterate the context, disarm after.
#[derive(Debug)]
pub struct LoopGuard {
    fired: Rc<Cell<bool>>,
    task: JoinHandle<()>,
}

impl LoopGuard {
    pub fn attach() -> Self {
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let task = tokio::task::spawn_local(async move { flag.set(true) });
        Self { fired, task }
    }

    pub fn fired(&self) -> bool {
        self.fired.get()
    }

    /// Cancel the guard; error if it already ran.
    pub fn disarm(self) -> Result<(), HarnessError> {
        self.task.abort();
        if self.fired.get() {
            return Err(HarnessError::protocol(
                "synchronous construction iterated the ambient event context",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trials
// ---------------------------------------------------------------------------

/// Success and error must be mutually exclusive, and success is required.
fn assert_success(
    strategy: &'static str,
    success: bool,
    error: Option<ClientError>,
) -> Result<(), HarnessError> {
    match (success, error) {
        (true, None) => Ok(()),
        (true, Some(e)) => Err(HarnessError::protocol(format!(
            "{strategy} reported success together with error {e:?}"
        ))),
        (false, Some(source)) => Err(HarnessError::ConstructionFailed { strategy, source }),
        (false, None) => Err(HarnessError::ConstructionFailed {
            strategy,
            source: ClientError::new("failed without reporting an error"),
        }),
    }
}

fn check_live<C: Client>(
    client: C,
    choice: BootstrapChoice,
) -> Result<ClientUnderTest<C>, HarnessError> {
    if !client.is_initialized() {
        return Err(HarnessError::protocol(format!(
            "{} returned a client that is not initialized",
            choice.label()
        )));
    }
    Ok(ClientUnderTest::new(client, choice))
}

fn construct_sync<F: ClientFactory>(
    factory: &F,
    strategy: SyncStrategy,
    slot: ErrorSlot,
) -> Result<F::Client, HarnessError> {
    match strategy {
        SyncStrategy::Factory => {
            let (client, error) = slot.settle(factory.new_sync());
            assert_success("sync factory", client.is_some(), error)?;
            client.ok_or_else(|| HarnessError::protocol("sync factory produced no client"))
        }
        SyncStrategy::Initable => {
            let mut client = factory.allocate();
            let (done, error) = slot.settle(client.init());
            assert_success("allocate+init", done.is_some(), error)?;
            Ok(client)
        }
    }
}

/// Synchronous path, including any extra contexts. Never awaits.
fn construct_blocking<F: ClientFactory>(
    factory: &F,
    choice: BootstrapChoice,
) -> Result<ClientUnderTest<F::Client>, HarnessError> {
    if choice.extra_contexts > 0 {
        return construct_in_extra_context(factory, choice);
    }
    let ConstructionMode::Sync { strategy, guard } = choice.mode else {
        return Err(HarnessError::HarnessInternal(format!(
            "{choice:?} cannot be constructed without iterating the ambient context"
        )));
    };

    let guard = guard.then(LoopGuard::attach);
    let client = construct_sync(factory, strategy, choice.error_slot);
    if let Some(guard) = guard {
        guard.disarm()?;
    }
    check_live(client?, choice)
}

/// Construct inside a fresh context, then hand that context's pending work
/// to the restored ambient context through an integration source.
fn construct_in_extra_context<F: ClientFactory>(
    factory: &F,
    choice: BootstrapChoice,
) -> Result<ClientUnderTest<F::Client>, HarnessError> {
    let inner = LocalSet::new();
    let mut client = {
        let _ambient = inner.enter();
        let nested = BootstrapChoice { extra_contexts: choice.extra_contexts - 1, ..choice };
        construct_blocking(factory, nested)?
    };
    let source = tokio::task::spawn_local(inner);
    let key = client.attach_integration(source);
    client.choice = choice;
    tracing::debug!(key = %key, "attached extra context");
    Ok(client)
}

async fn construct_async<F: ClientFactory>(
    factory: &F,
    choice: BootstrapChoice,
) -> Result<ClientUnderTest<F::Client>, HarnessError> {
    let (tx, rx) = oneshot::channel();
    let pending = factory.new_async();
    tokio::task::spawn_local(async move {
        let _ = tx.send(pending.await);
    });
    // No deadline: a constructor that never completes is a hang to debug.
    let result = rx
        .await
        .map_err(|_| HarnessError::protocol("async constructor dropped its completion"))?;

    let (client, error) = choice.error_slot.settle(result);
    assert_success("async constructor", client.is_some(), error)?;
    let client =
        client.ok_or_else(|| HarnessError::protocol("async constructor produced no client"))?;
    check_live(client, choice)
}

async fn construct_direct<F: ClientFactory>(
    factory: &F,
    choice: BootstrapChoice,
) -> Result<ClientUnderTest<F::Client>, HarnessError> {
    match choice.mode {
        ConstructionMode::Async if choice.extra_contexts == 0 => {
            construct_async(factory, choice).await
        }
        _ => construct_blocking(factory, choice),
    }
}

fn rethrow(e: JoinError) -> HarnessError {
    if e.is_panic() {
        std::panic::resume_unwind(e.into_panic());
    }
    HarnessError::protocol(format!("idle-dispatched construction was cancelled: {e}"))
}

/// Run one trial. Must be awaited inside a `LocalSet`.
///
/// On return the client is fully constructed and checked.
pub async fn run_trial<F>(
    factory: Rc<F>,
    choice: BootstrapChoice,
) -> Result<ClientUnderTest<F::Client>, HarnessError>
where
    F: ClientFactory + 'static,
{
    tracing::debug!(?choice, "bootstrap trial");
    if choice.dispatch == Dispatch::Idle && choice.extra_contexts == 0 {
        let dispatched = tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            construct_direct(&*factory, choice).await
        });
        return dispatched.await.map_err(rethrow)?;
    }
    construct_direct(&*factory, choice).await
}

// ---------------------------------------------------------------------------
// BootstrapMatrix
// ---------------------------------------------------------------------------

/// Seeded source of [`BootstrapChoice`]s.
#[derive(Debug, Clone)]
pub struct BootstrapMatrix {
    config: BootstrapConfig,
    seed: u64,
    rng: ChaCha8Rng,
}

impl BootstrapMatrix {
    pub fn new(config: BootstrapConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        tracing::info!(seed, "bootstrap matrix seeded");
        Self { config, seed, rng: ChaCha8Rng::seed_from_u64(seed) }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(BootstrapConfig { seed: Some(seed), ..BootstrapConfig::default() })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn one_in(&mut self, n: u32) -> bool {
        n > 0 && self.rng.gen_ratio(1, n)
    }

    fn coin(&mut self) -> bool {
        self.rng.gen()
    }

    /// Draw the next choice. Without `allow_iteration` the choice never
    /// iterates the ambient context.
    pub fn choose(&mut self, allow_iteration: bool) -> BootstrapChoice {
        let mut extra_contexts = 0;
        while extra_contexts < MAX_EXTRA_CONTEXTS && self.one_in(self.config.nested_one_in) {
            extra_contexts += 1;
        }

        let (sync, dispatch) = if extra_contexts > 0 || !allow_iteration {
            (true, Dispatch::Direct)
        } else {
            let sync = self.coin();
            let idle = self.one_in(self.config.idle_one_in);
            (sync, if idle { Dispatch::Idle } else { Dispatch::Direct })
        };

        let mode = if sync {
            let guard = self.coin();
            let strategy = if self.coin() { SyncStrategy::Initable } else { SyncStrategy::Factory };
            ConstructionMode::Sync { strategy, guard }
        } else {
            ConstructionMode::Async
        };
        let error_slot = if self.coin() { ErrorSlot::Capture } else { ErrorSlot::Discard };

        BootstrapChoice { extra_contexts, mode, dispatch, error_slot }
    }

    /// Build one client on a randomly chosen path. Any failure fails the test.
    pub async fn new_client<F>(
        &mut self,
        factory: &Rc<F>,
        allow_iteration: bool,
    ) -> ClientUnderTest<F::Client>
    where
        F: ClientFactory + 'static,
    {
        let choice = self.choose(allow_iteration);
        run_trial(factory.clone(), choice)
            .await
            .unwrap_or_else(|e| e.fatal())
    }
}

thread_local! {
    static THREAD_MATRIX: RefCell<Option<BootstrapMatrix>> = const { RefCell::new(None) };
}

/// [`BootstrapMatrix::new_client`] on a per-thread matrix, seeded from the
/// environment on first use. Later calls keep drawing from the same RNG.
pub async fn new_client<F>(factory: &Rc<F>, allow_iteration: bool) -> ClientUnderTest<F::Client>
where
    F: ClientFactory + 'static,
{
    let choice = THREAD_MATRIX.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| {
                BootstrapMatrix::new(BootstrapConfig::from_env().unwrap_or_else(|e| e.fatal()))
            })
            .choose(allow_iteration)
    });
    run_trial(factory.clone(), choice)
        .await
        .unwrap_or_else(|e| e.fatal())
}
