//! Process-group context: the per-process distributed session.
//!
//! A [`ProcessGroupContext`] moves through `Uninitialized -> Active ->
//! Finalized`. Every accessor and collective fails with
//! [`DistributedError::NotInitialized`] outside the active state; nothing
//! silently falls back to rank 0.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DistributedError, Result};
use super::launcher::{DistributedConfig, WORLD_SIZE_ENV};
use super::local::local_links;
use super::process_group::StaticProcessGroup;
use super::tcp;
use super::transport::{HostTransport, Transport};

pub const ACCELERATOR_AWARE_ENV: &str = "DPSYNC_ACCELERATOR_AWARE";
pub const DISABLE_ACCELERATOR_AWARE_ENV: &str = "DPSYNC_DISABLE_ACCELERATOR_AWARE";
pub const BACKEND_ENV: &str = "DPSYNC_BACKEND";
pub const VERIFY_STRUCTURE_ENV: &str = "DPSYNC_VERIFY_STRUCTURE";
pub const CONNECT_TIMEOUT_ENV: &str = "DPSYNC_CONNECT_TIMEOUT_MS";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Transport backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// TCP full mesh, one process per rank.
    Tcp,
    /// World of one, no network.
    Single,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Single => "single",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DistributedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "single" => Ok(Self::Single),
            other => Err(DistributedError::InvalidConfig(format!(
                "unknown backend {other:?} (expected \"tcp\" or \"single\")"
            ))),
        }
    }
}

/// Options for [`ProcessGroupContext::initialize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    /// Request accelerator-direct collectives. `None` infers from the
    /// transport's capability.
    pub accelerator_aware: Option<bool>,
    /// Escape hatch: never hand accelerator buffers to the transport.
    pub disable_accelerator_aware: bool,
    /// Backend override. `None` selects TCP when `WORLD_SIZE` is set.
    pub backend: Option<BackendKind>,
    /// Exchange a structure fingerprint before every payload collective.
    pub verify_structure: bool,
    /// Rendezvous deadline in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            accelerator_aware: None,
            disable_accelerator_aware: false,
            backend: None,
            verify_structure: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl InitOptions {
    /// Read options from `DPSYNC_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed values are an
    /// [`DistributedError::InvalidConfig`] error.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(v) = env_bool(ACCELERATOR_AWARE_ENV)? {
            options.accelerator_aware = Some(v);
        }
        if let Some(v) = env_bool(DISABLE_ACCELERATOR_AWARE_ENV)? {
            options.disable_accelerator_aware = v;
        }
        if let Ok(raw) = env::var(BACKEND_ENV) {
            options.backend = Some(raw.parse()?);
        }
        if let Some(v) = env_bool(VERIFY_STRUCTURE_ENV)? {
            options.verify_structure = v;
        }
        if let Ok(raw) = env::var(CONNECT_TIMEOUT_ENV) {
            options.connect_timeout_ms = raw.trim().parse().map_err(|_| {
                DistributedError::InvalidConfig(format!(
                    "{CONNECT_TIMEOUT_ENV}={raw:?} is not a number of milliseconds"
                ))
            })?;
        }
        Ok(options)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_accelerator_aware(mut self, enabled: bool) -> Self {
        self.accelerator_aware = Some(enabled);
        self
    }

    pub fn with_verify_structure(mut self, enabled: bool) -> Self {
        self.verify_structure = enabled;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Effective accelerator-awareness for `transport`.
    fn resolve_accelerator_aware(&self, transport: &dyn Transport) -> bool {
        if self.disable_accelerator_aware {
            if self.accelerator_aware == Some(true) {
                tracing::info!("Accelerator-aware collectives disabled by override");
            }
            return false;
        }
        let capable = transport.accelerator_capable();
        match self.accelerator_aware {
            Some(true) if !capable => {
                tracing::warn!(
                    backend = transport.backend_name(),
                    "Accelerator-aware collectives requested but the transport is host-only; \
                     staging through host memory"
                );
                false
            }
            Some(requested) => requested,
            None => capable,
        }
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(raw) => parse_bool(&raw)
            .map(Some)
            .ok_or_else(|| {
                DistributedError::InvalidConfig(format!("{name}={raw:?} is not a boolean"))
            }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// An active distributed session.
#[derive(Debug)]
pub struct Session {
    transport: Arc<dyn Transport>,
    accelerator_aware: bool,
    verify_structure: bool,
}

impl Session {
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn world_size(&self) -> usize {
        self.transport.world_size()
    }

    pub fn accelerator_aware(&self) -> bool {
        self.accelerator_aware
    }

    pub fn verify_structure(&self) -> bool {
        self.verify_structure
    }
}

#[derive(Debug)]
enum State {
    Uninitialized,
    Active(Arc<Session>),
    Finalized,
}

/// Per-process distributed state.
///
/// Created once at startup and shared (`Arc`) with every component that
/// needs it. Several contexts may coexist in one process, e.g. one per
/// simulated rank.
#[derive(Debug)]
pub struct ProcessGroupContext {
    state: RwLock<State>,
}

impl Default for ProcessGroupContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroupContext {
    /// A context that has not been initialized yet.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::Uninitialized),
        }
    }

    /// Create and initialize a context in one step.
    pub fn initialized(options: InitOptions) -> Result<Arc<Self>> {
        let ctx = Arc::new(Self::new());
        ctx.initialize(options)?;
        Ok(ctx)
    }

    /// Establish the transport session selected by `options`.
    ///
    /// Calling this on an active context logs a warning and changes nothing.
    pub fn initialize(&self, options: InitOptions) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !Self::ready_for_init(&state)? {
            return Ok(());
        }
        let transport = connect_backend(&options)?;
        *state = State::Active(Arc::new(Self::activate(transport, &options)));
        Ok(())
    }

    /// Initialize over an already constructed transport.
    pub fn initialize_with_transport(
        &self,
        transport: Arc<dyn Transport>,
        options: InitOptions,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !Self::ready_for_init(&state)? {
            return Ok(());
        }
        *state = State::Active(Arc::new(Self::activate(transport, &options)));
        Ok(())
    }

    fn ready_for_init(state: &State) -> Result<bool> {
        match state {
            State::Uninitialized => Ok(true),
            State::Active(session) => {
                tracing::warn!(
                    rank = session.rank(),
                    world_size = session.world_size(),
                    "Process group already initialized; ignoring repeated initialize"
                );
                Ok(false)
            }
            State::Finalized => Err(DistributedError::Initialization(
                "process group was finalized and cannot be re-initialized".into(),
            )),
        }
    }

    fn activate(transport: Arc<dyn Transport>, options: &InitOptions) -> Session {
        let accelerator_aware = options.resolve_accelerator_aware(transport.as_ref());
        tracing::info!(
            rank = transport.rank(),
            world_size = transport.world_size(),
            local_rank = transport.local_rank(),
            backend = transport.backend_name(),
            accelerator_aware,
            verify_structure = options.verify_structure,
            "Process group initialized"
        );
        Session {
            transport,
            accelerator_aware,
            verify_structure: options.verify_structure,
        }
    }

    /// Tear down the transport. Repeated calls are no-ops.
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(&mut *state, State::Finalized) {
            State::Active(session) => {
                session.transport.shutdown()?;
                tracing::info!(rank = session.rank(), "Process group finalized");
            }
            State::Uninitialized => {
                tracing::debug!("finalize called before initialize");
                *state = State::Uninitialized;
            }
            State::Finalized => tracing::debug!("Process group already finalized"),
        }
        Ok(())
    }

    /// The active session, or `NotInitialized` naming `operation`.
    pub fn session(&self, operation: &'static str) -> Result<Arc<Session>> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            State::Active(session) => Ok(Arc::clone(session)),
            State::Uninitialized | State::Finalized => {
                Err(DistributedError::NotInitialized { operation })
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(|e| e.into_inner()),
            State::Active(_)
        )
    }

    pub fn rank(&self) -> Result<usize> {
        Ok(self.session("rank")?.rank())
    }

    pub fn world_size(&self) -> Result<usize> {
        Ok(self.session("world_size")?.world_size())
    }

    pub fn local_rank(&self) -> Result<usize> {
        Ok(self.session("local_rank")?.transport().local_rank())
    }

    /// Whether collectives hand accelerator buffers to the transport
    /// directly instead of staging through host memory.
    pub fn is_accelerator_aware(&self) -> Result<bool> {
        Ok(self.session("is_accelerator_aware")?.accelerator_aware())
    }

    pub fn verify_structure(&self) -> Result<bool> {
        Ok(self.session("verify_structure")?.verify_structure())
    }

    pub fn backend_name(&self) -> Result<&'static str> {
        Ok(self.session("backend_name")?.transport().backend_name())
    }
}

fn connect_backend(options: &InitOptions) -> Result<Arc<dyn Transport>> {
    let backend = match options.backend {
        Some(backend) => backend,
        None if env::var_os(WORLD_SIZE_ENV).is_some() => BackendKind::Tcp,
        None => {
            return Err(DistributedError::Initialization(format!(
                "not launched under a multi-process runner ({WORLD_SIZE_ENV} is not set); \
                 use dpsync-launch or set {BACKEND_ENV}=single"
            )))
        }
    };

    match backend {
        BackendKind::Tcp => {
            let config = DistributedConfig::detect()?.ok_or_else(|| {
                DistributedError::Initialization(format!(
                    "tcp backend requires the rendezvous environment ({WORLD_SIZE_ENV} is not set)"
                ))
            })?;
            let transport =
                tcp::connect(&config, options.connect_timeout()).map_err(|e| match e {
                    e @ DistributedError::Initialization(_) => e,
                    other => {
                        DistributedError::Initialization(format!("tcp rendezvous failed: {other}"))
                    }
                })?;
            Ok(Arc::new(transport))
        }
        BackendKind::Single => {
            let links = local_links(1)?.pop().ok_or_else(|| {
                DistributedError::Initialization("failed to create single-process links".into())
            })?;
            let transport = HostTransport::new(StaticProcessGroup::single(), "single", links)?;
            Ok(Arc::new(transport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::launcher::RANK_ENV;
    use crate::distributed::local::local_world;
    use crate::distributed::process_group::ProcessGroup;
    use crate::distributed::transport::{Collective, PendingCollective};
    use serial_test::serial;

    /// Host transport that reports accelerator capability.
    #[derive(Debug)]
    struct AcceleratorCapable(HostTransport);

    impl AcceleratorCapable {
        fn new() -> Arc<Self> {
            Arc::new(Self(local_world(1).unwrap().pop().unwrap()))
        }
    }

    impl ProcessGroup for AcceleratorCapable {
        fn rank(&self) -> usize {
            self.0.rank()
        }

        fn world_size(&self) -> usize {
            self.0.world_size()
        }

        fn local_rank(&self) -> usize {
            self.0.local_rank()
        }
    }

    impl Transport for AcceleratorCapable {
        fn backend_name(&self) -> &'static str {
            "capable"
        }

        fn accelerator_capable(&self) -> bool {
            true
        }

        fn submit(&self, op: Collective) -> Result<PendingCollective> {
            self.0.submit(op)
        }

        fn shutdown(&self) -> Result<()> {
            self.0.shutdown()
        }
    }

    fn resolved(options: InitOptions) -> bool {
        let ctx = ProcessGroupContext::new();
        ctx.initialize_with_transport(AcceleratorCapable::new(), options)
            .unwrap();
        let aware = ctx.is_accelerator_aware().unwrap();
        ctx.finalize().unwrap();
        aware
    }

    fn clear_env() {
        for name in [
            ACCELERATOR_AWARE_ENV,
            DISABLE_ACCELERATOR_AWARE_ENV,
            BACKEND_ENV,
            VERIFY_STRUCTURE_ENV,
            CONNECT_TIMEOUT_ENV,
            WORLD_SIZE_ENV,
            RANK_ENV,
        ] {
            env::remove_var(name);
        }
    }

    fn single() -> InitOptions {
        InitOptions::default().with_backend(BackendKind::Single)
    }

    #[test]
    fn accessors_fail_before_initialize() {
        let ctx = ProcessGroupContext::new();
        assert!(!ctx.is_initialized());
        assert!(matches!(
            ctx.rank(),
            Err(DistributedError::NotInitialized { operation: "rank" })
        ));
        assert!(matches!(
            ctx.world_size(),
            Err(DistributedError::NotInitialized {
                operation: "world_size"
            })
        ));
        assert!(ctx.is_accelerator_aware().is_err());
    }

    #[test]
    fn single_backend_initializes() {
        let ctx = ProcessGroupContext::initialized(single()).unwrap();
        assert!(ctx.is_initialized());
        assert_eq!(ctx.rank().unwrap(), 0);
        assert_eq!(ctx.world_size().unwrap(), 1);
        assert_eq!(ctx.local_rank().unwrap(), 0);
        assert!(!ctx.is_accelerator_aware().unwrap());
        assert!(ctx.verify_structure().unwrap());
        ctx.finalize().unwrap();
    }

    #[test]
    fn initialize_twice_is_a_no_op() {
        let ctx = ProcessGroupContext::initialized(single()).unwrap();
        ctx.initialize(single().with_verify_structure(false)).unwrap();
        assert_eq!(ctx.rank().unwrap(), 0);
        assert_eq!(ctx.world_size().unwrap(), 1);
        assert!(ctx.verify_structure().unwrap());
    }

    #[test]
    fn finalize_twice_is_a_no_op() {
        let ctx = ProcessGroupContext::initialized(single()).unwrap();
        ctx.finalize().unwrap();
        ctx.finalize().unwrap();
        assert!(!ctx.is_initialized());
        assert!(matches!(
            ctx.rank(),
            Err(DistributedError::NotInitialized { .. })
        ));
    }

    #[test]
    fn reinitialize_after_finalize_fails() {
        let ctx = ProcessGroupContext::initialized(single()).unwrap();
        ctx.finalize().unwrap();
        assert!(matches!(
            ctx.initialize(single()),
            Err(DistributedError::Initialization(_))
        ));
    }

    #[test]
    fn finalize_before_initialize_keeps_context_usable() {
        let ctx = ProcessGroupContext::new();
        ctx.finalize().unwrap();
        ctx.initialize(single()).unwrap();
        assert!(ctx.is_initialized());
    }

    #[test]
    fn accelerator_request_on_host_transport_resolves_false() {
        let ctx = ProcessGroupContext::initialized(single().with_accelerator_aware(true)).unwrap();
        assert!(!ctx.is_accelerator_aware().unwrap());
    }

    #[test]
    fn capable_transport_is_accelerator_aware_by_default() {
        assert!(resolved(InitOptions::default()));
        assert!(resolved(InitOptions::default().with_accelerator_aware(true)));
    }

    #[test]
    fn capable_transport_honours_opt_out() {
        assert!(!resolved(InitOptions::default().with_accelerator_aware(false)));

        let disabled = InitOptions {
            disable_accelerator_aware: true,
            ..InitOptions::default()
        };
        assert!(!resolved(disabled.clone()));
        assert!(!resolved(disabled.with_accelerator_aware(true)));
    }

    #[test]
    fn accelerator_aware_session_still_reduces_host_tensors() {
        let ctx = Arc::new(ProcessGroupContext::new());
        ctx.initialize_with_transport(AcceleratorCapable::new(), InitOptions::default())
            .unwrap();
        assert_eq!(ctx.backend_name().unwrap(), "capable");

        let comm = crate::distributed::Communicator::new(ctx.clone());
        let mut grads = crate::distributed::Payload::from(
            candle_core::Tensor::new(&[1f32, 2.], &candle_core::Device::Cpu).unwrap(),
        );
        comm.all_reduce(&mut grads, crate::distributed::ReduceOp::Sum)
            .unwrap();
        match grads {
            crate::distributed::Payload::Tensor(t) => {
                assert_eq!(t.to_vec1::<f32>().unwrap(), vec![1., 2.])
            }
            other => panic!("expected a tensor leaf, got {other:?}"),
        }
        ctx.finalize().unwrap();
    }

    #[test]
    #[serial]
    fn initialize_outside_runner_fails() {
        clear_env();
        let ctx = ProcessGroupContext::new();
        let err = ctx.initialize(InitOptions::default()).unwrap_err();
        assert!(matches!(err, DistributedError::Initialization(_)));
        assert!(err.to_string().contains("multi-process runner"));
        assert!(!ctx.is_initialized());
    }

    #[test]
    #[serial]
    fn options_from_env() {
        clear_env();
        env::set_var(BACKEND_ENV, "Single");
        env::set_var(DISABLE_ACCELERATOR_AWARE_ENV, "1");
        env::set_var(VERIFY_STRUCTURE_ENV, "off");
        env::set_var(CONNECT_TIMEOUT_ENV, "2500");

        let options = InitOptions::from_env().unwrap();
        assert_eq!(options.backend, Some(BackendKind::Single));
        assert!(options.disable_accelerator_aware);
        assert!(!options.verify_structure);
        assert_eq!(options.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(options.accelerator_aware, None);
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_env_values_are_rejected() {
        clear_env();
        env::set_var(VERIFY_STRUCTURE_ENV, "maybe");
        assert!(matches!(
            InitOptions::from_env(),
            Err(DistributedError::InvalidConfig(_))
        ));

        clear_env();
        env::set_var(BACKEND_ENV, "mpi");
        assert!(matches!(
            InitOptions::from_env(),
            Err(DistributedError::InvalidConfig(_))
        ));

        clear_env();
        env::set_var(CONNECT_TIMEOUT_ENV, "soon");
        assert!(InitOptions::from_env().is_err());
        clear_env();
    }
}
