//! Digital Twin
//!
//! Isolated attacker / defender / arena workspaces.
//!
//! ```text
//! Uninitialized ──setup ok──▶ Ready ──cleanup──▶ Destroyed
//!       │                                           ▲
//!       └──────────────cleanup (partial setup)──────┘
//! ```
//!
//! The backend is chosen once at construction ([`detect_backend`]) and
//! never branched on again; everything backend-specific lives behind
//! [`TwinDriver`].

pub mod command;
pub mod copy;
pub mod docker;
pub mod git;
pub mod ports;
pub mod qemu;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{BattleConfig, TwinOptions};
use crate::context::BattleContext;
use crate::error::{BattleError, BattleResult};
use crate::model::{Role, TwinBackend};

pub use copy::CopyDriver;
pub use docker::DockerDriver;
pub use git::GitWorktreeDriver;
pub use ports::PortAllocator;
pub use qemu::QemuDriver;

/// Where a battle's workspaces live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinLayout {
    pub battle_id: String,
    /// Canonical target the twin is cloned from.
    pub source: PathBuf,
    /// `<work_root>/<battle_id>`
    pub root: PathBuf,
}

impl TwinLayout {
    pub fn new(battle_id: &str, source: PathBuf, work_root: PathBuf) -> Self {
        Self {
            battle_id: battle_id.to_string(),
            source,
            root: work_root.join(battle_id),
        }
    }

    pub fn workspace(&self, role: Role) -> PathBuf {
        self.root.join(role.as_str())
    }

    /// Error unless all three role directories exist.
    pub fn require_role_dirs(&self) -> BattleResult<()> {
        for role in Role::ALL {
            let dir = self.workspace(role);
            if !dir.is_dir() {
                return Err(BattleError::setup(
                    "attach",
                    format!("missing {role} workspace {}", dir.display()),
                ));
            }
        }
        Ok(())
    }
}

/// The three workspace paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspaces {
    pub attacker: PathBuf,
    pub defender: PathBuf,
    pub arena: PathBuf,
}

/// Backend strategy behind a [`DigitalTwin`].
#[async_trait]
pub trait TwinDriver: Send + Sync {
    fn backend(&self) -> TwinBackend;

    /// Provision all three workspaces.
    async fn setup(&mut self, layout: &TwinLayout) -> BattleResult<()>;

    /// Adopt workspaces left by an earlier (paused) run.
    async fn attach(&mut self, layout: &TwinLayout) -> BattleResult<()>;

    /// Propagate defender changes into the arena.
    async fn sync(&mut self, layout: &TwinLayout) -> BattleResult<()>;

    /// Release backend resources. Must tolerate partially built twins.
    async fn cleanup(&mut self, layout: &TwinLayout) -> BattleResult<()>;
}

/// Twin lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinPhase {
    Uninitialized,
    Ready,
    Destroyed,
}

impl std::fmt::Display for TwinPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Ready => write!(f, "ready"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Pick a backend for `source`.
///
/// Priority: explicit backend → container image → machine type → binary
/// image extension → container build file → git repository → plain copy.
pub fn detect_backend(source: &Path, opts: &TwinOptions) -> TwinBackend {
    if let Some(backend) = opts.backend {
        return backend;
    }
    if opts.container_image.is_some() {
        return TwinBackend::Docker;
    }
    if opts.qemu_machine.is_some() {
        return TwinBackend::Qemu;
    }
    if source.is_file() && qemu::is_binary_image(source) {
        return TwinBackend::Qemu;
    }
    if source.is_dir() && docker::has_build_file(source) {
        return TwinBackend::Docker;
    }
    if source.join(".git").exists() {
        return TwinBackend::GitWorktree;
    }
    TwinBackend::Copy
}

/// Build the driver for a backend.
pub fn driver_for(backend: TwinBackend, config: &BattleConfig) -> Box<dyn TwinDriver> {
    match backend {
        TwinBackend::GitWorktree => Box::new(GitWorktreeDriver::new()),
        TwinBackend::Copy => Box::new(CopyDriver),
        TwinBackend::Docker => Box::new(DockerDriver::new(config.twin.clone())),
        TwinBackend::Qemu => Box::new(QemuDriver::new(config.twin.clone(), &config.work_root)),
    }
}

/// Owns one battle's workspaces from setup to teardown.
pub struct DigitalTwin {
    ctx: BattleContext,
    layout: TwinLayout,
    driver: Box<dyn TwinDriver>,
    phase: TwinPhase,
    /// Set once this twin provisions or adopts the workspace root. Cleanup
    /// leaves roots it never owned alone.
    owns_root: bool,
}

impl DigitalTwin {
    /// Twin for `source`, backend auto-detected from config and target.
    pub fn new(ctx: BattleContext, source: impl Into<PathBuf>, config: &BattleConfig) -> Self {
        let source = source.into();
        let backend = detect_backend(&source, &config.twin);
        let driver = driver_for(backend, config);
        Self::with_driver(ctx, source, config.work_root.clone(), driver)
    }

    /// Twin with an explicit driver.
    pub fn with_driver(
        ctx: BattleContext,
        source: PathBuf,
        work_root: PathBuf,
        driver: Box<dyn TwinDriver>,
    ) -> Self {
        let layout = TwinLayout::new(&ctx.battle_id, source, work_root);
        Self {
            ctx,
            layout,
            driver,
            phase: TwinPhase::Uninitialized,
            owns_root: false,
        }
    }

    pub fn backend(&self) -> TwinBackend {
        self.driver.backend()
    }

    pub fn phase(&self) -> TwinPhase {
        self.phase
    }

    pub fn layout(&self) -> &TwinLayout {
        &self.layout
    }

    /// Provision workspaces. `false` means the battle cannot run.
    pub async fn setup(&mut self) -> bool {
        match self.try_setup().await {
            Ok(()) => true,
            Err(e) => {
                error!(backend = %self.backend(), "Twin setup failed: {e}");
                self.ctx.status(&e.status_line());
                false
            }
        }
    }

    /// Provision workspaces, reporting why on failure.
    pub async fn try_setup(&mut self) -> BattleResult<()> {
        if self.phase != TwinPhase::Uninitialized {
            return Err(BattleError::InvalidTransition {
                from: self.phase.to_string(),
                to: TwinPhase::Ready.to_string(),
            });
        }
        if !self.layout.source.exists() {
            return Err(BattleError::setup(
                self.backend().to_string(),
                format!("target {} does not exist", self.layout.source.display()),
            ));
        }
        if self.layout.root.exists() {
            return Err(BattleError::setup(
                self.backend().to_string(),
                format!("workspace root {} already exists", self.layout.root.display()),
            ));
        }

        // from here on a partial setup is ours to tear down
        self.owns_root = true;
        self.driver.setup(&self.layout).await.map_err(|e| match e {
            BattleError::SetupFailed { .. } => e,
            other => BattleError::setup(self.backend().to_string(), other.to_string()),
        })?;

        self.phase = TwinPhase::Ready;
        info!(
            battle_id = %self.layout.battle_id,
            backend = %self.backend(),
            root = %self.layout.root.display(),
            "Digital twin ready"
        );
        Ok(())
    }

    /// Reattach to existing workspaces without re-provisioning.
    pub async fn attach(&mut self) -> bool {
        if self.phase != TwinPhase::Uninitialized {
            return self.phase == TwinPhase::Ready;
        }
        match self.driver.attach(&self.layout).await {
            Ok(()) => {
                self.phase = TwinPhase::Ready;
                self.owns_root = true;
                info!(backend = %self.backend(), "Reattached to existing twin");
                true
            }
            Err(e) => {
                error!(backend = %self.backend(), "Twin attach failed: {e}");
                self.ctx.status(&e.status_line());
                false
            }
        }
    }

    /// Push defender changes into the arena. `false` leaves the arena as it was.
    pub async fn sync(&mut self) -> bool {
        match self.try_sync().await {
            Ok(()) => true,
            Err(e) => {
                warn!(backend = %self.backend(), "Arena sync failed: {e}");
                self.ctx.status(&BattleError::sync(e.to_string()).status_line());
                false
            }
        }
    }

    pub async fn try_sync(&mut self) -> BattleResult<()> {
        if self.phase != TwinPhase::Ready {
            return Err(BattleError::sync(format!("twin is {}", self.phase)));
        }
        self.driver.sync(&self.layout).await
    }

    /// Tear everything down. Safe to call repeatedly and after failed setup.
    pub async fn cleanup(&mut self) {
        if self.phase == TwinPhase::Destroyed {
            return;
        }
        if !self.owns_root {
            self.phase = TwinPhase::Destroyed;
            debug!(
                battle_id = %self.layout.battle_id,
                root = %self.layout.root.display(),
                "Twin never took ownership, leaving workspace root in place"
            );
            return;
        }
        if let Err(e) = self.driver.cleanup(&self.layout).await {
            warn!(backend = %self.backend(), "Backend cleanup warning: {e}");
        }
        if self.layout.root.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.layout.root).await {
                warn!(root = %self.layout.root.display(), "Workspace removal failed: {e}");
            }
        }
        self.phase = TwinPhase::Destroyed;
        info!(battle_id = %self.layout.battle_id, "Digital twin destroyed");
    }

    fn path_for(&self, role: Role) -> PathBuf {
        if self.phase == TwinPhase::Ready {
            self.layout.workspace(role)
        } else {
            self.layout.source.clone()
        }
    }

    pub fn attacker_path(&self) -> PathBuf {
        self.path_for(Role::Attacker)
    }

    pub fn defender_path(&self) -> PathBuf {
        self.path_for(Role::Defender)
    }

    pub fn arena_path(&self) -> PathBuf {
        self.path_for(Role::Arena)
    }

    pub fn workspaces(&self) -> Workspaces {
        Workspaces {
            attacker: self.attacker_path(),
            defender: self.defender_path(),
            arena: self.arena_path(),
        }
    }
}
