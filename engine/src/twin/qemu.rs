//! Emulated-machine backend
//!
//! Stages the firmware per role directory and writes a `machine.json`
//! descriptor next to it. The emulator itself runs inside the container
//! runtime, so a working runtime is a precondition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::command::docker_available;
use super::copy::{copy_tree, mirror_defender};
use super::ports::PortAllocator;
use super::{TwinDriver, TwinLayout};
use crate::config::TwinOptions;
use crate::error::{BattleError, BattleResult};
use crate::model::{Role, TwinBackend};
use crate::persistence::write_json_atomic;

/// Extensions treated as firmware/binary images.
pub const BINARY_EXTENSIONS: &[&str] = &["bin", "elf", "img", "hex", "fw", "rom", "uf2", "srec"];

/// Descriptor file written into each role directory.
pub const DESCRIPTOR_FILE: &str = "machine.json";

/// Machine type used when the target is detected only by extension.
pub const DEFAULT_MACHINE: &str = "virt";

/// Whether `path` names a firmware/binary image.
pub fn is_binary_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Per-role machine descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDescriptor {
    pub battle_id: String,
    pub role: Role,
    pub machine: String,
    pub firmware: String,
    pub debug_port: u16,
}

/// Find the firmware image to boot: the source itself, or the first image in it.
fn locate_firmware(source: &Path) -> BattleResult<PathBuf> {
    if source.is_file() {
        return Ok(source.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(source)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_binary_image(p))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| BattleError::setup("qemu", format!("no firmware image in {}", source.display())))
}

/// QEMU driver.
#[derive(Debug, Clone)]
pub struct QemuDriver {
    opts: TwinOptions,
    ports: PortAllocator,
}

impl QemuDriver {
    pub fn new(opts: TwinOptions, work_root: &Path) -> Self {
        let ports = PortAllocator::new(work_root, opts.debug_port_base, opts.debug_port_span);
        Self { opts, ports }
    }

    fn machine(&self) -> String {
        self.opts
            .qemu_machine
            .clone()
            .unwrap_or_else(|| DEFAULT_MACHINE.to_string())
    }

    /// Stage firmware and write descriptors for every role.
    pub fn stage(&self, layout: &TwinLayout) -> BattleResult<Vec<MachineDescriptor>> {
        let firmware = locate_firmware(&layout.source)?;
        let firmware_name = firmware
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BattleError::setup("qemu", "firmware has no file name"))?
            .to_string();

        let mut descriptors = Vec::new();
        for role in Role::ALL {
            let dir = layout.workspace(role);
            copy_tree(&layout.source, &dir)?;
            let descriptor = MachineDescriptor {
                battle_id: layout.battle_id.clone(),
                role,
                machine: self.machine(),
                firmware: firmware_name.clone(),
                debug_port: self.ports.allocate(&layout.battle_id, role)?,
            };
            write_json_atomic(&dir.join(DESCRIPTOR_FILE), &descriptor)?;
            debug!(role = %role, port = descriptor.debug_port, "Staged machine");
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }
}

#[async_trait]
impl TwinDriver for QemuDriver {
    fn backend(&self) -> TwinBackend {
        TwinBackend::Qemu
    }

    async fn setup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        tokio::fs::create_dir_all(&layout.root).await?;
        if !docker_available(&layout.root).await {
            return Err(BattleError::setup("qemu", "container runtime not available"));
        }
        // staging copies the tree and probes ports
        let stager = self.clone();
        let layout = layout.clone();
        tokio::task::spawn_blocking(move || stager.stage(&layout))
            .await
            .map_err(|e| BattleError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn attach(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        layout.require_role_dirs()?;
        for role in Role::ALL {
            let path = layout.workspace(role).join(DESCRIPTOR_FILE);
            let present = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !present {
                return Err(BattleError::setup("qemu", format!("missing {}", path.display())));
            }
        }
        Ok(())
    }

    async fn sync(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        // keep the arena's own descriptor (its debug port differs)
        mirror_defender(layout, &[DESCRIPTOR_FILE]).await
    }

    async fn cleanup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        if let Err(e) = self.ports.release(&layout.battle_id) {
            warn!("debug port release failed: {e}");
        }
        Ok(())
    }
}
