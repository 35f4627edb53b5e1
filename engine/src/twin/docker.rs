//! Container backend
//!
//! One private network per battle, three hardened containers labelled by
//! role. Each container bind-mounts its staged role directory at
//! `/workspace`; the attacker's mount is read-only.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, warn};

use super::command::{docker_available, run};
use super::copy::{mirror_defender, stage_roles};
use super::{TwinDriver, TwinLayout};
use crate::config::TwinOptions;
use crate::error::{BattleError, BattleResult};
use crate::model::{Role, TwinBackend};

/// Names of the files that mark a container build context.
pub const BUILD_FILES: &[&str] = &["Dockerfile", "Containerfile"];

pub fn network_name(battle_id: &str) -> String {
    format!("battle-{battle_id}")
}

pub fn container_name(battle_id: &str, role: Role) -> String {
    format!("battle-{battle_id}-{role}")
}

fn built_image_tag(battle_id: &str) -> String {
    format!("battle-{}:latest", battle_id.to_ascii_lowercase())
}

/// Whether `dir` carries a container build file.
pub fn has_build_file(dir: &Path) -> bool {
    BUILD_FILES.iter().any(|f| dir.join(f).is_file())
}

/// Arguments for `docker run` of one role's container.
pub fn run_args(layout: &TwinLayout, role: Role, image: &str, opts: &TwinOptions) -> Vec<String> {
    let mount_mode = if role == Role::Attacker { "ro" } else { "rw" };
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        container_name(&layout.battle_id, role),
        "--hostname".into(),
        role.to_string(),
        "--network".into(),
        network_name(&layout.battle_id),
        "--label".into(),
        format!("battle.id={}", layout.battle_id),
        "--label".into(),
        format!("battle.role={role}"),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--read-only".into(),
        "--tmpfs".into(),
        format!("/tmp:rw,noexec,nosuid,size={}", opts.tmpfs_size),
        "--pids-limit".into(),
        opts.pids_limit.to_string(),
        "--memory".into(),
        opts.memory_limit.clone(),
        "-v".into(),
        format!("{}:/workspace:{mount_mode}", layout.workspace(role).display()),
    ];
    if let Some(profile) = &opts.seccomp_profile {
        args.push("--security-opt".into());
        args.push(format!("seccomp={}", profile.display()));
    }
    args.push(image.to_string());
    args.extend(["sleep".to_string(), "infinity".to_string()]);
    args
}

/// Docker driver.
#[derive(Debug)]
pub struct DockerDriver {
    opts: TwinOptions,
    /// Image tag we built ourselves (removed on cleanup).
    built_image: Option<String>,
}

impl DockerDriver {
    pub fn new(opts: TwinOptions) -> Self {
        Self {
            opts,
            built_image: None,
        }
    }

    async fn resolve_image(&mut self, layout: &TwinLayout) -> BattleResult<String> {
        if let Some(image) = self.opts.container_image.clone() {
            let present = run("docker", &["image", "inspect", &image], &layout.root)
                .await
                .is_ok();
            if !present {
                info!(image = %image, "Pulling container image");
                run("docker", &["pull", &image], &layout.root).await?;
            }
            return Ok(image);
        }

        if !layout.source.is_dir() || !has_build_file(&layout.source) {
            return Err(BattleError::setup(
                "docker",
                "no container image configured and no build file in target",
            ));
        }
        let tag = built_image_tag(&layout.battle_id);
        info!(tag = %tag, "Building container image");
        run(
            "docker",
            &["build", "-t", &tag, &layout.source.display().to_string()],
            &layout.root,
        )
        .await?;
        self.built_image = Some(tag.clone());
        Ok(tag)
    }
}

#[async_trait]
impl TwinDriver for DockerDriver {
    fn backend(&self) -> TwinBackend {
        TwinBackend::Docker
    }

    async fn setup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        tokio::fs::create_dir_all(&layout.root).await?;
        if !docker_available(&layout.root).await {
            return Err(BattleError::setup("docker", "container runtime not available"));
        }

        stage_roles(layout).await?;

        let network = network_name(&layout.battle_id);
        run(
            "docker",
            &[
                "network",
                "create",
                "--label",
                &format!("battle.id={}", layout.battle_id),
                &network,
            ],
            &layout.root,
        )
        .await?;

        let image = self.resolve_image(layout).await?;
        for role in Role::ALL {
            let args = run_args(layout, role, &image, &self.opts);
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            let id = run("docker", &argv, &layout.root).await?;
            debug!(role = %role, container = %id, "Started container");
        }
        Ok(())
    }

    async fn attach(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        layout.require_role_dirs()?;
        for role in Role::ALL {
            let name = container_name(&layout.battle_id, role);
            let running = run(
                "docker",
                &["inspect", "-f", "{{.State.Running}}", &name],
                &layout.root,
            )
            .await?;
            if running != "true" {
                return Err(BattleError::setup("docker", format!("container {name} is not running")));
            }
        }
        Ok(())
    }

    async fn sync(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        mirror_defender(layout, &[]).await
    }

    async fn cleanup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        let cwd = std::env::temp_dir();
        for role in Role::ALL {
            let name = container_name(&layout.battle_id, role);
            if let Err(e) = run("docker", &["rm", "-f", &name], &cwd).await {
                debug!(container = %name, "docker rm skipped: {e}");
            }
        }
        let network = network_name(&layout.battle_id);
        if let Err(e) = run("docker", &["network", "rm", &network], &cwd).await {
            debug!(network = %network, "docker network rm skipped: {e}");
        }
        if let Some(tag) = self.built_image.take() {
            if let Err(e) = run("docker", &["rmi", &tag], &cwd).await {
                warn!(image = %tag, "docker rmi warning: {e}");
            }
        }
        Ok(())
    }
}
