//! Git worktree backend
//!
//! Each role gets branch `battle/<id>/<role>` cut from the source HEAD and a
//! worktree at `<root>/<role>`. Sync cherry-picks new defender commits onto
//! the arena branch.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::command::git;
use super::{TwinDriver, TwinLayout};
use crate::error::{BattleError, BattleResult};
use crate::model::{Role, TwinBackend};

/// Identity used for commits the twin makes on the defender's behalf.
const COMMIT_IDENTITY: [&str; 4] = ["-c", "user.name=battle", "-c", "user.email=battle@localhost"];

/// Branch name for a role.
pub fn branch_name(battle_id: &str, role: Role) -> String {
    format!("battle/{battle_id}/{role}")
}

/// Git worktree driver.
#[derive(Debug, Default)]
pub struct GitWorktreeDriver {
    /// Last defender commit already present in the arena.
    last_synced: Option<String>,
}

impl GitWorktreeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit anything the defender left uncommitted.
    async fn commit_pending(&self, layout: &TwinLayout) -> BattleResult<bool> {
        let defender = layout.workspace(Role::Defender);
        let status = git(&["status", "--porcelain"], &defender).await?;
        if status.is_empty() {
            return Ok(false);
        }
        git(&["add", "-A"], &defender).await?;
        let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
        args.extend(["commit", "-m", "battle: defender patch"]);
        git(&args, &defender).await?;
        Ok(true)
    }
}

#[async_trait]
impl TwinDriver for GitWorktreeDriver {
    fn backend(&self) -> TwinBackend {
        TwinBackend::GitWorktree
    }

    async fn setup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        git(&["rev-parse", "--git-dir"], &layout.source)
            .await
            .map_err(|e| BattleError::setup("git-worktree", format!("not a git repository: {e}")))?;
        let head = git(&["rev-parse", "HEAD"], &layout.source).await?;

        tokio::fs::create_dir_all(&layout.root).await?;
        for role in Role::ALL {
            let branch = branch_name(&layout.battle_id, role);
            let path = layout.workspace(role);
            git(&["branch", &branch, &head], &layout.source).await?;
            git(
                &["worktree", "add", &path.display().to_string(), &branch],
                &layout.source,
            )
            .await?;
            debug!(role = %role, branch = %branch, path = %path.display(), "Created worktree");
        }

        self.last_synced = Some(head);
        Ok(())
    }

    async fn attach(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        layout.require_role_dirs()?;
        let arena = layout.workspace(Role::Arena);
        let defender = layout.workspace(Role::Defender);
        let arena_branch = branch_name(&layout.battle_id, Role::Arena);
        let defender_branch = branch_name(&layout.battle_id, Role::Defender);
        git(&["rev-parse", "--verify", &arena_branch], &arena).await?;
        // Resume from the fork point. Commits the arena already carries
        // replay as empty commits under --keep-redundant-commits.
        let base = git(&["merge-base", &arena_branch, &defender_branch], &defender).await?;
        self.last_synced = Some(base);
        Ok(())
    }

    async fn sync(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        let arena = layout.workspace(Role::Arena);
        let defender = layout.workspace(Role::Defender);

        if self.commit_pending(layout).await? {
            debug!("Committed pending defender changes before sync");
        }

        let tip = git(&["rev-parse", "HEAD"], &defender).await?;
        if self.last_synced.as_deref() == Some(tip.as_str()) {
            debug!(tip = %tip, "Arena already up to date");
            return Ok(());
        }

        let range = match &self.last_synced {
            Some(last) => format!("{last}..{tip}"),
            None => tip.clone(),
        };
        let mut args: Vec<&str> = COMMIT_IDENTITY.to_vec();
        args.extend(["cherry-pick", "--keep-redundant-commits", &range]);

        if let Err(e) = git(&args, &arena).await {
            if let Err(abort) = git(&["cherry-pick", "--abort"], &arena).await {
                warn!("cherry-pick --abort failed: {abort}");
            }
            return Err(BattleError::sync(format!("cherry-pick {range} onto arena: {e}")));
        }

        info!(tip = %tip, "Synced defender commits into arena");
        self.last_synced = Some(tip);
        Ok(())
    }

    async fn cleanup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        if git(&["rev-parse", "--git-dir"], &layout.source).await.is_err() {
            return Ok(());
        }
        for role in Role::ALL {
            let path = layout.workspace(role);
            if path.exists() {
                if let Err(e) = git(
                    &["worktree", "remove", "--force", &path.display().to_string()],
                    &layout.source,
                )
                .await
                {
                    warn!(role = %role, "git worktree remove warning: {e}");
                }
            }
        }
        if let Err(e) = git(&["worktree", "prune"], &layout.source).await {
            warn!("git worktree prune warning: {e}");
        }
        for role in Role::ALL {
            let branch = branch_name(&layout.battle_id, role);
            let exists = git(
                &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
                &layout.source,
            )
            .await
            .is_ok();
            if exists {
                if let Err(e) = git(&["branch", "-D", &branch], &layout.source).await {
                    warn!(branch = %branch, "git branch -D warning: {e}");
                }
            }
        }
        Ok(())
    }
}
