//! Plain-copy backend
//!
//! Three recursive copies of the source tree.
//!
//! The only backend that needs neither a VCS nor a container runtime.
//! The tree helpers here are shared with the container backends, which
//! stage role directories the same way.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{TwinDriver, TwinLayout};
use crate::error::{BattleError, BattleResult};
use crate::model::{Role, TwinBackend};

/// Directory names never copied into a workspace.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "target",
    "node_modules",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".venv",
    ".tox",
    ".cache",
];

fn is_excluded(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

/// Copy `src` into `dst`, skipping VCS and cache directories.
///
/// A file source lands as `dst/<file name>`. Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> BattleResult<usize> {
    std::fs::create_dir_all(dst)?;

    if src.is_file() {
        let name = src
            .file_name()
            .ok_or_else(|| BattleError::config(format!("bad source path {}", src.display())))?;
        std::fs::copy(src, dst.join(name))?;
        return Ok(1);
    }

    let walker = ignore::WalkBuilder::new(src)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_str().is_some_and(is_excluded)
        })
        .build();

    let mut copied = 0;
    for entry in walker {
        let entry = entry.map_err(|e| BattleError::Io(std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| BattleError::Io(std::io::Error::other(e)))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        match entry.file_type() {
            Some(ft) if ft.is_dir() => std::fs::create_dir_all(&target)?,
            Some(ft) if ft.is_file() => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
                copied += 1;
            }
            // symlinks and specials are not part of the twin
            _ => {}
        }
    }
    Ok(copied)
}

/// Make `to`'s non-hidden top-level entries match `from`'s.
///
/// Hidden entries and anything named in `keep` are left untouched on both sides.
pub fn mirror_visible(from: &Path, to: &Path, keep: &[&str]) -> BattleResult<()> {
    let skip = |name: &str| name.starts_with('.') || keep.contains(&name) || is_excluded(name);

    for entry in std::fs::read_dir(to)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if skip(name) {
            continue;
        }
        if !from.join(name).exists() {
            remove_path(&entry.path())?;
        }
    }

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else { continue };
        if skip(name_str) {
            continue;
        }
        let target = to.join(&name);
        if target.exists() {
            remove_path(&target)?;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Stage one copy of `source` per role under the layout root.
pub(crate) async fn stage_roles(layout: &TwinLayout) -> BattleResult<()> {
    for role in Role::ALL {
        let src = layout.source.clone();
        let dst = layout.workspace(role);
        let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| BattleError::Io(std::io::Error::other(e)))??;
        debug!(role = %role, files = copied, "Staged workspace");
    }
    Ok(())
}

/// Mirror defender into arena on a blocking thread.
pub(crate) async fn mirror_defender(layout: &TwinLayout, keep: &'static [&'static str]) -> BattleResult<()> {
    let from: PathBuf = layout.workspace(Role::Defender);
    let to: PathBuf = layout.workspace(Role::Arena);
    tokio::task::spawn_blocking(move || mirror_visible(&from, &to, keep))
        .await
        .map_err(|e| BattleError::Io(std::io::Error::other(e)))?
        .map_err(|e| BattleError::sync(e.to_string()))
}

/// Copy backend driver.
#[derive(Debug, Default)]
pub struct CopyDriver;

#[async_trait]
impl TwinDriver for CopyDriver {
    fn backend(&self) -> TwinBackend {
        TwinBackend::Copy
    }

    async fn setup(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        stage_roles(layout).await
    }

    async fn attach(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        layout.require_role_dirs()
    }

    async fn sync(&mut self, layout: &TwinLayout) -> BattleResult<()> {
        mirror_defender(layout, &[]).await
    }

    async fn cleanup(&mut self, _layout: &TwinLayout) -> BattleResult<()> {
        // the layout root is removed by the twin itself
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_copy_tree_skips_vcs_and_caches() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("src/main.rs"), "fn main() {}");
        write(&src.path().join(".env"), "KEY=1");
        write(&src.path().join(".git/HEAD"), "ref: refs/heads/main");
        write(&src.path().join("node_modules/x/index.js"), "");
        write(&src.path().join("pkg/__pycache__/a.pyc"), "");

        let copied = copy_tree(src.path(), dst.path()).unwrap();
        assert_eq!(copied, 2);
        assert!(dst.path().join("src/main.rs").exists());
        assert!(dst.path().join(".env").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("node_modules").exists());
        assert!(dst.path().join("pkg").exists());
        assert!(!dst.path().join("pkg/__pycache__").exists());
    }

    #[test]
    fn test_copy_tree_single_file() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let fw = src.path().join("router.bin");
        std::fs::write(&fw, [0u8, 1, 2]).unwrap();

        copy_tree(&fw, dst.path()).unwrap();
        assert_eq!(std::fs::read(dst.path().join("router.bin")).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_mirror_visible_replaces_and_prunes() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        write(&from.path().join("app.py"), "patched");
        write(&from.path().join("lib/util.py"), "new util");
        write(&to.path().join("app.py"), "vulnerable");
        write(&to.path().join("stale.txt"), "gone soon");
        write(&to.path().join(".secret"), "keep me");
        write(&to.path().join("machine.json"), "{}");

        mirror_visible(from.path(), to.path(), &["machine.json"]).unwrap();

        assert_eq!(std::fs::read_to_string(to.path().join("app.py")).unwrap(), "patched");
        assert_eq!(
            std::fs::read_to_string(to.path().join("lib/util.py")).unwrap(),
            "new util"
        );
        assert!(!to.path().join("stale.txt").exists());
        assert!(to.path().join(".secret").exists());
        assert!(to.path().join("machine.json").exists());
    }
}
