//! Digital twin lifecycle against real directories and real git repositories.

use std::fs;
use std::path::Path;
use std::process::Command;

use battle_engine::twin::git::branch_name;
use battle_engine::{BattleConfig, BattleContext, DigitalTwin, Role, TwinBackend, TwinPhase};

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Fresh repository with one commit.
fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "test@test.com"]);
    git(dir, &["config", "user.name", "Test"]);
    write(&dir.join("src/lib.rs"), "pub fn check(input: &str) -> bool {\n    true\n}\n");
    write(&dir.join("README.md"), "# demo\n");
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

fn config(work_root: &Path) -> BattleConfig {
    BattleConfig {
        work_root: work_root.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_copy_round_trip_and_cleanup() {
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write(&source.path().join("app/main.py"), "print('hi')\n");
    write(&source.path().join("app/util.py"), "X = 1\n");
    write(&source.path().join("config.ini"), "[a]\n");
    write(&source.path().join("node_modules/dep/index.js"), "");
    write(&source.path().join("app/__pycache__/main.pyc"), "");

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("copy-1"),
        source.path(),
        &config(work.path()),
    );
    assert_eq!(twin.backend(), TwinBackend::Copy);
    assert!(twin.setup().await);
    assert_eq!(twin.phase(), TwinPhase::Ready);

    for path in [twin.attacker_path(), twin.defender_path(), twin.arena_path()] {
        assert_eq!(fs::read_to_string(path.join("app/main.py")).unwrap(), "print('hi')\n");
        assert_eq!(fs::read_to_string(path.join("app/util.py")).unwrap(), "X = 1\n");
        assert!(path.join("config.ini").is_file());
        assert!(!path.join("node_modules").exists());
        assert!(!path.join("app/__pycache__").exists());
    }

    let root = work.path().join("copy-1");
    assert!(root.is_dir());
    twin.cleanup().await;
    assert!(!root.exists());
    assert_eq!(twin.phase(), TwinPhase::Destroyed);

    // idempotent, and no way back to ready
    twin.cleanup().await;
    assert!(!twin.setup().await);
    assert_eq!(twin.arena_path(), source.path());
}

#[tokio::test]
async fn test_copy_sync_mirrors_defender_into_arena() {
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write(&source.path().join("login.php"), "<?php echo $_GET['u']; ?>");
    write(&source.path().join("legacy.php"), "<?php ?>");

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("copy-2"),
        source.path(),
        &config(work.path()),
    );
    assert!(twin.setup().await);

    let defender = twin.defender_path();
    let arena = twin.arena_path();
    write(&defender.join("login.php"), "<?php echo htmlspecialchars($_GET['u']); ?>");
    fs::remove_file(defender.join("legacy.php")).unwrap();
    write(&arena.join(".arena-state"), "keep");

    assert!(twin.sync().await);
    assert!(fs::read_to_string(arena.join("login.php"))
        .unwrap()
        .contains("htmlspecialchars"));
    assert!(!arena.join("legacy.php").exists());
    assert!(arena.join(".arena-state").exists());
    // attacker view is untouched
    assert!(!fs::read_to_string(twin.attacker_path().join("login.php"))
        .unwrap()
        .contains("htmlspecialchars"));

    twin.cleanup().await;
}

#[tokio::test]
async fn test_setup_refuses_existing_workspace_root() {
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write(&source.path().join("a.txt"), "a");
    fs::create_dir_all(work.path().join("taken")).unwrap();

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("taken"),
        source.path(),
        &config(work.path()),
    );
    assert!(!twin.setup().await);
    assert_eq!(twin.phase(), TwinPhase::Uninitialized);
}

#[tokio::test]
async fn test_refused_setup_leaves_existing_root_on_cleanup() {
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write(&source.path().join("a.txt"), "a");
    write(&work.path().join("dup/arena/keep.txt"), "paused battle");

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("dup"),
        source.path(),
        &config(work.path()),
    );
    assert!(!twin.setup().await);
    twin.cleanup().await;

    assert_eq!(twin.phase(), TwinPhase::Destroyed);
    assert_eq!(
        fs::read_to_string(work.path().join("dup/arena/keep.txt")).unwrap(),
        "paused battle"
    );
}

#[tokio::test]
async fn test_refused_git_setup_keeps_other_twins_worktrees() {
    let repo = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let mut owner = DigitalTwin::new(
        BattleContext::with_tracing("g-dup"),
        repo.path(),
        &config(work.path()),
    );
    assert!(owner.setup().await);

    let mut intruder = DigitalTwin::new(
        BattleContext::with_tracing("g-dup"),
        repo.path(),
        &config(work.path()),
    );
    assert!(!intruder.setup().await);
    intruder.cleanup().await;

    let branches = git(repo.path(), &["branch", "--list", "battle/*"]);
    for role in Role::ALL {
        assert!(branches.contains(&branch_name("g-dup", role)), "{branches}");
    }
    assert!(owner.arena_path().join("src/lib.rs").is_file());

    owner.cleanup().await;
    assert!(!work.path().join("g-dup").exists());
}

#[tokio::test]
async fn test_sync_before_setup_fails() {
    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("early"),
        source.path(),
        &config(work.path()),
    );
    assert!(!twin.sync().await);
}

#[tokio::test]
async fn test_git_worktrees_and_branches() {
    let repo = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("g1"),
        repo.path(),
        &config(work.path()),
    );
    assert_eq!(twin.backend(), TwinBackend::GitWorktree);
    assert!(twin.setup().await);

    let branches = git(repo.path(), &["branch", "--list", "battle/*"]);
    for role in Role::ALL {
        assert!(branches.contains(&branch_name("g1", role)), "{branches}");
    }
    assert!(twin.arena_path().join("src/lib.rs").is_file());

    twin.cleanup().await;
    assert!(!work.path().join("g1").exists());
    assert!(git(repo.path(), &["branch", "--list", "battle/*"]).is_empty());
    twin.cleanup().await;
}

#[tokio::test]
async fn test_git_sync_brings_defender_commit_into_arena() {
    let repo = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("g2"),
        repo.path(),
        &config(work.path()),
    );
    assert!(twin.setup().await);

    let defender = twin.defender_path();
    write(
        &defender.join("src/lib.rs"),
        "pub fn check(input: &str) -> bool {\n    !input.contains('\\'')\n}\n",
    );
    git(&defender, &["add", "-A"]);
    git(&defender, &["commit", "-q", "-m", "reject quotes"]);

    assert!(twin.sync().await);
    let arena = twin.arena_path();
    assert!(git(&arena, &["log", "--format=%s"]).contains("reject quotes"));
    assert!(fs::read_to_string(arena.join("src/lib.rs"))
        .unwrap()
        .contains("contains"));

    // uncommitted defender edits are committed and carried over too
    write(&defender.join("SECURITY.md"), "report to security@example.com\n");
    assert!(twin.sync().await);
    assert!(arena.join("SECURITY.md").is_file());

    // nothing new: still a successful no-op
    assert!(twin.sync().await);

    twin.cleanup().await;
}

#[tokio::test]
async fn test_git_attach_then_sync_continues_from_paused_twin() {
    let repo = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let mut first = DigitalTwin::new(
        BattleContext::with_tracing("g-resume"),
        repo.path(),
        &config(work.path()),
    );
    assert!(first.setup().await);
    let defender = first.defender_path();
    write(&defender.join("src/guard.rs"), "pub const MAX_LEN: usize = 64;\n");
    git(&defender, &["add", "-A"]);
    git(&defender, &["commit", "-q", "-m", "length guard"]);
    assert!(first.sync().await);
    // paused: the twin is dropped without cleanup
    drop(first);

    let mut resumed = DigitalTwin::new(
        BattleContext::with_tracing("g-resume"),
        repo.path(),
        &config(work.path()),
    );
    assert!(resumed.attach().await);
    assert_eq!(resumed.phase(), TwinPhase::Ready);

    let defender = resumed.defender_path();
    write(&defender.join("src/audit.rs"), "pub fn audit() {}\n");
    git(&defender, &["add", "-A"]);
    git(&defender, &["commit", "-q", "-m", "audit hook"]);
    assert!(resumed.sync().await);

    let arena = resumed.arena_path();
    let log = git(&arena, &["log", "--format=%s"]);
    assert!(log.contains("length guard"), "{log}");
    assert!(log.contains("audit hook"), "{log}");
    assert!(arena.join("src/guard.rs").is_file());
    assert!(arena.join("src/audit.rs").is_file());
    assert!(git(&arena, &["status", "--porcelain"]).is_empty());

    resumed.cleanup().await;
    assert!(!work.path().join("g-resume").exists());
    assert!(git(repo.path(), &["branch", "--list", "battle/*"]).is_empty());
}

#[tokio::test]
async fn test_git_sync_conflict_leaves_arena_unchanged() {
    let repo = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    init_repo(repo.path());

    let mut twin = DigitalTwin::new(
        BattleContext::with_tracing("g3"),
        repo.path(),
        &config(work.path()),
    );
    assert!(twin.setup().await);

    let arena = twin.arena_path();
    write(&arena.join("src/lib.rs"), "pub fn check(input: &str) -> bool {\n    false\n}\n");
    git(&arena, &["add", "-A"]);
    git(&arena, &["commit", "-q", "-m", "arena drift"]);
    let arena_head = git(&arena, &["rev-parse", "HEAD"]);

    let defender = twin.defender_path();
    write(
        &defender.join("src/lib.rs"),
        "pub fn check(input: &str) -> bool {\n    input.is_ascii()\n}\n",
    );
    git(&defender, &["add", "-A"]);
    git(&defender, &["commit", "-q", "-m", "ascii only"]);

    assert!(!twin.sync().await);
    assert_eq!(git(&arena, &["rev-parse", "HEAD"]), arena_head);
    assert!(git(&arena, &["status", "--porcelain"]).is_empty());
    assert!(fs::read_to_string(arena.join("src/lib.rs"))
        .unwrap()
        .contains("false"));

    twin.cleanup().await;
}

fn docker(args: &[&str]) -> String {
    let out = Command::new("docker").args(args).output().unwrap();
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

#[tokio::test]
#[ignore = "needs a running docker daemon and the alpine image"]
async fn test_docker_twin_lifecycle() {
    use battle_engine::twin::docker::{container_name, network_name};

    let source = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write(&source.path().join("app.sh"), "echo hi\n");

    let mut cfg = config(work.path());
    cfg.twin.container_image = Some("alpine:3".into());
    let mut twin = DigitalTwin::new(BattleContext::with_tracing("docker-live"), source.path(), &cfg);
    assert_eq!(twin.backend(), TwinBackend::Docker);
    assert!(twin.setup().await);

    for role in Role::ALL {
        let name = container_name("docker-live", role);
        assert_eq!(docker(&["inspect", "-f", "{{.State.Running}}", &name]), "true");
    }

    write(&twin.defender_path().join("app.sh"), "echo patched\n");
    assert!(twin.sync().await);
    assert_eq!(
        fs::read_to_string(twin.arena_path().join("app.sh")).unwrap(),
        "echo patched\n"
    );

    twin.cleanup().await;
    assert!(docker(&["ps", "-aq", "--filter", "label=battle.id=docker-live"]).is_empty());
    assert!(docker(&["network", "ls", "-q", "--filter", &format!("name={}", network_name("docker-live"))]).is_empty());
}
