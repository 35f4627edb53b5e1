//! Subprocess agents driven through real shell commands.
#![cfg(unix)]

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use battle_agents::{AgentCommand, CommandAttacker, CommandDefender};
use battle_engine::state::read_state;
use battle_engine::{
    Attacker, BattleConfig, BattleContext, BattleMode, BattleOrchestrator, BattleStatus,
    BufferConsole, Defender, Finding, RoundContext, Severity, TwinBackend, Workspaces,
};
use tokio_util::sync::CancellationToken;

fn shell(script: &str) -> AgentCommand {
    AgentCommand {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
    }
}

struct Round {
    _dir: tempfile::TempDir,
    ctx: RoundContext,
}

fn round(n: u32) -> Round {
    let dir = tempfile::tempdir().unwrap();
    let workspaces = Workspaces {
        attacker: dir.path().join("attacker"),
        defender: dir.path().join("defender"),
        arena: dir.path().join("arena"),
    };
    for path in [&workspaces.attacker, &workspaces.defender, &workspaces.arena] {
        fs::create_dir_all(path).unwrap();
    }
    Round {
        _dir: dir,
        ctx: RoundContext {
            battle_id: "cmd-test".into(),
            round: n,
            workspaces,
        },
    }
}

#[tokio::test]
async fn test_attacker_reads_env_and_parses_stdout() {
    let r = round(4);
    let attacker = CommandAttacker::new(shell(
        r#"pwd > where.txt; printf '[{"id":"F-%s","description":"%s","severity":"high"}]' "$BATTLE_ROUND" "$BATTLE_ROLE""#,
    ));

    let findings = attacker.attack(&r.ctx, CancellationToken::new()).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].id, "F-4");
    assert_eq!(findings[0].description, "attacker");
    assert_eq!(findings[0].severity, Severity::High);

    // Ran inside the attacker's workspace.
    assert!(r.ctx.workspaces.attacker.join("where.txt").exists());
}

#[tokio::test]
async fn test_attacker_with_no_output_reports_nothing() {
    let r = round(1);
    let attacker = CommandAttacker::new(shell("true"));
    let findings = attacker.attack(&r.ctx, CancellationToken::new()).await.unwrap();
    assert!(findings.is_empty());
}

#[tokio::test]
async fn test_defender_receives_findings_on_stdin() {
    let r = round(2);
    let defender = CommandDefender::new(shell(
        r#"cat > findings.json; printf '[{"finding_ids":["F-2-a"],"description":"escape output","verified":true}]'"#,
    ));
    let findings = vec![Finding::new("F-2-a", "xss", Severity::Medium, "index.php:1")];

    let patches = defender
        .defend(&findings, &r.ctx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(patches.len(), 1);
    assert!(patches[0].verified);
    assert_eq!(patches[0].finding_ids, vec!["F-2-a".to_string()]);

    let echoed = fs::read_to_string(r.ctx.workspaces.defender.join("findings.json")).unwrap();
    let echoed: Vec<Finding> = serde_json::from_str(&echoed).unwrap();
    assert_eq!(echoed, findings);
}

#[tokio::test]
async fn test_non_zero_exit_carries_stderr() {
    let r = round(1);
    let attacker = CommandAttacker::new(shell("echo 'scanner crashed' >&2; exit 3"));
    let err = attacker
        .attack(&r.ctx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scanner crashed"), "{err}");
}

#[tokio::test]
async fn test_garbage_stdout_is_an_error() {
    let r = round(1);
    let attacker = CommandAttacker::new(shell("echo 'found stuff!'"));
    assert!(attacker.attack(&r.ctx, CancellationToken::new()).await.is_err());
}

#[tokio::test]
async fn test_cancellation_kills_child() {
    let r = round(1);
    let attacker = CommandAttacker::new(shell("sleep 30"));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = attacker.attack(&r.ctx, cancel).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let r = round(1);
    let attacker = CommandAttacker::from_line("/nonexistent/scanner --fast").unwrap();
    let err = attacker
        .attack(&r.ctx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to spawn"), "{err}");
}

#[tokio::test]
async fn test_full_battle_with_shell_agents() {
    let target = tempfile::tempdir().unwrap();
    fs::write(target.path().join("index.php"), "<?php echo $_GET['q']; ?>").unwrap();
    let work = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();

    let mut config = BattleConfig {
        max_rounds: 2,
        mode: BattleMode::Sequential,
        checkpoint_interval: 1,
        work_root: work.path().to_path_buf(),
        state_dir: state_dir.path().to_path_buf(),
        ..Default::default()
    };
    config.twin.backend = Some(TwinBackend::Copy);

    // One finding in round 1, nothing afterwards.
    let attacker = CommandAttacker::new(shell(
        r#"if [ "$BATTLE_ROUND" = 1 ]; then printf '[{"id":"F-xss","description":"reflected xss","severity":"medium","location":"index.php:1"}]'; fi"#,
    ));
    let defender = CommandDefender::new(shell(
        r#"cat > /dev/null; echo '<?php echo htmlspecialchars($_GET["q"]); ?>' > index.php; printf '[{"finding_ids":["F-xss"],"description":"escape q","verified":true}]'"#,
    ));

    let console = Arc::new(BufferConsole::new());
    let mut battle = BattleOrchestrator::new(
        BattleContext::new("shell-battle", console.clone()),
        config,
        target.path(),
        Arc::new(attacker),
        Arc::new(defender),
    )
    .unwrap();

    let summary = battle.run().await;
    assert_eq!(summary.status, BattleStatus::Completed);
    assert_eq!(summary.rounds, 2);

    let state = read_state(&battle.state()).clone();
    let first = &state.rounds[0];
    assert_eq!(first.findings[0].id, "F-xss");
    assert_eq!(first.findings[0].round, 1);
    assert_eq!(first.patches.len(), 1);
    assert!(first.patches[0].id.starts_with("P-1-"));
    assert!(first.synced);
    assert!(state.rounds[1].findings.is_empty());

    // The target itself is never touched.
    let original = fs::read_to_string(target.path().join("index.php")).unwrap();
    assert!(original.contains("$_GET['q']"));
    assert!(!console.lines().is_empty());
}
