use sessdex_core::{CacheStore, Scope, Source};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const CODEX_SESSION_ID: &str = "019ab86e-1e83-75b0-b2d7-d335492e7026";

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        seed_codex_fixture(&home);

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("sessdex/index.db")
    }
}

fn seed_codex_fixture(home: &Path) {
    let name = format!("rollout-2025-11-25T00-33-35-{CODEX_SESSION_ID}.jsonl");
    let source = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../sessdex-core/tests/fixtures/codex")
        .join(&name);
    let target = home.join(".codex/sessions/2025/11/25").join(&name);

    fs::create_dir_all(target.parent().expect("missing fixture parent"))
        .expect("failed to create codex fixture directories");
    fs::copy(source, target).expect("failed to copy codex fixture");
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("sessdex"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", env.home.join("run"))
        .output()
        .unwrap_or_else(|e| panic!("failed to execute sessdex: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "sessdex {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout_of(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn sync_indexes_codex_fixture_and_populates_store() {
    let env = CliTestEnv::new();

    let stdout = stdout_of(&env, &["sync"]);
    assert!(stdout.contains("Sync complete:"));
    assert!(
        stdout.contains("New:              1"),
        "expected sync summary in stdout, got:\n{stdout}"
    );

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "store file should exist at {}",
        db_path.display()
    );

    let store = CacheStore::open(&db_path).expect("failed to open store");
    let sessions = store
        .list_sessions(&Scope::All, 10)
        .expect("failed to list sessions");
    assert_eq!(sessions.len(), 1, "expected one indexed session");
    assert_eq!(sessions[0].source, Source::Codex);
    assert_eq!(sessions[0].session_id, CODEX_SESSION_ID);
    assert_eq!(sessions[0].project.as_deref(), Some("beta"));
    assert!(sessions[0].parse_error.is_none());
}

#[test]
fn second_sync_parses_nothing() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["sync"]);

    let stdout = stdout_of(&env, &["sync"]);
    assert!(stdout.contains("Unchanged:        1"), "got:\n{stdout}");
    assert!(stdout.contains("Parsed:           0"), "got:\n{stdout}");
}

#[test]
fn dry_run_classifies_without_writing() {
    let env = CliTestEnv::new();

    let stdout = stdout_of(&env, &["sync", "--dry-run"]);
    assert!(stdout.contains("Codex: 1 file(s)"), "got:\n{stdout}");
    assert!(stdout.contains("New:       1"), "got:\n{stdout}");
    assert!(!env.db_path().exists());
}

#[test]
fn stats_sessions_and_title_work_on_synced_store() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["sync"]);

    let stats = stdout_of(&env, &["stats", "--project", "beta"]);
    assert!(stats.contains("Sessions:          1"), "got:\n{stats}");
    assert!(stats.contains("Tokens:            1.5K"), "got:\n{stats}");

    let other = stdout_of(&env, &["stats", "--project", "gamma"]);
    assert!(other.contains("Sessions:          0"), "got:\n{other}");

    let ranged = stdout_of(
        &env,
        &[
            "stats", "--since", "2025-11-25", "--until", "2025-11-25", "--by", "created",
        ],
    );
    assert!(ranged.contains("Sessions:          1"), "got:\n{ranged}");

    let title_args = ["title", CODEX_SESSION_ID, "Fix the flaky test"];
    stdout_of(&env, &title_args);

    let listing = stdout_of(&env, &["sessions"]);
    assert!(listing.contains(CODEX_SESSION_ID), "got:\n{listing}");
    assert!(listing.contains("Fix the flaky test"), "got:\n{listing}");

    // A user-owned title survives a resync
    stdout_of(&env, &["sync"]);
    let store = CacheStore::open(&env.db_path()).expect("failed to open store");
    let record = store
        .get_session(CODEX_SESSION_ID)
        .expect("failed to read session")
        .expect("session missing");
    assert_eq!(record.title.as_deref(), Some("Fix the flaky test"));
}

#[test]
fn title_for_unknown_session_fails() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["sync"]);

    let output = run_bin(&env, &["title", "no-such-session", "x"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no indexed session"), "got:\n{stderr}");
}
