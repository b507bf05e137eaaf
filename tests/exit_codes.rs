use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

const ENV_KEYS: [&str; 9] = [
    "BOOTMEND_CONFIG",
    "BOOTMEND_REPAIR_MAX_TIER",
    "BOOTMEND_REPAIR_PREFER_REVERSIBLE",
    "BOOTMEND_REPAIR_INSTALL_MEDIA",
    "BOOTMEND_COMMAND_TIMEOUT_SECS",
    "BOOTMEND_ENVIRONMENT_KIND",
    "BOOTMEND_ENVIRONMENT_FIRMWARE",
    "BOOTMEND_SESSION_LOCK_DIR",
    "BOOTMEND_UI_COLOR",
];

fn bootmend_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bootmend"));
    cmd.env("HOME", home);
    cmd.env("USERPROFILE", home);
    for key in ENV_KEYS {
        cmd.env_remove(key);
    }
    cmd.stdin(Stdio::null());
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    bootmend_cmd(home).args(args).output().expect("run bootmend")
}

fn make_temp_home() -> PathBuf {
    static HOME_SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
    let home = std::env::temp_dir().join(format!(
        "bootmend-exit-test-{}-{seq}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&home);
    std::fs::create_dir_all(&home).expect("create home");
    home
}

#[test]
fn completion_unknown_shell_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["completion", "nope"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn completion_bash_succeeds() {
    let home = make_temp_home();
    let out = run(&home, &["completion", "bash"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("bootmend"));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn target_that_is_not_a_drive_letter_exits_2() {
    let home = make_temp_home();
    for args in [
        ["scan", "--target", "CC"],
        ["plan", "--target", "C:\\Windows"],
        ["repair", "--target", "1:"],
    ] {
        let out = run(&home, &args);
        assert_eq!(out.status.code(), Some(2), "args={args:?}");
    }
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn repair_max_tier_out_of_range_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["repair", "--target", "C:", "--max-tier", "9"]);
    assert_eq!(out.status.code(), Some(2));
    let out = run(&home, &["repair", "--target", "C:", "--max-tier", "0"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn repair_apply_requires_tty_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["repair", "--target", "C:", "--apply"]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("interactive terminal"), "stderr={stderr}");
    assert!(
        !home.join(".config/bootmend/logs").exists(),
        "no session log may be created before confirmation is possible"
    );
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn zero_timeout_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["--timeout", "0", "config", "--show"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn invalid_config_file_exits_2() {
    let home = make_temp_home();
    let path = home.join(".config/bootmend/config.toml");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdirs");
    std::fs::write(&path, "[repair]\nmax_tier = 7\n").expect("write");
    let out = run(&home, &["config", "--show"]);
    assert_eq!(out.status.code(), Some(2));

    std::fs::write(&path, "[repair]\nunknown_key = true\n").expect("write");
    let out = run(&home, &["config", "--show"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn invalid_env_override_exits_2() {
    let home = make_temp_home();
    for (key, value) in [
        ("BOOTMEND_REPAIR_MAX_TIER", "six"),
        ("BOOTMEND_ENVIRONMENT_KIND", "sandbox"),
        ("BOOTMEND_UI_COLOR", "maybe"),
    ] {
        let out = bootmend_cmd(&home)
            .env(key, value)
            .args(["config", "--show"])
            .output()
            .expect("run bootmend");
        assert_eq!(out.status.code(), Some(2), "{key}={value}");
    }
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn scan_json_reports_unavailable_tools_as_inconclusive() {
    let home = make_temp_home();
    let out = bootmend_cmd(&home)
        .env("BOOTMEND_ENVIRONMENT_KIND", "recovery")
        .env("BOOTMEND_ENVIRONMENT_FIRMWARE", "uefi")
        .env("BOOTMEND_COMMAND_TIMEOUT_SECS", "5")
        .args(["--json", "scan", "--target", "Q:"])
        .output()
        .expect("run bootmend");
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse json");
    assert_eq!(v["schema_version"], "1.0");
    assert_eq!(v["target"]["drive"], "Q:");
    assert_eq!(v["environment"]["kind"], "pre_boot_recovery");
    let errors = v["probe_errors"].as_array().expect("probe_errors");
    assert!(
        errors.iter().any(|e| e["probe"] == "boot_partition_discovery"),
        "partition discovery must be reported, not assumed healthy: {errors:?}"
    );
    let _ = std::fs::remove_dir_all(&home);
}
