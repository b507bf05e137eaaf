use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

fn bootmend_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bootmend"));
    cmd.env("HOME", home);
    cmd.env("USERPROFILE", home);
    cmd.env_remove("BOOTMEND_CONFIG");
    cmd.env_remove("BOOTMEND_REPAIR_MAX_TIER");
    cmd.env_remove("BOOTMEND_REPAIR_PREFER_REVERSIBLE");
    cmd.env_remove("BOOTMEND_REPAIR_INSTALL_MEDIA");
    cmd.env_remove("BOOTMEND_COMMAND_TIMEOUT_SECS");
    cmd.env_remove("BOOTMEND_ENVIRONMENT_KIND");
    cmd.env_remove("BOOTMEND_ENVIRONMENT_FIRMWARE");
    cmd.env_remove("BOOTMEND_SESSION_LOCK_DIR");
    cmd.env_remove("BOOTMEND_UI_COLOR");
    cmd.stdin(Stdio::null());
    cmd
}

fn show(cmd: &mut Command) -> serde_json::Value {
    let out: Output = cmd
        .args(["--json", "config", "--show"])
        .output()
        .expect("run bootmend");
    assert!(
        out.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("parse json")
}

fn make_temp_home() -> PathBuf {
    static HOME_SEQ: AtomicU64 = AtomicU64::new(0);

    let temp = std::env::temp_dir();
    let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
    let uniq = format!("bootmend-config-test-{}-{seq}", std::process::id());
    let home = temp.join(uniq);
    let _ = std::fs::remove_dir_all(&home);
    std::fs::create_dir_all(&home).expect("create home");
    home
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdirs");
    }
    std::fs::write(path, bytes).expect("write");
}

#[test]
fn defaults_without_config_file() {
    let home = make_temp_home();
    let v = show(&mut bootmend_cmd(&home));
    assert_eq!(v["repair"]["max_tier"], 5);
    assert_eq!(v["repair"]["prefer_reversible"], true);
    assert_eq!(v["repair"]["confirm_phrase"], "WIPE BOOT PARTITION");
    assert_eq!(v["command"]["timeout_secs"], 120);
    assert_eq!(v["probe"]["mount_letter"], "S:");
    assert_eq!(v["environment"]["kind"], "auto");
    assert!(v.get("config_path").is_none());
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn env_overrides_config_file() {
    let home = make_temp_home();
    write_file(
        home.join(".config/bootmend/config.toml").as_path(),
        br#"
[repair]
max_tier = 3
prefer_reversible = false

[environment]
kind = "recovery"
"#,
    );

    let v = show(&mut bootmend_cmd(&home));
    assert_eq!(v["repair"]["max_tier"], 3);
    assert_eq!(v["repair"]["prefer_reversible"], false);
    assert_eq!(v["environment"]["kind"], "recovery");
    assert!(
        v["config_path"]
            .as_str()
            .is_some_and(|p| p.ends_with("config.toml"))
    );

    let v = show(
        bootmend_cmd(&home)
            .env("BOOTMEND_REPAIR_MAX_TIER", "2")
            .env("BOOTMEND_ENVIRONMENT_KIND", "live"),
    );
    assert_eq!(v["repair"]["max_tier"], 2);
    assert_eq!(v["repair"]["prefer_reversible"], false);
    assert_eq!(v["environment"]["kind"], "live");

    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn explicit_config_flag_beats_env_config_path() {
    let home = make_temp_home();
    let from_env = home.join("env.toml");
    let from_flag = home.join("flag.toml");
    write_file(&from_env, b"[command]\ntimeout_secs = 30\n");
    write_file(&from_flag, b"[command]\ntimeout_secs = 45\n");

    let v = show(bootmend_cmd(&home).env("BOOTMEND_CONFIG", &from_env));
    assert_eq!(v["command"]["timeout_secs"], 30);

    let flag = from_flag.to_string_lossy().into_owned();
    let v = show(
        bootmend_cmd(&home)
            .env("BOOTMEND_CONFIG", &from_env)
            .args(["--config", flag.as_str()]),
    );
    assert_eq!(v["command"]["timeout_secs"], 45);

    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn timeout_flag_beats_env_and_file() {
    let home = make_temp_home();
    write_file(
        home.join(".config/bootmend/config.toml").as_path(),
        b"[command]\ntimeout_secs = 30\n",
    );
    let v = show(
        bootmend_cmd(&home)
            .env("BOOTMEND_COMMAND_TIMEOUT_SECS", "60")
            .args(["--timeout", "90"]),
    );
    assert_eq!(v["command"]["timeout_secs"], 90);
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn config_show_text_is_toml() {
    let home = make_temp_home();
    let out = bootmend_cmd(&home)
        .args(["config", "--show"])
        .output()
        .expect("run bootmend");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("[repair]"), "stdout={stdout}");
    assert!(stdout.contains("max_tier = 5"), "stdout={stdout}");
    let _ = std::fs::remove_dir_all(&home);
}
