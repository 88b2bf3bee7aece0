mod common;

use common::{config_yaml, write_fixture};
use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_styletts-train"))
}

#[test]
fn cli_prints_vocabulary_size() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.yml");
    std::fs::write(&config_path, config_yaml(dir.path())).expect("write config");

    let output = bin()
        .args(["vocab", "--config", config_path.to_str().expect("utf-8 path")])
        .output()
        .expect("run vocab");
    assert!(output.status.success());
    // "$" + ",. " + "abcdef" + "ɑ" plus one spare row.
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "12");
}

#[test]
fn cli_inspects_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixture(dir.path());
    let checkpoint = dir.path().join("pretrained.safetensors");

    let output = bin()
        .args(["inspect", checkpoint.to_str().expect("utf-8 path")])
        .output()
        .expect("run inspect");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("epoch: 0"));
    assert!(stdout.contains("iters: 0"));
    assert!(stdout.contains("decoder: net"));
    assert!(stdout.contains("mpd: net"));
}

#[test]
fn cli_fails_on_missing_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = bin()
        .args([
            "train",
            "--config",
            dir.path().join("absent.yml").to_str().expect("utf-8 path"),
        ])
        .output()
        .expect("run train");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Config file not found"));
}
