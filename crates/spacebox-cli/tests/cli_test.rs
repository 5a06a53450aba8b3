//! E2E tests for the spacebox binary against an isolated data root.

use std::fs;
use std::process::{Command, Output};

use spacebox_config::testing::TestEnvironment;

/// Run spacebox with the environment's data root and topology
fn spacebox(env: &TestEnvironment, args: &[&str]) -> Output {
    // Local config in the working directory: no reserved space
    env.create_file(".spacebox/config.toml", b"[storage]\nreserved_space = 0\n")
        .unwrap();
    Command::new(env!("CARGO_BIN_EXE_spacebox"))
        .arg("--data-root")
        .arg(&env.data_root)
        .arg("--topology")
        .arg(&env.topology_file)
        .args(args)
        .current_dir(&env.scratch)
        .env("HOME", &env.scratch)
        .env_remove("SPACEBOX_DATA_PATH")
        .env_remove("SPACEBOX_TOPOLOGY_FILE")
        .env_remove("SPACEBOX_RESERVED_SPACE")
        .output()
        .expect("Failed to execute spacebox")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn e2e_config_show_returns_valid_toml() {
    let env = TestEnvironment::new().unwrap();
    let output = spacebox(&env, &["config", "show"]);
    assert!(output.status.success());

    let parsed: Result<spacebox_config::Config, _> = toml::from_str(&stdout(&output));
    let config = parsed.expect("config show should return valid TOML");
    assert_eq!(config.storage.data_root, env.data_root);
    assert_eq!(config.multipart.lifecycle_secs, 2_592_000);
}

#[test]
fn e2e_disks_lists_every_disk() {
    let env = TestEnvironment::with_disks(3).unwrap();
    let output = spacebox(&env, &["disks"]);
    assert!(output.status.success());

    let out = stdout(&output);
    for id in 1..=3 {
        assert!(
            out.contains(&env.disk_root(id).display().to_string()),
            "missing disk {} in:\n{}",
            id,
            out
        );
    }
}

#[test]
fn e2e_put_then_ranged_get() {
    let env = TestEnvironment::new().unwrap();
    let file = env.create_file("hello.txt", b"hello spacebox").unwrap();
    let file_arg = file.to_str().unwrap();

    let output = spacebox(&env, &["fingerprint", file_arg]);
    assert!(output.status.success());
    let fingerprint = stdout(&output)
        .split_whitespace()
        .next()
        .unwrap()
        .to_string();
    assert_eq!(fingerprint.len(), 34);

    let output = spacebox(&env, &["put", file_arg]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains(&fingerprint));

    let output = spacebox(&env, &["put", file_arg]);
    assert!(stdout(&output).contains("Already stored"));

    let output = spacebox(&env, &["get", &fingerprint, "--start", "6", "--end", "8"]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"spa");

    let out_file = env.scratch.join("copy.txt");
    let output = spacebox(
        &env,
        &["get", &fingerprint, "-o", out_file.to_str().unwrap()],
    );
    assert!(output.status.success());
    assert_eq!(fs::read(&out_file).unwrap(), b"hello spacebox");

    let output = spacebox(&env, &["get", &fingerprint, "--start", "0", "--end", "99"]);
    assert!(!output.status.success());
}

#[test]
fn e2e_upload_in_small_parts() {
    let env = TestEnvironment::new().unwrap();
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let file = env.create_file("data.bin", &body).unwrap();

    let output = spacebox(
        &env,
        &[
            "upload",
            file.to_str().unwrap(),
            "--folder",
            "/backup",
            "--part-size",
            "3000",
        ],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let record: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(record["name"], "data.bin");
    assert_eq!(record["path"], "/backup/");
    assert_eq!(record["size"], 10_000);

    let betag = record["betag"].as_str().unwrap().to_string();
    let output = spacebox(&env, &["get", &betag]);
    assert_eq!(output.stdout, body);

    // Completed uploads leave no task behind
    let output = spacebox(&env, &["parts", &betag]);
    assert!(!output.status.success());
}

#[test]
fn e2e_gc_dry_run_reports_nothing_expired() {
    let env = TestEnvironment::new().unwrap();
    let output = spacebox(&env, &["gc"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Dry run complete"));
}
