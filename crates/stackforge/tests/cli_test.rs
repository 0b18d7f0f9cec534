#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;

const CONFIG: &str = r#"{
    "global": { "stackName": "demo", "region": "us-east-1" },
    "enabledForges": ["main", "shared", "web"],
    "forges": {
        "vpc": { "instances": [{ "id": "main" }] },
        "efs": { "instances": [{ "id": "shared" }] },
        "ec2": { "instances": [{ "id": "web", "dependsOn": "EFS:shared" }] }
    }
}"#;

fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn stackforge() -> Command {
    let mut cmd = Command::cargo_bin("stackforge").unwrap();
    cmd.env_remove("STACKFORGE_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    stackforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("synth"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("forges"));
}

#[test]
fn test_cli_version() {
    stackforge()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stackforge"));
}

#[test]
fn test_forges_lists_builtin_types() {
    stackforge()
        .arg("forges")
        .assert()
        .success()
        .stdout(predicate::str::contains("vpc"))
        .stdout(predicate::str::contains("ec2"))
        .stdout(predicate::str::contains("batch"));
}

#[test]
fn test_synth_writes_template() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "stackforge.json", CONFIG);
    let output = dir.path().join("template.json");

    stackforge()
        .args(["synth", "--offline", "-c"])
        .arg(&config)
        .arg("-o")
        .arg(&output)
        .assert()
        .success()
        .stderr(predicate::str::contains("VPC:main"));

    let template: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(template["AWSTemplateFormatVersion"], "2010-09-09");
    assert_eq!(template["Resources"]["FileSystemShared"]["Type"], "AWS::EFS::FileSystem");
    assert!(template["Outputs"]["ElasticCloudComputeWeb"].is_object());
}

#[test]
fn test_synth_to_stdout_from_discovered_yaml() {
    let dir = tempfile::tempdir().unwrap();
    write_config(
        &dir,
        "stackforge.yaml",
        "global:\n  stackName: demo\n  region: us-east-1\nenabledForges: [main]\nforges:\n  vpc:\n    instances:\n      - id: main\n",
    );

    stackforge()
        .current_dir(dir.path())
        .args(["synth", "--offline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("AWS::EC2::VPC"));
}

#[test]
fn test_synth_fails_when_an_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        "stackforge.json",
        &CONFIG.replace(r#"["main", "shared", "web"]"#, r#"["main", "web", "ghost"]"#),
    );

    stackforge()
        .args(["synth", "--offline", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"))
        .stderr(predicate::str::contains("EFS:shared"))
        .stderr(predicate::str::contains("2 of 3 id(s) failed"));
}

#[test]
fn test_validate_accepts_valid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir, "stackforge.json", CONFIG);

    stackforge()
        .args(["validate", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn test_validate_reports_unknown_type() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        "stackforge.toml",
        "enabledForges = [\"fn\"]\n\n[global]\nstackName = \"demo\"\n\n[forges.lambda]\ninstances = [{ id = \"fn\" }]\n",
    );

    stackforge()
        .args(["validate", "-c"])
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown forge type"));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();

    stackforge()
        .args(["validate", "-c"])
        .arg(dir.path().join("absent.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}
