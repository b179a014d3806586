//! CLI Integration Tests
//!
//! These tests run the `idsync` binary against stores seeded through
//! idsync-core, checking the wiring between the CLI and the library.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use idsync_core::types::ActionId;
use idsync_core::{
    ActionRecord, ErrorLedger, HostKeypair, JsonlErrorLedger, LedgerEntry, PairKey, SetAttribute,
    Storage,
};

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("idsync").expect("Failed to find idsync binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Queue attribute edits directly in the store. The store is closed again
/// before returning so the CLI can open it.
fn seed_pending(data_dir: &TempDir, pair: &PairKey, values: &[&str]) -> Vec<ActionId> {
    let storage = Storage::new(data_dir.path().join("idsync.redb")).unwrap();
    let mut ids = Vec::new();
    for (n, value) in values.iter().enumerate() {
        let action = SetAttribute::new(pair.clone(), "names", "display", *value);
        let record = ActionRecord::capture(ActionId::new(), &action).unwrap();
        let bytes = record.encode().unwrap();
        storage
            .write(|txn| txn.push_pending(pair, &bytes, 1_000 + n as i64))
            .unwrap();
        ids.push(record.id);
    }
    ids
}

// ============================================================================
// Info Command Tests
// ============================================================================

#[test]
fn test_info_on_empty_store() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("idsync v"))
        .stdout(predicate::str::contains("Data directory:"))
        .stdout(predicate::str::contains("Pending actions: 0"))
        .stdout(predicate::str::contains("Failed actions: 0"));
}

#[test]
fn test_info_counts_pending() {
    let data_dir = TempDir::new().unwrap();
    let pair = PairKey::new("alice@example.org", "profile");
    seed_pending(&data_dir, &pair, &["Alice", "Al"]);

    cli_cmd(&data_dir)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending actions: 2"));
}

#[test]
fn test_info_uses_config_file() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("config.json");
    std::fs::write(&config, r#"{"min_workers": 2, "max_workers": 4, "resend_limit": 3}"#)
        .unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Workers: 2..4"))
        .stdout(predicate::str::contains("Resend limit: 3"));
}

#[test]
fn test_invalid_config_fails() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("config.json");
    std::fs::write(&config, "not json").unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

// ============================================================================
// Pending Command Tests
// ============================================================================

#[test]
fn test_pending_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("pending")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending actions."));
}

#[test]
fn test_pending_lists_actions() {
    let data_dir = TempDir::new().unwrap();
    let pair = PairKey::new("alice@example.org", "profile");
    let ids = seed_pending(&data_dir, &pair, &["Alice", "Al"]);

    cli_cmd(&data_dir)
        .arg("pending")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending actions (2):"))
        .stdout(predicate::str::contains(SetAttribute::TYPE_TAG))
        .stdout(predicate::str::contains(ids[0].to_string()))
        .stdout(predicate::str::contains(ids[1].to_string()));
}

#[test]
fn test_pending_filters_by_identity() {
    let data_dir = TempDir::new().unwrap();
    let alice = PairKey::new("alice@example.org", "profile");
    let bob = PairKey::new("bob@example.org", "profile");
    let alice_ids = seed_pending(&data_dir, &alice, &["Alice"]);
    let bob_ids = seed_pending(&data_dir, &bob, &["Bob"]);

    cli_cmd(&data_dir)
        .args(["pending", "--identity", "bob@example.org"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pending actions (1):"))
        .stdout(predicate::str::contains(bob_ids[0].to_string()))
        .stdout(predicate::str::contains(alice_ids[0].to_string()).not());
}

#[test]
fn test_pending_filters_by_service() {
    let data_dir = TempDir::new().unwrap();
    seed_pending(
        &data_dir,
        &PairKey::new("alice@example.org", "profile"),
        &["Alice"],
    );

    cli_cmd(&data_dir)
        .args(["pending", "--service", "mail"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending actions."));
}

// ============================================================================
// Cursor Command Tests
// ============================================================================

#[test]
fn test_cursor_never_synced() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["cursor", "alice@example.org", "profile"])
        .assert()
        .success()
        .stdout(predicate::str::contains("never synced"));
}

#[test]
fn test_cursor_shows_stored_time() {
    let data_dir = TempDir::new().unwrap();
    let pair = PairKey::new("alice@example.org", "profile");
    {
        let storage = Storage::new(data_dir.path().join("idsync.redb")).unwrap();
        storage
            .write(|txn| txn.advance_cursor(&pair, 1_700_000_000_000))
            .unwrap();
    }

    cli_cmd(&data_dir)
        .args(["cursor", "alice@example.org", "profile"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1700000000000"));
}

#[test]
fn test_cursor_requires_pair() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["cursor", "alice@example.org"])
        .assert()
        .failure();
}

// ============================================================================
// Ledger Command Tests
// ============================================================================

#[test]
fn test_ledger_empty() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("ledger")
        .assert()
        .success()
        .stdout(predicate::str::contains("No failed actions."));
}

#[test]
fn test_ledger_shows_recent_entries() {
    let data_dir = TempDir::new().unwrap();
    let ledger = JsonlErrorLedger::open(data_dir.path().join("errors.jsonl")).unwrap();
    for n in 0..3 {
        ledger
            .record(LedgerEntry::new(
                "alice@example.org".into(),
                "profile".into(),
                ActionId::new(),
                SetAttribute::TYPE_TAG,
                "response CONTENT",
                format!("refused value {}", n),
            ))
            .unwrap();
    }

    cli_cmd(&data_dir)
        .args(["ledger", "--limit", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("refused value 0").not())
        .stdout(predicate::str::contains("refused value 1"))
        .stdout(predicate::str::contains("refused value 2"))
        .stdout(predicate::str::contains("[response CONTENT]"));
}

// ============================================================================
// Maintenance Command Tests
// ============================================================================

#[test]
fn test_purge_replay_on_fresh_store() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("purge-replay")
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 0 replay nonces (0 left)"));
}

#[test]
fn test_purge_replay_drops_old_nonces() {
    let data_dir = TempDir::new().unwrap();
    {
        let storage = Storage::new(data_dir.path().join("idsync.redb")).unwrap();
        storage.write(|txn| txn.insert_nonce(b"ancient", 1_000)).unwrap();
    }

    cli_cmd(&data_dir)
        .arg("purge-replay")
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 1 replay nonces (0 left)"));
}

#[test]
fn test_host_keygen_writes_loadable_key() {
    let data_dir = TempDir::new().unwrap();
    let out = data_dir.path().join("host.key");

    let assert = cli_cmd(&data_dir)
        .arg("host-keygen")
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Signing key:"))
        .stdout(predicate::str::contains("Exchange key:"));

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    let bytes = hex::decode(std::fs::read_to_string(&out).unwrap().trim()).unwrap();
    let keypair = HostKeypair::from_bytes(&bytes).unwrap();
    let public = keypair.public_keys();
    assert!(stdout.contains(&hex::encode(public.signing)));
    assert!(stdout.contains(&hex::encode(public.exchange)));
}

#[test]
fn test_host_keygen_refuses_overwrite() {
    let data_dir = TempDir::new().unwrap();
    let out = data_dir.path().join("host.key");
    std::fs::write(&out, "existing").unwrap();

    cli_cmd(&data_dir)
        .arg("host-keygen")
        .arg("--out")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "existing");

    cli_cmd(&data_dir)
        .arg("host-keygen")
        .arg("--out")
        .arg(&out)
        .arg("--force")
        .assert()
        .success();
    assert_ne!(std::fs::read_to_string(&out).unwrap(), "existing");
}
