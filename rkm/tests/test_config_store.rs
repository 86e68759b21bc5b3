use rkm::config_store::ConfigPhase;
use rkm::error::Error;
use serde_json::json;

use crate::common::{Fixture, LONG_RUNNING, config_json, project};

mod common;

#[tokio::test]
async fn test_invalid_apply_leaves_file_untouched() {
    let fixture = Fixture::new();
    let script = fixture.script("bot.sh", LONG_RUNNING);
    let original = config_json(vec![project(&script)]);
    fixture.write_config(&original);
    let store = fixture.store();
    store.open().await.unwrap();

    let mut candidate: serde_json::Value = serde_json::from_str(&original).unwrap();
    candidate.as_object_mut().unwrap().remove("AUTHORIZED_LIST");
    let err = store
        .apply(&candidate.to_string())
        .await
        .expect_err("candidate without AUTHORIZED_LIST must be rejected");

    let Error::ConfigInvalid(violations) = err else {
        panic!("unexpected error: {err}");
    };
    assert!(violations.iter().any(|v| v.field == "AUTHORIZED_LIST"));
    let on_disk = std::fs::read_to_string(fixture.layout.config_file()).unwrap();
    assert_eq!(on_disk, original);
    assert_eq!(store.raw().await.unwrap(), original);
}

#[tokio::test]
async fn test_apply_then_load_round_trips() {
    let fixture = Fixture::new();
    let script = fixture.script("bot.sh", LONG_RUNNING);
    fixture.write_config(&config_json(vec![project(&script)]));
    let store = fixture.store();
    store.open().await.unwrap();

    let other = fixture.script("worker.sh", LONG_RUNNING);
    let applied = store
        .apply(&config_json(vec![project(&script), project(&other)]))
        .await
        .unwrap();
    assert!(matches!(store.phase().await, ConfigPhase::Committed { .. }));

    let loaded = fixture.store().load().await.unwrap();
    assert_eq!(loaded, applied);
    assert_eq!(loaded.projects.len(), 2);
}

#[tokio::test]
async fn test_restore_yields_last_confirmed_config() {
    let fixture = Fixture::new();
    let script = fixture.script("bot.sh", LONG_RUNNING);
    let first = config_json(vec![project(&script)]);
    fixture.write_config(&first);
    let store = fixture.store();
    let (confirmed, healed) = store.open().await.unwrap();
    assert!(healed.is_none());

    let backup = store.confirm_healthy().await.unwrap();
    assert!(backup.is_some());
    assert_eq!(store.phase().await, ConfigPhase::BackedUp);
    // nothing new to confirm.
    assert_eq!(store.confirm_healthy().await.unwrap(), None);

    let other = fixture.script("worker.sh", LONG_RUNNING);
    store
        .apply(&config_json(vec![project(&other)]))
        .await
        .unwrap();
    store.mark_unhealthy().await;
    assert_eq!(store.phase().await, ConfigPhase::Unhealthy);
    assert_eq!(store.confirm_healthy().await.unwrap(), None);
    assert_eq!(store.backups().await.unwrap().len(), 1);

    let restored = store.restore_latest_backup().await.unwrap();
    assert_eq!(restored, confirmed);
    assert_eq!(
        std::fs::read_to_string(fixture.layout.config_file()).unwrap(),
        first
    );
}

#[tokio::test]
async fn test_corrupt_config_heals_from_backup() {
    let fixture = Fixture::new();
    let script = fixture.script("bot.sh", LONG_RUNNING);
    let good = config_json(vec![project(&script)]);
    fixture.write_config(&good);
    let store = fixture.store();
    let (config, _) = store.open().await.unwrap();
    store.confirm_healthy().await.unwrap();

    fixture.write_config("{ \"GUILD_ID\": ");
    let reopened = fixture.store();
    let (healed_config, healed) = reopened.open().await.unwrap();
    assert_eq!(healed_config, config);
    assert!(healed.is_some());
    assert_eq!(reopened.phase().await, ConfigPhase::BackedUp);
    assert_eq!(
        std::fs::read_to_string(fixture.layout.config_file()).unwrap(),
        good
    );
}

#[tokio::test]
async fn test_corrupt_config_without_backup_is_fatal() {
    let fixture = Fixture::new();
    fixture.write_config(&json!({ "GUILD_ID": 1 }).to_string());
    let err = fixture.store().open().await.unwrap_err();
    assert!(matches!(err, Error::NoBackupAvailable), "got {err}");
}

#[tokio::test]
async fn test_backups_are_pruned_to_retention() {
    let fixture = Fixture::new();
    let store = fixture.store();
    fixture.write_config(&config_json(vec![]));
    store.open().await.unwrap();

    for i in 0..5 {
        let script = fixture.script(&format!("p{i}.sh"), LONG_RUNNING);
        store
            .apply(&config_json(vec![project(&script)]))
            .await
            .unwrap();
        store.confirm_healthy().await.unwrap();
    }
    // retention is 3 in the test settings.
    let backups = store.backups().await.unwrap();
    assert_eq!(backups.len(), 3);
    assert!(backups.windows(2).all(|w| w[0].created_ms >= w[1].created_ms));
}
