use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn slidefeed(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("slidefeed").expect("binary built");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_CACHE_HOME", home.join("cache"))
        .env_remove("SLIDEFEED_FEED__URL");
    cmd
}

#[test]
fn once_prints_local_feed_newest_first() {
    let dir = tempdir().unwrap();
    let feed = dir.path().join("image-data.json");
    fs::write(
        &feed,
        r#"[
            {"id":"a","name":"morning.jpg","createdTime":"2024-05-01T08:00:00Z"},
            {"id":"b","name":"evening.jpg","createdTime":"2024-05-01T20:00:00Z"},
            {"id":"a","name":"morning.jpg","createdTime":"2024-05-01T08:00:00Z"}
        ]"#,
    )
    .unwrap();

    slidefeed(dir.path())
        .arg("--url")
        .arg(&feed)
        .arg("--once")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("2 photos from"))
        .stdout(predicate::str::contains("1\tb\t2024-05-01T20:00:00Z\tevening.jpg"))
        .stdout(predicate::str::contains("2\ta\t2024-05-01T08:00:00Z\tmorning.jpg"));
}

#[test]
fn once_honours_max_items_from_config() {
    let dir = tempdir().unwrap();
    let feed = dir.path().join("image-data.json");
    fs::write(
        &feed,
        r#"[{"id":"a","createdTime":"2024-05-01T08:00:00Z"},
            {"id":"b","createdTime":"2024-05-02T08:00:00Z"},
            {"id":"c","createdTime":"2024-05-03T08:00:00Z"}]"#,
    )
    .unwrap();
    let config = dir.path().join("config.yaml");
    fs::write(&config, "slideshow:\n  max_items: 2\n").unwrap();

    slidefeed(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("--url")
        .arg(&feed)
        .arg("--once")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("2 photos from"))
        .stdout(predicate::str::contains("\tc\t"))
        .stdout(predicate::str::contains("\ta\t").not());
}

#[test]
fn once_fails_on_unreadable_feed() {
    let dir = tempdir().unwrap();
    slidefeed(dir.path())
        .arg("--url")
        .arg(dir.path().join("missing.json"))
        .arg("--once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.json"));
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempdir().unwrap();
    slidefeed(dir.path())
        .arg("--config")
        .arg(dir.path().join("nope.yaml"))
        .arg("--once")
        .assert()
        .failure();
}
