//! Unit tests for the reattach snapshot repository.

use std::sync::Arc;

use chrono::{Duration, Utc};

use world_warden::models::reattach::ReattachInformation;
use world_warden::persistence::db;
use world_warden::persistence::reattach_repo::ReattachRepo;

async fn repo() -> ReattachRepo {
    let pool = db::connect_memory().await.expect("db connect");
    ReattachRepo::new(Arc::new(pool))
}

fn snapshot(pid: u32) -> ReattachInformation {
    ReattachInformation {
        pid,
        port: 4777,
        event_port: 39200,
        access_token: "token".into(),
        dmb_dir: "/deployments/x".into(),
        // SQLite stores rfc3339 text; sub-second precision survives.
        launched_at: Utc::now() - Duration::minutes(5),
    }
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let repo = repo().await;
    let info = snapshot(101);

    repo.save(&info).await.expect("save");
    let loaded = repo.load().await.expect("query").expect("row exists");

    assert_eq!(loaded, info);
}

#[tokio::test]
async fn save_replaces_the_previous_snapshot() {
    let repo = repo().await;
    repo.save(&snapshot(101)).await.expect("save first");
    repo.save(&snapshot(202)).await.expect("save second");

    let loaded = repo.load().await.expect("query").expect("row exists");
    assert_eq!(loaded.pid, 202);
}

#[tokio::test]
async fn load_without_snapshot_is_none() {
    let repo = repo().await;
    assert!(repo.load().await.expect("query").is_none());
}

#[tokio::test]
async fn clear_discards_the_snapshot() {
    let repo = repo().await;
    repo.save(&snapshot(101)).await.expect("save");
    repo.clear().await.expect("clear");

    assert!(repo.load().await.expect("query").is_none());
}
