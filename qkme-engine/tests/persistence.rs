//! Restart behaviour of the fjall-backed pool

use qkme_core::*;
use qkme_engine::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn sae(id: &str) -> SaeId {
    SaeId::new(id).unwrap()
}

fn open(path: &std::path::Path) -> Arc<KeyPoolStore> {
    let config = PoolConfig {
        max_key_count: 10,
        ..Default::default()
    };
    open_pool(&config, Some(path)).unwrap()
}

fn materials(count: usize) -> Vec<KeyMaterial> {
    (0..count).map(|i| KeyMaterial::new(vec![i as u8; 32])).collect()
}

#[test]
fn pool_survives_restart() {
    let temp = tempfile::tempdir().unwrap();
    let delivered;
    {
        let store = open(temp.path());
        store.insert(materials(4), Duration::from_secs(300)).unwrap();

        let reservation = store.reserve(1, 256);
        let grants = reservation
            .records()
            .iter()
            .map(|r| {
                DistributionGrant::new(
                    r.key_id,
                    sae("MMMMMMMMMMMMMMMM"),
                    BTreeSet::from([sae("SSSSSSSSSSSSSSSS")]),
                    SystemTime::now() + Duration::from_secs(60),
                )
            })
            .collect();
        delivered = reservation.commit(grants).unwrap();
    }

    let store = open(temp.path());
    assert_eq!(store.levels().stored_key_count, 3);

    let key_id = delivered[0].key_id;
    assert_eq!(store.key_state(&key_id), Some(KeyState::Delivered));

    let out = store
        .consume(
            &sae("SSSSSSSSSSSSSSSS"),
            &sae("MMMMMMMMMMMMMMMM"),
            &[key_id],
            |_, grant| {
                assert!(grant.is_some());
                Ok(())
            },
        )
        .unwrap();
    assert_eq!(out[0].material, delivered[0].material);
}

#[test]
fn reserved_keys_return_after_crash() {
    let temp = tempfile::tempdir().unwrap();
    {
        let persistence = Arc::new(FjallStore::open(temp.path()).unwrap());
        let mut record = KeyRecord::new(KeyMaterial::new(vec![9; 32]), 0, Duration::from_secs(300));
        record.state = KeyState::Reserved;
        persistence
            .save(&StoreChanges {
                upsert_records: vec![record],
                ..Default::default()
            })
            .unwrap();
    }

    let store = open(temp.path());
    assert_eq!(store.levels().stored_key_count, 1);
    assert!(store.reserve(1, 256).is_reserved());
}

#[test]
fn retired_keys_stay_retired_after_restart() {
    let temp = tempfile::tempdir().unwrap();
    {
        let store = open(temp.path());
        store.insert(materials(1), Duration::from_secs(0)).unwrap();
        let report = store
            .sweep(SystemTime::now() + Duration::from_secs(1), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(report.expired_available, 1);
    }

    let store = open(temp.path());
    assert_eq!(store.levels().stored_key_count, 0);
    assert_eq!(store.record_count(), 1);
    assert!(!store.reserve(1, 256).is_reserved());
}
