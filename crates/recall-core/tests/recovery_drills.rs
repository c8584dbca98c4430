//! Scripted crash-and-recover scenarios against real storage roots.
//!
//! Each drill damages the on-disk state the way a real failure would
//! (process death, torn write, partial snapshot, flipped bytes) and
//! asserts the store comes back with exactly the data the durability
//! contract promises.

use std::fs;

use tempfile::TempDir;

use recall_core::{
    DialogueFilter, DialogueRecord, Error, MemoryStore, Role, StoreConfig,
};

fn dialogue(text: &str) -> DialogueRecord {
    DialogueRecord::new("drill", Role::User, text)
}

fn contents(store: &MemoryStore) -> Vec<String> {
    store
        .get_dialogues(&DialogueFilter::default())
        .iter()
        .map(|d| d.content.clone())
        .collect()
}

#[test]
fn crash_after_ack_loses_nothing() {
    let tmp = TempDir::new().unwrap();
    {
        let (store, _) = MemoryStore::open(StoreConfig::at(tmp.path())).unwrap();
        for i in 0..10 {
            store.put_dialogue(dialogue(&format!("m{i}"))).unwrap();
        }
        // Process dies here: no close(), no checkpoint.
    }

    let (store, report) = MemoryStore::open(StoreConfig::at(tmp.path())).unwrap();
    assert_eq!(report.entries_replayed, 10);
    assert_eq!(contents(&store).len(), 10);
}

#[test]
fn torn_final_write_recovers_acknowledged_prefix() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        for i in 0..5 {
            store.put_dialogue(dialogue(&format!("m{i}"))).unwrap();
        }
    }

    // Tear the last WAL line mid-byte.
    let wal_path = config.wal_path();
    let len = fs::metadata(&wal_path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - 7).unwrap();
    drop(file);

    let (store, report) = MemoryStore::open(config).unwrap();
    assert_eq!(report.entries_replayed, 4);
    assert!(report.tail_corruption.is_some());
    assert_eq!(contents(&store), vec!["m0", "m1", "m2", "m3"]);
}

#[test]
fn corrupt_newest_snapshot_falls_back_to_older() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.put_dialogue(dialogue("epoch-one")).unwrap();
        store.checkpoint().unwrap();
        store.put_dialogue(dialogue("epoch-two")).unwrap();
        store.checkpoint().unwrap();
    }

    // Flip the newest snapshot to garbage; the older one must carry.
    let snaps = {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.list_snapshots().unwrap()
    };
    assert_eq!(snaps.len(), 2);
    fs::write(config.snapshot_dir().join(snaps[0].id.as_str()), b"garbage").unwrap();

    let (store, report) = MemoryStore::open(config).unwrap();
    // Best-effort: state as of the older checkpoint survives.
    assert_eq!(report.snapshot_sequence, Some(snaps[1].sequence));
    assert_eq!(contents(&store), vec!["epoch-one"]);
}

#[test]
fn fully_garbage_wal_with_marker_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.put_dialogue(dialogue("doomed")).unwrap();
    }

    fs::write(config.wal_path(), b"\x00\xff\x00\xffnot json at all\n").unwrap();

    let err = MemoryStore::open(config).unwrap_err();
    assert!(matches!(err, Error::Corruption { .. }));
}

#[test]
fn same_garbage_without_marker_starts_fresh() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    // Garbage WAL in an uninitialized root (no marker was ever written).
    fs::create_dir_all(&config.root).unwrap();
    fs::write(config.wal_path(), b"\x00\xff\x00\xffnot json at all\n").unwrap();

    let (store, report) = MemoryStore::open(config).unwrap();
    assert!(report.fresh_start);
    assert!(contents(&store).is_empty());
}

#[test]
fn fresh_directory_is_a_fresh_start() {
    let tmp = TempDir::new().unwrap();
    let (_, report) = MemoryStore::open(StoreConfig::at(tmp.path())).unwrap();
    assert!(report.fresh_start);
    assert_eq!(report.entries_replayed, 0);
    assert_eq!(report.snapshot_sequence, None);

    // Second open of the same root is no longer fresh.
    let (_, report) = MemoryStore::open(StoreConfig::at(tmp.path())).unwrap();
    assert!(!report.fresh_start);
}

#[test]
fn leftover_snapshot_temp_file_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.put_dialogue(dialogue("real")).unwrap();
        store.checkpoint().unwrap();
    }

    // Simulate a crash mid-snapshot on a later run: a stray .tmp file.
    fs::write(
        config.snapshot_dir().join("snap_99999999999999999999_1.json.tmp"),
        b"half-written",
    )
    .unwrap();

    let (store, report) = MemoryStore::open(config).unwrap();
    assert!(report.snapshot_sequence.is_some());
    assert_eq!(contents(&store), vec!["real"]);
}

#[test]
fn checkpoint_then_crash_replays_only_the_suffix() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        for i in 0..3 {
            store.put_dialogue(dialogue(&format!("old{i}"))).unwrap();
        }
        store.checkpoint().unwrap();
        for i in 0..2 {
            store.put_dialogue(dialogue(&format!("new{i}"))).unwrap();
        }
    }

    let (store, report) = MemoryStore::open(config).unwrap();
    assert_eq!(report.entries_replayed, 2);
    assert_eq!(
        contents(&store),
        vec!["old0", "old1", "old2", "new0", "new1"]
    );
}

#[test]
fn deletes_replay_exactly() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.put_dialogue(dialogue("keep")).unwrap();
        store.put_dialogue(dialogue("remove")).unwrap();
        let doomed = store
            .get_dialogues(&DialogueFilter::default())
            .iter()
            .find(|d| d.content == "remove")
            .unwrap()
            .id
            .clone();
        store.delete_dialogue(&doomed).unwrap();
    }

    let (store, report) = MemoryStore::open(config).unwrap();
    assert_eq!(report.entries_replayed, 3);
    assert_eq!(contents(&store), vec!["keep"]);
}

#[test]
fn sequences_continue_across_restarts() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::at(tmp.path());
    let first = {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.put_dialogue(dialogue("a")).unwrap()
    };
    let second = {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.put_dialogue(dialogue("b")).unwrap()
    };
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    // And across a checkpoint-restart boundary, where the WAL is empty.
    {
        let (store, _) = MemoryStore::open(config.clone()).unwrap();
        store.checkpoint().unwrap();
    }
    let (store, _) = MemoryStore::open(config).unwrap();
    let third = store.put_dialogue(dialogue("c")).unwrap();
    assert_eq!(third, 4, "checkpoint entry took sequence 3");
}
