use emberdb::access::{BPlusTree, Rid};
use emberdb::storage::PageId;
use emberdb::transaction::{TransactionId, TransactionState};
use emberdb::{Database, DatabaseConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn config() -> DatabaseConfig {
    DatabaseConfig {
        pool_size: 32,
        ..DatabaseConfig::default()
    }
}

#[test]
fn test_commit_and_abort() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = Database::create(dir.path(), config())?;

    let setup = db.begin()?;
    let table = db.create_table("accounts", &setup)?;
    let alice = table.insert_tuple(b"alice:100", &setup)?;
    db.commit(&setup)?;

    let txn = db.begin()?;
    assert!(table.update_tuple(b"alice:0", alice, &txn)?);
    let bob = table.insert_tuple(b"bob:100", &txn)?;
    db.abort(&txn)?;
    assert_eq!(txn.state(), TransactionState::Aborted);

    let reader = db.begin()?;
    assert_eq!(
        table.get_tuple(alice, &reader)?.map(|t| t.data),
        Some(b"alice:100".to_vec())
    );
    assert!(table.get_tuple(bob, &reader)?.is_none());
    db.commit(&reader)?;

    db.close()
}

#[test]
fn test_crash_recovery() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (committed, uncommitted) = {
        let db = Database::create(dir.path(), config())?;
        let setup = db.begin()?;
        let table = db.create_table("events", &setup)?;
        let committed = (0..50u32)
            .map(|i| table.insert_tuple(format!("event-{}", i).as_bytes(), &setup))
            .collect::<anyhow::Result<Vec<_>>>()?;
        db.commit(&setup)?;

        let loser = db.begin()?;
        let uncommitted = table.insert_tuple(b"never committed", &loser)?;
        assert!(table.mark_delete(committed[0], &loser)?);
        // Dropped without close: no page is written back
        (committed, uncommitted)
    };

    let db = Database::open(dir.path(), config())?;
    let stats = db
        .recovery_stats()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("recovery did not run"))?;
    assert_eq!(stats.loser_transactions, vec![TransactionId(2)]);
    assert_eq!(stats.records_undone, 2);

    let table = db.open_table("events")?;
    let reader = db.begin()?;
    assert!(reader.id() > TransactionId(2));
    for (i, rid) in committed.iter().enumerate() {
        assert_eq!(
            table.get_tuple(*rid, &reader)?.map(|t| t.data),
            Some(format!("event-{}", i).into_bytes())
        );
    }
    assert!(table.get_tuple(uncommitted, &reader)?.is_none());
    assert_eq!(table.iter(&reader).count(), 50);
    db.commit(&reader)?;
    db.close()?;

    // Nothing left to do the second time
    let db = Database::open(dir.path(), config())?;
    let stats = db.recovery_stats().cloned().unwrap_or_default();
    assert!(stats.loser_transactions.is_empty());
    assert_eq!(stats.records_redone, 0);
    db.close()
}

#[test]
fn test_younger_writer_dies() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = Database::create(dir.path(), config())?;

    let t1 = db.begin()?;
    let t2 = db.begin()?;
    let table = db.create_table("t", &t1)?;
    let rid = table.insert_tuple(b"held by T1", &t1)?;

    // T2 is younger than the holder and must not wait
    assert!(table.mark_delete(rid, &t2).is_err());
    assert_eq!(t2.state(), TransactionState::Aborted);
    db.abort(&t2)?;

    assert!(table.update_tuple(b"still T1's", rid, &t1)?);
    db.commit(&t1)?;
    db.close()
}

#[test]
fn test_older_writer_waits() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(Database::create(dir.path(), config())?);

    let older = db.begin()?;
    let younger = db.begin()?;
    let table = db.create_table("t", &younger)?;
    let rid = table.insert_tuple(b"v1", &younger)?;

    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let (table, done, older) = (table.clone(), Arc::clone(&done), Arc::clone(&older));
        thread::spawn(move || {
            let updated = table.update_tuple(b"v2", rid, &older);
            done.store(true, Ordering::SeqCst);
            updated
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!done.load(Ordering::SeqCst), "older writer should block");

    db.commit(&younger)?;
    assert!(waiter.join().unwrap()?);
    db.commit(&older)?;

    let reader = db.begin()?;
    assert_eq!(table.get_tuple(rid, &reader)?.map(|t| t.data), Some(b"v2".to_vec()));
    db.commit(&reader)?;
    Ok(())
}

#[test]
fn test_index_round_trip() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = Database::create(
        dir.path(),
        DatabaseConfig {
            leaf_max_size: Some(3),
            internal_max_size: Some(3),
            ..config()
        },
    )?;
    let index: BPlusTree<i64> = db.create_index("keys")?;

    for key in [5i64, 15, 25, 35, 45] {
        assert!(index.insert(&key, Rid::new(PageId(1), key as u32))?);
    }
    assert!(!index.insert(&25, Rid::new(PageId(2), 0))?);

    assert!(index.remove(&5)?);
    assert!(index.remove(&15)?);
    assert_eq!(index.get_value(&5)?, None);
    assert_eq!(index.get_value(&15)?, None);
    for key in [25i64, 35, 45] {
        assert_eq!(index.get_value(&key)?, Some(Rid::new(PageId(1), key as u32)));
    }

    let keys: Vec<i64> = index
        .iter()?
        .map(|entry| entry.map(|(key, _)| key))
        .collect::<anyhow::Result<_>>()?;
    assert_eq!(keys, vec![25, 35, 45]);
    index.check_integrity()?;
    db.close()
}

#[test]
fn test_concurrent_index_and_table() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(Database::create(
        dir.path(),
        DatabaseConfig {
            pool_size: 64,
            leaf_max_size: Some(8),
            internal_max_size: Some(8),
            ..config()
        },
    )?);
    let setup = db.begin()?;
    let table = db.create_table("rows", &setup)?;
    db.commit(&setup)?;
    let index = Arc::new(db.create_index::<u32>("rows_by_id")?);

    let threads = 4;
    let per_thread = 100u32;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads as u32)
        .map(|t| {
            let (db, table, index, barrier) =
                (Arc::clone(&db), table.clone(), Arc::clone(&index), Arc::clone(&barrier));
            thread::spawn(move || -> anyhow::Result<()> {
                barrier.wait();
                let txn = db.begin()?;
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    let rid = table.insert_tuple(&key.to_le_bytes(), &txn)?;
                    assert!(index.insert(&key, rid)?);
                }
                db.commit(&txn)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }

    index.check_integrity()?;
    let reader = db.begin()?;
    for key in 0..threads as u32 * per_thread {
        let rid = index
            .get_value(&key)?
            .ok_or_else(|| anyhow::anyhow!("key {} missing", key))?;
        let tuple = table
            .get_tuple(rid, &reader)?
            .ok_or_else(|| anyhow::anyhow!("row for {} missing", key))?;
        assert_eq!(tuple.data, key.to_le_bytes());
    }
    db.commit(&reader)?;
    Ok(())
}
