//! End-to-end scenarios
//!
//! Clients, proxies and the authority wired together in process, checked
//! through the public client API only.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;
    use proptest::prelude::*;

    use odb_client::{ConnectionConfig, Reactor};
    use odb_core::{OdbError, TypeKey, CONNECTION_TYPE, CORE_SCHEMA};
    use odb_proxy::ProxyConfig;
    use odb_server::AuthorityConfig;
    use odb_store::MemoryPersistence;

    use crate::{counter_schema, counter_state, counter_type, key_groups, wait_until, Cluster, Worker, APP_SCHEMA};

    const WAIT: Duration = Duration::from_secs(10);

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_index_subscriber_follows_key_changes() {
        let cluster = Cluster::start().unwrap();
        let ty = counter_type();

        let a = cluster.counter_client(true).unwrap();
        let oid = a.transact(|t| t.create(&ty, &[("k", b("5"))])).unwrap();

        let other = cluster.counter_client(false).unwrap();
        other.subscribe_index(APP_SCHEMA, "Counter", "k", b("5")).unwrap();
        other.subscribe_index(APP_SCHEMA, "Counter", "k", b("6")).unwrap();
        other.flush().unwrap();
        assert_eq!(other.view().lookup_all(&ty, "k", b"5").unwrap(), vec![oid]);

        a.transact(|t| t.set(&ty, oid, "k", b("6"))).unwrap();
        other.flush().unwrap();
        let view = other.view();
        assert!(view.lookup_all(&ty, "k", b"5").unwrap().is_empty());
        assert_eq!(view.lookup_all(&ty, "k", b"6").unwrap(), vec![oid]);
        assert_eq!(view.get(&ty, oid, "k").unwrap(), b("6"));
    }

    #[test]
    fn test_concurrent_writers_conflict() {
        let cluster = Cluster::start().unwrap();
        let ty = counter_type();
        let db = cluster.counter_client(true).unwrap();
        let oid = db.transact(|t| t.create(&ty, &[("k", b("0"))])).unwrap();

        let mut t1 = db.transaction();
        let mut t2 = db.transaction();
        assert_eq!(t1.tid(), t2.tid());
        assert_eq!(t2.get(&ty, oid, "k").unwrap(), b("0"));

        t1.set(&ty, oid, "k", b("1")).unwrap();
        t1.commit().unwrap();

        t2.set(&ty, oid, "k", b("2")).unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(err, OdbError::RevisionConflict(_)));
        assert!(err.is_conflict());

        assert_eq!(db.view().get(&ty, oid, "k").unwrap(), b("1"));
    }

    #[test]
    fn test_proxy_shares_one_upstream_subscription() {
        let mut cluster = Cluster::start().unwrap();
        let proxy = cluster.add_proxy(ProxyConfig::default()).unwrap();
        let ty = counter_type();

        let mapping = {
            let a = cluster.connect_via_proxy(proxy).unwrap();
            a.define_schema(APP_SCHEMA, &counter_schema()).unwrap()
        };
        let counter_fields: Vec<_> = mapping.values().copied().collect();

        let mut clients = Vec::new();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let db = cluster.connect_via_proxy(proxy).unwrap();
            db.define_schema(APP_SCHEMA, &counter_schema()).unwrap();
            db.subscribe_type(APP_SCHEMA, "Counter", false).unwrap();

            let count = Arc::new(AtomicUsize::new(0));
            let counted = count.clone();
            let fields = counter_fields.clone();
            db.register_transaction_handler(move |notice| {
                if notice.writes.keys().any(|k| fields.contains(&k.field)) {
                    counted.fetch_add(1, Ordering::SeqCst);
                }
            });
            clients.push(db);
            seen.push(count);
        }

        let writer = cluster.counter_client(false).unwrap();
        let oid = writer.transact(|t| t.create(&ty, &[("x", b("hello"))])).unwrap();

        for (db, count) in clients.iter().zip(&seen) {
            db.flush().unwrap();
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert_eq!(db.view().get(&ty, oid, "x").unwrap(), b("hello"));
        }
        let upstream = cluster.proxy_upstream(proxy).unwrap();
        assert_eq!(upstream.subscriptions_to(&ty), 1);
    }

    #[test]
    fn test_proxy_commits_reach_direct_clients() {
        let mut cluster = Cluster::start().unwrap();
        let proxy = cluster.add_proxy(ProxyConfig::default()).unwrap();
        let ty = counter_type();

        let direct = cluster.counter_client(true).unwrap();
        let proxied = cluster.connect_via_proxy(proxy).unwrap();
        proxied.define_schema(APP_SCHEMA, &counter_schema()).unwrap();
        proxied.subscribe_index(APP_SCHEMA, "Counter", "k", b("1")).unwrap();

        let oid = proxied.transact(|t| t.create(&ty, &[("k", b("1"))])).unwrap();
        assert_eq!(oid.root(), proxied.identity_root().unwrap());
        assert_eq!(proxied.view().lookup_all(&ty, "k", b"1").unwrap(), vec![oid]);

        direct.flush().unwrap();
        assert_eq!(direct.view().get(&ty, oid, "k").unwrap(), b("1"));

        // stale proxied write loses to the direct one
        let mut stale = proxied.transaction();
        assert_eq!(stale.get(&ty, oid, "k").unwrap(), b("1"));
        direct.transact(|t| t.set(&ty, oid, "k", b("2"))).unwrap();
        stale.set(&ty, oid, "x", b("late")).unwrap();
        assert!(stale.commit().unwrap_err().is_conflict());

        proxied.flush().unwrap();
        assert!(proxied.view().lookup_all(&ty, "k", b"1").unwrap().is_empty());
    }

    #[test]
    fn test_deleted_objects_disappear_everywhere() {
        let cluster = Cluster::start().unwrap();
        let ty = counter_type();
        let a = cluster.counter_client(true).unwrap();
        let other = cluster.counter_client(true).unwrap();

        let oid = a.transact(|t| t.create(&ty, &[("k", b("3")), ("x", b("v"))])).unwrap();
        other.flush().unwrap();
        assert!(other.view().exists(&ty, oid).unwrap());

        let before = other.view();
        a.transact(|t| t.delete(&ty, oid)).unwrap();
        other.flush().unwrap();

        let view = other.view();
        assert!(!view.exists(&ty, oid).unwrap());
        assert!(view.lookup_type(&ty).unwrap().is_empty());
        assert!(view.lookup_all(&ty, "k", b"3").unwrap().is_empty());
        assert!(matches!(view.get(&ty, oid, "x"), Err(OdbError::ObjectDoesntExist(_))));

        // the older snapshot still sees it
        assert_eq!(before.get(&ty, oid, "x").unwrap(), b("v"));
    }

    #[test]
    fn test_lazy_subscriber_loads_on_read() {
        let cluster = Cluster::start().unwrap();
        let ty = counter_type();
        let writer = cluster.counter_client(true).unwrap();
        let oid = writer
            .transact(|t| t.create(&ty, &[("k", b("1")), ("x", b("payload"))]))
            .unwrap();

        let lazy = cluster.counter_client(false).unwrap();
        lazy.subscribe_type(APP_SCHEMA, "Counter", true).unwrap();
        assert_eq!(lazy.view().lookup_type(&ty).unwrap(), vec![oid]);
        assert_eq!(lazy.view().get(&ty, oid, "x").unwrap(), b("payload"));

        // later writes arrive in full
        writer.transact(|t| t.set(&ty, oid, "x", b("next"))).unwrap();
        lazy.flush().unwrap();
        assert_eq!(lazy.view().get(&ty, oid, "x").unwrap(), b("next"));
    }

    #[test]
    fn test_reactor_wakes_on_remote_write() {
        let cluster = Cluster::start().unwrap();
        let ty = counter_type();
        let watcher = cluster.counter_client(true).unwrap();
        let writer = cluster.counter_client(true).unwrap();
        let oid = writer.transact(|t| t.create(&ty, &[("x", b("start"))])).unwrap();
        watcher.flush().unwrap();

        let read_ty = ty.clone();
        let reactor = Reactor::new(&watcher, move |ctx| {
            Ok(ctx.get(&read_ty, oid, "x")? == Bytes::from_static(b"done"))
        });

        let remote = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.transact(|t| t.set(&ty, oid, "x", b("done"))).unwrap();
            writer
        });
        assert!(reactor.block_until_true(Some(WAIT)).unwrap());
        remote.join().unwrap();
    }

    #[test]
    fn test_connection_records_track_live_clients() {
        let cluster = Cluster::start().unwrap();
        let observer = cluster.connect().unwrap();
        observer.subscribe_type(CORE_SCHEMA, CONNECTION_TYPE, false).unwrap();

        let client = cluster.connect().unwrap();
        let record = client.connection_object().unwrap();
        observer.flush().unwrap();
        assert!(observer.connection_objects().unwrap().contains(&record));

        client.disconnect();
        assert!(wait_until(WAIT, || {
            observer.flush().is_ok()
                && !observer.connection_objects().unwrap_or_default().contains(&record)
        }));
        let ty = TypeKey::new(CORE_SCHEMA, CONNECTION_TYPE);
        assert!(!observer.view().exists(&ty, record).unwrap());
    }

    #[test]
    fn test_random_writers_converge() {
        let cluster = Cluster::start().unwrap();
        let handles: Vec<_> = (0..3u64)
            .map(|seed| {
                let db = cluster.counter_client(true).unwrap();
                thread::spawn(move || {
                    let mut worker = Worker::new(db, seed);
                    worker.run(25).unwrap();
                    worker
                })
            })
            .collect();
        let workers: Vec<Worker> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let reader = cluster.counter_client(true).unwrap();
        let expected = counter_state(&reader).unwrap();
        let groups = key_groups(&reader).unwrap();
        for worker in &workers {
            worker.connection().flush().unwrap();
            assert_eq!(counter_state(worker.connection()).unwrap(), expected);
            assert_eq!(key_groups(worker.connection()).unwrap(), groups);
        }

        // every live object sits in exactly the group of its key
        let grouped: usize = groups.values().map(Vec::len).sum();
        assert_eq!(grouped, expected.len());
        for (k, oids) in &groups {
            for oid in oids {
                assert_eq!(expected[oid].0, Bytes::from(vec![b'0' + k]));
            }
        }
    }

    #[test]
    fn test_recovered_authority_serves_old_data() {
        let store = Arc::new(MemoryPersistence::new());
        let ty = counter_type();
        let oid = {
            let cluster = Cluster::with_store(AuthorityConfig::default(), store.clone()).unwrap();
            let db = cluster.counter_client(true).unwrap();
            db.transact(|t| t.create(&ty, &[("k", b("7")), ("x", b("kept"))])).unwrap()
        };

        let cluster = Cluster::with_store(AuthorityConfig::default(), store).unwrap();
        let db = cluster.counter_client(true).unwrap();
        let view = db.view();
        assert_eq!(view.get(&ty, oid, "x").unwrap(), b("kept"));
        assert_eq!(view.lookup_all(&ty, "k", b"7").unwrap(), vec![oid]);

        // fresh ids do not collide with recovered ones
        let fresh = db.transact(|t| t.create(&ty, &[])).unwrap();
        assert_ne!(fresh.root(), oid.root());
    }

    #[test]
    fn test_small_transaction_chunks_commit_whole() {
        let cluster = Cluster::start()
            .unwrap()
            .with_client_config(ConnectionConfig::default().with_transaction_chunk_size(2));
        let ty = counter_type();
        let db = cluster.counter_client(true).unwrap();
        let reader = cluster.counter_client(true).unwrap();

        let oids = db
            .transact(|t| {
                (0..5)
                    .map(|_| t.create(&ty, &[("k", b("9")), ("x", b("c"))]))
                    .collect::<Result<Vec<_>, _>>()
            })
            .unwrap();
        reader.flush().unwrap();
        let mut found = reader.view().lookup_all(&ty, "k", b"9").unwrap();
        found.sort();
        let mut oids = oids;
        oids.sort();
        assert_eq!(found, oids);
    }

    #[test]
    fn test_long_open_transaction_outlives_retention() {
        let config = AuthorityConfig::default()
            .with_version_retention(2)
            .with_gc_interval(Duration::from_millis(20));
        let cluster = Cluster::with_store(config, Arc::new(MemoryPersistence::new()))
            .unwrap()
            .with_client_config(
                ConnectionConfig::default()
                    .with_request_timeout(Some(WAIT))
                    .with_cache_gc_every(1),
            );
        let ty = counter_type();
        let db = cluster.counter_client(true).unwrap();
        let writer = cluster.counter_client(true).unwrap();
        let kept = db.transact(|t| t.create(&ty, &[("x", b("a"))])).unwrap();
        let busy = db.transact(|t| t.create(&ty, &[("x", b("0"))])).unwrap();

        let mut old = db.transaction();
        for i in 0..10u8 {
            writer
                .transact(|t| t.set(&ty, busy, "x", Bytes::from(vec![b'0' + i])))
                .unwrap();
        }
        db.flush().unwrap();
        assert!(db.current_tid().0 > old.tid().0 + 2);
        thread::sleep(Duration::from_millis(200));

        // untouched since the transaction opened, so it still commits
        assert_eq!(old.get(&ty, kept, "x").unwrap(), b("a"));
        old.set(&ty, kept, "x", b("b")).unwrap();
        old.commit().unwrap();

        let mut stale = db.transaction();
        let mut late = writer.transaction();
        assert_eq!(stale.get(&ty, busy, "x").unwrap(), b("9"));
        late.set(&ty, busy, "x", b("late")).unwrap();
        late.commit().unwrap();
        stale.set(&ty, busy, "x", b("lost")).unwrap();
        assert!(stale.commit().unwrap_err().is_conflict());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_index_lookups_match_latest_keys(
            moves in proptest::collection::vec((0usize..3, 0u8..3), 1..12)
        ) {
            let cluster = Cluster::start().unwrap();
            let ty = counter_type();
            let writer = cluster.counter_client(true).unwrap();
            let watcher = cluster.counter_client(false).unwrap();
            watcher.subscribe_index(APP_SCHEMA, "Counter", "k", b("0")).unwrap();

            let oids: Vec<_> = (0..3)
                .map(|_| writer.transact(|t| t.create(&ty, &[("k", b("0"))])).unwrap())
                .collect();
            let mut keys = [0u8; 3];
            for (object, key) in moves {
                keys[object] = key;
                writer
                    .transact(|t| t.set(&ty, oids[object], "k", Bytes::from(vec![b'0' + key])))
                    .unwrap();
            }
            watcher.flush().unwrap();

            for k in 0..3u8 {
                let mut expected: Vec<_> = (0..3).filter(|i| keys[*i] == k).map(|i| oids[i]).collect();
                expected.sort();
                let mut found = writer.view().lookup_all(&ty, "k", [b'0' + k]).unwrap();
                found.sort();
                prop_assert_eq!(&found, &expected);
                if k == 0 {
                    let mut watched = watcher.view().lookup_all(&ty, "k", b"0").unwrap();
                    watched.sort();
                    prop_assert_eq!(&watched, &expected);
                }
            }
        }
    }
}
