use super::Kestrel;
use crate::{
    Config, ConnectionState, Error, KestrelId, MemoryStore, NodeAddr, ReconnectPolicy,
    events::{Event, EventKind},
    script::{KeySet, MAX_SEQUENCE, Script, allocation_script},
    store::{
        Connection, Connector, MemoryConnector, Role, StoreResult, TopologyEvent, TopologyKind,
    },
};
use core::time::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::broadcast;

fn addr(port: u16) -> NodeAddr {
    NodeAddr::new("127.0.0.1", port)
}

fn config(shard_id: u16) -> Config {
    Config::builder()
        .shard_id(shard_id)
        .connect_timeout(Duration::from_secs(1))
        .build_with(|_| None)
        .unwrap()
}

async fn ready(store: &MemoryStore, shard_id: u16) -> Kestrel {
    Kestrel::connect_with(config(shard_id), store.connector())
        .await
        .unwrap()
}

fn record(kestrel: &Kestrel, kinds: &[EventKind]) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    kestrel
        .events()
        .on_many(kinds, move |e| sink.lock().push(e.clone()));
    seen
}

/// Issues until the store accepts the call, sleeping between attempts.
async fn issue_eventually(kestrel: &Kestrel, count: usize) -> Vec<KestrelId> {
    for _ in 0..100 {
        match kestrel.issue(count).await {
            Ok(ids) => return ids,
            Err(Error::ShardIdOutOfRange) => panic!("shard misconfigured"),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("store never accepted the allocation");
}

fn assert_strictly_increasing(ids: &[KestrelId]) {
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
    }
}

#[tokio::test(start_paused = true)]
async fn a_batch_shares_timestamp_and_shard() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 42).await;

    let ids = kestrel.issue(100).await.unwrap();
    assert_eq!(ids.len(), 100);
    assert_strictly_increasing(&ids);
    assert!(ids.iter().all(|id| id.shard_id() == 42));
    assert!(ids.iter().all(|id| id.timestamp() == ids[0].timestamp()));
    for pair in ids.windows(2) {
        assert_eq!(pair[1].sequence(), pair[0].sequence() + 1);
    }

    let one = kestrel.issue_one().await.unwrap();
    assert!(one > ids[99]);
    kestrel.close().await;
}

#[tokio::test(start_paused = true)]
async fn counts_are_clamped() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 1).await;

    assert_eq!(kestrel.issue(0).await.unwrap().len(), 1);
    // Sequences 2..=4095 remain before the ceiling.
    let ids = kestrel.issue(1_000_000).await.unwrap();
    assert_eq!(ids.len(), 4094);
    assert_eq!(ids.last().map(|id| id.sequence()), Some(MAX_SEQUENCE as u64));
    assert_eq!(kestrel.issue(1).await, Err(Error::AllocatorLocked));
}

#[tokio::test(start_paused = true)]
async fn crossing_the_wraparound_never_repeats() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 9).await;

    let mut ids = Vec::new();
    let mut locked = 0;
    while ids.len() < 10_000 {
        match kestrel.issue(1000).await {
            Ok(batch) => ids.extend(batch),
            Err(Error::AllocatorLocked) => {
                locked += 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(err) => panic!("unexpected {err}"),
        }
    }

    assert!(locked > 0);
    assert_strictly_increasing(&ids);
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(ids.iter().any(|id| id.sequence() == 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_collide() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 3).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let kestrel = kestrel.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..20 {
                    ids.extend(kestrel.issue(20).await.unwrap());
                }
                ids
            })
        })
        .collect();

    let mut all = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(all.insert(id), "duplicate {id:?}");
        }
    }
    assert_eq!(all.len(), 8 * 20 * 20);
    kestrel.close().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_shard_ids_fail_every_allocation() {
    for shard_id in [0, 1024] {
        let store = MemoryStore::single(addr(6379));
        let kestrel = ready(&store, shard_id).await;
        let errors = record(&kestrel, &[EventKind::Error]);

        for _ in 0..3 {
            assert_eq!(kestrel.issue(5).await, Err(Error::ShardIdOutOfRange));
        }
        assert_eq!(kestrel.issue_one().await, Err(Error::ShardIdOutOfRange));
        assert_eq!(errors.lock().len(), 4);

        // The counter still advances on rejected calls.
        assert_eq!(store.get(&KeySet::default().sequence), Some(16));
        kestrel.close().await;
    }
}

#[tokio::test(start_paused = true)]
async fn allocation_resumes_after_failover() {
    let store = MemoryStore::replicated(addr(1), [addr(2)]);
    let kestrel = ready(&store, 7).await;
    let before = kestrel.issue_one().await.unwrap();
    assert!(!store.script_loaded(&addr(2), allocation_script().sha()));

    store.set_node_down(&addr(1), true);
    store.failover(&addr(2));
    assert!(kestrel.issue_one().await.is_err());

    let ids = issue_eventually(&kestrel, 1).await;
    assert_eq!(ids[0].shard_id(), 7);
    assert!(ids[0] > before);
    assert!(store.script_loaded(&addr(2), allocation_script().sha()));
    assert_eq!(kestrel.status(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn demoted_primary_hands_over_to_the_new_one() {
    let store = MemoryStore::replicated(addr(1), [addr(2)]);
    let kestrel = ready(&store, 11).await;
    kestrel.issue_one().await.unwrap();

    // The old primary stays up but now rejects writes.
    store.failover(&addr(2));
    let ids = issue_eventually(&kestrel, 3).await;
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.shard_id() == 11));
    assert_eq!(store.get(&KeySet::default().shard_id), Some(11));
}

#[tokio::test(start_paused = true)]
async fn lifecycle_events_are_published_in_order() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = Kestrel::new(config(5), store.connector());
    let seen = record(
        &kestrel,
        &[
            EventKind::ClientCreated,
            EventKind::Waiting,
            EventKind::Connecting,
            EventKind::Connected,
            EventKind::ScriptInstalled,
            EventKind::Ready,
            EventKind::Closing,
            EventKind::Closed,
        ],
    );

    kestrel.initialize().await.unwrap();
    kestrel.close().await;

    let kinds: Vec<_> = seen.lock().iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::ClientCreated,
            EventKind::Waiting,
            EventKind::Connecting,
            EventKind::Connected,
            EventKind::ScriptInstalled,
            EventKind::Ready,
            EventKind::Closing,
            EventKind::Closed,
        ]
    );
    assert_eq!(kestrel.events().count(EventKind::Closed), 0);
}

#[tokio::test(start_paused = true)]
async fn initialize_classifies_connection_failures() {
    let store = MemoryStore::single(addr(6379));

    let kestrel = Kestrel::new(
        config(1),
        store.connector_for(NodeAddr::new("missing.invalid", 6379)),
    );
    let errors = record(&kestrel, &[EventKind::Error]);
    assert!(matches!(
        kestrel.initialize().await,
        Err(Error::HostUnresolved(_))
    ));
    assert!(errors.lock().is_empty());
    assert_eq!(kestrel.status(), ConnectionState::Closed);

    store.set_node_down(&addr(6379), true);
    let refused = Kestrel::connect_with(config(1), store.connector()).await;
    assert!(matches!(refused, Err(Error::ConnectionRefused(_))));

    store.set_node_down(&addr(6379), false);
    store.require_password("opensesame");
    let denied = Kestrel::connect_with(config(1), store.connector()).await;
    assert!(matches!(denied, Err(Error::Authentication(_))));
    let allowed =
        Kestrel::connect_with(config(1), store.connector().password("opensesame")).await;
    assert!(allowed.is_ok());

    store.set_connect_delay(&addr(6379), Duration::from_secs(5));
    let slow = Kestrel::connect_with(config(1), store.connector().password("opensesame")).await;
    assert!(matches!(slow, Err(Error::ConnectTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn errors_after_startup_reach_observers() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 2).await;
    let errors = record(&kestrel, &[EventKind::Error]);

    store.set_node_down(&addr(6379), true);
    assert!(kestrel.issue(1).await.is_err());
    // Wait for the reconnect attempt to fail as well.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let errors = errors.lock();
    assert!(matches!(errors[0], Event::Error(Error::Store(_))));
    assert!(
        errors
            .iter()
            .any(|e| matches!(e, Event::Error(Error::ConnectionRefused(_))))
    );
    assert_eq!(kestrel.status(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_final() {
    let store = MemoryStore::single(addr(6379));

    let never = Kestrel::new(config(1), store.connector());
    assert_eq!(never.issue(1).await, Err(Error::NotReady(ConnectionState::Disconnected)));
    never.close().await;
    never.close().await;
    assert_eq!(never.status(), ConnectionState::Closed);
    assert_eq!(never.initialize().await, Err(Error::Closed));

    let kestrel = ready(&store, 1).await;
    let closed = record(&kestrel, &[EventKind::Closed]);
    kestrel.close().await;
    kestrel.close().await;
    assert_eq!(closed.lock().len(), 1);
    assert_eq!(kestrel.issue(1).await, Err(Error::Closed));
}

#[tokio::test(start_paused = true)]
async fn joining_cluster_nodes_get_the_script() {
    let store = MemoryStore::cluster([addr(7000), addr(7001)]);
    let kestrel = ready(&store, 4).await;
    let seen = record(
        &kestrel,
        &[EventKind::NodeAdded, EventKind::NodeRemoved, EventKind::ScriptInstalled],
    );

    store.add_node(addr(7002));
    store.add_node(addr(7003));
    store.remove_node(&addr(7001));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!store.script_loaded(&addr(7002), allocation_script().sha()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(store.script_loaded(&addr(7002), allocation_script().sha()));
    assert!(store.script_loaded(&addr(7003), allocation_script().sha()));

    let seen = seen.lock();
    let count = |kind| seen.iter().filter(|e| e.kind() == kind).count();
    assert_eq!(count(EventKind::NodeAdded), 2);
    assert_eq!(count(EventKind::NodeRemoved), 1);
    assert_eq!(count(EventKind::ScriptInstalled), 2);

    assert_eq!(kestrel.issue(2).await.map(|ids| ids.len()), Ok(2));
}

#[test]
fn decoding_needs_no_connection() {
    let decoded = Kestrel::decode("4194304172155").unwrap();
    assert_eq!((decoded.timestamp, decoded.shard_id, decoded.sequence), (1_000_000, 42, 123));
    assert_eq!(decoded.timestamp_ms, 1_451_567_800_000);

    let many = Kestrel::decode_many([4_194_304_172_155_u64, 4_194_304_172_156]).unwrap();
    assert_eq!(many[1].sequence, 124);
}

#[tokio::test(start_paused = true)]
async fn reinitializing_after_giving_up_does_not_duplicate_events() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 6).await;
    let seen = record(
        &kestrel,
        &[EventKind::ClientCreated, EventKind::Ready, EventKind::Waiting],
    );

    store.set_node_down(&addr(6379), true);
    assert!(kestrel.issue(1).await.is_err());
    let mut state = kestrel.state_changes();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();

    store.set_node_down(&addr(6379), false);
    kestrel.initialize().await.unwrap();
    assert_eq!(kestrel.status(), ConnectionState::Ready);

    let kinds: Vec<_> = seen.lock().iter().map(Event::kind).collect();
    assert_eq!(kinds, vec![EventKind::Waiting, EventKind::Ready]);
    let conn_events = kestrel.inner.manager.events();
    assert_eq!(conn_events.count(EventKind::Error), 1);
    assert_eq!(conn_events.count(EventKind::NodeAdded), 1);
    assert_eq!(kestrel.issue(3).await.map(|ids| ids.len()), Ok(3));
}

#[tokio::test(start_paused = true)]
async fn initialize_leaves_no_pending_race_observers() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 1).await;
    let conn_events = kestrel.inner.manager.events();
    // One forwarder per kind; the one-shot observers of the race are gone.
    assert_eq!(conn_events.count(EventKind::Error), 1);
    assert_eq!(conn_events.count(EventKind::Ready), 1);
}

/// Delegates to a memory connection, except that script lookups never finish.
struct StalledScripts(Arc<dyn Connection>);

impl Connection for StalledScripts {
    fn eval<'a>(
        &'a self,
        script: &'a Script,
        keys: &'a [String],
        args: &'a [i64],
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        self.0.eval(script, keys, args)
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        self.0.ping()
    }

    fn set<'a>(&'a self, key: &'a str, value: i64) -> BoxFuture<'a, StoreResult<()>> {
        self.0.set(key, value)
    }

    fn role(&self) -> BoxFuture<'_, StoreResult<Role>> {
        self.0.role()
    }

    fn primaries(&self) -> BoxFuture<'_, StoreResult<Vec<NodeAddr>>> {
        self.0.primaries()
    }

    fn script_exists<'a>(
        &'a self,
        _node: &'a NodeAddr,
        _sha: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(futures::future::pending())
    }

    fn script_load<'a>(
        &'a self,
        node: &'a NodeAddr,
        script: &'a Script,
    ) -> BoxFuture<'a, StoreResult<String>> {
        self.0.script_load(node, script)
    }

    fn topology_events(&self) -> Option<broadcast::Receiver<TopologyEvent>> {
        self.0.topology_events()
    }

    fn quit(&self) -> BoxFuture<'_, StoreResult<()>> {
        self.0.quit()
    }

    fn terminate(&self) {
        self.0.terminate();
    }
}

struct StalledConnector(MemoryConnector);

impl Connector for StalledConnector {
    fn kind(&self) -> TopologyKind {
        self.0.kind()
    }

    fn connect(&self) -> BoxFuture<'_, StoreResult<Arc<dyn Connection>>> {
        Box::pin(async move {
            let conn: Arc<dyn Connection> = Arc::new(StalledScripts(self.0.connect().await?));
            Ok(conn)
        })
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_script_install_hits_the_connect_timeout() {
    let store = MemoryStore::cluster([addr(7000), addr(7001)]);
    let kestrel = Kestrel::new(config(1), StalledConnector(store.connector()));
    assert_eq!(kestrel.initialize().await, Err(Error::ConnectTimeout(Duration::from_secs(1))));
    assert_eq!(kestrel.status(), ConnectionState::Closed);
    assert!(!store.script_loaded(&addr(7000), allocation_script().sha()));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_aborts_the_session() {
    let store = MemoryStore::single(addr(6379));
    let kestrel = ready(&store, 1).await;
    let manager = kestrel.inner.manager.clone();
    let copy = kestrel.clone();

    drop(kestrel);
    assert_eq!(manager.status(), ConnectionState::Ready);
    drop(copy);
    assert_eq!(manager.status(), ConnectionState::Closed);
    assert_eq!(
        manager.call(|conn| async move { conn.ping().await }).await,
        Err(Error::Closed)
    );
}
