//! Shard identity and script placement.
//!
//! Before a session is ready, every primary it can allocate against must hold
//! the allocation script and the configured shard ID:
//!
//! - Single node: install the script and write the shard ID on every connect.
//! - Cluster: install the script on every primary and write the shard ID once;
//!   primaries that join later get the script through
//!   [`ShardCoordinator::install_on`].
//! - Supervised failover: only when the session landed on the primary. This
//!   re-runs after every failover, since a promoted replica has neither.

use crate::{
    events::{Emitter, Event},
    script::{KeySet, allocation_script},
    store::{Connection, NodeAddr, Role, StoreError, StoreResult, TopologyKind},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ShardCoordinator {
    kind: TopologyKind,
    shard_id: u16,
    keys: KeySet,
    events: Emitter,
}

impl ShardCoordinator {
    pub fn new(kind: TopologyKind, shard_id: u16, events: Emitter) -> Self {
        Self {
            kind,
            shard_id,
            keys: KeySet::default(),
            events,
        }
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    /// Readies a fresh session for allocation.
    pub async fn prepare(&self, conn: Arc<dyn Connection>) -> StoreResult<()> {
        if self.kind == TopologyKind::Sentinel && conn.role().await? != Role::Primary {
            #[cfg(feature = "tracing")]
            tracing::debug!("Session landed on a replica, leaving shard identity alone");
            return Ok(());
        }

        let primaries = conn.primaries().await?;
        self.install_on(conn.as_ref(), &primaries).await?;
        self.write_shard_id(conn.as_ref()).await
    }

    /// Installs the allocation script on each of `nodes`.
    pub async fn install_on(
        &self,
        conn: &dyn Connection,
        nodes: &[NodeAddr],
    ) -> StoreResult<()> {
        for node in nodes {
            self.install_script(conn, node).await?;
        }
        Ok(())
    }

    /// Uploads the allocation script to `node` unless it already has it.
    /// Returns `true` if it uploaded.
    pub async fn install_script(
        &self,
        conn: &dyn Connection,
        node: &NodeAddr,
    ) -> StoreResult<bool> {
        let script = allocation_script();
        if conn.script_exists(node, script.sha()).await? {
            #[cfg(feature = "tracing")]
            tracing::debug!(%node, "Allocation script already cached");
            return Ok(false);
        }

        let sha = conn.script_load(node, script).await?;
        if sha != script.sha() {
            return Err(StoreError::Response(format!(
                "{node} cached the allocation script as {sha}, expected {}",
                script.sha()
            )));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%node, %sha, "Installed allocation script");
        self.events.emit(Event::ScriptInstalled {
            node: node.clone(),
            sha,
        });
        Ok(true)
    }

    async fn write_shard_id(&self, conn: &dyn Connection) -> StoreResult<()> {
        conn.set(&self.keys.shard_id, i64::from(self.shard_id)).await?;
        #[cfg(feature = "tracing")]
        tracing::debug!(shard_id = self.shard_id, "Wrote logical shard ID");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::EventKind,
        store::{Connector, MemoryStore},
    };
    use parking_lot::Mutex;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", port)
    }

    fn installed(events: &Emitter) -> Arc<Mutex<Vec<NodeAddr>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.on(EventKind::ScriptInstalled, move |e| {
            if let Event::ScriptInstalled { node, .. } = e {
                sink.lock().push(node.clone());
            }
        });
        seen
    }

    #[tokio::test]
    async fn single_node_gets_script_and_shard() {
        let store = MemoryStore::single(addr(6379));
        let events = Emitter::new();
        let seen = installed(&events);
        let coordinator = ShardCoordinator::new(TopologyKind::Single, 42, events);
        let conn = store.connector().connect().await.unwrap();

        coordinator.prepare(Arc::clone(&conn)).await.unwrap();
        assert_eq!(store.get(&coordinator.keys().shard_id), Some(42));
        assert!(store.script_loaded(&addr(6379), allocation_script().sha()));
        assert_eq!(*seen.lock(), vec![addr(6379)]);

        // Reconnects overwrite the shard ID but skip the upload.
        store.set(&coordinator.keys().shard_id, 7);
        coordinator.prepare(conn).await.unwrap();
        assert_eq!(store.get(&coordinator.keys().shard_id), Some(42));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn cluster_installs_on_every_primary() {
        let store = MemoryStore::cluster([addr(7000), addr(7001), addr(7002)]);
        let events = Emitter::new();
        let seen = installed(&events);
        let coordinator = ShardCoordinator::new(TopologyKind::Cluster, 5, events);
        let conn = store.connector().connect().await.unwrap();

        coordinator.prepare(Arc::clone(&conn)).await.unwrap();
        assert_eq!(seen.lock().len(), 3);
        assert_eq!(store.get(&coordinator.keys().shard_id), Some(5));

        store.add_node(addr(7003));
        assert!(
            coordinator
                .install_script(conn.as_ref(), &addr(7003))
                .await
                .unwrap()
        );
        assert!(
            !coordinator
                .install_script(conn.as_ref(), &addr(7003))
                .await
                .unwrap()
        );
        assert!(store.script_loaded(&addr(7003), allocation_script().sha()));
    }

    #[tokio::test]
    async fn replicas_are_left_alone() {
        let store = MemoryStore::replicated(addr(1), [addr(2)]);
        let events = Emitter::new();
        let seen = installed(&events);
        let coordinator = ShardCoordinator::new(TopologyKind::Sentinel, 9, events);

        let replica = store.connector_for(addr(2)).connect().await.unwrap();
        coordinator.prepare(replica).await.unwrap();
        assert!(seen.lock().is_empty());

        store.failover(&addr(2));
        let promoted = store.connector().connect().await.unwrap();
        coordinator.prepare(promoted).await.unwrap();
        assert_eq!(*seen.lock(), vec![addr(2)]);
        assert_eq!(store.get(&coordinator.keys().shard_id), Some(9));
    }
}
