//! AsyncDht node.

use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::{
    common::{DhtTime, Id, Node, StoredValue},
    dht::{ActorMessage, Dht, DhtWasShutdown},
    rpc::Info,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0.send(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Wait until bootstrapping is done.
    ///
    /// Returns true if any initial peer responded, or if there were none to contact.
    pub async fn bootstrapped(&self) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0.send(ActorMessage::Bootstrapped(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Snapshot of the nodes in the routing table.
    pub async fn routing_table(&self) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.0.send(ActorMessage::RoutingTable(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Async version of [Dht::get]
    pub async fn get(&self, key: Id) -> Result<Option<StoredValue>, DhtWasShutdown> {
        self.get_sufficient(key, f64::NEG_INFINITY).await
    }

    /// Async version of [Dht::get_sufficient]
    pub async fn get_sufficient(
        &self,
        key: Id,
        sufficient_time: DhtTime,
    ) -> Result<Option<StoredValue>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<StoredValue>>(1);

        self.0
            .send(ActorMessage::Get(key, sufficient_time, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Async version of [Dht::set]
    pub async fn set(
        &self,
        key: Id,
        value: Bytes,
        expiration_time: DhtTime,
    ) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0
            .send(ActorMessage::Set(key, value, expiration_time, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Async version of [Dht::find_nearest_nodes]
    pub async fn find_nearest_nodes(
        &self,
        target: Id,
        k: usize,
    ) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.0
            .send(ActorMessage::FindNearestNodes(target, k, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Async version of [Dht::refresh_stale_buckets]
    pub async fn refresh_stale_buckets(&self) -> Result<usize, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<usize>(1);

        self.0.send(ActorMessage::RefreshStaleBuckets(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// Async version of [Dht::ping]
    pub async fn ping(&self, address: SocketAddrV4) -> Result<Option<Id>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Option<Id>>(1);

        self.0.send(ActorMessage::Ping(address, sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use crate::common::get_dht_time;
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let mut dht = Dht::builder()
                .interface(Ipv4Addr::LOCALHOST)
                .build()
                .unwrap()
                .as_async();

            let a = dht.clone();

            dht.shutdown().await;

            let result = a.get(Id::random()).await;

            assert!(matches!(result, Err(DhtWasShutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn set_get() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = Dht::builder()
                .interface(Ipv4Addr::LOCALHOST)
                .initial_peers(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            let b = Dht::builder()
                .interface(Ipv4Addr::LOCALHOST)
                .initial_peers(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            assert!(a.bootstrapped().await.unwrap());
            assert!(b.bootstrapped().await.unwrap());

            let key = Id::from_key("expert.3");
            let expiration_time = get_dht_time() + 60.0;

            assert!(a.set(key, "alive".into(), expiration_time).await.unwrap());

            let value = b.get(key).await.unwrap();

            assert_eq!(value, Some(StoredValue::new("alive".into(), expiration_time)));
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn find_nearest_nodes() {
        async fn test() {
            let testnet = Testnet::new(5).unwrap();

            let dht = Dht::builder()
                .interface(Ipv4Addr::LOCALHOST)
                .initial_peers(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();

            dht.bootstrapped().await.unwrap();

            let target = *testnet.nodes[3].info().unwrap().id();
            let nodes = dht.find_nearest_nodes(target, 3).await.unwrap();

            assert_eq!(nodes.len(), 3);
            assert_eq!(nodes[0].id, target);
        }
        futures::executor::block_on(test());
    }
}
