//! Mainline DHT (BEP 5): a minimal node table plus `find_node`/`get_peers`
//! queries, enough to bootstrap and harvest peers for a single info-hash.
//! Not a full routing-table implementation (no bucket splitting, no
//! `announce_peer` serving) — this engine only needs the DHT as another
//! peer-discovery source, not a participating routing node.

pub mod krpc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dht::krpc::{KrpcMessage, NodeId, Query, Response};
use crate::error::{Error, Result};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PENDING_QUERIES: usize = 500;
const BOOTSTRAP_SPACING: Duration = Duration::from_millis(200);
const FIND_PEERS_SPACING: Duration = Duration::from_millis(10);
const FIND_PEERS_TIMEOUT: Duration = Duration::from_secs(10);
const FIND_PEERS_FANOUT: usize = 100;

/// Well-known bootstrap nodes used when the routing table is empty.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Flat node list standing in for a full Kademlia routing table: good
/// enough for a DHT client that only wants peers for torrents it's
/// actively downloading, not one that serves lookups for others.
pub struct NodeTable {
    nodes: Vec<Node>,
    capacity: usize,
}

impl NodeTable {
    pub fn new(capacity: usize) -> Self {
        Self { nodes: Vec::new(), capacity }
    }

    /// Rejects unroutable nodes (`0.0.0.0`, loopback, zero port) before
    /// admitting them, so the table never hands out dead `get_peers`
    /// targets.
    pub fn insert(&mut self, node: Node) {
        if node.addr.port() == 0 || node.addr.ip().is_loopback() || node.addr.ip().is_unspecified() {
            return;
        }
        if self.nodes.iter().any(|n| n.id == node.id) {
            return;
        }
        if self.nodes.len() >= self.capacity {
            self.nodes.remove(0);
        }
        self.nodes.push(node);
    }

    pub fn sample(&self, n: usize) -> Vec<Node> {
        self.nodes.iter().rev().take(n).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct DhtClient {
    socket: UdpSocket,
    local_id: NodeId,
    pending: DashMap<Bytes, oneshot::Sender<Response>>,
}

impl DhtClient {
    pub async fn bind(local_id: NodeId, bind_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket,
            local_id,
            pending: DashMap::new(),
        })
    }

    /// Resolves every bootstrap hostname and seeds the node table with a
    /// `find_node` targeted at our own id, so we learn a first set of real
    /// peers near us in the keyspace. Queries fire 200ms apart rather than
    /// all at once, to avoid bursting a handful of public routers.
    pub async fn bootstrap(self: &Arc<Self>, table: &mut NodeTable) -> Result<()> {
        let mut queries = tokio::task::JoinSet::new();
        for (i, host) in BOOTSTRAP_NODES.iter().enumerate() {
            let client = Arc::clone(self);
            let host = *host;
            let delay = BOOTSTRAP_SPACING * i as u32;
            queries.spawn(async move {
                tokio::time::sleep(delay).await;
                let addr: SocketAddr = match tokio::net::lookup_host(host).await {
                    Ok(mut addrs) => addrs.next()?,
                    Err(_) => return None,
                };
                match client.find_node(addr, client.local_id).await {
                    Ok(Response::FindNode { nodes, .. }) => Some(nodes),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(%host, error = %err, "dht bootstrap query failed");
                        None
                    }
                }
            });
        }
        while let Some(result) = queries.join_next().await {
            if let Ok(Some(nodes)) = result {
                for (id, node_addr) in nodes {
                    table.insert(Node { id, addr: node_addr });
                }
            }
        }
        Ok(())
    }

    pub async fn find_node(&self, addr: SocketAddr, target: NodeId) -> Result<Response> {
        self.query(addr, Query::FindNode { id: self.local_id, target }).await
    }

    pub async fn get_peers(&self, addr: SocketAddr, info_hash: [u8; 20]) -> Result<Response> {
        self.query(addr, Query::GetPeers { id: self.local_id, info_hash }).await
    }

    /// Queries up to `FIND_PEERS_FANOUT` nodes from `table` for peers on
    /// `info_hash`, firing each query `FIND_PEERS_SPACING` apart and
    /// collecting unique socket addresses across all responses that
    /// returned `values`. Bounded overall by `FIND_PEERS_TIMEOUT` so a
    /// handful of unresponsive nodes can't stall discovery.
    pub async fn get_peers_from_table(self: &Arc<Self>, table: &NodeTable, info_hash: [u8; 20]) -> Vec<SocketAddr> {
        let mut queries = tokio::task::JoinSet::new();
        for (i, node) in table.sample(FIND_PEERS_FANOUT).into_iter().enumerate() {
            let client = Arc::clone(self);
            let delay = FIND_PEERS_SPACING * i as u32;
            queries.spawn(async move {
                tokio::time::sleep(delay).await;
                client.get_peers(node.addr, info_hash).await
            });
        }

        let mut peers = Vec::new();
        let drained = timeout(FIND_PEERS_TIMEOUT, async {
            while let Some(result) = queries.join_next().await {
                if let Ok(Ok(Response::GetPeers { peers: found, .. })) = result {
                    peers.extend(found);
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("dht get_peers sweep hit its overall timeout before every node replied");
        }

        peers.sort_unstable_by_key(|a| a.to_string());
        peers.dedup();
        peers
    }

    async fn query(&self, addr: SocketAddr, query: Query) -> Result<Response> {
        if self.pending.len() >= MAX_PENDING_QUERIES {
            return Err(Error::ResourceExhausted("too many in-flight dht queries".into()));
        }
        let transaction_id = random_transaction_id();
        let message = KrpcMessage::Query {
            transaction_id: transaction_id.clone(),
            query,
        };
        let (tx, rx) = oneshot::channel();
        self.pending.insert(transaction_id.clone(), tx);

        let encoded = message.encode();
        self.socket.send_to(&encoded, addr).await?;

        let result = timeout(QUERY_TIMEOUT, rx).await;
        self.pending.remove(&transaction_id);
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ProtocolViolation("dht response channel dropped".into())),
            Err(_) => Err(Error::Timeout(format!("dht query to {addr}"))),
        }
    }

    /// Pumps inbound datagrams, dispatching responses to whichever
    /// `query()` call is waiting on their transaction id. Runs until the
    /// socket errors; the supervisor spawns this as its own task.
    pub async fn run_receive_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, _src) = self.socket.recv_from(&mut buf).await?;
            let Ok(message) = KrpcMessage::decode(&buf[..n]) else {
                continue;
            };
            if let KrpcMessage::Response { transaction_id, response } = message {
                if let Some((_, sender)) = self.pending.remove(&transaction_id) {
                    let _ = sender.send(response);
                }
            }
            debug!("dht message processed");
        }
    }
}

fn random_transaction_id() -> Bytes {
    let mut bytes = [0u8; 2];
    rand::thread_rng().fill(&mut bytes);
    Bytes::copy_from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_table_evicts_oldest_when_full() {
        let mut table = NodeTable::new(2);
        table.insert(Node { id: [1u8; 20], addr: "1.1.1.1:1".parse().unwrap() });
        table.insert(Node { id: [2u8; 20], addr: "2.2.2.2:2".parse().unwrap() });
        table.insert(Node { id: [3u8; 20], addr: "3.3.3.3:3".parse().unwrap() });
        assert_eq!(table.len(), 2);
        assert!(table.sample(2).iter().all(|n| n.id != [1u8; 20]));
    }

    #[test]
    fn node_table_deduplicates_by_id() {
        let mut table = NodeTable::new(10);
        let node = Node { id: [9u8; 20], addr: "9.9.9.9:9".parse().unwrap() };
        table.insert(node);
        table.insert(node);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn find_node_round_trips_over_loopback() {
        let server = DhtClient::bind([1u8; 20], "127.0.0.1:0").await.unwrap();
        let server_addr = server.socket.local_addr().unwrap();
        let client = DhtClient::bind([2u8; 20], "127.0.0.1:0").await.unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, src) = server.socket.recv_from(&mut buf).await.unwrap();
            let msg = KrpcMessage::decode(&buf[..n]).unwrap();
            if let KrpcMessage::Query { transaction_id, .. } = msg {
                let response = KrpcMessage::Response {
                    transaction_id,
                    response: Response::FindNode {
                        id: [1u8; 20],
                        nodes: vec![],
                    },
                };
                server.socket.send_to(&response.encode(), src).await.unwrap();
            }
        });

        let result = client.find_node(server_addr, [3u8; 20]).await.unwrap();
        assert!(matches!(result, Response::FindNode { .. }));
        server_task.await.unwrap();
    }
}
