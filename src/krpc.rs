//! KRPC: the DHT's RPC envelope (§3 "KRPC message", §4.6). A bencoded
//! mapping with `t` (transaction id), `y` (`q`/`r`/`e`), and the query/
//! response/error payload. Built directly on [`bencode::Value`] rather
//! than a derived struct, since inbound queries arrive from untrusted
//! peers and a strict derive would turn a merely-unexpected shape into a
//! hard decode failure instead of "ignore this datagram".

use crate::bencode::Value;
use rand::RngCore;

pub type NodeId = [u8; 20];

#[derive(Debug, Clone)]
pub enum Query {
    Ping { id: NodeId },
    FindNode { id: NodeId, target: NodeId },
    GetPeers { id: NodeId, info_hash: NodeId },
    AnnouncePeer { id: NodeId, info_hash: NodeId, port: u16, implied_port: bool, token: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub transaction_id: Vec<u8>,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub enum Body {
    Query(Query),
    Response(Value),
    Error,
}

pub fn random_transaction_id() -> Vec<u8> {
    let mut t = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut t);
    t.to_vec()
}

pub fn random_node_id() -> NodeId {
    let mut id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// §4.6 "responding-id trick": prefix-match the remote id for 15 bytes and
/// randomize the last 5, so the sybil looks like an XOR-near neighbor and
/// doesn't get evicted from the remote's routing table.
pub fn neighbor_id(remote: &NodeId) -> NodeId {
    let mut id = *remote;
    let mut tail = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut tail);
    id[15..20].copy_from_slice(&tail);
    id
}

fn node_id_from(value: &Value, key: &str) -> Option<NodeId> {
    let bytes = value.get(key)?.as_bytes()?;
    if bytes.len() != 20 {
        return None;
    }
    let mut id = [0u8; 20];
    id.copy_from_slice(bytes);
    Some(id)
}

impl Message {
    pub fn decode(datagram: &[u8]) -> Option<Message> {
        let value = Value::decode(datagram).ok()?;
        let transaction_id = value.get("t")?.as_bytes()?.to_vec();
        let y = value.get("y")?.as_str()?;
        let body = match y {
            "q" => Body::Query(decode_query(&value)?),
            "r" => Body::Response(value.get("r")?.clone()),
            "e" => Body::Error,
            _ => return None,
        };
        Some(Message { transaction_id, body })
    }

    pub fn encode_query(transaction_id: Vec<u8>, query: &Query) -> Vec<u8> {
        let (name, args) = match query {
            Query::Ping { id } => ("ping", Value::dict().set("id", Value::bytes(id.to_vec())).build()),
            Query::FindNode { id, target } => (
                "find_node",
                Value::dict()
                    .set("id", Value::bytes(id.to_vec()))
                    .set("target", Value::bytes(target.to_vec()))
                    .build(),
            ),
            Query::GetPeers { id, info_hash } => (
                "get_peers",
                Value::dict()
                    .set("id", Value::bytes(id.to_vec()))
                    .set("info_hash", Value::bytes(info_hash.to_vec()))
                    .build(),
            ),
            Query::AnnouncePeer { id, info_hash, port, implied_port, token } => (
                "announce_peer",
                Value::dict()
                    .set("id", Value::bytes(id.to_vec()))
                    .set("info_hash", Value::bytes(info_hash.to_vec()))
                    .set("port", Value::Int(*port as i64))
                    .set("implied_port", Value::Int(if *implied_port { 1 } else { 0 }))
                    .set("token", Value::bytes(token.clone()))
                    .build(),
            ),
        };
        Value::dict()
            .set("t", Value::bytes(transaction_id))
            .set("y", Value::string("q"))
            .set("q", Value::string(name))
            .set("a", args)
            .build()
            .encode()
    }

    pub fn encode_response(transaction_id: Vec<u8>, response: Value) -> Vec<u8> {
        Value::dict()
            .set("t", Value::bytes(transaction_id))
            .set("y", Value::string("r"))
            .set("r", response)
            .build()
            .encode()
    }

    /// `ping` / `announce_peer` reply: just our id.
    pub fn only_id_response(self_id: NodeId) -> Value {
        Value::dict().set("id", Value::bytes(self_id.to_vec())).build()
    }

    /// `find_node` / `get_peers` reply: our id, a token, an empty (or
    /// small fabricated) `nodes` list, and empty `values`, just enough
    /// to look useful to a remote routing table without maintaining a
    /// real one (§4.6, §9 open question on `get_peers` tolerability).
    pub fn nodes_response(self_id: NodeId, token: Option<Vec<u8>>) -> Value {
        let mut builder = Value::dict()
            .set("id", Value::bytes(self_id.to_vec()))
            .set("nodes", Value::bytes(Vec::new()))
            .set("values", Value::List(Vec::new()));
        if let Some(token) = token {
            builder = builder.set("token", Value::bytes(token));
        }
        builder.build()
    }
}

fn decode_query(value: &Value) -> Option<Query> {
    let name = value.get("q")?.as_str()?;
    let args = value.get("a")?;
    match name {
        "ping" => Some(Query::Ping { id: node_id_from(args, "id")? }),
        "find_node" => Some(Query::FindNode {
            id: node_id_from(args, "id")?,
            target: node_id_from(args, "target")?,
        }),
        "get_peers" => Some(Query::GetPeers {
            id: node_id_from(args, "id")?,
            info_hash: node_id_from(args, "info_hash")?,
        }),
        "announce_peer" => {
            let implied_port = args.get("implied_port").and_then(Value::as_int).unwrap_or(0) != 0;
            let port = args.get("port").and_then(Value::as_int).unwrap_or(0) as u16;
            let token = args.get("token").and_then(Value::as_bytes).unwrap_or(&[]).to_vec();
            Some(Query::AnnouncePeer {
                id: node_id_from(args, "id")?,
                info_hash: node_id_from(args, "info_hash")?,
                port,
                implied_port,
                token,
            })
        }
        _ => None,
    }
}
