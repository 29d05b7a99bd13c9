//! The handshake contract.
//!
//! A [`HelloCommand`] is what a monitor asks a node, a [`HelloReply`] is the strongly-typed
//! view of the document the node answers with. Only the fields needed to classify the node
//! and the shape of its deployment are decoded; everything else in the reply is ignored.
use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::{server_address::ServerAddress, server_description::ServerType};

/// The legacy handshake command name.
pub const LEGACY_HELLO_COMMAND: &str = "isMaster";
/// The modern handshake command name, used once the server advertises `helloOk`.
pub const HELLO_COMMAND: &str = "hello";

/// A 12 byte opaque identifier, totally ordered by its bytes.
///
/// Used for replica set election ids and for the process id inside a [`TopologyVersion`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn parse_str(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(hex_str, &mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawObjectId {
    Hex(String),
    Extended {
        #[serde(rename = "$oid")]
        oid: String,
    },
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = match RawObjectId::deserialize(deserializer)? {
            RawObjectId::Hex(s) => s,
            RawObjectId::Extended { oid } => oid,
        };
        ObjectId::parse_str(&hex_str).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        json!({ "$oid": self.to_hex() }).serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInt64 {
    Int(i64),
    Extended {
        #[serde(rename = "$numberLong")]
        number_long: String,
    },
}

fn deserialize_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match RawInt64::deserialize(deserializer)? {
        RawInt64::Int(value) => Ok(value),
        RawInt64::Extended { number_long } => {
            number_long.parse().map_err(serde::de::Error::custom)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDateValue {
    Millis(i64),
    NumberLong {
        #[serde(rename = "$numberLong")]
        number_long: String,
    },
    Iso(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDate {
    Millis(i64),
    Extended {
        #[serde(rename = "$date")]
        date: RawDateValue,
    },
}

fn deserialize_date<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let millis = match Option::<RawDate>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(RawDate::Millis(ms)) | Some(RawDate::Extended { date: RawDateValue::Millis(ms) }) => ms,
        Some(RawDate::Extended {
            date: RawDateValue::NumberLong { number_long },
        }) => number_long.parse().map_err(serde::de::Error::custom)?,
        Some(RawDate::Extended {
            date: RawDateValue::Iso(iso),
        }) => {
            return DateTime::parse_from_rfc3339(&iso)
                .map(|date| Some(date.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom)
        }
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("date out of range: {}", millis)))
}

/// Identifies a server process and the version of its topology state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    #[serde(deserialize_with = "deserialize_i64")]
    pub counter: i64,
}

impl TopologyVersion {
    /// Whether `self` describes a strictly newer state than `other`.
    ///
    /// Versions from different processes can't be ordered, so a different process always counts
    /// as newer.
    pub fn is_more_recent_than(&self, other: &TopologyVersion) -> bool {
        self.process_id != other.process_id || self.counter > other.counter
    }
}

/// A BSON timestamp, ordered by seconds then increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Timestamp {
    pub t: u32,
    pub i: u32,
}

#[derive(Deserialize, Serialize)]
struct ExtendedTimestamp {
    #[serde(rename = "$timestamp")]
    timestamp: Timestamp,
}

fn deserialize_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
    ExtendedTimestamp::deserialize(deserializer).map(|ext| ext.timestamp)
}

fn serialize_timestamp<S: Serializer>(timestamp: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
    ExtendedTimestamp {
        timestamp: *timestamp,
    }
    .serialize(serializer)
}

/// The `$clusterTime` gossiped by servers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    #[serde(
        deserialize_with = "deserialize_timestamp",
        serialize_with = "serialize_timestamp"
    )]
    pub cluster_time: Timestamp,
    #[serde(default)]
    pub signature: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    #[serde(default, deserialize_with = "deserialize_date")]
    pub last_write_date: Option<DateTime<Utc>>,
}

/// The handshake request a monitor sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloCommand {
    /// Use `hello` rather than the legacy `isMaster` command name.
    pub hello_ok: bool,
    /// Present for awaitable (streaming) handshakes.
    pub topology_version: Option<TopologyVersion>,
    /// How long the server may hold the reply waiting for a topology change.
    pub max_await_time: Option<Duration>,
}

impl HelloCommand {
    pub fn is_awaitable(&self) -> bool {
        self.topology_version.is_some() && self.max_await_time.is_some()
    }

    /// Renders the command document handed to the [`Connector`](crate::connector::Connector).
    pub fn to_document(&self) -> serde_json::Value {
        let name = if self.hello_ok {
            HELLO_COMMAND
        } else {
            LEGACY_HELLO_COMMAND
        };
        let mut document = serde_json::Value::Object(serde_json::Map::new());
        document[name] = json!(1);
        document["helloOk"] = json!(true);
        if let (Some(topology_version), Some(max_await_time)) =
            (self.topology_version, self.max_await_time)
        {
            document["topologyVersion"] = json!({
                "processId": topology_version.process_id,
                "counter": topology_version.counter,
            });
            document["maxAwaitTimeMS"] = json!(max_await_time.as_millis() as u64);
        }
        document
    }
}

/// The subset of a handshake reply this crate consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub ok: Option<f64>,
    pub errmsg: Option<String>,
    pub code: Option<i32>,
    #[serde(rename = "ismaster", alias = "isMaster")]
    pub is_master: Option<bool>,
    pub is_writable_primary: Option<bool>,
    pub secondary: Option<bool>,
    pub arbiter_only: Option<bool>,
    pub hidden: Option<bool>,
    pub passive: Option<bool>,
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<ServerAddress>,
    pub me: Option<ServerAddress>,
    #[serde(default)]
    pub hosts: Vec<ServerAddress>,
    #[serde(default)]
    pub passives: Vec<ServerAddress>,
    #[serde(default)]
    pub arbiters: Vec<ServerAddress>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub min_wire_version: i32,
    #[serde(default)]
    pub max_wire_version: i32,
    pub logical_session_timeout_minutes: Option<i64>,
    pub last_write: Option<LastWrite>,
    pub topology_version: Option<TopologyVersion>,
    #[serde(rename = "$clusterTime")]
    pub cluster_time: Option<ClusterTime>,
    pub hello_ok: Option<bool>,
}

impl HelloReply {
    /// Whether the command itself succeeded. Only a truthy `ok` counts.
    pub fn is_ok(&self) -> bool {
        self.ok.map_or(false, |ok| ok != 0.0)
    }

    fn is_writable_primary(&self) -> bool {
        self.is_writable_primary.or(self.is_master).unwrap_or(false)
    }

    /// Classifies the replying node.
    pub fn server_type(&self) -> ServerType {
        if !self.is_ok() {
            return ServerType::Unknown;
        }

        if self.is_replica_set.unwrap_or(false) {
            return ServerType::RsGhost;
        }

        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }

        if self.set_name.is_some() {
            if self.hidden.unwrap_or(false) {
                return ServerType::RsOther;
            }
            if self.is_writable_primary() {
                return ServerType::RsPrimary;
            }
            if self.secondary.unwrap_or(false) {
                return ServerType::RsSecondary;
            }
            if self.arbiter_only.unwrap_or(false) {
                return ServerType::RsArbiter;
            }
            return ServerType::RsOther;
        }

        ServerType::Standalone
    }

    /// Whether the server can take awaitable handshakes (server 4.4+ reporting a topology version).
    pub fn supports_streaming(&self) -> bool {
        self.topology_version.is_some() && self.max_wire_version >= 9
    }
}
