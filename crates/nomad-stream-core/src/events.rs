//! Event stream envelopes.
//!
//! The server pushes [`Events`] batches; each [`Event`] carries a payload
//! whose shape is named by its [`Topic`]. Payloads stay raw JSON until a
//! caller asks for them with [`Event::decode_payload`].

use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::encoding::nullable;

/// Event topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Deployment,
    Evaluation,
    Allocation,
    Job,
    Node,
    NodePool,
    Service,
    AclToken,
    AclPolicy,
    AclRole,
    /// Wildcard subscription to every topic.
    All,
    /// A topic this client does not know about.
    Other(String),
}

impl Topic {
    /// Wire name of the topic.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Deployment => "Deployment",
            Self::Evaluation => "Evaluation",
            Self::Allocation => "Allocation",
            Self::Job => "Job",
            Self::Node => "Node",
            Self::NodePool => "NodePool",
            Self::Service => "Service",
            Self::AclToken => "ACLToken",
            Self::AclPolicy => "ACLPolicy",
            Self::AclRole => "ACLRole",
            Self::All => "*",
            Self::Other(s) => s,
        }
    }

    /// Key under which an event of this topic stores its payload.
    #[must_use]
    pub fn payload_key(&self) -> Option<&str> {
        match self {
            Self::All => None,
            other => Some(other.as_str()),
        }
    }
}

impl FromStr for Topic {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Deployment" => Self::Deployment,
            "Evaluation" => Self::Evaluation,
            "Allocation" => Self::Allocation,
            "Job" => Self::Job,
            "Node" => Self::Node,
            "NodePool" => Self::NodePool,
            "Service" => Self::Service,
            "ACLToken" => Self::AclToken,
            "ACLPolicy" => Self::AclPolicy,
            "ACLRole" => Self::AclRole,
            "*" => Self::All,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(Self::Other(s)))
    }
}

/// Payload decoding error.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("topic {0} has no single payload shape")]
    UntypedTopic(Topic),
    #[error("event for topic {0} carries no payload")]
    MissingPayload(Topic),
    #[error("failed to decode {topic} payload: {source}")]
    Decode {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },
}

/// A single state change pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub topic: Topic,
    #[serde(rename = "Type")]
    pub event_type: String,
    pub key: String,
    #[serde(default, deserialize_with = "nullable")]
    pub filter_keys: Vec<String>,
    pub index: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Raw payload entry for this event's topic.
    #[must_use]
    pub fn raw_payload(&self) -> Option<&Value> {
        self.topic.payload_key().and_then(|key| self.payload.get(key))
    }

    /// Decode the payload into the shape named by the topic.
    ///
    /// # Errors
    /// Returns error if the topic is a wildcard, the payload entry is
    /// missing, or it does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        if self.topic == Topic::All {
            return Err(EventError::UntypedTopic(Topic::All));
        }
        let value = self
            .raw_payload()
            .ok_or_else(|| EventError::MissingPayload(self.topic.clone()))?;
        T::deserialize(value).map_err(|source| EventError::Decode {
            topic: self.topic.clone(),
            source,
        })
    }
}

/// One decoded unit of the event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Events {
    #[serde(default)]
    pub index: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub events: Vec<Event>,
}

impl Events {
    /// An empty envelope sent only to keep the connection alive.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.index == 0 && self.events.is_empty()
    }
}
