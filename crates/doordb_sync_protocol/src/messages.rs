//! Replication envelope and outgoing event types.

use serde::{Deserialize, Serialize};

/// Globally unique node identifier.
pub type NodeId = i64;

/// Identifier of a replicable table.
pub type TableId = i32;

/// Entity version (etag).
pub type Version = i64;

/// What a [`DoorMessage`] asks the receiver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Entities pushed by the sender.
    Push,
    /// Entities returned for a pull.
    Pull,
    /// The receiver should pull the named table.
    Invalidate,
}

/// One entity payload inside a [`DoorMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorReplicationEntity {
    /// Table the entity belongs to.
    pub table_id: TableId,
    /// The full row.
    pub entity: serde_json::Map<String, serde_json::Value>,
}

/// The replication envelope.
///
/// Serialized as `{what, fromNode, toNode, replications: [{tableId, entity}]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorMessage {
    /// Message kind.
    pub what: MessageKind,
    /// Sending node.
    pub from_node: NodeId,
    /// Receiving node.
    pub to_node: NodeId,
    /// Entity payloads.
    #[serde(default)]
    pub replications: Vec<DoorReplicationEntity>,
}

impl DoorMessage {
    /// Creates an empty message.
    pub fn new(what: MessageKind, from_node: NodeId, to_node: NodeId) -> Self {
        Self {
            what,
            from_node,
            to_node,
            replications: Vec::new(),
        }
    }

    /// Appends an entity payload.
    #[must_use]
    pub fn with_entity(
        mut self,
        table_id: TableId,
        entity: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.replications
            .push(DoorReplicationEntity { table_id, entity });
        self
    }

    /// Returns true if the message carries no entities.
    pub fn is_empty(&self) -> bool {
        self.replications.is_empty()
    }

    /// Encodes to JSON bytes.
    pub fn encode(&self) -> crate::ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> crate::ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An outgoing replication event: a row that must reach `to_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    /// Message kind the event will travel as.
    pub what: MessageKind,
    /// Destination node.
    pub to_node: NodeId,
    /// Table of the changed row.
    pub table_id: TableId,
    /// First key column of the row.
    pub key1: i64,
    /// Second key column, zero when unused.
    pub key2: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_camel_case_fields() {
        let entity = json!({"personUid": 1, "etag": 3});
        let msg = DoorMessage::new(MessageKind::Push, 10, 20)
            .with_entity(42, entity.as_object().cloned().unwrap());
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(value["what"], json!("push"));
        assert_eq!(value["fromNode"], json!(10));
        assert_eq!(value["toNode"], json!(20));
        assert_eq!(value["replications"][0]["tableId"], json!(42));
        assert_eq!(value["replications"][0]["entity"]["etag"], json!(3));
    }

    #[test]
    fn decode_tolerates_missing_replications() {
        let msg =
            DoorMessage::decode(br#"{"what":"invalidate","fromNode":1,"toNode":2}"#).unwrap();
        assert_eq!(msg.what, MessageKind::Invalidate);
        assert!(msg.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert!(DoorMessage::decode(br#"{"what":"merge","fromNode":1,"toNode":2}"#).is_err());
    }
}
