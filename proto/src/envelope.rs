use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use statelink_schema::{EntityName, MaterializedValue, QueryHash, RawQuery};

/// The two generic procedures. Any other procedure string names a
/// schema-declared custom mutation.
pub const GENERIC_INSERT: &str = "INSERT";
pub const GENERIC_UPDATE: &str = "UPDATE";

/// Messages a client sends to the server. Every envelope carries a fresh
/// correlation `id` echoed back by REPLY/REJECT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Begin a standing query: the server answers with the initial result set
    /// and keeps streaming deltas until UNSUBSCRIBE.
    #[serde(rename = "SUBSCRIBE", rename_all = "camelCase")]
    Subscribe {
        id: String,
        resource: EntityName,
        query_hash: QueryHash,
        query: RawQuery,
    },
    #[serde(rename = "UNSUBSCRIBE", rename_all = "camelCase")]
    Unsubscribe { id: String, query_hash: QueryHash },
    /// One-shot read.
    #[serde(rename = "QUERY", rename_all = "camelCase")]
    Query {
        id: String,
        #[serde(flatten)]
        query: RawQuery,
    },
    #[serde(rename = "MUTATE", rename_all = "camelCase")]
    Mutate {
        id: String,
        resource: EntityName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<String>,
        procedure: String,
        /// Materialized `{field: {value, _meta}}` payload for the generic
        /// INSERT/UPDATE procedures.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<MaterializedValue>,
        /// Raw input for custom procedures, validated server-side.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<JsonValue>,
    },
}

impl ClientMessage {
    pub fn id(&self) -> &str {
        match self {
            ClientMessage::Subscribe { id, .. }
            | ClientMessage::Unsubscribe { id, .. }
            | ClientMessage::Query { id, .. }
            | ClientMessage::Mutate { id, .. } => id,
        }
    }

    /// True for MUTATE envelopes carrying a custom procedure. Only these are
    /// replayed after a reconnect.
    pub fn is_custom_mutation(&self) -> bool {
        match self {
            ClientMessage::Mutate { procedure, .. } => {
                procedure != GENERIC_INSERT && procedure != GENERIC_UPDATE
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
}

impl MutationKind {
    pub fn procedure(&self) -> &'static str {
        match self {
            MutationKind::Insert => GENERIC_INSERT,
            MutationKind::Update => GENERIC_UPDATE,
        }
    }
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Correlation-id echo carrying the result of the request.
    #[serde(rename = "REPLY", rename_all = "camelCase")]
    Reply { id: String, data: JsonValue },
    #[serde(rename = "REJECT", rename_all = "camelCase")]
    Reject {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<EntityName>,
        message: String,
    },
    /// A live delta addressed to one standing query's subscribers.
    #[serde(rename = "MUTATE", rename_all = "camelCase")]
    Mutate {
        id: String,
        resource: EntityName,
        resource_id: String,
        procedure: MutationKind,
        payload: MaterializedValue,
    },
}

impl ServerMessage {
    pub fn id(&self) -> &str {
        match self {
            ServerMessage::Reply { id, .. }
            | ServerMessage::Reject { id, .. }
            | ServerMessage::Mutate { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_envelope_flattens_raw_query() {
        let msg = ClientMessage::Query {
            id: "m1".into(),
            query: RawQuery::resource("posts")
                .with_where(json!({"title": "T"}))
                .with_limit(5),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "QUERY");
        assert_eq!(wire["resource"], "posts");
        assert_eq!(wire["where"], json!({"title": "T"}));
        assert_eq!(wire["limit"], 5);
        let back: ClientMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_mutate_procedure_classification() {
        let custom = ClientMessage::Mutate {
            id: "m1".into(),
            resource: "posts".into(),
            resource_id: None,
            procedure: "createPost".into(),
            payload: None,
            input: Some(json!({"id": "p1"})),
        };
        assert!(custom.is_custom_mutation());

        let generic = ClientMessage::Mutate {
            id: "m2".into(),
            resource: "posts".into(),
            resource_id: Some("p1".into()),
            procedure: GENERIC_INSERT.into(),
            payload: None,
            input: None,
        };
        assert!(!generic.is_custom_mutation());
    }

    #[test]
    fn test_subscribe_round_trips() {
        let msg = ClientMessage::Subscribe {
            id: "m1".into(),
            resource: "posts".into(),
            query_hash: QueryHash("abc123".into()),
            query: RawQuery::resource("posts").with_where(json!({"author": {"name": "J"}})),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "SUBSCRIBE");
        assert_eq!(wire["queryHash"], "abc123");
        let back: ClientMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_live_delta_round_trips() {
        let mut payload = MaterializedValue::new();
        payload.set_scalar("id", json!("p1"), None);
        let msg = ServerMessage::Mutate {
            id: "m9".into(),
            resource: "posts".into(),
            resource_id: "p1".into(),
            procedure: MutationKind::Insert,
            payload,
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["procedure"], "INSERT");
        assert_eq!(wire["resourceId"], "p1");
        let back: ServerMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_reject_wire_shape() {
        let msg = ServerMessage::Reject {
            id: "m3".into(),
            resource: None,
            message: "Not authorized".into(),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire, json!({"type": "REJECT", "id": "m3", "message": "Not authorized"}));
    }
}
