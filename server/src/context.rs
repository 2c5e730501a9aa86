use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a transport hands over when a connection opens. The configured
/// [`ContextProvider`] maps these onto the request context object whose
/// fields authorization policies address.
#[derive(Debug, Clone, Default)]
pub struct TransportParams {
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

pub type ContextProvider = Arc<dyn Fn(&TransportParams) -> JsonValue + Send + Sync>;

/// Per-request context: the correlation id of the triggering envelope plus
/// the connection-scoped context object.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub message_id: String,
    pub data: JsonValue,
}

impl RequestContext {
    pub fn new(message_id: &str, data: JsonValue) -> Self {
        Self {
            message_id: message_id.to_owned(),
            data,
        }
    }

    /// Convenience accessor for a context field, `null` when absent.
    pub fn get(&self, field: &str) -> &JsonValue {
        self.data.get(field).unwrap_or(&JsonValue::Null)
    }
}
