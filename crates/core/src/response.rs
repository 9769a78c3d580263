//! The replayable response payload.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Serialized outcome of a guarded operation: HTTP status plus JSON body.
///
/// This is what the ledger persists and what a replay returns verbatim — a
/// replayed create answers 201 again, not 200, because the stored pair is
/// returned untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl StoredResponse {
    pub fn new(status: u16, body: JsonValue) -> Self {
        Self { status, body }
    }

    /// 201 response for a successful create.
    pub fn created(body: JsonValue) -> Self {
        Self::new(201, body)
    }

    /// 200 response for a successful read/update.
    pub fn ok(body: JsonValue) -> Self {
        Self::new(200, body)
    }

    /// 204 response for an operation with no body.
    pub fn no_content() -> Self {
        Self::new(204, JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let response = StoredResponse::created(json!({"data": {"id": "L-17"}}));
        let raw = serde_json::to_string(&response).unwrap();
        let back: StoredResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, response);
        assert_eq!(back.status, 201);
    }
}
