use crate::models::Connection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkTokenResponse {
    pub link_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeTokenRequest {
    pub public_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeTokenResponse {
    pub connection_id: i64,
}

/// A connection as shown to its owner. The access credential never leaves
/// the service.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub id: i64,
    pub has_synced: bool,
    pub last_synced_utc: Option<String>,
    pub created_utc: String,
    pub sync_in_progress: bool,
}

impl ConnectionResponse {
    pub fn new(connection: Connection, sync_in_progress: bool) -> Self {
        Self {
            id: connection.id,
            has_synced: !connection.cursor.is_empty(),
            last_synced_utc: connection.last_synced_utc.map(|t| t.to_rfc3339()),
            created_utc: connection.created_utc.to_rfc3339(),
            sync_in_progress,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerSyncResponse {
    pub connection_id: i64,
    pub status: String,
}
