//! Optional Redis read-through cache for function rows.
//!
//! Every failure here is logged and swallowed: the cache only ever saves a
//! database read, it never gates one.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::FunctionRecord;

const FUNCTION_TTL_SECS: u64 = 300;

#[derive(Clone)]
pub(crate) struct MetadataCache {
    conn: ConnectionManager,
}

impl MetadataCache {
    pub(crate) async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn key(id: &str) -> String {
        format!("function:{id}")
    }

    pub(crate) async fn put_function(&self, record: &FunctionRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, id = %record.id, "Failed to serialise function for cache");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(err) = conn
            .set_ex::<_, _, ()>(Self::key(&record.id), json, FUNCTION_TTL_SECS)
            .await
        {
            warn!(error = %err, id = %record.id, "Failed to cache function");
        }
    }

    pub(crate) async fn get_function(&self, id: &str) -> Option<FunctionRecord> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(Self::key(id)).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => {
                    debug!(%id, "Function cache hit");
                    Some(record)
                }
                Err(err) => {
                    warn!(error = %err, %id, "Discarding unparseable cache entry");
                    self.evict_function(id).await;
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, %id, "Cache read failed");
                None
            }
        }
    }

    pub(crate) async fn evict_function(&self, id: &str) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.del::<_, ()>(Self::key(id)).await {
            warn!(error = %err, %id, "Cache eviction failed");
        }
    }
}
