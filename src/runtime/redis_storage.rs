use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::model::{Record, RecordKey, RecordKind};
use crate::runtime::storage::{Change, RecordStore, Versioned, conflict};

// Checks every expected revision first, then applies all changes. Returns the
// 1-based index of the first conflicting change, 0 on success.
// ARGV per change: op, expected, data, member, kind index key, instance index key.
const COMMIT_SCRIPT: &str = r#"
    local n = #KEYS
    for i = 1, n do
        local current = tonumber(redis.call("HGET", KEYS[i], "rev") or "0")
        if current ~= tonumber(ARGV[(i - 1) * 6 + 2]) then
            return i
        end
    end
    for i = 1, n do
        local base = (i - 1) * 6
        local op = ARGV[base + 1]
        local member = ARGV[base + 4]
        local kind_idx = ARGV[base + 5]
        if op == "put" then
            local pid_idx = ARGV[base + 6]
            redis.call("HSET", KEYS[i], "rev", tonumber(ARGV[base + 2]) + 1, "data", ARGV[base + 3], "pidx", pid_idx)
            redis.call("SADD", kind_idx, member)
            if pid_idx ~= "" then
                redis.call("SADD", pid_idx, member)
            end
        else
            local pid_idx = redis.call("HGET", KEYS[i], "pidx")
            if pid_idx and pid_idx ~= "" then
                redis.call("SREM", pid_idx, member)
            end
            redis.call("SREM", kind_idx, member)
            redis.call("DEL", KEYS[i])
        end
    end
    return 0
"#;

// Consistent snapshot of one index: flat list of rev, data pairs.
const SCAN_SCRIPT: &str = r#"
    local out = {}
    for _, member in ipairs(redis.call("SMEMBERS", KEYS[1])) do
        local row = redis.call("HMGET", ARGV[1] .. member, "rev", "data")
        if row[1] and row[2] then
            table.insert(out, row[1])
            table.insert(out, row[2])
        end
    end
    return out
"#;

/// Record store on Redis. Each record is a hash (`rev`, `data`) plus index sets per
/// kind and per process instance; commits and scans run as Lua scripts so they are
/// atomic on the server.
pub struct RedisRecordStore {
    conn: MultiplexedConnection,
    prefix: String,
    commit_script: redis::Script,
    scan_script: redis::Script,
}

impl RedisRecordStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            commit_script: redis::Script::new(COMMIT_SCRIPT),
            scan_script: redis::Script::new(SCAN_SCRIPT),
        })
    }

    fn record_prefix(&self, kind: RecordKind) -> String {
        format!("{}:rec:{}:", self.prefix, kind)
    }

    fn record_key(&self, key: &RecordKey) -> String {
        format!("{}{}", self.record_prefix(key.kind), key.id)
    }

    fn kind_index(&self, kind: RecordKind) -> String {
        format!("{}:idx:{}", self.prefix, kind)
    }

    fn instance_index(&self, kind: RecordKind, process_instance_id: Uuid) -> String {
        format!("{}:pidx:{}:{}", self.prefix, kind, process_instance_id)
    }

    /// Deletes every key under the store's prefix.
    pub async fn clear_prefix(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", self.prefix)).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}

fn decode(rev: &str, data: &str) -> Result<Versioned> {
    let revision = rev
        .parse()
        .map_err(|_| EngineError::Storage(format!("corrupt revision `{}`", rev)))?;
    Ok(Versioned {
        revision,
        record: serde_json::from_str::<Record>(data)?,
    })
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn load(&self, key: &RecordKey) -> Result<Option<Versioned>> {
        let mut conn = self.conn.clone();
        let (rev, data): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.record_key(key))
            .arg("rev")
            .arg("data")
            .query_async(&mut conn)
            .await?;
        match (rev, data) {
            (Some(rev), Some(data)) => decode(&rev, &data).map(Some),
            _ => Ok(None),
        }
    }

    async fn scan(&self, kind: RecordKind, process_instance_id: Option<Uuid>) -> Result<Vec<Versioned>> {
        let index = match process_instance_id {
            Some(pid) => self.instance_index(kind, pid),
            None => self.kind_index(kind),
        };
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .scan_script
            .key(index)
            .arg(self.record_prefix(kind))
            .invoke_async(&mut conn)
            .await?;
        let mut found = flat
            .chunks_exact(2)
            .map(|pair| decode(&pair[0], &pair[1]))
            .collect::<Result<Vec<_>>>()?;
        found.sort_by_key(|v| v.record.key());
        Ok(found)
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<()> {
        let mut invocation = self.commit_script.prepare_invoke();
        for change in &changes {
            let key = change.key();
            invocation.key(self.record_key(&key));
            match change {
                Change::Put { record, expected } => {
                    let pid_index = record
                        .process_instance_id()
                        .map(|pid| self.instance_index(key.kind, pid))
                        .unwrap_or_default();
                    invocation
                        .arg("put")
                        .arg(*expected)
                        .arg(serde_json::to_string(record)?)
                        .arg(key.id.to_string())
                        .arg(self.kind_index(key.kind))
                        .arg(pid_index);
                }
                Change::Delete { expected, .. } => {
                    invocation
                        .arg("del")
                        .arg(*expected)
                        .arg("")
                        .arg(key.id.to_string())
                        .arg(self.kind_index(key.kind))
                        .arg("");
                }
            }
        }

        let mut conn = self.conn.clone();
        let failed: usize = invocation.invoke_async(&mut conn).await?;
        if failed == 0 {
            return Ok(());
        }
        let key = changes
            .get(failed - 1)
            .map(Change::key)
            .ok_or_else(|| EngineError::Storage(format!("commit script returned bad index {}", failed)))?;
        debug!(record = %key, "Redis commit rejected");
        Err(conflict(&key))
    }
}
