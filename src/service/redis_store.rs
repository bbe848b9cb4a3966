use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use uuid::Uuid;

use crate::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use crate::service::store::{
    finish_context_query, finish_task_query, ContextRecord, ObjectStore, TaskRecord,
};
use crate::service::{ContextCriteria, TaskCriteria};

/// Redis-backed object store. One hash per record with one field per
/// column (state and request as integer codes, the codec payload as a
/// binary field) plus an id index set per record type. Every operation
/// autocommits; the transaction calls are accepted no-ops.
pub struct RedisObjectStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisObjectStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            key_prefix: "prozess".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    fn ctx_key(&self, id: Uuid) -> String {
        format!("{}:ctx:{}", self.key_prefix, id)
    }

    fn ctx_index_key(&self) -> String {
        format!("{}:ctx:index", self.key_prefix)
    }

    fn task_key(&self, id: Uuid) -> String {
        format!("{}:task:{}", self.key_prefix, id)
    }

    fn task_index_key(&self) -> String {
        format!("{}:task:index", self.key_prefix)
    }

    fn context_fields(record: &ContextRecord) -> Result<Vec<(&'static str, Vec<u8>)>> {
        let mut fields: Vec<(&'static str, Vec<u8>)> = vec![
            ("state", record.state.as_code().to_string().into_bytes()),
            ("request", record.request.as_code().to_string().into_bytes()),
            ("priority", record.priority.to_string().into_bytes()),
            ("child_ids", serde_json::to_vec(&record.child_ids)?),
            ("payload", record.payload.clone()),
        ];
        if let Some(parent_id) = record.parent_id {
            fields.push(("parent_id", parent_id.to_string().into_bytes()));
        }
        if let Some(queue_type) = &record.queue_type {
            fields.push(("queue_type", queue_type.clone().into_bytes()));
        }
        if let Some(node_id) = &record.node_id {
            fields.push(("node_id", node_id.clone().into_bytes()));
        }
        if let Some(user_id) = &record.user_id {
            fields.push(("user_id", user_id.clone().into_bytes()));
        }
        if let Some(debugger_id) = &record.debugger_id {
            fields.push(("debugger_id", debugger_id.clone().into_bytes()));
        }
        if let Some(current_socket) = &record.current_socket {
            fields.push(("current_socket", current_socket.clone().into_bytes()));
        }
        Ok(fields)
    }

    fn parse_context(id: Uuid, mut fields: HashMap<String, Vec<u8>>) -> Result<ContextRecord> {
        let state_code: i32 = take_str(&mut fields, "state")?
            .ok_or_else(|| anyhow!("context {} has no state column", id))?
            .parse()?;
        let request_code: i32 = take_str(&mut fields, "request")?
            .ok_or_else(|| anyhow!("context {} has no request column", id))?
            .parse()?;
        let state = LifecycleState::from_code(state_code)
            .ok_or_else(|| anyhow!("unknown state code {}", state_code))?;
        let request = LifecycleRequest::from_code(request_code)
            .ok_or_else(|| anyhow!("unknown request code {}", request_code))?;
        let priority: i32 = take_str(&mut fields, "priority")?
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(0);
        let parent_id = take_str(&mut fields, "parent_id")?
            .map(|s| s.parse::<Uuid>())
            .transpose()?;
        let child_ids = match fields.remove("child_ids") {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Vec::new(),
        };

        Ok(ContextRecord {
            id,
            parent_id,
            child_ids,
            state,
            request,
            priority,
            queue_type: take_str(&mut fields, "queue_type")?,
            node_id: take_str(&mut fields, "node_id")?,
            user_id: take_str(&mut fields, "user_id")?,
            debugger_id: take_str(&mut fields, "debugger_id")?,
            current_socket: take_str(&mut fields, "current_socket")?,
            payload: fields.remove("payload").unwrap_or_default(),
        })
    }

    async fn read_context(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: Uuid,
    ) -> Result<Option<ContextRecord>> {
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(self.ctx_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::parse_context(id, fields)?))
    }
}

fn take_str(fields: &mut HashMap<String, Vec<u8>>, name: &str) -> Result<Option<String>> {
    match fields.remove(name) {
        Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|e| {
            anyhow!("column '{}' is not utf-8: {}", name, e)
        })?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ObjectStore for RedisObjectStore {
    async fn begin(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn allocate_id(&self) -> Result<Uuid> {
        Ok(Uuid::new_v4())
    }

    async fn save_context(&self, record: &ContextRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fields = Self::context_fields(record)?;
        // Rewrite the whole hash so columns that became empty do not linger.
        let _: () = conn.del(self.ctx_key(record.id)).await?;
        let _: () = conn.hset_multiple(self.ctx_key(record.id), &fields).await?;
        let _: () = conn
            .sadd(self.ctx_index_key(), record.id.to_string())
            .await?;
        Ok(())
    }

    async fn delete_context(&self, id: Uuid) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.ctx_key(id)).await?;
        let _: () = conn.srem(self.ctx_index_key(), id.to_string()).await?;
        Ok(())
    }

    async fn find_context(&self, id: Uuid) -> Result<Option<ContextRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.read_context(&mut conn, id).await
    }

    async fn merge_context(&self, id: Uuid) -> Result<Option<ContextRecord>> {
        // A merge is a fresh canonical read; Redis holds no stale session
        // copies to reconcile.
        self.find_context(id).await
    }

    async fn evict(&self, _id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn query_contexts(&self, criteria: &ContextCriteria) -> Result<Vec<ContextRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ids: Vec<String> = conn.smembers(self.ctx_index_key()).await?;

        let mut records = Vec::new();
        for raw_id in ids {
            let id = match raw_id.parse::<Uuid>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            // An entry deleted between SMEMBERS and HGETALL is skipped.
            if let Some(record) = self.read_context(&mut conn, id).await? {
                if criteria.matches_record(&record) {
                    records.push(record);
                }
            }
        }
        Ok(finish_context_query(records, criteria))
    }

    async fn update_context_states(
        &self,
        from: LifecycleState,
        node_id: Option<&str>,
        to: LifecycleState,
        to_request: LifecycleRequest,
    ) -> Result<u64> {
        // Lua script so the whole index walk updates atomically. Only the
        // state, request and owner columns are touched.
        let script = redis::Script::new(
            r#"
            local ids = redis.call('SMEMBERS', KEYS[1])
            local count = 0
            for _, id in ipairs(ids) do
                local key = ARGV[5] .. id
                local state = redis.call('HGET', key, 'state')
                if state == ARGV[1] then
                    local node = redis.call('HGET', key, 'node_id')
                    if ARGV[4] == '' or node == ARGV[4] then
                        redis.call('HSET', key, 'state', ARGV[2], 'request', ARGV[3])
                        redis.call('HDEL', key, 'node_id')
                        count = count + 1
                    end
                end
            end
            return count
        "#,
        );

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = script
            .key(self.ctx_index_key())
            .arg(from.as_code().to_string())
            .arg(to.as_code().to_string())
            .arg(to_request.as_code().to_string())
            .arg(node_id.unwrap_or(""))
            .arg(format!("{}:ctx:", self.key_prefix))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let encoded = serde_json::to_vec(record)?;
        let _: () = conn.hset(self.task_key(record.id), "task", encoded).await?;
        let _: () = conn
            .sadd(self.task_index_key(), record.id.to_string())
            .await?;
        Ok(())
    }

    async fn delete_task(&self, id: Uuid) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.task_key(id)).await?;
        let _: () = conn.srem(self.task_index_key(), id.to_string()).await?;
        Ok(())
    }

    async fn find_task(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let encoded: Option<Vec<u8>> = conn.hget(self.task_key(id), "task").await?;
        match encoded {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn query_tasks(&self, criteria: &TaskCriteria) -> Result<Vec<TaskRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ids: Vec<String> = conn.smembers(self.task_index_key()).await?;

        let mut records = Vec::new();
        for raw_id in ids {
            let id = match raw_id.parse::<Uuid>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let encoded: Option<Vec<u8>> = conn.hget(self.task_key(id), "task").await?;
            if let Some(bytes) = encoded {
                let record: TaskRecord = serde_json::from_slice(&bytes)?;
                if criteria.matches(&record) {
                    records.push(record);
                }
            }
        }
        Ok(finish_task_query(records, criteria))
    }
}
