//! Redis Streams-backed message queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `{prefix}:queue:{name}`, one stream per queue
//! - **Consumer group**: `{prefix}`; every worker process joins it under its own
//!   consumer name, so a message is handed to one consumer at a time
//! - **Visibility**: a delivered entry stays in the group's pending list; once it has
//!   been idle longer than the visibility timeout another receive claims it (XCLAIM)
//! - **Ack**: XACK followed by XDEL
//! - **Defer**: the entry moves to a sorted set `{stream}:delayed` scored by due time
//!   and is re-added to the stream once due, keeping its message id and delivery count

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use annotflow_events::{MessageQueue, QueueError, ReceiptHandle, ReceivedMessage};

const FIELD_ID: &str = "message_id";
const FIELD_BODY: &str = "body";
const FIELD_DELIVERIES: &str = "deliveries";
const PROMOTE_BATCH: usize = 16;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    name: String,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

/// Entry parked in the delayed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DelayedEntry {
    message_id: String,
    body: String,
    deliveries: u32,
}

/// Entry read back from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    entry_id: String,
    message_id: String,
    body: String,
    deliveries: u32,
}

impl RedisStreamsQueue {
    /// Connect to `redis_url` and make sure the stream and consumer group exist.
    pub fn open(
        redis_url: impl AsRef<str>,
        prefix: &str,
        name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;
        let stream_key = format!("{prefix}:queue:{name}");
        let queue = Self {
            client: Arc::new(client),
            name: name.to_string(),
            delayed_key: format!("{stream_key}:delayed"),
            stream_key,
            group: prefix.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            visibility_timeout,
        };
        queue.ensure_group()?;
        Ok(queue)
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client.get_connection().map_err(transport)
    }

    fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<Value> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(transport(err)),
        }
    }

    fn append(
        &self,
        conn: &mut redis::Connection,
        message_id: &str,
        body: &str,
        deliveries: u32,
    ) -> Result<(), QueueError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(FIELD_ID)
            .arg(message_id)
            .arg(FIELD_BODY)
            .arg(body)
            .arg(FIELD_DELIVERIES)
            .arg(deliveries)
            .query(conn)
            .map_err(transport)?;
        Ok(())
    }

    /// Move due entries from the delayed set back onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(transport)?;

        for member in due {
            // Whoever removes the member owns re-adding it.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&member)
                .query(conn)
                .map_err(transport)?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<DelayedEntry>(&member) {
                Ok(entry) => self.append(conn, &entry.message_id, &entry.body, entry.deliveries)?,
                Err(err) => warn!(queue = %self.name, error = %err, "dropping unreadable delayed entry"),
            }
        }
        Ok(())
    }

    /// Claim one entry another delivery left idle past the visibility timeout.
    fn claim_expired(&self, conn: &mut redis::Connection) -> Result<Option<StreamEntry>, QueueError> {
        let idle_ms = self.visibility_timeout.as_millis().to_string();
        let pending: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(&idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn)
            .map_err(transport)?;

        let Some((entry_id, _)) = parse_pending(pending).into_iter().next() else {
            return Ok(None);
        };

        let claimed: Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(&idle_ms)
            .arg(&entry_id)
            .query(conn)
            .map_err(transport)?;

        let Some(entry) = parse_entries(claimed).into_iter().next() else {
            return Ok(None);
        };
        let delivered = self.delivery_count(conn, &entry.entry_id)?;
        Ok(Some(StreamEntry {
            deliveries: entry.deliveries + delivered,
            ..entry
        }))
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        wait: Duration,
    ) -> Result<Option<StreamEntry>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.as_millis().to_string());
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(">");

        let reply: Value = cmd.query(conn).map_err(transport)?;
        let entry = parse_read_reply(reply).into_iter().next();
        Ok(entry.map(|entry| StreamEntry {
            deliveries: entry.deliveries + 1,
            ..entry
        }))
    }

    /// Times the group has delivered `entry_id`, or 0 if it is no longer pending.
    fn delivery_count(&self, conn: &mut redis::Connection, entry_id: &str) -> Result<u32, QueueError> {
        let pending: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query(conn)
            .map_err(transport)?;
        Ok(parse_pending(pending)
            .into_iter()
            .next()
            .map(|(_, count)| count)
            .unwrap_or(0))
    }

    fn fetch(&self, conn: &mut redis::Connection, entry_id: &str) -> Result<Option<StreamEntry>, QueueError> {
        let reply: Value = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(entry_id)
            .arg(entry_id)
            .query(conn)
            .map_err(transport)?;
        Ok(parse_entries(reply).into_iter().next())
    }

    /// XACK + XDEL; fails with `UnknownReceipt` when the entry was not pending.
    fn settle(&self, conn: &mut redis::Connection, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let acked: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(receipt.as_str())
            .query(conn)
            .map_err(transport)?;
        if acked == 0 {
            return Err(QueueError::UnknownReceipt(receipt.to_string()));
        }
        let _: i64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt.as_str())
            .query(conn)
            .map_err(transport)?;
        Ok(())
    }
}

impl MessageQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, body), fields(queue = %self.name), err)]
    fn send(&self, body: String) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        self.append(&mut conn, &uuid::Uuid::now_v7().to_string(), &body, 0)
    }

    fn receive(&self, wait: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn)?;

        let entry = match self.claim_expired(&mut conn)? {
            Some(entry) => Some(entry),
            None => self.read_new(&mut conn, wait)?,
        };

        Ok(entry.map(|entry| {
            debug!(queue = %self.name, message_id = %entry.message_id, deliveries = entry.deliveries, "received");
            ReceivedMessage {
                message_id: entry.message_id,
                body: entry.body,
                receipt: ReceiptHandle::new(entry.entry_id),
                receive_count: entry.deliveries,
            }
        }))
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        self.settle(&mut conn, receipt)
    }

    #[instrument(skip(self), fields(queue = %self.name), err)]
    fn defer(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let entry = self
            .fetch(&mut conn, receipt.as_str())?
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        let delivered = self.delivery_count(&mut conn, &entry.entry_id)?;
        if delivered == 0 {
            return Err(QueueError::UnknownReceipt(receipt.to_string()));
        }

        let parked = DelayedEntry {
            message_id: entry.message_id,
            body: entry.body,
            deliveries: entry.deliveries + delivered - 1,
        };
        let member = serde_json::to_string(&parked).map_err(|e| QueueError::Transport(e.to_string()))?;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let due = Utc::now().timestamp_millis().saturating_add(delay_ms);

        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due)
            .arg(&member)
            .query(&mut conn)
            .map_err(transport)?;
        self.settle(&mut conn, receipt)
    }
}

fn transport(err: redis::RedisError) -> QueueError {
    QueueError::Transport(err.to_string())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        other => text(other).and_then(|s| s.parse().ok()),
    }
}

fn items(value: Value) -> Vec<Value> {
    match value {
        Value::Bulk(items) => items,
        _ => Vec::new(),
    }
}

/// `[id, [field, value, ...]]`; deleted entries come back as nil and are skipped.
fn parse_entry(value: Value) -> Option<StreamEntry> {
    let mut parts = items(value).into_iter();
    let entry_id = text(&parts.next()?)?;
    let fields = items(parts.next()?);

    let mut message_id = None;
    let mut body = None;
    let mut deliveries = 0;
    for pair in fields.chunks(2) {
        let [key, value] = pair else { continue };
        match text(key).as_deref() {
            Some(FIELD_ID) => message_id = text(value),
            Some(FIELD_BODY) => body = text(value),
            Some(FIELD_DELIVERIES) => {
                deliveries = int(value).and_then(|n| u32::try_from(n).ok()).unwrap_or(0)
            }
            _ => {}
        }
    }

    Some(StreamEntry {
        message_id: message_id.unwrap_or_else(|| entry_id.clone()),
        body: body?,
        deliveries,
        entry_id,
    })
}

fn parse_entries(value: Value) -> Vec<StreamEntry> {
    items(value).into_iter().filter_map(parse_entry).collect()
}

/// XREADGROUP reply: `[[stream, [entry, ...]], ...]` or nil on timeout.
fn parse_read_reply(value: Value) -> Vec<StreamEntry> {
    items(value)
        .into_iter()
        .flat_map(|stream| items(stream).into_iter().nth(1).map(parse_entries).unwrap_or_default())
        .collect()
}

/// Extended XPENDING reply: `[[id, consumer, idle_ms, deliveries], ...]`.
fn parse_pending(value: Value) -> Vec<(String, u32)> {
    items(value)
        .into_iter()
        .filter_map(|row| {
            let row = items(row);
            let id = text(row.first()?)?;
            let count = int(row.get(3)?).and_then(|n| u32::try_from(n).ok())?;
            Some((id, count))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(fields.iter().flat_map(|(k, v)| [data(k), data(v)]).collect()),
        ])
    }

    #[test]
    fn parses_read_group_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("annotflow:queue:dispatch"),
            Value::Bulk(vec![entry(
                "1700000000000-0",
                &[(FIELD_ID, "m-1"), (FIELD_BODY, "{}"), (FIELD_DELIVERIES, "2")],
            )]),
        ])]);

        let entries = parse_read_reply(reply);
        assert_eq!(
            entries,
            vec![StreamEntry {
                entry_id: "1700000000000-0".into(),
                message_id: "m-1".into(),
                body: "{}".into(),
                deliveries: 2,
            }]
        );
    }

    #[test]
    fn timeout_reply_is_empty() {
        assert!(parse_read_reply(Value::Nil).is_empty());
    }

    #[test]
    fn claimed_deleted_entries_are_skipped() {
        let reply = Value::Bulk(vec![Value::Nil, entry("2-0", &[(FIELD_BODY, "x")])]);
        let entries = parse_entries(reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message_id, "2-0");
        assert_eq!(entries[0].deliveries, 0);
    }

    #[test]
    fn entry_without_body_is_ignored() {
        assert!(parse_entry(entry("3-0", &[(FIELD_ID, "m")])).is_none());
    }

    #[test]
    fn parses_pending_rows() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("5-0"),
            data("consumer-a"),
            Value::Int(61_000),
            Value::Int(3),
        ])]);
        assert_eq!(parse_pending(reply), vec![("5-0".to_string(), 3)]);
    }

    #[test]
    fn delayed_entry_survives_json() {
        let parked = DelayedEntry {
            message_id: "m".into(),
            body: "{\"a\":1}".into(),
            deliveries: 4,
        };
        let member = serde_json::to_string(&parked).unwrap();
        assert_eq!(serde_json::from_str::<DelayedEntry>(&member).unwrap(), parked);
    }
}
