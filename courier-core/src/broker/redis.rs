//! Redis Streams broker.
//!
//! Every module publishes to one shared stream. Each module reads it through
//! its own consumer group, so every module sees every event once. Entries
//! carry the fields `message_id`, `event_type`, `occurred_on` (RFC 3339) and
//! `body` (the JSON envelope).

use super::{BrokerError, Delivery, MessageBroker, MessageSource};
use crate::config::BrokerSettings;
use async_trait::async_trait;
use courier_sdk::TransportMessage;
use std::collections::HashMap;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamMaxlen;
use redis::{AsyncCommands, Client, RedisResult, Value};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_EVENT_TYPE: &str = "event_type";
const FIELD_OCCURRED_ON: &str = "occurred_on";
const FIELD_BODY: &str = "body";
const FIELD_ERROR: &str = "error";
const FIELD_SOURCE_ID: &str = "source_id";

fn encode_fields(message: &TransportMessage) -> Result<Vec<(&'static str, String)>, BrokerError> {
    let occurred_on = message
        .occurred_on
        .format(&Rfc3339)
        .map_err(|e| BrokerError::Rejected(format!("unencodable occurred_on: {e}")))?;
    let body = serde_json::to_string(&message.body)
        .map_err(|e| BrokerError::Rejected(format!("unencodable body: {e}")))?;

    let mut fields = Vec::with_capacity(4);
    if let Some(message_id) = &message.message_id {
        fields.push((FIELD_MESSAGE_ID, message_id.clone()));
    }
    fields.push((FIELD_EVENT_TYPE, message.event_type.clone()));
    fields.push((FIELD_OCCURRED_ON, occurred_on));
    fields.push((FIELD_BODY, body));
    Ok(fields)
}

async fn append(
    conn: &mut MultiplexedConnection,
    stream: &str,
    max_len: Option<usize>,
    fields: &[(&str, String)],
) -> RedisResult<String> {
    match max_len {
        Some(len) => conn.xadd_maxlen(stream, StreamMaxlen::Approx(len), "*", fields).await,
        None => conn.xadd(stream, "*", fields).await,
    }
}

/// Publishing side. Cloning shares the multiplexed connection.
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    stream: String,
    max_len: Option<usize>,
    publish_timeout: Duration,
}

impl RedisBroker {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        let client = Client::open(settings.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(stream = %settings.stream, "Connected Redis broker");
        Ok(Self {
            conn,
            stream: settings.stream.clone(),
            max_len: settings.max_stream_len,
            publish_timeout: Duration::from_millis(settings.publish_timeout_ms),
        })
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, message: &TransportMessage) -> Result<(), BrokerError> {
        let fields = encode_fields(message)?;
        let mut conn = self.conn.clone();
        let entry_id = tokio::time::timeout(
            self.publish_timeout,
            append(&mut conn, &self.stream, self.max_len, &fields),
        )
        .await
        .map_err(|_| {
            BrokerError::Unavailable(format!("publish timed out after {:?}", self.publish_timeout))
        })??;
        debug!(
            stream = %self.stream,
            entry_id = %entry_id,
            event_type = %message.event_type,
            "Appended message to stream"
        );
        Ok(())
    }
}

/// A raw stream entry before it is decoded into a [`TransportMessage`].
#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    fields: Vec<(String, String)>,
}

impl StreamEntry {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn into_delivery(self, delivery_count: u64) -> Result<Delivery, String> {
        let event_type = self
            .field(FIELD_EVENT_TYPE)
            .ok_or("missing event_type field")?
            .to_string();
        let body = self.field(FIELD_BODY).ok_or("missing body field")?;
        let body: serde_json::Value =
            serde_json::from_str(body).map_err(|e| format!("body is not JSON: {e}"))?;
        let occurred_on = self.field(FIELD_OCCURRED_ON).ok_or("missing occurred_on field")?;
        let occurred_on = OffsetDateTime::parse(occurred_on, &Rfc3339)
            .map_err(|e| format!("invalid occurred_on: {e}"))?;
        let message_id = self.field(FIELD_MESSAGE_ID).map(str::to_string);

        Ok(Delivery {
            delivery_id: self.id,
            message: TransportMessage {
                message_id,
                event_type,
                occurred_on,
                body,
            },
            delivery_count,
        })
    }
}

/// Entry id and its field pairs; `None` fields mean the entry was deleted.
type RawEntry = (String, Option<Vec<(String, String)>>);

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Parse `[[id, [field, value, ...]], ...]`.
///
/// Entries whose field list is nil were deleted from the stream while still
/// pending; they come back with `fields == None` so the caller can ack them.
fn parse_entries(value: &Value) -> Result<Vec<RawEntry>, BrokerError> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(BrokerError::Protocol(format!(
                "Expected array of stream entries, got {other:?}"
            )));
        }
    };

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Array(parts) = entry else {
            return Err(BrokerError::Protocol(format!("Expected array for entry, got {entry:?}")));
        };
        let [id, fields, ..] = parts.as_slice() else {
            return Err(BrokerError::Protocol("Stream entry too short".to_string()));
        };
        let id = value_to_string(id)
            .ok_or_else(|| BrokerError::Protocol(format!("Expected string entry id, got {id:?}")))?;
        let fields = match fields {
            Value::Array(raw) => Some(
                raw.chunks_exact(2)
                    .filter_map(|pair| Some((value_to_string(&pair[0])?, value_to_string(&pair[1])?)))
                    .collect(),
            ),
            Value::Nil => None,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "Expected array for entry fields, got {other:?}"
                )));
            }
        };
        parsed.push((id, fields));
    }
    Ok(parsed)
}

/// XREADGROUP reply: `[[stream, entries], ...]` (RESP2) or a map of
/// stream to entries (RESP3). Nil on block timeout.
fn parse_read_reply(value: &Value) -> Result<Vec<RawEntry>, BrokerError> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => {
            let mut entries = Vec::new();
            for stream in streams {
                match stream {
                    Value::Array(pair) if pair.len() >= 2 => entries.extend(parse_entries(&pair[1])?),
                    other => {
                        return Err(BrokerError::Protocol(format!(
                            "Expected [stream, entries], got {other:?}"
                        )));
                    }
                }
            }
            Ok(entries)
        }
        Value::Map(streams) => {
            let mut entries = Vec::new();
            for (_, stream_entries) in streams {
                entries.extend(parse_entries(stream_entries)?);
            }
            Ok(entries)
        }
        other => Err(BrokerError::Protocol(format!(
            "Unexpected XREADGROUP response type: {other:?}"
        ))),
    }
}

/// Extended XPENDING reply: `[[id, consumer, idle_ms, deliveries], ...]`.
fn parse_pending_reply(value: &Value) -> Result<Vec<(String, u64)>, BrokerError> {
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XPENDING response: {other:?}"
            )));
        }
    };

    let mut pending = Vec::with_capacity(rows.len());
    for row in rows {
        let Value::Array(parts) = row else {
            return Err(BrokerError::Protocol(format!("Expected array for pending row, got {row:?}")));
        };
        let [id, _consumer, _idle, deliveries, ..] = parts.as_slice() else {
            return Err(BrokerError::Protocol("Pending row too short".to_string()));
        };
        let id = value_to_string(id)
            .ok_or_else(|| BrokerError::Protocol(format!("Expected string entry id, got {id:?}")))?;
        let Value::Int(deliveries) = deliveries else {
            return Err(BrokerError::Protocol(format!(
                "Expected integer delivery count, got {deliveries:?}"
            )));
        };
        pending.push((id, u64::try_from(*deliveries).unwrap_or(0)));
    }
    Ok(pending)
}

/// Consuming side: one consumer in a module's consumer group.
pub struct RedisStreamSource {
    client: Client,
    conn: MultiplexedConnection,
    settings: BrokerSettings,
    group: String,
    consumer: String,
}

impl RedisStreamSource {
    pub async fn connect(
        settings: BrokerSettings,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = Client::open(settings.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let source = Self {
            client,
            conn,
            settings,
            group: group.into(),
            consumer: consumer.into(),
        };
        source.ensure_consumer_group().await?;
        Ok(source)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create the consumer group if it does not exist yet.
    ///
    /// New groups start at `0` so a module deployed after events were
    /// published still receives what the stream retains; the inbox absorbs
    /// any overlap.
    async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.settings.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.settings.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take over entries idle for longer than `claim_idle_ms`.
    ///
    /// XPENDING reports how often each entry was delivered; XCLAIM then moves
    /// them to this consumer and counts one more delivery. Returns the
    /// entries with their delivery count after the claim.
    async fn claim_stale(&mut self) -> Result<(Vec<RawEntry>, HashMap<String, u64>), BrokerError> {
        let reply: Value = redis::cmd("XPENDING")
            .arg(&self.settings.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.settings.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.settings.read_count)
            .query_async(&mut self.conn)
            .await?;
        let pending = parse_pending_reply(&reply)?;
        if pending.is_empty() {
            return Ok((Vec::new(), HashMap::new()));
        }

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.settings.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.settings.claim_idle_ms);
        for (id, _) in &pending {
            claim.arg(id);
        }
        let reply: Value = claim.query_async(&mut self.conn).await?;
        let counts = pending
            .into_iter()
            .map(|(id, deliveries)| (id, deliveries + 1))
            .collect();
        Ok((parse_entries(&reply)?, counts))
    }

    async fn read_new(&mut self) -> Result<Vec<RawEntry>, BrokerError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(self.settings.read_count)
            .arg("BLOCK")
            .arg(self.settings.block_ms)
            .arg("STREAMS")
            .arg(&self.settings.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;
        parse_read_reply(&reply)
    }

    async fn ack_id(&mut self, entry_id: &str) -> Result<(), BrokerError> {
        let acked: i64 = self
            .conn
            .xack(&self.settings.stream, &self.group, &[entry_id])
            .await?;
        if acked == 1 {
            debug!(entry_id = %entry_id, group = %self.group, "Acknowledged entry");
        } else {
            warn!(entry_id = %entry_id, group = %self.group, "XACK returned {acked}, entry may not exist");
        }
        Ok(())
    }

    async fn park(&mut self, entry_id: &str, mut fields: Vec<(String, String)>, error: &str) -> Result<(), BrokerError> {
        fields.push((FIELD_SOURCE_ID.to_string(), entry_id.to_string()));
        fields.push((FIELD_ERROR.to_string(), error.to_string()));
        let dead_letter_stream = self.settings.dead_letter_stream.clone();
        let _: String = self.conn.xadd(&dead_letter_stream, "*", &fields).await?;
        self.ack_id(entry_id).await
    }

    /// Turn raw entries into deliveries; undecodable entries are parked on
    /// the dead-letter stream and acked here.
    async fn decode_entries(
        &mut self,
        entries: Vec<RawEntry>,
        counts: &HashMap<String, u64>,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            let Some(fields) = fields else {
                debug!(entry_id = %id, "Pending entry was trimmed from the stream, acking");
                self.ack_id(&id).await?;
                continue;
            };
            let delivery_count = counts.get(&id).copied().unwrap_or(1);
            let entry = StreamEntry { id, fields };
            match entry.clone().into_delivery(delivery_count) {
                Ok(delivery) => deliveries.push(delivery),
                Err(reason) => {
                    warn!(entry_id = %entry.id, group = %self.group, error = %reason, "Malformed stream entry, dead-lettering");
                    self.park(&entry.id, entry.fields, &reason).await?;
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl MessageSource for RedisStreamSource {
    async fn next_batch(&mut self) -> Result<Vec<Delivery>, BrokerError> {
        let (stale, counts) = self.claim_stale().await?;
        if !stale.is_empty() {
            debug!(group = %self.group, count = stale.len(), "Reclaimed stale pending entries");
            return self.decode_entries(stale, &counts).await;
        }
        let fresh = self.read_new().await?;
        self.decode_entries(fresh, &HashMap::new()).await
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ack_id(&delivery.delivery_id).await
    }

    async fn dead_letter(&mut self, delivery: &Delivery, error: &str) -> Result<(), BrokerError> {
        let fields = encode_fields(&delivery.message)?
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.park(&delivery.delivery_id, fields, error).await
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        info!(group = %self.group, "Reconnecting to Redis...");
        self.conn = self.client.get_multiplexed_async_connection().await?;
        self.ensure_consumer_group().await
    }
}
