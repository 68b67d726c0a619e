//! JSON lines consumer
//!
//! Writes one JSON object per record:
//!
//! ```json
//! {"key":"Q1_record1","query_id":"Q1","observed_at":"2024-01-01T00:00:00Z","body":{"dept_no":"d001"}}
//! ```

use async_trait::async_trait;
use mysql_records_source::Batch;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::delivery::{DeliveryError, RecordConsumer};

pub struct JsonLinesConsumer<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesConsumer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

fn render(batch: &Batch) -> Result<Vec<u8>, DeliveryError> {
    let mut out = Vec::new();
    for record in &batch.records {
        let body: Value = serde_json::from_str(&record.body).map_err(|e| {
            DeliveryError::Permanent(format!("record {} has invalid body: {e}", record.key))
        })?;
        let attributes: Map<String, Value> = record
            .attributes()
            .into_iter()
            .map(|(name, value)| (name.to_string(), Value::from(value)))
            .collect();
        let line = json!({
            "key": record.key,
            "query_id": record.query_id,
            "observed_at": record.observed_at.to_rfc3339(),
            "attributes": attributes,
            "body": body,
        });
        serde_json::to_writer(&mut out, &line)
            .map_err(|e| DeliveryError::Permanent(format!("record {}: {e}", record.key)))?;
        out.push(b'\n');
    }
    Ok(out)
}

#[async_trait]
impl<W> RecordConsumer for JsonLinesConsumer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn consume(&self, batch: &Batch) -> Result<(), DeliveryError> {
        // Render first so a bad record never leaves a partial batch behind
        let bytes = render(batch)?;

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| DeliveryError::Transient(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| DeliveryError::Transient(format!("flush failed: {e}")))
    }
}
