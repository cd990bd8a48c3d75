use chrono::{DateTime, TimeZone, Utc};
use rdkafka::message::{Headers, Message};
use std::collections::HashMap;

/// Raw format of a consumed Kafka record.
///
/// Built once per delivered record by the transport adapter and handed to the
/// processor by reference; nothing keeps it after the processing call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub event_time: DateTime<Utc>,
    pub partition: i32,
    pub offset: i64,
}

impl RawMessage {
    /// Copy an rdkafka record into an owned message.
    ///
    /// Missing keys and payloads become empty buffers. Records without a
    /// broker or producer timestamp get the Unix epoch as event time.
    pub fn from_kafka<M: Message>(record: &M) -> Self {
        let event_time = record
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_default();

        let headers = record
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        let value = header
                            .value
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_default();
                        (header.key.to_string(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: record.topic().to_string(),
            key: record.key().map(<[u8]>::to_vec).unwrap_or_default(),
            body: record.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
            event_time,
            partition: record.partition(),
            offset: record.offset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
    use rdkafka::Timestamp;

    #[test]
    fn test_from_kafka_copies_record_fields() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "trace-id",
                value: Some("abc-123"),
            })
            .insert(Header {
                key: "source",
                value: Some("orders"),
            });
        let record = OwnedMessage::new(
            Some(b"{\"id\":1}".to_vec()),
            Some(b"order-1".to_vec()),
            "orders".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            3,
            42,
            Some(headers),
        );

        let msg = RawMessage::from_kafka(&record);

        assert_eq!(msg.topic, "orders");
        assert_eq!(msg.key, b"order-1");
        assert_eq!(msg.body, b"{\"id\":1}");
        assert_eq!(msg.partition, 3);
        assert_eq!(msg.offset, 42);
        assert_eq!(msg.event_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(msg.headers.get("trace-id").map(String::as_str), Some("abc-123"));
        assert_eq!(msg.headers.get("source").map(String::as_str), Some("orders"));
    }

    #[test]
    fn test_from_kafka_defaults_missing_parts() {
        let record = OwnedMessage::new(
            None,
            None,
            "orders".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );

        let msg = RawMessage::from_kafka(&record);

        assert!(msg.key.is_empty());
        assert!(msg.body.is_empty());
        assert!(msg.headers.is_empty());
        assert_eq!(msg.event_time.timestamp(), 0);
    }

    #[test]
    fn test_duplicate_header_keeps_last_value() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "retry",
                value: Some("1"),
            })
            .insert(Header {
                key: "retry",
                value: Some("2"),
            });
        let record = OwnedMessage::new(
            None,
            None,
            "orders".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            Some(headers),
        );

        let msg = RawMessage::from_kafka(&record);
        assert_eq!(msg.headers.len(), 1);
        assert_eq!(msg.headers.get("retry").map(String::as_str), Some("2"));
    }
}
