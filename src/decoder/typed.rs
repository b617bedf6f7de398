//! Strict decoding of payloads into a registered record type
use std::marker::PhantomData;

use serde::de::Error as _;

use super::{object_to_row, Row};
use crate::model::Record;

pub struct Decoder<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Decoder<T> {
    pub fn new() -> Decoder<T> {
        Decoder {
            _record: PhantomData,
        }
    }
}

impl<T: Record> Default for Decoder<T> {
    fn default() -> Self {
        Decoder::new()
    }
}

impl<T: Record> super::Decoder for Decoder<T> {
    // unknown fields are dropped by serde, known fields must type-check
    fn decode(&self, message: &[u8]) -> Result<Row, serde_json::Error> {
        let mut record: T = serde_json::from_slice(message)?;
        if let Some(base) = record.base_event_mut() {
            base.stamp_receive_ts();
        }
        match serde_json::to_value(&record)? {
            serde_json::Value::Object(object) => Ok(object_to_row(object, |_| true)),
            _ => Err(serde_json::Error::custom("record must serialize to an object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        decoder::{Decoder as _, Value},
        model::instance_event::InstanceEvent,
    };

    use super::*;

    fn column<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
        row.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    #[test]
    fn extra_fields_are_dropped() {
        let decoder = Decoder::<InstanceEvent>::new();
        let row = decoder
            .decode(
                br#"{"cluster_address":"10.0.0.1:3306","instance":"db-1","event_name":"failover",
                    "level":"warn","message":"promoted","event_create_ts":1700000000000,
                    "event_uuid":"abc","unexpected":{"x":1}}"#,
            )
            .unwrap();
        assert_eq!(column(&row, "instance"), Some(&Value::from("db-1")));
        assert_eq!(
            column(&row, "event_create_ts"),
            Some(&Value::Int(1_700_000_000_000))
        );
        assert!(column(&row, "unexpected").is_none());
        assert!(column(&row, "event_uuid").is_none());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let decoder = Decoder::<InstanceEvent>::new();
        let err = decoder
            .decode(
                br#"{"cluster_address":"a","instance":"b","event_name":"c","level":"d",
                    "message":"e","cloud_id":"not-a-number"}"#,
            )
            .unwrap_err();
        assert!(err.to_string().contains("invalid type"), "{err}");
    }

    #[test]
    fn receive_ts_is_stamped_when_missing() {
        let decoder = Decoder::<InstanceEvent>::new();
        let row = decoder
            .decode(
                br#"{"cluster_address":"a","instance":"b","event_name":"c","level":"d",
                    "message":"e"}"#,
            )
            .unwrap();
        match column(&row, "event_receive_ts") {
            Some(Value::Int(ts)) => assert!(*ts > 0),
            other => panic!("unexpected event_receive_ts {other:?}"),
        }
    }

    #[test]
    fn receive_ts_from_payload_is_kept() {
        let decoder = Decoder::<InstanceEvent>::new();
        let row = decoder
            .decode(
                br#"{"cluster_address":"a","instance":"b","event_name":"c","level":"d",
                    "message":"e","event_receive_ts":42}"#,
            )
            .unwrap();
        assert_eq!(column(&row, "event_receive_ts"), Some(&Value::Int(42)));
    }
}
