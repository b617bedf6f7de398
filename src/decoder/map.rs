//! Loose decoding of payloads into key/value rows
use std::collections::HashSet;

use serde::de::Error as _;

use super::{object_to_row, Row};

pub struct Decoder {
    /// columns the destination table is known to have; empty accepts every key
    known: HashSet<String>,
}

impl Decoder {
    pub fn new<I, S>(columns: I) -> Decoder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Decoder {
            known: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl super::Decoder for Decoder {
    fn decode(&self, message: &[u8]) -> Result<Row, serde_json::Error> {
        match serde_json::from_slice(message)? {
            serde_json::Value::Object(object) => Ok(object_to_row(object, |k| {
                self.known.is_empty() || self.known.contains(k)
            })),
            _ => Err(serde_json::Error::custom("message must be a JSON object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::decoder::{Decoder as _, Value};

    use super::*;

    #[test]
    fn unknown_keys_are_filtered() {
        let decoder = Decoder::new(["operator", "action"]);
        let mut row = decoder
            .decode(br#"{"operator":"alice","action":"drop","foo":"bar"}"#)
            .unwrap();
        row.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            row,
            vec![
                (String::from("action"), Value::from("drop")),
                (String::from("operator"), Value::from("alice")),
            ]
        );
    }

    #[test]
    fn without_columns_every_key_passes() {
        let decoder = Decoder::new(Vec::<String>::new());
        let row = decoder.decode(br#"{"foo":"bar"}"#).unwrap();
        assert_eq!(row, vec![(String::from("foo"), Value::from("bar"))]);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let decoder = Decoder::new(Vec::<String>::new());
        assert!(decoder.decode(b"[1,2,3]").is_err());
        assert!(decoder.decode(b"not json").is_err());
    }
}
