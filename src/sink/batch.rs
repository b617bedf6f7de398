use std::collections::HashMap;

use super::InboundMessage;

/// Messages received since the last successful flush, in arrival order
#[derive(Debug, Default)]
pub struct Batch {
    messages: Vec<InboundMessage>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Batch {
        Batch {
            messages: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, message: InboundMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[InboundMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Offset to resume from for every partition in the batch, that is the
    /// highest received offset plus one
    pub fn next_offsets(&self) -> HashMap<(String, i32), i64> {
        let mut topic_map: HashMap<(String, i32), i64> = HashMap::new();
        for msg in &self.messages {
            let next_offset = msg.offset + 1;
            topic_map
                .entry((msg.topic.clone(), msg.partition))
                .and_modify(|o| *o = (*o).max(next_offset))
                .or_insert(next_offset);
        }
        topic_map
    }
}
