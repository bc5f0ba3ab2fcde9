//! Messages delivered by the gateway.

use std::fmt;

/// A message received from the bus.
///
/// Payloads are UTF-8 text; binary payloads are dropped at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    /// Replayed by the broker from its retained store rather than sent live
    pub retained: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            retained: true,
            ..Self::new(topic, payload)
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.topic, self.payload)?;
        if self.retained {
            write!(f, " (retained)")?;
        }
        Ok(())
    }
}
