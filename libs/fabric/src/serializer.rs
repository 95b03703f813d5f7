use circuit_core::{Envelope, Result, Serializer};

/// JSON envelope serializer, the default for networked transports
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    fn deserialize(&self, raw: &str) -> Result<Envelope> {
        Ok(serde_json::from_str(raw)?)
    }
}
