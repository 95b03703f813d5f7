use crate::envelope::Envelope;
use crate::error::Result;

/// Text encoding of envelopes for transports that leave the process
///
/// Implementations must round-trip every field, `id` and `created_at`
/// included.
pub trait Serializer: Send + Sync {
    fn serialize(&self, envelope: &Envelope) -> Result<String>;

    fn deserialize(&self, raw: &str) -> Result<Envelope>;
}
