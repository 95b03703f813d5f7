//! Reserved channel names shared by the control plane and the router

/// Broadcast control channel, and the prefix of every control channel
pub const NETWORK_CHANNEL: &str = "$network";

/// Prefix of each circuit's private reply channel
pub const ROUTER_PREFIX: &str = "$router";

/// Directed control channel of a single circuit
pub fn network_channel_for(circuit_id: &str) -> String {
    format!("{NETWORK_CHANNEL}.{circuit_id}")
}

/// Whether `channel` belongs to the directory control plane
pub fn is_control_channel(channel: &str) -> bool {
    channel.starts_with(NETWORK_CHANNEL)
}

/// Private reply channel of `circuit_id`
pub fn reply_channel_for(circuit_id: &str) -> String {
    format!("{ROUTER_PREFIX}.{circuit_id}")
}

/// Delivery address of a responder owned by `circuit_id`
pub fn direct_channel(circuit_id: &str, channel: &str) -> String {
    format!("{circuit_id}.{channel}")
}
