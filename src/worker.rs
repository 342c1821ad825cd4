//! Worker readiness hook.
//!
//! A worker declares the queues of the channels it routes before it starts
//! receiving, so messages sent before its first receive are not lost to a
//! missing queue.

use tracing::{debug, info};

use crate::layer::{ChannelLayer, Result};

/// Declare broker topology for every channel a worker routes.
///
/// Returns how many channels were declared. Layers without a broker half do
/// nothing and return 0. Channels the layer serves in process are skipped.
pub fn declare_routes(layer: &dyn ChannelLayer, channels: &[&str]) -> Result<usize> {
    let Some(amqp) = layer.as_amqp() else {
        debug!("Layer is not broker-backed, skipping route declaration");
        return Ok(0);
    };

    let mut declared = 0;
    for channel in channels {
        if layer.serves_locally(channel) {
            debug!(channel = %channel, "Channel is served in process, not declaring");
            continue;
        }
        amqp.declare_channel(channel)?;
        declared += 1;
    }
    info!(channels = declared, "Declared worker routes");
    Ok(declared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryLayer;

    #[test]
    fn test_in_memory_layer_is_skipped() {
        let layer = InMemoryLayer::new();
        assert_eq!(declare_routes(&layer, &["http.request", "websocket.connect"]).unwrap(), 0);
    }

    #[test]
    fn test_no_routes() {
        let layer = InMemoryLayer::new();
        assert_eq!(declare_routes(&layer, &[]).unwrap(), 0);
    }
}
