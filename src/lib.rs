//! amqp-channel-layer - named message channels over RabbitMQ.
//!
//! Application processes exchange messages with worker processes by channel
//! name. Channels are capacity-bounded, messages and group memberships expire,
//! groups fan a single send out to every live member, and payloads can be
//! encrypted so the broker never sees plaintext.
//!
//! Two layer implementations share the [`layer::ChannelLayer`] contract:
//! - [`amqp::AmqpChannelLayer`]: every operation goes through the broker.
//! - [`hybrid::HybridChannelLayer`]: only reply channels (and groups) reach the
//!   broker, everything else stays in-process.

pub mod amqp;
pub mod codec;
pub mod config;
pub mod hybrid;
pub mod layer;
pub mod local;
pub mod naming;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
pub mod worker;

pub use amqp::AmqpChannelLayer;
pub use config::LayerConfig;
pub use hybrid::HybridChannelLayer;
pub use layer::{layer_from_config, ChannelLayer, Extension, LayerError, Message, Received, Result};
