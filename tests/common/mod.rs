//! Shared utilities for integration tests.
//!
//! Starts RabbitMQ with testcontainers and inspects broker topology through a
//! separate connection.

#![allow(dead_code)]

use std::time::Duration;

use amqp_channel_layer::{LayerConfig, Message};
use lapin::{options::QueueDeclareOptions, types::FieldTable, Connection, ConnectionProperties};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::SyncRunner,
    Container, GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
pub fn start_rabbitmq() -> (Container<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    std::thread::sleep(Duration::from_secs(2));

    let host_port = container
        .get_host_port_ipv4(5672)
        .expect("Failed to get mapped port");
    let host = container.get_host().expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);
    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Layer config with a short blocking-receive timeout.
pub fn test_config(url: &str) -> LayerConfig {
    LayerConfig::new(url).with_receive_timeout(Duration::from_millis(500))
}

pub fn message(value: serde_json::Value) -> Message {
    value.as_object().cloned().expect("message must be a JSON object")
}

/// Whether a queue exists, checked over a separate connection.
pub fn queue_exists(url: &str, queue: &str) -> bool {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    runtime.block_on(async {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .expect("Failed to connect");
        let channel = conn.create_channel().await.expect("Failed to open channel");
        let exists = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .is_ok();
        let _ = conn.close(200, "OK").await;
        exists
    })
}
