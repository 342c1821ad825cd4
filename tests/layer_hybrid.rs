//! Hybrid channel layer integration tests using testcontainers.
//!
//! Run with: cargo test --test layer_hybrid --features docker-tests -- --nocapture
//!
//! Plain channels must never reach the broker; reply channels and groups must.

mod common;

use std::time::Duration;

use amqp_channel_layer::test_utils::{HarnessKind, HarnessSet};
use amqp_channel_layer::worker::declare_routes;
use amqp_channel_layer::{AmqpChannelLayer, ChannelLayer, HybridChannelLayer, LayerError};
use common::{message, queue_exists, start_rabbitmq, test_config};
use serde_json::json;

#[test]
fn test_plain_channels_stay_local() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true)).unwrap();
    let msg = message(json!({"local": true}));

    layer.send("http.request", &msg).unwrap();
    assert!(!queue_exists(&url, "http.request"));
    assert_eq!(layer.local().depth("http.request"), 1);

    assert_eq!(
        layer.receive(&["http.request"], false).unwrap(),
        (Some("http.request".to_string()), Some(msg))
    );
}

#[test]
fn test_reply_channels_reach_broker() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true)).unwrap();
    let remote = AmqpChannelLayer::new(test_config(&url)).unwrap();

    let reply = layer.new_channel("http.response!").unwrap();
    assert!(queue_exists(&url, &reply.replace("http.response!", "amq.gen-")));

    // A worker in another process answers on the reply channel.
    remote.send(&reply, &message(json!({"status": 200}))).unwrap();
    let (channel, msg) = layer.receive(&[reply.as_str()], true).unwrap();
    assert_eq!(channel.as_deref(), Some(reply.as_str()));
    assert_eq!(msg.unwrap().get("status"), Some(&json!(200)));
}

#[test]
fn test_local_capacity_matches_broker_semantics() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true).with_capacity(5)).unwrap();
    let msg = message(json!({"type": "test"}));

    for _ in 0..5 {
        layer.send("x", &msg).unwrap();
    }
    assert_eq!(
        layer.send("x", &msg).unwrap_err(),
        LayerError::ChannelFull {
            channel: "x".to_string()
        }
    );
    layer.receive(&["x"], false).unwrap();
    layer.send("x", &msg).unwrap();
}

#[test]
fn test_local_message_expiry() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true).with_expiry(1)).unwrap();

    layer.send("short", &message(json!({}))).unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(layer.receive(&["short"], false).unwrap(), (None, None));
}

#[test]
fn test_groups_reach_local_members() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true)).unwrap();
    let msg = message(json!({"value": "orange"}));

    layer.send_group("g1", &msg).unwrap();
    assert_eq!(layer.receive(&["c1"], false).unwrap(), (None, None));

    layer.group_add("g1", "c1").unwrap();
    layer.send_group("g1", &msg).unwrap();
    assert_eq!(
        layer.receive(&["c1"], true).unwrap(),
        (Some("c1".to_string()), Some(msg.clone()))
    );

    layer.group_discard("g1", "c1").unwrap();
    layer.send_group("g1", &msg).unwrap();
    assert_eq!(layer.receive(&["c1"], false).unwrap(), (None, None));
}

#[test]
fn test_process_local_generated_channel() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true)).unwrap();
    let msg = message(json!({"ws": "frame"}));

    let channel = layer.new_channel("daphne.response?").unwrap();
    assert!(channel.starts_with("daphne.response?"));

    layer.send(&channel, &msg).unwrap();
    assert_eq!(layer.local().depth(&channel), 1);
    assert_eq!(
        layer.receive(&[channel.as_str()], false).unwrap(),
        (Some(channel.clone()), Some(msg))
    );

    // The broker-named queue lets it join groups.
    layer.group_add("sockets", &channel).unwrap();
    layer.send_group("sockets", &message(json!({"broadcast": 1}))).unwrap();
    let (received_on, _) = layer.receive(&[channel.as_str()], true).unwrap();
    assert_eq!(received_on, Some(channel));
}

#[test]
fn test_worker_hook_and_factory() {
    let (_container, url) = start_rabbitmq();
    let layer = HarnessSet::new()
        .with(HarnessKind::Broker)
        .build(test_config(&url).hybrid(true))
        .unwrap();

    assert!(layer.is_broker_backed());
    let reply = layer.new_channel("http.response!").unwrap();

    // Plain channels are served in process; only the reply channel counts.
    assert_eq!(
        declare_routes(layer.as_ref(), &["http.request", reply.as_str()]).unwrap(),
        1
    );
    assert!(!queue_exists(&url, "http.request"));
}

#[test]
fn test_group_discard_ends_bridge() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true)).unwrap();
    let channel = layer.new_channel("daphne.response?").unwrap();

    layer.group_add("lobby", &channel).unwrap();
    layer.group_add("chat", &channel).unwrap();
    assert!(layer.local().is_bridged(&channel));

    layer.group_discard("lobby", &channel).unwrap();
    assert!(layer.local().is_bridged(&channel));

    layer.group_discard("chat", &channel).unwrap();
    assert!(!layer.local().is_bridged(&channel));
}

#[test]
fn test_flush_clears_both_halves() {
    let (_container, url) = start_rabbitmq();
    let layer = HybridChannelLayer::new(test_config(&url).hybrid(true)).unwrap();

    layer.send("local", &message(json!({}))).unwrap();
    let reply = layer.new_channel("reply!").unwrap();
    layer.send(&reply, &message(json!({}))).unwrap();

    layer.flush().unwrap();
    assert_eq!(layer.local().depth("local"), 0);
    assert_eq!(
        layer.receive(&["local", reply.as_str()], false).unwrap(),
        (None, None)
    );
}
