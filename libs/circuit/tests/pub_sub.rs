mod common;

use std::sync::Arc;
use std::time::Duration;

use circuit::{Circuit, Envelope, Error};
use circuit_fabric::MemoryTransport;
use common::node;
use serde_json::json;
use tokio::sync::mpsc;

async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("channel closed")
}

async fn collect(circuit: &Circuit, channel: &str) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    circuit
        .subscribe(channel, move |msg| {
            let _ = tx.send(msg);
            async {}
        })
        .await
        .unwrap();
    rx
}

#[tokio::test]
async fn transports_the_message() {
    let c = Circuit::builder().id("c1").build();
    c.connect().await.unwrap();

    let mut rx = collect(&c, "test1").await;
    c.publish("test1", "a").await.unwrap();

    let msg = next(&mut rx).await;
    assert_eq!(msg.content, json!("a"));
    assert_eq!(msg.sender, "c1");
    assert_eq!(msg.channel, "test1");
    assert!(msg.recipient.is_none());
    assert!(!msg.is_reply());

    c.disconnect().await.unwrap();
}

#[tokio::test]
async fn fans_out_to_every_holder() {
    let t = Arc::new(MemoryTransport::new());
    let a = node("a", &t).await;
    let b = node("b", &t).await;

    let mut rx_a = collect(&a, "news").await;
    let mut rx_b = collect(&b, "news").await;

    a.publish("news", &json!({"headline": "hi"})).await.unwrap();

    let got_a = next(&mut rx_a).await;
    let got_b = next(&mut rx_b).await;
    assert_eq!(got_a.id, got_b.id);
    assert_eq!(got_b.content["headline"], "hi");
}

#[tokio::test]
async fn publishes_prepared_envelopes() {
    let c = Circuit::builder().id("c1").build();
    c.connect().await.unwrap();
    let mut rx = collect(&c, "raw").await;

    let mut envelope = Envelope::with_content(&7).unwrap();
    envelope.sender = "someone-else".to_string();
    envelope.channel = "elsewhere".to_string();
    envelope.recipient = Some("c9".to_string());
    envelope.reply_for = Some("req-1".to_string());
    let id = envelope.id.clone();

    c.publish_envelope("raw", envelope).await.unwrap();

    let msg = next(&mut rx).await;
    assert_eq!(msg.id, id);
    assert_eq!(msg.sender, "c1");
    assert_eq!(msg.channel, "raw");
    assert_eq!(msg.content_as::<i64>().unwrap(), 7);
    assert_eq!(msg.recipient, None);
    assert_eq!(msg.reply_for, None);
    assert!(!msg.is_reply());
}

#[tokio::test]
async fn operations_require_a_connection() {
    let c = Circuit::builder().build();

    assert!(!c.is_connected());
    assert!(matches!(c.publish("a", &1).await, Err(Error::NotConnected)));
    assert!(matches!(
        c.subscribe("a", |_| async {}).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(c.directory(), Err(Error::NotConnected)));
    assert!(matches!(c.disconnect().await, Err(Error::NotConnected)));

    c.connect().await.unwrap();
    assert!(c.is_connected());
    assert!(matches!(c.connect().await, Err(Error::AlreadyConnected)));

    c.disconnect().await.unwrap();
    assert!(!c.is_connected());
    assert!(matches!(c.publish("a", &1).await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn reconnects_with_fresh_state() {
    let c = Circuit::builder().id("c1").build();
    c.connect().await.unwrap();
    c.subscribe("a", |_| async {}).await.unwrap();
    c.disconnect().await.unwrap();

    c.connect().await.unwrap();
    let d = c.directory().unwrap();
    assert!(d.local_channels().is_empty());
    assert!(c.subscribed_channels().is_empty());
}
