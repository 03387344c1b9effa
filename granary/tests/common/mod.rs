#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use granary::{core::Subscription, Server};
use granary_proto::{
    api::{ConsumerConfig, StreamConfig},
    headers::{HeaderMap, HeaderName, HeaderValue},
    MessageBase, Subject,
};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub(crate) async fn server() -> Server {
    init_tracing();
    Server::builder()
        .node("n1")
        .start()
        .await
        .expect("server starts")
}

pub(crate) fn stream_config(json: &str) -> StreamConfig {
    serde_json::from_str(json).expect("valid stream config")
}

pub(crate) fn consumer_config(json: &str) -> ConsumerConfig {
    serde_json::from_str(json).expect("valid consumer config")
}

pub(crate) fn message(subject: &str, payload: &[u8]) -> MessageBase {
    MessageBase {
        subject: Subject::try_from(subject).expect("valid subject"),
        reply_subject: None,
        headers: HeaderMap::new(),
        payload: Bytes::copy_from_slice(payload),
    }
}

pub(crate) fn message_with_id(subject: &str, payload: &[u8], id: &str) -> MessageBase {
    let mut message = message(subject, payload);
    message.headers.insert(
        HeaderName::MESSAGE_ID,
        HeaderValue::from_dangerous_value(id.to_owned().into()),
    );
    message
}

/// Receive the next data message, skipping control messages
pub(crate) async fn recv_data(subscription: &mut Subscription) -> MessageBase {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("subscription closed");
        if message.headers.get(&HeaderName::STATUS).is_none() {
            return message;
        }
    }
}

/// Acknowledge a delivered message
pub(crate) fn ack(server: &Server, delivered: &MessageBase, payload: &'static [u8]) {
    let reply_subject = delivered
        .reply_subject
        .clone()
        .expect("delivered messages carry an ack subject");
    server.router().publish(MessageBase {
        subject: reply_subject,
        reply_subject: None,
        headers: HeaderMap::new(),
        payload: Bytes::from_static(payload),
    });
}

/// Poll `condition` until it holds or a generous timeout elapses
pub(crate) async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached: {what}");
}
