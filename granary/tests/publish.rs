use std::time::Duration;

use claims::assert_matches;
use granary_proto::error::ErrorCode;

mod common;

use common::{eventually, message, message_with_id, server, stream_config};

#[tokio::test(flavor = "multi_thread")]
async fn pub_ack_sequencing() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "PUBACK", "subjects": ["foo"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"PUBACK".try_into().unwrap()).unwrap();

    for expected in 1..=1000u64 {
        let ack = stream.publish(message("foo", b"payload")).await.unwrap();
        assert_eq!("PUBACK", ack.stream.as_str());
        assert_eq!(expected, ack.sequence);
        assert!(!ack.duplicate);
    }

    let info = stream.info().await.unwrap();
    assert_eq!(1000, info.state.messages);
    assert_eq!(1, info.state.first_sequence);
    assert_eq!(1000, info.state.last_sequence);
}

#[tokio::test(flavor = "multi_thread")]
async fn deduplication_window() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{
                "name": "DeDupe",
                "subjects": ["dedupe.*"],
                "storage": "memory",
                "duplicate_window": 25000000
            }"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"DeDupe".try_into().unwrap()).unwrap();

    let mut sequences = Vec::new();
    for id in ["AA", "BB", "CC", "ZZ"] {
        let ack = stream
            .publish(message_with_id("dedupe.in", b"data", id))
            .await
            .unwrap();
        assert!(!ack.duplicate);
        sequences.push(ack.sequence);
    }
    assert_eq!(4, stream.info().await.unwrap().state.messages);

    for (id, original) in [("AA", sequences[0]), ("BB", sequences[1]), ("ZZ", sequences[3])] {
        let ack = stream
            .publish(message_with_id("dedupe.in", b"data", id))
            .await
            .unwrap();
        assert!(ack.duplicate);
        assert_eq!(original, ack.sequence);
    }
    assert_eq!(4, stream.info().await.unwrap().state.messages);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let ack = stream
        .publish(message_with_id("dedupe.in", b"data", "AAA"))
        .await
        .unwrap();
    assert!(!ack.duplicate);
    assert_eq!(5, stream.info().await.unwrap().state.messages);

    // The previously expired id is assignable again
    eventually("expired dedup entry accepts a new sequence", || async {
        let ack = stream
            .publish(message_with_id("dedupe.in", b"data", "AA"))
            .await
            .unwrap();
        !ack.duplicate
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn discard_new_rejects_at_message_cap() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{
                "name": "CAPPED",
                "subjects": ["capped"],
                "storage": "memory",
                "max_msgs": 3,
                "discard": "new"
            }"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"CAPPED".try_into().unwrap()).unwrap();

    for _ in 0..3 {
        stream.publish(message("capped", b"data")).await.unwrap();
    }

    let err = stream.publish(message("capped", b"data")).await.unwrap_err();
    assert_matches!(err.code, ErrorCode::MAXIMUM_MESSAGES);
    assert_eq!("maximum messages exceeded", err.description);
    assert_eq!(3, stream.info().await.unwrap().state.messages);
}

#[tokio::test(flavor = "multi_thread")]
async fn message_size_boundary() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{
                "name": "SIZED",
                "subjects": ["sized"],
                "storage": "memory",
                "max_msg_size": 22
            }"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"SIZED".try_into().unwrap()).unwrap();

    let err = stream.publish(message("sized", &[0; 36])).await.unwrap_err();
    assert_eq!("message size exceeds maximum allowed", err.description);

    stream.publish(message("sized", &[0; 22])).await.unwrap();
    assert_eq!(1, stream.info().await.unwrap().state.messages);
}

#[tokio::test(flavor = "multi_thread")]
async fn expected_last_sequence_is_enforced() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "EXPECT", "subjects": ["expect"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"EXPECT".try_into().unwrap()).unwrap();

    stream.publish(message("expect", b"one")).await.unwrap();

    let mut matching = message("expect", b"two");
    matching.headers.insert(
        granary_proto::headers::HeaderName::EXPECTED_LAST_SEQUENCE,
        granary_proto::headers::HeaderValue::from_static("1"),
    );
    stream.publish(matching).await.unwrap();

    let mut stale = message("expect", b"three");
    stale.headers.insert(
        granary_proto::headers::HeaderName::EXPECTED_LAST_SEQUENCE,
        granary_proto::headers::HeaderValue::from_static("1"),
    );
    let err = stream.publish(stale).await.unwrap_err();
    assert_matches!(err.code, ErrorCode::WRONG_LAST_SEQUENCE);
    assert_eq!(2, stream.info().await.unwrap().state.messages);
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_subjects_are_rejected() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "ONE", "subjects": ["orders.>"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();

    let err = server
        .create_stream(stream_config(
            r#"{"name": "TWO", "subjects": ["orders.eu.*"], "storage": "memory"}"#,
        ))
        .await
        .unwrap_err();
    assert_matches!(err.code, ErrorCode::SUBJECTS_OVERLAP);
}
