use granary_proto::{api::PullRequest, Subject};

mod common;

use common::{ack, consumer_config, eventually, message, recv_data, server, stream_config};

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_restore_round_trip_with_consumers() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "SNAP", "subjects": ["snap.>"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"SNAP".try_into().unwrap()).unwrap();

    for index in 0..50 {
        let subject = if index % 2 == 0 { "snap.even" } else { "snap.odd" };
        stream
            .publish(message(subject, format!("payload-{index}").as_bytes()))
            .await
            .unwrap();
    }

    for name in ["alpha", "beta"] {
        stream
            .add_consumer(consumer_config(&format!(
                r#"{{
                    "durable_name": "{name}",
                    "deliver_policy": "all",
                    "ack_policy": "explicit",
                    "ack_wait": 60000000000
                }}"#,
            )))
            .await
            .unwrap();
    }

    // Walk the two consumers to different ack floors
    pull_and_ack(&server, &stream, "alpha", 10, 10).await;
    pull_and_ack(&server, &stream, "beta", 20, 5).await;

    eventually("floors settle", || async {
        let alpha = stream
            .consumer_info("alpha".try_into().unwrap())
            .await
            .unwrap();
        let beta = stream
            .consumer_info("beta".try_into().unwrap())
            .await
            .unwrap();
        alpha.ack_floor.stream_seq == 10 && beta.ack_floor.stream_seq == 5
    })
    .await;

    let before = stream.info().await.unwrap();
    let snapshot = stream.snapshot().await.unwrap();
    assert_eq!(2, snapshot.consumers.len());

    // The stream is gone, then rebuilt from the snapshot bytes
    let encoded = snapshot.encode();
    server
        .delete_stream(&"SNAP".try_into().unwrap())
        .await
        .unwrap();
    assert!(server.stream(&"SNAP".try_into().unwrap()).is_err());

    let snapshot = granary::core::StreamSnapshot::decode(&encoded).unwrap();
    server.create_stream(snapshot.config.clone()).await.unwrap();
    let restored = server.stream(&"SNAP".try_into().unwrap()).unwrap();
    restored.restore(snapshot).await.unwrap();

    let after = restored.info().await.unwrap();
    assert_eq!(before.state.messages, after.state.messages);
    assert_eq!(before.state.first_sequence, after.state.first_sequence);
    assert_eq!(before.state.last_sequence, after.state.last_sequence);
    assert_eq!(before.state.consumer_count, after.state.consumer_count);

    let alpha = restored
        .consumer_info("alpha".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(10, alpha.ack_floor.stream_seq);
    assert_eq!(10, alpha.delivered.stream_seq);

    let beta = restored
        .consumer_info("beta".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(5, beta.ack_floor.stream_seq);

    // Alpha continues exactly where it left off
    let inbox = Subject::from_static("inbox.snap.resume");
    let mut subscription = server.router().subscribe(inbox.clone(), None);
    restored
        .pull_next(
            "alpha".try_into().unwrap(),
            PullRequest {
                batch: 5,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();
    for expected in 11..=15 {
        let delivered = recv_data(&mut subscription).await;
        let reply = granary_proto::AckReply::from_subject(
            delivered.reply_subject.as_ref().unwrap(),
        )
        .unwrap();
        assert_eq!(expected, reply.stream_sequence);
    }
}

async fn pull_and_ack(
    server: &granary::Server,
    stream: &granary::core::StreamHandle,
    consumer: &str,
    batch: u64,
    ack_first: usize,
) {
    let inbox = Subject::try_from(format!("inbox.snap.{consumer}")).unwrap();
    let mut subscription = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            consumer.try_into().unwrap(),
            PullRequest {
                batch,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();

    for index in 0..batch {
        let delivered = recv_data(&mut subscription).await;
        if (index as usize) < ack_first {
            ack(server, &delivered, b"+ACK");
        }
    }
}
