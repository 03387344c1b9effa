use granary::Server;
use granary_proto::{api::PullRequest, AckReply, Subject};

mod common;

use common::{ack, consumer_config, eventually, message, recv_data, stream_config};

#[tokio::test(flavor = "multi_thread")]
async fn file_backed_stream_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let server = Server::builder()
            .node("n1")
            .storage_dir(dir.path())
            .start()
            .await
            .unwrap();

        server
            .create_stream(stream_config(
                r#"{"name": "DURABLE", "subjects": ["events.>"], "storage": "file"}"#,
            ))
            .await
            .unwrap();
        let stream = server.stream(&"DURABLE".try_into().unwrap()).unwrap();

        for index in 0..20 {
            stream
                .publish(message(
                    &format!("events.{index}"),
                    format!("payload-{index}").as_bytes(),
                ))
                .await
                .unwrap();
        }

        stream
            .add_consumer(consumer_config(
                r#"{
                    "durable_name": "archiver",
                    "deliver_policy": "all",
                    "ack_policy": "explicit",
                    "ack_wait": 60000000000
                }"#,
            ))
            .await
            .unwrap();

        let inbox = Subject::from_static("inbox.durable.before");
        let mut subscription = server.router().subscribe(inbox.clone(), None);
        stream
            .pull_next(
                "archiver".try_into().unwrap(),
                PullRequest {
                    batch: 5,
                    ..PullRequest::default()
                },
                inbox,
            )
            .await
            .unwrap();
        for _ in 0..5 {
            let delivered = recv_data(&mut subscription).await;
            ack(&server, &delivered, b"+ACK");
        }
        eventually("acks settle before shutdown", || async {
            stream
                .consumer_info("archiver".try_into().unwrap())
                .await
                .map_or(false, |info| info.ack_floor.stream_seq == 5)
        })
        .await;

        server.shutdown().await;
    }

    // A fresh instance over the same directory recovers everything
    let server = Server::builder()
        .node("n1")
        .storage_dir(dir.path())
        .start()
        .await
        .unwrap();

    let stream = server.stream(&"DURABLE".try_into().unwrap()).unwrap();
    let info = stream.info().await.unwrap();
    assert_eq!(20, info.state.messages);
    assert_eq!(1, info.state.first_sequence);
    assert_eq!(20, info.state.last_sequence);
    assert_eq!(b"payload-0".as_slice(), &stream.get_message(Some(1), None).await.unwrap().payload[..]);

    let consumer = stream
        .consumer_info("archiver".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(5, consumer.ack_floor.stream_seq);
    assert_eq!(5, consumer.delivered.stream_seq);

    // The recovered cursor resumes at message 6
    let inbox = Subject::from_static("inbox.durable.after");
    let mut subscription = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            "archiver".try_into().unwrap(),
            PullRequest {
                batch: 3,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();
    for expected in 6..=8 {
        let delivered = recv_data(&mut subscription).await;
        let reply = AckReply::from_subject(delivered.reply_subject.as_ref().unwrap()).unwrap();
        assert_eq!(expected, reply.stream_sequence);
    }

    // Sequences keep increasing after the restart
    let pub_ack = stream.publish(message("events.late", b"after")).await.unwrap();
    assert_eq!(21, pub_ack.sequence);
}
