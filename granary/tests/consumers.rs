use std::time::Duration;

use granary_proto::{
    api::PullRequest,
    headers::HeaderName,
    AckReply, Subject,
};

mod common;

use common::{ack, consumer_config, eventually, message, recv_data, server, stream_config};

#[tokio::test(flavor = "multi_thread")]
async fn ack_floor_advances_over_gaps() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "FLOOR", "subjects": ["floor"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"FLOOR".try_into().unwrap()).unwrap();

    let mut delivery = server
        .router()
        .subscribe(Subject::from_static("deliver.floor"), None);
    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "tracker",
                "deliver_subject": "deliver.floor",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 60000000000
            }"#,
        ))
        .await
        .unwrap();

    for index in 0..4 {
        stream
            .publish(message("floor", format!("m{index}").as_bytes()))
            .await
            .unwrap();
    }

    let mut deliveries = Vec::new();
    for _ in 0..4 {
        deliveries.push(recv_data(&mut delivery).await);
    }

    // Ack 2 and 3 but not 1: the floor cannot move
    ack(&server, &deliveries[1], b"+ACK");
    ack(&server, &deliveries[2], b"+ACK");

    eventually("acks for 2 and 3 are processed", || async {
        stream
            .consumer_info("tracker".try_into().unwrap())
            .await
            .map_or(false, |info| info.num_ack_pending == 2)
    })
    .await;
    let info = stream
        .consumer_info("tracker".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(0, info.ack_floor.stream_seq);

    // Ack 1: the floor jumps over the already-acked gap
    ack(&server, &deliveries[0], b"+ACK");
    eventually("floor advances to 3", || async {
        stream
            .consumer_info("tracker".try_into().unwrap())
            .await
            .map_or(false, |info| info.ack_floor.stream_seq == 3)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn work_queue_removes_on_ack_only() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{
                "name": "MY_WQ",
                "subjects": ["wq"],
                "storage": "memory",
                "retention": "workqueue"
            }"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"MY_WQ".try_into().unwrap()).unwrap();

    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "worker",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 300000000
            }"#,
        ))
        .await
        .unwrap();

    for index in 0..100 {
        stream
            .publish(message("wq", format!("job-{index}").as_bytes()))
            .await
            .unwrap();
    }

    // First pass: consume everything without acking
    let inbox = Subject::from_static("inbox.wq.first");
    let mut first = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            "worker".try_into().unwrap(),
            PullRequest {
                batch: 100,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();
    for _ in 0..100 {
        let delivered = recv_data(&mut first).await;
        let reply = AckReply::from_subject(delivered.reply_subject.as_ref().unwrap()).unwrap();
        assert_eq!(1, reply.delivery_count);
    }

    // Unacked messages stay in the store
    assert_eq!(100, stream.info().await.unwrap().state.messages);

    // Second pass after the ack wait: everything is a redelivery
    tokio::time::sleep(Duration::from_millis(400)).await;
    let inbox = Subject::from_static("inbox.wq.second");
    let mut second = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            "worker".try_into().unwrap(),
            PullRequest {
                batch: 100,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();
    for _ in 0..100 {
        let delivered = recv_data(&mut second).await;
        let reply = AckReply::from_subject(delivered.reply_subject.as_ref().unwrap()).unwrap();
        assert!(reply.delivery_count >= 2);
        ack(&server, &delivered, b"+ACK");
    }

    // Workqueue retention drops acked messages from the store
    eventually("acked workqueue messages are removed", || async {
        stream
            .info()
            .await
            .map_or(false, |info| info.state.messages == 0)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_subjects_partition_delivery() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "ORDERS", "subjects": ["orders.*.*"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"ORDERS".try_into().unwrap()).unwrap();

    for index in 0..100 {
        stream
            .publish(message(&format!("orders.{index}.NEW"), b"new"))
            .await
            .unwrap();
    }
    for index in 0..25 {
        stream
            .publish(message(&format!("orders.{index}.SHIPPED"), b"shipped"))
            .await
            .unwrap();
    }

    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "shipped",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 60000000000,
                "filter_subject": "orders.*.SHIPPED"
            }"#,
        ))
        .await
        .unwrap();
    let info = stream
        .consumer_info("shipped".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(25, info.num_pending);

    let inbox = Subject::from_static("inbox.shipped");
    let mut shipped = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            "shipped".try_into().unwrap(),
            PullRequest {
                batch: 25,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();
    for _ in 0..25 {
        let delivered = recv_data(&mut shipped).await;
        let subject = delivered.headers.get(&HeaderName::SUBJECT).unwrap();
        assert!(subject.as_str().ends_with(".SHIPPED"));
    }

    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "seven",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 60000000000,
                "filter_subject": "orders.7.*"
            }"#,
        ))
        .await
        .unwrap();
    let info = stream
        .consumer_info("seven".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(2, info.num_pending);

    let inbox = Subject::from_static("inbox.seven");
    let mut seven = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            "seven".try_into().unwrap(),
            PullRequest {
                batch: 2,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();
    let first = recv_data(&mut seven).await;
    let second = recv_data(&mut seven).await;
    assert_eq!(
        "orders.7.NEW",
        first.headers.get(&HeaderName::SUBJECT).unwrap().as_str()
    );
    assert_eq!(
        "orders.7.SHIPPED",
        second.headers.get(&HeaderName::SUBJECT).unwrap().as_str()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn max_deliver_caps_redeliveries() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "REDELIVER", "subjects": ["redeliver"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"REDELIVER".try_into().unwrap()).unwrap();

    let mut delivery = server
        .router()
        .subscribe(Subject::from_static("deliver.redeliver"), None);
    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "capped",
                "deliver_subject": "deliver.redeliver",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 10000000,
                "max_deliver": 5
            }"#,
        ))
        .await
        .unwrap();

    stream.publish(message("redeliver", b"stubborn")).await.unwrap();

    let mut copies = 0;
    for _ in 0..5 {
        let delivered = recv_data(&mut delivery).await;
        let reply = AckReply::from_subject(delivered.reply_subject.as_ref().unwrap()).unwrap();
        copies += 1;
        assert_eq!(copies, reply.delivery_count);
    }

    // Even well past three more ack-waits, no sixth copy shows up
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(delivery.try_recv().is_none());

    let info = stream
        .consumer_info("capped".try_into().unwrap())
        .await
        .unwrap();
    assert_eq!(0, info.num_ack_pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_pulls_get_request_timeout() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "PULLS", "subjects": ["pulls"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"PULLS".try_into().unwrap()).unwrap();

    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "waiter",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 60000000000,
                "max_waiting": 2
            }"#,
        ))
        .await
        .unwrap();

    let mut inboxes = Vec::new();
    for index in 0..3 {
        let inbox = Subject::try_from(format!("inbox.pulls.{index}")).unwrap();
        inboxes.push(server.router().subscribe(inbox.clone(), None));
        stream
            .pull_next(
                "waiter".try_into().unwrap(),
                PullRequest::default(),
                inbox,
            )
            .await
            .unwrap();
    }

    // The third pull evicted the oldest waiter with a 408
    let stale = tokio::time::timeout(Duration::from_secs(5), inboxes[0].recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        "408",
        stale.headers.get(&HeaderName::STATUS).unwrap().as_str()
    );

    // The two younger waiters are still live and get real messages
    stream.publish(message("pulls", b"work")).await.unwrap();
    stream.publish(message("pulls", b"work")).await.unwrap();
    let delivered = recv_data(&mut inboxes[1]).await;
    assert!(delivered.reply_subject.is_some());
    let delivered = recv_data(&mut inboxes[2]).await;
    assert!(delivered.reply_subject.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn no_wait_pull_gets_404_when_empty() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "EMPTY", "subjects": ["empty"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let stream = server.stream(&"EMPTY".try_into().unwrap()).unwrap();

    stream
        .add_consumer(consumer_config(
            r#"{
                "durable_name": "nowait",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 60000000000
            }"#,
        ))
        .await
        .unwrap();

    let inbox = Subject::from_static("inbox.nowait");
    let mut subscription = server.router().subscribe(inbox.clone(), None);
    stream
        .pull_next(
            "nowait".try_into().unwrap(),
            PullRequest {
                no_wait: true,
                ..PullRequest::default()
            },
            inbox,
        )
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        "404",
        reply.headers.get(&HeaderName::STATUS).unwrap().as_str()
    );
}
