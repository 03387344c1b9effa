use std::time::Duration;

use bytes::Bytes;
use claims::assert_matches;
use granary::Server;
use granary_proto::{
    api::{
        AccountInfo, MsgGetResponse, PubAck, PurgeResponse, StreamInfo, StreamNamesResponse,
        SuccessResponse,
    },
    error::{ApiError, Response},
    headers::HeaderMap,
    MessageBase, Subject,
};
use serde::de::DeserializeOwned;

mod common;

use common::{recv_data, server, stream_config};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn request<T: DeserializeOwned>(
    server: &Server,
    subject: &str,
    body: Vec<u8>,
) -> Result<T, ApiError> {
    let reply = server
        .router()
        .request(
            Subject::try_from(subject).unwrap(),
            HeaderMap::new(),
            Bytes::from(body),
            TIMEOUT,
        )
        .await
        .expect("api reply");
    serde_json::from_slice::<Response<T>>(&reply.payload)
        .expect("decodable api reply")
        .into()
}

#[tokio::test(flavor = "multi_thread")]
async fn control_api_round_trip() {
    let server = server().await;

    // Create
    let config = stream_config(
        r#"{"name": "API_TEST", "subjects": ["api.>"], "storage": "memory"}"#,
    );
    let info: StreamInfo = request(
        &server,
        "$API.STREAM.CREATE.API_TEST",
        serde_json::to_vec(&config).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!("API_TEST", info.config.name.as_str());

    // Mismatched subject token is rejected
    let err = request::<StreamInfo>(
        &server,
        "$API.STREAM.CREATE.OTHER",
        serde_json::to_vec(&config).unwrap(),
    )
    .await
    .unwrap_err();
    assert_matches!(
        err.code,
        granary_proto::error::ErrorCode::NAME_MISMATCH
    );

    // Publishing through the router yields a pub-ack on the reply
    let reply = server
        .router()
        .request(
            Subject::from_static("api.orders"),
            HeaderMap::new(),
            Bytes::from_static(b"first"),
            TIMEOUT,
        )
        .await
        .expect("pub ack");
    let ack = serde_json::from_slice::<PubAck>(&reply.payload).unwrap();
    assert_eq!(1, ack.sequence);
    assert_eq!("API_TEST", ack.stream.as_str());

    // Info and listing
    let info: StreamInfo = request(&server, "$API.STREAM.INFO.API_TEST", Vec::new())
        .await
        .unwrap();
    assert_eq!(1, info.state.messages);

    let names: StreamNamesResponse = request(&server, "$API.STREAMS", Vec::new())
        .await
        .unwrap();
    assert_eq!(1, names.total);
    assert_eq!("API_TEST", names.streams[0].as_str());

    // Direct message get
    let got: MsgGetResponse = request(
        &server,
        "$API.STREAM.MSG.GET.API_TEST",
        b"{\"seq\": 1}".to_vec(),
    )
    .await
    .unwrap();
    assert_eq!(1, got.message.sequence);
    assert_eq!("api.orders", got.message.subject.as_str());

    // Pull consumer over the api
    request::<granary_proto::api::ConsumerInfo>(
        &server,
        "$API.CONSUMER.DURABLE.CREATE.API_TEST.puller",
        br#"{
            "stream_name": "API_TEST",
            "config": {
                "durable_name": "puller",
                "deliver_policy": "all",
                "ack_policy": "explicit",
                "ack_wait": 60000000000
            }
        }"#
        .to_vec(),
    )
    .await
    .unwrap();

    let inbox = Subject::from_static("inbox.api.pull");
    let mut subscription = server.router().subscribe(inbox.clone(), None);
    server.router().publish(MessageBase {
        subject: Subject::from_static("$API.CONSUMER.MSG.NEXT.API_TEST.puller"),
        reply_subject: Some(inbox),
        headers: HeaderMap::new(),
        payload: Bytes::from_static(b"1"),
    });
    let delivered = recv_data(&mut subscription).await;
    assert_eq!(b"first".as_slice(), &delivered.payload[..]);

    // Purge and delete
    let purged: PurgeResponse = request(&server, "$API.STREAM.PURGE.API_TEST", Vec::new())
        .await
        .unwrap();
    assert_eq!(1, purged.purged);

    let deleted: SuccessResponse = request(&server, "$API.STREAM.DELETE.API_TEST", Vec::new())
        .await
        .unwrap();
    assert!(deleted.success);

    let err = request::<StreamInfo>(&server, "$API.STREAM.INFO.API_TEST", Vec::new())
        .await
        .unwrap_err();
    assert_matches!(err.code, granary_proto::error::ErrorCode::STREAM_NOT_FOUND);

    // The account counters saw the traffic
    let account: AccountInfo = request(&server, "$API.ACCOUNT.INFO", Vec::new())
        .await
        .unwrap();
    assert!(account.api.total > 0);
    assert!(account.api.errors > 0);
    assert_eq!(0, account.streams);
}

#[tokio::test(flavor = "multi_thread")]
async fn domain_qualified_subjects() {
    let server = Server::builder()
        .node("hub-1")
        .domain("HUB")
        .start()
        .await
        .unwrap();

    let config = stream_config(
        r#"{"name": "DOMAINED", "subjects": ["dom.>"], "storage": "memory"}"#,
    );
    let info: StreamInfo = request(
        &server,
        "$API.HUB.STREAM.CREATE.DOMAINED",
        serde_json::to_vec(&config).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!("DOMAINED", info.config.name.as_str());

    // The undomained form keeps working for local clients
    let info: StreamInfo = request(&server, "$API.STREAM.INFO.DOMAINED", Vec::new())
        .await
        .unwrap();
    assert_eq!(0, info.state.messages);
}
