use granary_proto::headers::HeaderName;

mod common;

use common::{eventually, message, server, stream_config};

#[tokio::test(flavor = "multi_thread")]
async fn mirror_converges_on_origin() {
    let server = server().await;
    server
        .create_stream(stream_config(
            r#"{"name": "ORIGIN", "subjects": ["src.>"], "storage": "memory"}"#,
        ))
        .await
        .unwrap();
    let origin = server.stream(&"ORIGIN".try_into().unwrap()).unwrap();

    for index in 0..10 {
        origin
            .publish(message(
                &format!("src.{index}"),
                format!("payload-{index}").as_bytes(),
            ))
            .await
            .unwrap();
    }

    server
        .create_stream(stream_config(
            r#"{"name": "COPY", "storage": "memory", "mirror": {"name": "ORIGIN"}}"#,
        ))
        .await
        .unwrap();
    let copy = server.stream(&"COPY".try_into().unwrap()).unwrap();

    eventually("mirror catches up with the origin", || async {
        copy.info()
            .await
            .map_or(false, |info| info.state.messages == 10)
    })
    .await;

    // Contents match up to local sequence renaming, and each copied
    // message names its origin
    for sequence in 1..=10 {
        let original = origin.get_message(Some(sequence), None).await.unwrap();
        let copied = copy.get_message(Some(sequence), None).await.unwrap();
        assert_eq!(original.subject, copied.subject);
        assert_eq!(original.payload, copied.payload);

        let source = copied
            .headers
            .get(&HeaderName::STREAM_SOURCE)
            .expect("mirrored messages name their origin");
        assert!(source.as_str().starts_with("ORIGIN "));
    }

    // New publishes keep flowing through
    origin.publish(message("src.more", b"late")).await.unwrap();
    eventually("mirror follows new publishes", || async {
        copy.info()
            .await
            .map_or(false, |info| info.state.messages == 11)
    })
    .await;

    // A mirror refuses direct publishes
    let err = copy.publish(message("src.direct", b"nope")).await.unwrap_err();
    assert_eq!(
        u16::from(granary_proto::error::ErrorCode::MIRROR_WITH_DIRECT_PUBLISH),
        u16::from(err.code)
    );
}
