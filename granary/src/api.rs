use std::time::Duration;

use bytes::Bytes;
use granary_proto::{
    api::{
        ConsumerCreateRequest, MsgDeleteRequest, MsgGetRequest, MsgGetResponse, PeerRemoveRequest,
        PullRequest, PurgeRequest, PurgeResponse, RawStoredMessage, RestoreRequest,
        RestoreResponse, SnapshotRequest, SnapshotResponse, StepdownRequest, StreamConfig,
        StreamListResponse, StreamNamesRequest, StreamNamesResponse, SuccessResponse,
    },
    error::{ApiError, ErrorCode, Response},
    headers::HeaderMap,
    MessageBase, Name, StatusCode, Subject,
};
use futures_util::StreamExt as _;
use rand::Rng as _;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::{server::Server, stream::StreamSnapshot};

/// Page size of the paginated list endpoints
const PAGE_LIMIT: usize = 256;
const DEFAULT_SNAPSHOT_CHUNK: usize = 64 * 1024;
const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn spawn(server: Server) {
    tokio::spawn(run(server));
}

async fn run(server: Server) {
    let mut requests = server
        .router()
        .subscribe(Subject::from_static("$API.>"), None);

    while let Some(message) = requests.next().await {
        let server = server.clone();
        tokio::spawn(async move {
            handle_request(server, message).await;
        });
    }
}

async fn handle_request(server: Server, message: MessageBase) {
    let subject = message.subject.clone();
    let tokens = subject.tokens().collect::<Vec<_>>();

    // `$API.<op...>`, or `$API.<domain>.<op...>` when a domain is set
    let mut op = &tokens[1..];
    if let Some(domain) = server.domain() {
        if op.first() == Some(&domain) {
            op = &op[1..];
        }
    }

    let result = dispatch(&server, op, &message).await;
    let errored = result.is_err();
    server.account().usage().count_api(errored);
    server.advisories().api_audit(&subject, errored);

    let Some(reply_subject) = message.reply_subject else {
        return;
    };
    let payload = match result {
        // Replies handled elsewhere, e.g. pull deliveries
        Ok(None) => return,
        Ok(Some(value)) => serde_json::to_vec(&value).unwrap_or_default(),
        Err(error) => {
            debug!(subject = %subject, error = %error, "api request failed");
            serde_json::to_vec(&Response::<Value>::Error { error }).unwrap_or_default()
        }
    };

    server.router().publish(MessageBase {
        subject: reply_subject,
        reply_subject: None,
        headers: HeaderMap::new(),
        payload: Bytes::from(payload),
    });
}

async fn dispatch(
    server: &Server,
    op: &[&str],
    message: &MessageBase,
) -> Result<Option<Value>, ApiError> {
    match op {
        ["ACCOUNT", "INFO"] => reply(server.account().info()),

        ["STREAM", "CREATE", name] => {
            let config = body::<StreamConfig>(&message.payload)?;
            check_name(name, &config.name)?;
            reply(server.create_stream(config).await?)
        }
        ["STREAM", "UPDATE", name] => {
            let config = body::<StreamConfig>(&message.payload)?;
            check_name(name, &config.name)?;
            reply(server.update_stream(config).await?)
        }
        ["STREAM", "DELETE", name] => {
            server.delete_stream(&parse_name(name)?).await?;
            reply(SuccessResponse { success: true })
        }
        ["STREAM", "PURGE", name] => {
            let request = body_or_default::<PurgeRequest>(&message.payload)?;
            let purged = server.stream(&parse_name(name)?)?.purge(request).await?;
            reply(PurgeResponse {
                success: true,
                purged,
            })
        }
        ["STREAM", "INFO", name] => reply(server.stream(&parse_name(name)?)?.info().await?),
        ["STREAMS"] => {
            let request = body_or_default::<StreamNamesRequest>(&message.payload)?;
            let mut names = server
                .meta()
                .stream_names(crate::server::DEFAULT_ACCOUNT, request.subject)
                .await;
            names.sort();
            let total = names.len();
            let names = names
                .into_iter()
                .skip(request.offset)
                .take(PAGE_LIMIT)
                .collect();
            reply(StreamNamesResponse {
                streams: names,
                total,
                offset: request.offset,
                limit: PAGE_LIMIT,
            })
        }
        ["STREAM", "LIST"] => {
            let request = body_or_default::<StreamNamesRequest>(&message.payload)?;
            let mut names = server
                .meta()
                .stream_names(crate::server::DEFAULT_ACCOUNT, None)
                .await;
            names.sort();
            let total = names.len();

            let mut streams = Vec::new();
            for name in names.into_iter().skip(request.offset).take(PAGE_LIMIT) {
                if let Ok(handle) = server.stream(&name) {
                    if let Ok(info) = handle.info().await {
                        streams.push(info);
                    }
                }
            }
            reply(StreamListResponse {
                streams,
                total,
                offset: request.offset,
                limit: PAGE_LIMIT,
            })
        }
        ["STREAM", "MSG", "GET", name] => {
            let request = body::<MsgGetRequest>(&message.payload)?;
            let stored = server
                .stream(&parse_name(name)?)?
                .get_message(request.sequence, request.last_by_subject)
                .await?;
            reply(MsgGetResponse {
                message: RawStoredMessage::from(stored),
            })
        }
        ["STREAM", "MSG", "DELETE", name] => {
            let request = body::<MsgDeleteRequest>(&message.payload)?;
            let success = server
                .stream(&parse_name(name)?)?
                .delete_message(request.sequence)
                .await?;
            reply(SuccessResponse { success })
        }
        ["STREAM", "SNAPSHOT", name] => {
            let request = body::<SnapshotRequest>(&message.payload)?;
            let snapshot = server.stream(&parse_name(name)?)?.snapshot().await?;
            let response = SnapshotResponse {
                config: snapshot.config.clone(),
                state: snapshot.state.clone(),
            };
            stream_snapshot_chunks(server.clone(), snapshot, request);
            reply(response)
        }
        ["STREAM", "RESTORE", name] => {
            let request = body::<RestoreRequest>(&message.payload)?;
            check_name(name, &request.config.name)?;
            let deliver_subject = start_restore_collector(server.clone(), request);
            reply(RestoreResponse { deliver_subject })
        }
        ["STREAM", "LEADER", "STEPDOWN", name] => {
            let _ = body_or_default::<StepdownRequest>(&message.payload)?;
            let success = server.stream(&parse_name(name)?)?.stepdown().await?;
            reply(SuccessResponse { success })
        }
        ["STREAM", "PEER", "REMOVE", name] => {
            let request = body::<PeerRemoveRequest>(&message.payload)?;
            server
                .meta()
                .remove_peer(
                    crate::server::DEFAULT_ACCOUNT,
                    parse_name(name)?,
                    request.peer,
                )
                .await?;
            reply(SuccessResponse { success: true })
        }

        ["CONSUMER", "CREATE", stream] => {
            create_consumer(server, stream, None, &message.payload).await
        }
        ["CONSUMER", "DURABLE", "CREATE", stream, consumer] => {
            create_consumer(server, stream, Some(*consumer), &message.payload).await
        }
        ["CONSUMER", "DELETE", stream, consumer] => {
            server
                .stream(&parse_name(stream)?)?
                .delete_consumer(parse_name(consumer)?)
                .await?;
            reply(SuccessResponse { success: true })
        }
        ["CONSUMER", "INFO", stream, consumer] => reply(
            server
                .stream(&parse_name(stream)?)?
                .consumer_info(parse_name(consumer)?)
                .await?,
        ),
        ["CONSUMER", "NAMES", stream] => {
            let request = body_or_default::<StreamNamesRequest>(&message.payload)?;
            let mut names = server
                .stream(&parse_name(stream)?)?
                .list_consumers()
                .await?
                .into_iter()
                .map(|info| info.name)
                .collect::<Vec<_>>();
            names.sort();
            let total = names.len();
            let consumers = names
                .into_iter()
                .skip(request.offset)
                .take(PAGE_LIMIT)
                .collect();
            reply(granary_proto::api::ConsumerNamesResponse {
                consumers,
                total,
                offset: request.offset,
                limit: PAGE_LIMIT,
            })
        }
        ["CONSUMER", "LIST", stream] => {
            let request = body_or_default::<StreamNamesRequest>(&message.payload)?;
            let consumers = server
                .stream(&parse_name(stream)?)?
                .list_consumers()
                .await?;
            let total = consumers.len();
            let consumers = consumers
                .into_iter()
                .skip(request.offset)
                .take(PAGE_LIMIT)
                .collect();
            reply(granary_proto::api::ConsumerListResponse {
                consumers,
                total,
                offset: request.offset,
                limit: PAGE_LIMIT,
            })
        }
        ["CONSUMER", "MSG", "NEXT", stream, consumer] => {
            let Some(reply_subject) = message.reply_subject.clone() else {
                return Ok(None);
            };
            let request = parse_pull_request(&message.payload)?;
            server
                .stream(&parse_name(stream)?)?
                .pull_next(parse_name(consumer)?, request, reply_subject)
                .await?;
            Ok(None)
        }

        ["META", "LEADER", "STEPDOWN"] => {
            let _ = body_or_default::<StepdownRequest>(&message.payload)?;
            let success = server.meta().stepdown(None).await?;
            reply(SuccessResponse { success })
        }
        ["SERVER", "REMOVE"] => {
            #[derive(serde::Deserialize)]
            struct ServerRemoveRequest {
                server: String,
            }
            let request = body::<ServerRemoveRequest>(&message.payload)?;
            server.meta().remove_server(request.server).await?;
            reply(SuccessResponse { success: true })
        }

        _ => Err(ApiError::bad_request("unknown api operation")),
    }
}

async fn create_consumer(
    server: &Server,
    stream: &str,
    durable: Option<&str>,
    payload: &Bytes,
) -> Result<Option<Value>, ApiError> {
    let mut raw = if payload.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice::<Value>(payload)
            .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?
    };

    // The body may be the bare config or a create request envelope
    let config_value = raw
        .get_mut("config")
        .map(Value::take)
        .unwrap_or_else(|| raw.clone());
    let mut config_value = match config_value {
        Value::Object(map) => map,
        _ => return Err(ApiError::bad_request("invalid consumer configuration")),
    };

    if let Some(durable) = durable {
        config_value.insert("durable_name".to_owned(), Value::from(durable));
    }
    // Ephemeral consumers without a name get a generated one
    if !config_value.contains_key("name") && !config_value.contains_key("durable_name") {
        let generated: String = {
            let mut rng = rand::thread_rng();
            (0..8)
                .map(|_| {
                    let n = rng.gen_range(0..36);
                    char::from_digit(n, 36).unwrap_or('0')
                })
                .collect()
        };
        config_value.insert("name".to_owned(), Value::from(generated));
    }

    let request = if raw.get("stream_name").is_some() {
        let mut envelope = match raw {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        envelope.insert("config".to_owned(), Value::Object(config_value));
        serde_json::from_value::<ConsumerCreateRequest>(Value::Object(envelope))
            .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?
    } else {
        ConsumerCreateRequest {
            stream_name: parse_name(stream)?,
            config: serde_json::from_value(Value::Object(config_value))
                .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?,
        }
    };

    if request.stream_name.as_str() != stream {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorCode::NAME_MISMATCH,
            "stream name in subject does not match request",
        ));
    }
    if let (Some(durable), config_name) = (durable, &request.config.name) {
        if durable != config_name.as_str() {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                ErrorCode::NAME_MISMATCH,
                "consumer name in subject does not match durable name",
            ));
        }
    }

    let info = server
        .stream(&request.stream_name)?
        .add_consumer(request.config)
        .await?;
    reply(info)
}

/// Stream snapshot chunks to the requested subject, each flow-acked
/// by the receiver, terminated by an empty chunk
fn stream_snapshot_chunks(server: Server, snapshot: StreamSnapshot, request: SnapshotRequest) {
    tokio::spawn(async move {
        let router = server.router().clone();
        let encoded = snapshot.encode();
        let chunk_size = request.chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNK).max(1);

        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(encoded.len());
            let chunk = encoded.slice(offset..end);
            let eof = chunk.is_empty();

            match router
                .request(
                    request.deliver_subject.clone(),
                    HeaderMap::new(),
                    chunk,
                    CHUNK_ACK_TIMEOUT,
                )
                .await
            {
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "snapshot receiver stopped acking");
                    return;
                }
            }
            if eof {
                return;
            }
            offset = end;
        }
    });
}

/// Accept restore chunks on a fresh subject until the empty EOF chunk,
/// then create and fill the stream; the EOF chunk's reply gets the
/// final stream info
fn start_restore_collector(server: Server, request: RestoreRequest) -> Subject {
    let token: String = {
        let mut rng = rand::thread_rng();
        (0..12)
            .map(|_| {
                let n = rng.gen_range(0..36);
                char::from_digit(n, 36).unwrap_or('0').to_ascii_uppercase()
            })
            .collect()
    };
    let deliver_subject = Subject::from_dangerous_value(
        format!("_RESTORE.{}.{token}", request.config.name).into(),
    );
    let mut chunks = server.router().subscribe(deliver_subject.clone(), None);

    tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            let reply_subject = chunk.reply_subject.clone();
            if chunk.payload.is_empty() {
                let result = finish_restore(&server, &request, &collected).await;
                if let Some(reply_subject) = reply_subject {
                    let payload = match result {
                        Ok(info) => serde_json::to_vec(&info).unwrap_or_default(),
                        Err(error) => {
                            serde_json::to_vec(&Response::<Value>::Error { error })
                                .unwrap_or_default()
                        }
                    };
                    server.router().publish(MessageBase {
                        subject: reply_subject,
                        reply_subject: None,
                        headers: HeaderMap::new(),
                        payload: Bytes::from(payload),
                    });
                }
                return;
            }

            collected.extend_from_slice(&chunk.payload);
            if let Some(reply_subject) = reply_subject {
                server.router().publish(MessageBase {
                    subject: reply_subject,
                    reply_subject: None,
                    headers: HeaderMap::new(),
                    payload: Bytes::new(),
                });
            }
        }
    });

    deliver_subject
}

async fn finish_restore(
    server: &Server,
    request: &RestoreRequest,
    collected: &[u8],
) -> Result<granary_proto::api::StreamInfo, ApiError> {
    let snapshot = StreamSnapshot::decode(collected)
        .map_err(|_| ApiError::bad_request("restore data is not a valid snapshot"))?;
    server.create_stream(request.config.clone()).await?;
    server
        .stream(&request.config.name)?
        .restore(snapshot)
        .await
}

fn reply<T: serde::Serialize>(value: T) -> Result<Option<Value>, ApiError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|_| ApiError::bad_request("response serialization failed"))
}

fn parse_name(token: &str) -> Result<Name, ApiError> {
    Name::try_from(token).map_err(|_| {
        ApiError::new(
            StatusCode::CONFLICT,
            ErrorCode::INVALID_NAME,
            "invalid stream or consumer name",
        )
    })
}

fn check_name(token: &str, name: &Name) -> Result<(), ApiError> {
    if token == name.as_str() {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::CONFLICT,
            ErrorCode::NAME_MISMATCH,
            "name in subject does not match request",
        ))
    }
}

fn body<T: DeserializeOwned>(payload: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(payload)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}

fn body_or_default<T: DeserializeOwned + Default>(payload: &Bytes) -> Result<T, ApiError> {
    if payload.is_empty() {
        return Ok(T::default());
    }
    body(payload)
}

/// A pull request body is JSON, a bare integer batch size, or empty
fn parse_pull_request(payload: &Bytes) -> Result<PullRequest, ApiError> {
    let trimmed = payload.as_ref().trim_ascii();
    if trimmed.is_empty() {
        return Ok(PullRequest::default());
    }
    if trimmed.iter().all(u8::is_ascii_digit) {
        let batch = std::str::from_utf8(trimmed)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| ApiError::bad_request("invalid batch size"))?;
        return Ok(PullRequest {
            batch: batch.max(1),
            ..PullRequest::default()
        });
    }
    body(payload)
}
