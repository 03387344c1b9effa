use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use granary_proto::{headers::HeaderMap, MessageBase, Name, Subject, SubjectTree};
use rand::Rng as _;
use tokio::{
    sync::mpsc,
    time::{self, error::Elapsed},
};

/// How many undelivered messages a subscription buffers before the
/// router starts dropping
const SUBSCRIPTION_BUFFER: usize = 512;

/// The in-process subject router
///
/// The streaming core treats message delivery as an external
/// collaborator; `Router` is the in-process stand-in. It dispatches
/// published messages to every subscription whose pattern matches,
/// picking a single subscriber per queue group. Delivery is at most
/// once: a subscription that stops draining its buffer loses messages
/// rather than blocking the publisher.
#[derive(Debug, Clone, Default)]
pub struct Router {
    inner: Arc<Mutex<RouterInner>>,
}

#[derive(Debug, Default)]
struct RouterInner {
    subscriptions: SubjectTree<SubscriptionEntry>,
    next_id: u64,
}

#[derive(Debug)]
struct SubscriptionEntry {
    id: u64,
    queue_group: Option<Name>,
    sender: mpsc::Sender<MessageBase>,
}

/// A subscription obtained from [`Router::subscribe`]
///
/// Messages are received from the embedded channel. Dropping the
/// subscription removes it from the router.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    pattern: Subject,
    router: Router,
    receiver: mpsc::Receiver<MessageBase>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every message matching `pattern`
    ///
    /// Subscriptions sharing a queue group receive each message on
    /// exactly one member.
    #[must_use]
    pub fn subscribe(&self, pattern: Subject, queue_group: Option<Name>) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let mut inner = self.inner.lock().expect("router lock");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscriptions.insert(
            &pattern,
            SubscriptionEntry {
                id,
                queue_group,
                sender,
            },
        );

        Subscription {
            id,
            pattern,
            router: self.clone(),
            receiver,
        }
    }

    /// Deliver `message` to every matching subscription
    ///
    /// Returns the number of subscriptions the message was handed to.
    pub fn publish(&self, message: MessageBase) -> usize {
        let inner = self.inner.lock().expect("router lock");

        let mut plain = Vec::new();
        let mut queued: Vec<(&Name, Vec<&SubscriptionEntry>)> = Vec::new();
        inner.subscriptions.visit_matches(&message.subject, |entry| {
            if entry.sender.is_closed() {
                return;
            }
            match &entry.queue_group {
                None => plain.push(entry),
                Some(group) => {
                    if let Some((_, members)) =
                        queued.iter_mut().find(|(name, _)| *name == group)
                    {
                        members.push(entry);
                    } else {
                        queued.push((group, vec![entry]));
                    }
                }
            }
        });

        let mut delivered = 0;
        for entry in &plain {
            if entry.sender.try_send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        for (_, members) in &queued {
            let pick = rand::thread_rng().gen_range(0..members.len());
            if members[pick].sender.try_send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns `true` if at least one open subscription matches `subject`
    #[must_use]
    pub fn has_interest(&self, subject: &Subject) -> bool {
        let inner = self.inner.lock().expect("router lock");
        let mut interested = false;
        inner.subscriptions.visit_matches(subject, |entry| {
            interested |= !entry.sender.is_closed();
        });
        interested
    }

    /// Publish `payload` to `subject` and await a single reply
    ///
    /// # Errors
    ///
    /// Returns an error if no reply arrives within `timeout`.
    pub async fn request(
        &self,
        subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<MessageBase, RequestError> {
        let reply_subject = self.new_inbox();
        let mut reply = self.subscribe(reply_subject.clone(), None);

        self.publish(MessageBase {
            subject,
            reply_subject: Some(reply_subject),
            headers,
            payload,
        });

        let message = time::timeout(timeout, reply.recv())
            .await?
            .ok_or(RequestError::Closed)?;
        Ok(message)
    }

    /// A fresh randomized inbox subject for request/reply
    #[must_use]
    pub fn new_inbox(&self) -> Subject {
        let mut rng = rand::thread_rng();
        let token: String = (0..12)
            .map(|_| {
                let n = rng.gen_range(0..36);
                char::from_digit(n, 36).unwrap_or('0').to_ascii_uppercase()
            })
            .collect();
        Subject::from_dangerous_value(format!("_INBOX.{token}").into())
    }

    fn unsubscribe(&self, pattern: &Subject, id: u64) {
        let mut inner = self.inner.lock().expect("router lock");
        inner.subscriptions.remove(pattern, |entry| entry.id == id);
    }
}

/// An error encountered while awaiting a reply to a request
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("no reply within the timeout")]
    Timeout(#[from] Elapsed),
    #[error("reply subscription closed")]
    Closed,
}

impl Subscription {
    /// Receive the next matching message
    pub async fn recv(&mut self) -> Option<MessageBase> {
        self.receiver.recv().await
    }

    /// Receive the next matching message without waiting
    #[must_use]
    pub fn try_recv(&mut self) -> Option<MessageBase> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub fn pattern(&self) -> &Subject {
        &self.pattern
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.unsubscribe(&self.pattern, self.id);
    }
}

impl futures_core::Stream for Subscription {
    type Item = MessageBase;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.receiver.len(), None)
    }
}

impl futures_core::FusedStream for Subscription {
    fn is_terminated(&self) -> bool {
        self.receiver.is_closed() && self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use granary_proto::{headers::HeaderMap, MessageBase, Name, Subject};

    use super::Router;

    fn message(subject: &'static str) -> MessageBase {
        MessageBase {
            subject: Subject::from_static(subject),
            reply_subject: None,
            headers: HeaderMap::new(),
            payload: Bytes::from_static(b"data"),
        }
    }

    #[tokio::test]
    async fn wildcard_dispatch() {
        let router = Router::new();
        let mut all = router.subscribe(Subject::from_static("orders.>"), None);
        let mut eu = router.subscribe(Subject::from_static("orders.eu.*"), None);

        assert_eq!(2, router.publish(message("orders.eu.new")));
        assert_eq!(1, router.publish(message("orders.us.new")));

        assert_eq!("orders.eu.new", all.recv().await.unwrap().subject.as_str());
        assert_eq!("orders.us.new", all.recv().await.unwrap().subject.as_str());
        assert_eq!("orders.eu.new", eu.recv().await.unwrap().subject.as_str());
        assert!(eu.try_recv().is_none());
    }

    #[tokio::test]
    async fn queue_groups_deliver_once() {
        let router = Router::new();
        let group = Name::from_static("workers");
        let mut first =
            router.subscribe(Subject::from_static("jobs.*"), Some(group.clone()));
        let mut second = router.subscribe(Subject::from_static("jobs.*"), Some(group));

        for _ in 0..32 {
            assert_eq!(1, router.publish(message("jobs.build")));
        }

        let mut received = 0;
        while first.try_recv().is_some() {
            received += 1;
        }
        while second.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(32, received);
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let router = Router::new();
        let sub = router.subscribe(Subject::from_static("orders.>"), None);
        assert!(router.has_interest(&Subject::from_static("orders.eu")));

        drop(sub);
        assert!(!router.has_interest(&Subject::from_static("orders.eu")));
        assert_eq!(0, router.publish(message("orders.eu")));
    }

    #[tokio::test]
    async fn request_reply() {
        let router = Router::new();
        let mut responder = router.subscribe(Subject::from_static("greeter"), None);

        let serve = {
            let router = router.clone();
            tokio::spawn(async move {
                let request = responder.recv().await.unwrap();
                router.publish(MessageBase {
                    subject: request.reply_subject.unwrap(),
                    reply_subject: None,
                    headers: HeaderMap::new(),
                    payload: Bytes::from_static(b"hello"),
                });
            })
        };

        let reply = router
            .request(
                Subject::from_static("greeter"),
                HeaderMap::new(),
                Bytes::new(),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(b"hello".as_slice(), &reply.payload[..]);
        serve.await.unwrap();
    }
}
