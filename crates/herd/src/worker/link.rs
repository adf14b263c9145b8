//! Worker side of the primary channel.
//!
//! The channel carries no correlation ids, so at most one intent may be in
//! flight: the next intent is written only after the previous reply arrived.
//! A single link task owns both pipe ends and runs round trips one at a time.
//! Callers wait on a oneshot, so a cancelled HTTP request only drops its
//! receiver; the task still consumes that reply before the next intent.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Intent, Reply, WorkerMessage};

const LINK_LOST: &str = "Worker lost its connection to the primary";

type ReplyReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, JsonCodec<Reply>>;
type MessageWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<WorkerMessage>>;

enum Command {
    Ready {
        port: u16,
        done: oneshot::Sender<io::Result<()>>,
    },
    Dispatch {
        intent: Intent,
        reply: oneshot::Sender<Reply>,
    },
}

#[derive(Debug, thiserror::Error)]
enum LinkError {
    #[error("failed to write to primary: {0}")]
    Write(#[from] io::Error),
    #[error("primary channel error: {0}")]
    Read(io::Error),
    #[error("primary did not reply within {0:?}")]
    Timeout(Duration),
    #[error("primary channel closed")]
    Closed,
}

/// Forwards intents to the primary and waits for the matching reply.
pub struct PrimaryLink {
    commands: mpsc::Sender<Command>,
    broken: Arc<AtomicBool>,
}

impl PrimaryLink {
    /// Wire a link over `reader` (replies) and `writer` (worker messages).
    ///
    /// `shutdown` is cancelled when the primary goes away or the link breaks.
    pub fn connect<R, W>(
        reader: R,
        writer: W,
        reply_timeout: Option<Duration>,
        shutdown: CancellationToken,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (commands, queue) = mpsc::channel(64);
        let broken = Arc::new(AtomicBool::new(false));

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let task = LinkTask {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
            reply_timeout,
            broken: Arc::clone(&broken),
            shutdown,
        };
        tokio::spawn(task.run(queue));

        Self { commands, broken }
    }

    /// Tell the primary this worker's listener is bound.
    pub async fn announce_ready(&self, port: u16) -> io::Result<()> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(Command::Ready { port, done })
            .await
            .map_err(|_| link_closed())?;
        outcome.await.map_err(|_| link_closed())?
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Backend for PrimaryLink {
    async fn dispatch(&self, intent: Intent) -> Reply {
        if self.is_broken() {
            return Reply::failure(500, LINK_LOST);
        }
        let (reply, answer) = oneshot::channel();
        if self
            .commands
            .send(Command::Dispatch { intent, reply })
            .await
            .is_err()
        {
            return Reply::failure(500, LINK_LOST);
        }
        answer
            .await
            .unwrap_or_else(|_| Reply::failure(500, LINK_LOST))
    }
}

fn link_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "primary link closed")
}

/// Owner of both pipe ends.
struct LinkTask {
    reader: ReplyReader,
    writer: MessageWriter,
    reply_timeout: Option<Duration>,
    broken: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl LinkTask {
    async fn run(mut self, mut queue: mpsc::Receiver<Command>) {
        let outcome = loop {
            tokio::select! {
                command = queue.recv() => {
                    let Some(command) = command else {
                        break Ok(());
                    };
                    if let Err(e) = self.execute(command).await {
                        break Err(e);
                    }
                }
                frame = self.reader.next() => match frame {
                    Some(Ok(stray)) => tracing::warn!(?stray, "Discarding unsolicited reply"),
                    Some(Err(e)) => break Err(LinkError::Read(e)),
                    None => break Err(LinkError::Closed),
                },
            }
        };

        match outcome {
            Ok(()) => tracing::debug!("Primary link dropped"),
            Err(LinkError::Closed) => tracing::info!("Primary channel closed, shutting down"),
            Err(e) => tracing::error!(error = %e, "Primary link broken, shutting down"),
        }
        self.mark_broken();
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
        self.shutdown.cancel();
    }

    /// Break the link first, so the caller never observes a usable link
    /// after its request failed.
    fn abandon(
        &self,
        reply: oneshot::Sender<Reply>,
        message: &str,
        error: LinkError,
    ) -> LinkError {
        self.mark_broken();
        let _ = reply.send(Reply::failure(500, message));
        error
    }

    async fn execute(&mut self, command: Command) -> Result<(), LinkError> {
        match command {
            Command::Ready { port, done } => {
                match self.writer.send(WorkerMessage::Ready { port }).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = done.send(Err(io::Error::new(e.kind(), e.to_string())));
                        Err(LinkError::Write(e))
                    }
                }
            }
            Command::Dispatch { intent, reply } => self.round_trip(intent, reply).await,
        }
    }

    async fn round_trip(
        &mut self,
        intent: Intent,
        reply: oneshot::Sender<Reply>,
    ) -> Result<(), LinkError> {
        let op = intent.op;
        if reply.is_closed() {
            tracing::debug!(%op, "Request cancelled before its intent was sent");
            return Ok(());
        }

        if let Err(e) = self.writer.send(WorkerMessage::Intent(intent)).await {
            return Err(self.abandon(reply, LINK_LOST, e.into()));
        }

        let received = match self.reply_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.reader.next()).await {
                Ok(received) => received,
                // A late reply would be matched to the wrong request.
                Err(_) => {
                    return Err(self.abandon(
                        reply,
                        "Primary did not reply in time",
                        LinkError::Timeout(limit),
                    ));
                }
            },
            None => self.reader.next().await,
        };

        let answer = match received {
            Some(Ok(Ok(answer))) => answer,
            Some(Ok(Err(e))) => {
                tracing::error!(%op, error = %e, "Malformed reply from primary");
                Reply::failure(500, "Primary reply has invalid format")
            }
            Some(Err(e)) => return Err(self.abandon(reply, LINK_LOST, LinkError::Read(e))),
            None => return Err(self.abandon(reply, LINK_LOST, LinkError::Closed)),
        };

        if reply.send(answer).is_err() {
            tracing::debug!(%op, "Request went away, reply discarded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::RawFrameCodec;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::bytes::Bytes;

    /// Primary end of a link under test.
    struct FakePrimary {
        messages: FramedRead<ReadHalf<DuplexStream>, JsonCodec<WorkerMessage>>,
        replies: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Reply>>,
    }

    impl FakePrimary {
        async fn next_message(&mut self) -> WorkerMessage {
            tokio::time::timeout(Duration::from_secs(5), self.messages.next())
                .await
                .expect("message timed out")
                .unwrap()
                .unwrap()
                .unwrap()
        }

        async fn next_intent(&mut self) -> Intent {
            match self.next_message().await {
                WorkerMessage::Intent(intent) => intent,
                other => panic!("expected intent, got {other:?}"),
            }
        }

        async fn reply(&mut self, reply: Reply) {
            self.replies.send(reply).await.unwrap();
        }
    }

    fn linked(reply_timeout: Option<Duration>) -> (Arc<PrimaryLink>, FakePrimary, CancellationToken) {
        let (worker_end, primary_end) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let shutdown = CancellationToken::new();
        let link = PrimaryLink::connect(worker_read, worker_write, reply_timeout, shutdown.clone());

        let (primary_read, primary_write) = tokio::io::split(primary_end);
        let primary = FakePrimary {
            messages: FramedRead::new(primary_read, JsonCodec::new()),
            replies: FramedWrite::new(primary_write, JsonCodec::new()),
        };
        (Arc::new(link), primary, shutdown)
    }

    #[tokio::test]
    async fn announces_ready() {
        let (link, mut primary, _) = linked(None);
        link.announce_ready(4001).await.unwrap();
        assert_eq!(
            primary.next_message().await,
            WorkerMessage::Ready { port: 4001 }
        );
    }

    #[tokio::test]
    async fn dispatch_round_trip() {
        let (link, mut primary, _) = linked(None);

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_one("abc")).await }
        });

        assert_eq!(primary.next_intent().await, Intent::read_one("abc"));
        primary.reply(Reply::failure(400, "Invalid UUID format")).await;

        assert_eq!(
            pending.await.unwrap(),
            Reply::failure(400, "Invalid UUID format")
        );
    }

    #[tokio::test]
    async fn one_intent_in_flight() {
        let (link, mut primary, _) = linked(None);

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::create(r#"{"n":1}"#)).await }
        });
        let first_intent = primary.next_intent().await;

        let second = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::create(r#"{"n":2}"#)).await }
        });

        // The second intent must wait for the first reply.
        let early = tokio::time::timeout(Duration::from_millis(200), primary.messages.next()).await;
        assert!(early.is_err(), "second intent sent before first reply");

        primary.reply(Reply::success(201, json!({"n": 1}))).await;
        let second_intent = primary.next_intent().await;
        primary.reply(Reply::success(201, json!({"n": 2}))).await;

        assert_eq!(first_intent, Intent::create(r#"{"n":1}"#));
        assert_eq!(second_intent, Intent::create(r#"{"n":2}"#));
        assert_eq!(first.await.unwrap(), Reply::success(201, json!({"n": 1})));
        assert_eq!(second.await.unwrap(), Reply::success(201, json!({"n": 2})));
    }

    #[tokio::test]
    async fn cancelled_request_does_not_receive_next_reply() {
        let (link, mut primary, _) = linked(None);

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_one("a")).await }
        });
        assert_eq!(primary.next_intent().await, Intent::read_one("a"));
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let second = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_one("b")).await }
        });

        // The first round trip is still open, so "b" must not be written yet.
        let early = tokio::time::timeout(Duration::from_millis(200), primary.messages.next()).await;
        assert!(early.is_err(), "second intent sent before first reply");

        primary.reply(Reply::success(200, json!("answer-for-a"))).await;
        assert_eq!(primary.next_intent().await, Intent::read_one("b"));
        primary.reply(Reply::success(200, json!("answer-for-b"))).await;

        assert_eq!(
            second.await.unwrap(),
            Reply::success(200, json!("answer-for-b"))
        );
        assert!(!link.is_broken());
    }

    #[tokio::test]
    async fn client_timeout_does_not_misroute_replies() {
        use crate::transport::http::{ServerConfig, bind, routes, serve_listener};

        let (link, mut primary, shutdown) = linked(None);
        let listener = bind(&ServerConfig::new("127.0.0.1", 0)).await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_listener(listener, routes(link), shutdown.clone()));
        let client = reqwest::Client::builder().no_proxy().build().unwrap();

        let impatient = client
            .get(format!("{base}/api/users/first"))
            .timeout(Duration::from_millis(200))
            .send()
            .await;
        assert!(impatient.unwrap_err().is_timeout());
        assert_eq!(primary.next_intent().await, Intent::read_one("first"));

        let patient = tokio::spawn({
            let client = client.clone();
            let url = format!("{base}/api/users/second");
            async move { client.get(url).send().await.unwrap() }
        });
        primary.reply(Reply::failure(404, "first")).await;
        assert_eq!(primary.next_intent().await, Intent::read_one("second"));
        primary.reply(Reply::failure(404, "second")).await;

        let response = patient.await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.text().await.unwrap(), "second");
        assert!(!server.is_finished());
    }

    #[tokio::test]
    async fn queued_request_cancelled_before_sending_is_skipped() {
        let (link, mut primary, _) = linked(None);

        let first = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_one("a")).await }
        });
        primary.next_intent().await;

        let queued = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_one("skipped")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        queued.abort();
        let _ = queued.await;

        primary.reply(Reply::success(200, json!("a"))).await;
        assert_eq!(first.await.unwrap(), Reply::success(200, json!("a")));

        let third = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_one("c")).await }
        });
        assert_eq!(primary.next_intent().await, Intent::read_one("c"));
        primary.reply(Reply::success(200, json!("c"))).await;
        assert_eq!(third.await.unwrap(), Reply::success(200, json!("c")));
    }

    #[tokio::test]
    async fn unsolicited_reply_is_discarded() {
        let (link, mut primary, _) = linked(None);

        primary.reply(Reply::success(200, json!("stray"))).await;
        // Let the link task see the stray reply while idle.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_all()).await }
        });
        primary.next_intent().await;
        primary.reply(Reply::success(200, json!([]))).await;

        assert_eq!(pending.await.unwrap(), Reply::success(200, json!([])));
    }

    #[tokio::test]
    async fn malformed_reply_becomes_500() {
        let (link, mut primary, _) = linked(None);

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_all()).await }
        });
        primary.next_intent().await;

        let mut raw = tokio_util::bytes::BytesMut::new();
        tokio_util::codec::Encoder::encode(
            &mut RawFrameCodec,
            Bytes::from_static(br#"{"result":"success","status":418}"#),
            &mut raw,
        )
        .unwrap();
        tokio::io::AsyncWriteExt::write_all(primary.replies.get_mut(), &raw)
            .await
            .unwrap();

        assert_eq!(
            pending.await.unwrap(),
            Reply::failure(500, "Primary reply has invalid format")
        );
        assert!(!link.is_broken());
    }

    #[tokio::test]
    async fn primary_exit_fails_pending_and_shuts_down() {
        let (link, mut primary, shutdown) = linked(None);

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_all()).await }
        });
        primary.next_intent().await;
        drop(primary);

        assert_eq!(pending.await.unwrap().status(), 500);
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .unwrap();
        assert!(link.is_broken());
    }

    #[tokio::test]
    async fn reply_timeout_breaks_link() {
        let (link, mut primary, shutdown) = linked(Some(Duration::from_millis(100)));

        let pending = tokio::spawn({
            let link = link.clone();
            async move { link.dispatch(Intent::read_all()).await }
        });
        primary.next_intent().await;

        assert_eq!(
            pending.await.unwrap(),
            Reply::failure(500, "Primary did not reply in time")
        );
        assert!(shutdown.is_cancelled());

        // Later requests fail fast instead of reading a stale reply.
        assert_eq!(link.dispatch(Intent::read_all()).await.status(), 500);
    }
}
