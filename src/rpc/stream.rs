//! Message stream of a streaming RPC.
//!
//! An [`RpcStream`] is one end of a call: it receives `In` messages and sends
//! `Out` messages. Interceptors register [`StreamObserver`]s on it before the
//! handler runs. Observers see every send and receive, together with a
//! sequence number and a timestamp, but never the message itself.
//!
//! The stream moves from [`StreamState::Open`] through any mix of
//! [`StreamState::Sending`] and [`StreamState::Receiving`] to
//! [`StreamState::Closed`], which is reached once the inbound side has ended
//! (end of stream or error) and the outbound side has been closed.

use std::{
    fmt,
    future::Future,
    panic,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::SystemTime,
};

use futures_util::{stream, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tonic::{metadata::MetadataMap, Extensions, Status};

use crate::context::{Logger, LoggerExt};

pub type MessageStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Sending,
    Receiving,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

/// Hook notified about stream activity.
pub trait StreamObserver: Send + Sync {
    /// Called after message number `sequence` (starting at 1) went through.
    fn on_message(&self, direction: Direction, sequence: u64, at: SystemTime);

    /// Called once per direction when that direction reaches its end.
    fn on_close(&self, _direction: Direction, _error: Option<&Status>) {}
}

type Observers = Arc<Vec<Arc<dyn StreamObserver>>>;

#[derive(Debug, Default)]
struct StateCell {
    last: AtomicU8,
    send_closed: AtomicBool,
    recv_closed: AtomicBool,
}

impl StateCell {
    const OPEN: u8 = 0;
    const SENDING: u8 = 1;
    const RECEIVING: u8 = 2;

    fn set_last(&self, last: u8) {
        self.last.store(last, Ordering::Release);
    }

    fn get(&self) -> StreamState {
        if self.send_closed.load(Ordering::Acquire) && self.recv_closed.load(Ordering::Acquire) {
            return StreamState::Closed;
        }

        match self.last.load(Ordering::Acquire) {
            Self::SENDING => StreamState::Sending,
            Self::RECEIVING => StreamState::Receiving,
            last => {
                debug_assert_eq!(last, Self::OPEN);
                StreamState::Open
            }
        }
    }
}

/// Outbound half of an [`RpcStream`].
pub struct StreamSender<Out> {
    outbound: Option<mpsc::Sender<Result<Out, Status>>>,
    observers: Observers,
    state: Arc<StateCell>,
    sequence: u64,
}

impl<Out> StreamSender<Out> {
    /// Sends one message. Fails once the stream was closed for sending or
    /// the peer went away.
    pub async fn send(&mut self, message: Out) -> Result<(), Status> {
        let Some(outbound) = self.outbound.as_ref() else {
            return Err(Status::failed_precondition("send on a stream closed for sending"));
        };

        if outbound.send(Ok(message)).await.is_err() {
            let status = Status::unavailable("peer closed the stream");
            self.close_with(Some(&status));
            return Err(status);
        }

        self.sequence += 1;
        self.state.set_last(StateCell::SENDING);
        for observer in self.observers.iter() {
            observer.on_message(Direction::Sent, self.sequence, SystemTime::now());
        }

        Ok(())
    }

    /// Half-closes the stream: the peer sees end of stream once it drained
    /// the messages sent so far.
    pub fn close(&mut self) {
        self.close_with(None);
    }

    pub fn sent(&self) -> u64 {
        self.sequence
    }

    fn close_with(&mut self, error: Option<&Status>) {
        if self.outbound.take().is_none() {
            return;
        }

        self.state.send_closed.store(true, Ordering::Release);
        for observer in self.observers.iter() {
            observer.on_close(Direction::Sent, error);
        }
    }
}

impl<Out> Drop for StreamSender<Out> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Inbound half of an [`RpcStream`].
pub struct StreamReceiver<In> {
    inbound: MessageStream<In>,
    observers: Observers,
    state: Arc<StateCell>,
    sequence: u64,
    closed: bool,
}

impl<In> StreamReceiver<In> {
    /// Receives the next message. `None` marks the end of the stream; after
    /// an error or the end, every further call returns `None`.
    pub async fn recv(&mut self) -> Option<Result<In, Status>> {
        if self.closed {
            return None;
        }

        let item = self.inbound.next().await;
        match &item {
            Some(Ok(_)) => {
                self.sequence += 1;
                self.state.set_last(StateCell::RECEIVING);
                for observer in self.observers.iter() {
                    observer.on_message(Direction::Received, self.sequence, SystemTime::now());
                }
            }
            Some(Err(status)) => self.close_with(Some(status)),
            None => self.close_with(None),
        }

        item
    }

    pub fn received(&self) -> u64 {
        self.sequence
    }

    fn close_with(&mut self, error: Option<&Status>) {
        self.closed = true;
        self.state.recv_closed.store(true, Ordering::Release);
        for observer in self.observers.iter() {
            observer.on_close(Direction::Received, error);
        }
    }
}

/// One end of a streaming call.
pub struct RpcStream<In, Out> {
    metadata: MetadataMap,
    extensions: Extensions,
    sender: StreamSender<Out>,
    receiver: StreamReceiver<In>,
    observers: Vec<Arc<dyn StreamObserver>>,
}

impl<In, Out> RpcStream<In, Out> {
    pub fn new(
        metadata: MetadataMap,
        inbound: impl Stream<Item = Result<In, Status>> + Send + 'static,
        outbound: mpsc::Sender<Result<Out, Status>>,
    ) -> Self {
        let state = Arc::new(StateCell::default());
        let observers: Observers = Arc::new(Vec::new());

        Self {
            metadata,
            extensions: Extensions::default(),
            sender: StreamSender {
                outbound: Some(outbound),
                observers: observers.clone(),
                state: state.clone(),
                sequence: 0,
            },
            receiver: StreamReceiver {
                inbound: Box::pin(inbound),
                observers,
                state,
                sequence: 0,
                closed: false,
            },
            observers: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Registers an observer for all subsequent sends and receives.
    pub fn observe(&mut self, observer: Arc<dyn StreamObserver>) {
        self.observers.push(observer);
        let observers: Observers = Arc::new(self.observers.clone());
        self.sender.observers = observers.clone();
        self.receiver.observers = observers;
    }

    pub async fn send(&mut self, message: Out) -> Result<(), Status> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Option<Result<In, Status>> {
        self.receiver.recv().await
    }

    pub fn close_send(&mut self) {
        self.sender.close();
    }

    pub fn state(&self) -> StreamState {
        self.receiver.state.get()
    }

    /// A second handle on the outbound channel, for the transport to deliver
    /// the final status after the handler returned. It does not count as a
    /// send and is not observed.
    pub fn status_sender(&self) -> Option<mpsc::Sender<Result<Out, Status>>> {
        self.sender.outbound.clone()
    }

    /// Splits the stream so sending and receiving can run on separate tasks.
    pub fn split(self) -> (StreamSender<Out>, StreamReceiver<In>) {
        (self.sender, self.receiver)
    }
}

impl<In, Out> LoggerExt for RpcStream<In, Out> {
    fn with_logger(mut self, logger: Logger) -> Self {
        self.extensions.insert(logger);
        self
    }

    fn logger(&self) -> Logger {
        self.extensions.get::<Logger>().cloned().unwrap_or_default()
    }
}

impl<In, Out> fmt::Debug for RpcStream<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("metadata", &self.metadata)
            .field("state", &self.state())
            .field("sent", &self.sender.sequence)
            .field("received", &self.receiver.sequence)
            .finish_non_exhaustive()
    }
}

/// Creates two connected in-process stream ends.
///
/// The first end receives `A` and sends `B`, the second one the other way
/// round. Both start with empty metadata.
pub fn channel<A, B>(buffer: usize) -> (RpcStream<A, B>, RpcStream<B, A>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);

    (
        RpcStream::new(MetadataMap::new(), receiver_stream(a_rx), b_tx),
        RpcStream::new(MetadataMap::new(), receiver_stream(b_rx), a_tx),
    )
}

fn receiver_stream<T: Send + 'static>(
    receiver: mpsc::Receiver<Result<T, Status>>,
) -> impl Stream<Item = Result<T, Status>> + Send + 'static {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    })
}

/// Runs the send loop and the receive loop of a bidirectional call as two
/// tasks and waits for both of them.
///
/// The call only returns once both loops reached a terminal state. A panic
/// in either loop is resumed on the caller; if both panicked, the receive
/// loop's panic is logged and the send loop's one is resumed. Otherwise the
/// first error, send loop first, is returned.
///
/// Dropping the returned future aborts both loops.
pub async fn join_bidi<S, R>(send_loop: S, recv_loop: R) -> Result<(), Status>
where
    S: Future<Output = Result<(), Status>> + Send + 'static,
    R: Future<Output = Result<(), Status>> + Send + 'static,
{
    let sending = AbortOnDrop(tokio::spawn(send_loop));
    let receiving = AbortOnDrop(tokio::spawn(recv_loop));

    let (sent, received) = tokio::join!(sending, receiving);

    match (sent, received) {
        (Err(sent), Err(received)) if sent.is_panic() && received.is_panic() => {
            tracing::error!(
                panic = %crate::recovery::panic_message(received.into_panic().as_ref()),
                "receive loop panicked as well"
            );
            panic::resume_unwind(sent.into_panic())
        }
        (sent, received) => {
            let sent = settle(sent);
            let received = settle(received);
            sent.and(received)
        }
    }
}

/// Task handle that aborts its task when dropped before completion.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

fn settle(joined: Result<Result<(), Status>, JoinError>) -> Result<(), Status> {
    match joined {
        Ok(result) => result,
        Err(error) if error.is_panic() => panic::resume_unwind(error.into_panic()),
        Err(error) => Err(Status::cancelled(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(Direction, u64)>>,
        closed: Mutex<Vec<Direction>>,
    }

    impl StreamObserver for Recorder {
        fn on_message(&self, direction: Direction, sequence: u64, _at: SystemTime) {
            self.events.lock().unwrap().push((direction, sequence));
        }

        fn on_close(&self, direction: Direction, _error: Option<&Status>) {
            self.closed.lock().unwrap().push(direction);
        }
    }

    #[tokio::test]
    async fn messages_arrive_unchanged_and_in_order() {
        let (mut client, mut server) = channel::<String, String>(8);
        let recorder = Arc::new(Recorder::default());
        server.observe(recorder.clone());

        for greeting in ["a", "b", "c"] {
            client.send(greeting.to_owned()).await.unwrap();
        }
        client.close_send();

        let mut received = Vec::new();
        while let Some(message) = server.recv().await {
            received.push(message.unwrap());
        }

        assert_eq!(received, ["a", "b", "c"]);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            [
                (Direction::Received, 1),
                (Direction::Received, 2),
                (Direction::Received, 3),
            ]
        );
        assert_eq!(*recorder.closed.lock().unwrap(), [Direction::Received]);
    }

    #[tokio::test]
    async fn state_machine_reaches_closed_after_both_sides_end() {
        let (mut client, mut server) = channel::<u32, u32>(8);
        assert_eq!(server.state(), StreamState::Open);

        client.send(1).await.unwrap();
        server.recv().await.unwrap().unwrap();
        assert_eq!(server.state(), StreamState::Receiving);

        server.send(2).await.unwrap();
        assert_eq!(server.state(), StreamState::Sending);

        client.close_send();
        assert!(server.recv().await.is_none());
        assert_eq!(server.state(), StreamState::Sending);

        server.close_send();
        assert_eq!(server.state(), StreamState::Closed);
        assert!(server.send(3).await.is_err());
    }

    #[tokio::test]
    async fn error_closes_the_receiving_side() {
        let (client, mut server) = channel::<u32, u32>(8);
        let status_sender = client.status_sender().unwrap();
        status_sender
            .send(Err(Status::internal("boom")))
            .await
            .unwrap();

        let status = server.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(server.recv().await.is_none());
    }

    #[tokio::test]
    async fn join_waits_for_both_loops() {
        let (client, mut server) = channel::<u32, u32>(8);
        let (mut sender, mut receiver) = client.split();

        let echo = tokio::spawn(async move {
            while let Some(Ok(message)) = server.recv().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
                server.send(message).await.unwrap();
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        join_bidi(
            async move {
                for i in 0..5 {
                    sender.send(i).await?;
                }
                sender.close();
                Ok(())
            },
            async move {
                while let Some(message) = receiver.recv().await {
                    sink.lock().unwrap().push(message?);
                }
                Ok(())
            },
        )
        .await
        .unwrap();

        echo.await.unwrap();
        assert_eq!(*received.lock().unwrap(), [0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn join_resumes_a_panicking_loop() {
        let bidi = join_bidi(async { panic!("send loop failed") }, async { Ok(()) });

        let error = tokio::spawn(bidi).await.unwrap_err();
        assert!(error.is_panic());
    }

    #[tokio::test]
    async fn join_reports_loop_errors() {
        let result = join_bidi(async { Ok(()) }, async {
            Err(Status::data_loss("receive failed"))
        })
        .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::DataLoss);
    }

    #[tokio::test]
    async fn dropping_the_join_aborts_both_loops() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let bidi = join_bidi(
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            async { Ok(()) },
        );
        let joined = tokio::time::timeout(Duration::from_millis(10), bidi).await;
        assert!(joined.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
