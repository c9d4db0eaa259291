//! Framed cipher connection: a send path serialized behind one mutex and a
//! single receive loop that decrypts frames and fans them out to listeners.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tonearm_core::{
    read_exact, write_all, Command, Frame, LinkHandle, RecvCipher, SendCipher, FRAME_HEADER_LEN,
};
use tracing::{debug, error, trace};

use crate::error::ClientError;

/// Receives every decrypted frame. Called on the receive loop, so an
/// implementation must return promptly and never wait on I/O.
pub trait CommandListener: Send + Sync + 'static {
    fn on_command(&self, command: u8, payload: &Bytes);

    /// The receive loop has stopped. No further commands will arrive.
    fn on_closed(&self) {}
}

pub(crate) fn command_label(command: u8) -> String {
    match Command::try_from(command) {
        Ok(known) => known.to_string(),
        Err(_) => format!("unknown(0x{command:02x})"),
    }
}

/// Read and authenticate the next frame from `reader`.
pub async fn read_frame<R>(reader: &mut R, cipher: &mut RecvCipher) -> Result<Frame, ClientError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact(reader, &mut header).await?;
    let pending = cipher.open_header(header)?;
    let command = pending.command;
    let mut body = vec![0u8; pending.body_len()];
    read_exact(reader, &mut body).await?;
    let len = pending.complete(&mut body)?.len();
    body.truncate(len);
    Ok(Frame {
        command,
        payload: Bytes::from(body),
    })
}

/// Seal one frame and write it. Returns the counter the frame was sealed
/// under.
pub async fn write_frame<W>(
    writer: &mut W,
    cipher: &mut SendCipher,
    command: u8,
    payload: &[u8],
) -> Result<u32, ClientError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let counter = cipher.counter();
    let frame = cipher.seal(command, payload)?;
    write_all(writer, &frame).await?;
    Ok(counter)
}

struct ConnectionState {
    closed: watch::Sender<bool>,
    reason: SyncMutex<Option<String>>,
    listeners_told: AtomicBool,
}

impl ConnectionState {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed,
            reason: SyncMutex::new(None),
            listeners_told: AtomicBool::new(false),
        }
    }

    /// Returns true for the first caller only.
    fn close(&self, reason: String) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.closed.send_replace(true);
        true
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

struct SendHalf {
    writer: WriteHalf<LinkHandle>,
    cipher: SendCipher,
}

/// Closes the connection if dropped while armed.
struct TornFrameGuard<'a> {
    state: &'a ConnectionState,
    armed: bool,
}

impl TornFrameGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TornFrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.state.close("send cancelled mid-frame".into()) {
            error!(target: "tonearm::connection", "send cancelled mid-frame; connection closed");
        }
    }
}

/// Cloneable handle for sending frames. Every clone shares one mutex so the
/// seal-and-write step is atomic with respect to the send counter.
#[derive(Clone)]
pub struct FrameSender {
    half: Arc<Mutex<Option<SendHalf>>>,
    state: Arc<ConnectionState>,
}

impl FrameSender {
    pub async fn send(&self, command: Command, payload: &[u8]) -> Result<u32, ClientError> {
        self.send_raw(command.as_u8(), payload).await
    }

    pub async fn send_raw(&self, command: u8, payload: &[u8]) -> Result<u32, ClientError> {
        if self.state.is_closed() {
            return Err(ClientError::Closed);
        }
        let mut slot = self.half.lock().await;
        let mut half = slot.take().ok_or(ClientError::Closed)?;
        // The counter has advanced once the frame is sealed; if this future
        // is dropped before the write finishes the stream is torn.
        let torn = TornFrameGuard {
            state: &self.state,
            armed: true,
        };
        let result = write_frame(&mut half.writer, &mut half.cipher, command, payload).await;
        torn.disarm();
        match result {
            Ok(counter) => {
                *slot = Some(half);
                trace!(
                    target: "tonearm::connection",
                    command = %command_label(command),
                    len = payload.len(),
                    counter,
                    "frame sent"
                );
                Ok(counter)
            }
            Err(err) => {
                drop(slot);
                if self.state.close(format!("send failed: {err}")) {
                    error!(target: "tonearm::connection", error = %err, "send failed; connection closed");
                }
                Err(err)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSender")
            .field("closed", &self.state.is_closed())
            .finish_non_exhaustive()
    }
}

type ListenerList = Arc<RwLock<Vec<Arc<dyn CommandListener>>>>;

/// An established, encrypted connection.
pub struct Connection {
    sender: FrameSender,
    listeners: ListenerList,
    state: Arc<ConnectionState>,
    receive_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Split `link` and spawn the receive loop. Listeners passed here see
    /// every frame from the first one on.
    pub fn start(
        link: LinkHandle,
        send: SendCipher,
        recv: RecvCipher,
        listeners: Vec<Arc<dyn CommandListener>>,
    ) -> Self {
        Self::start_with(link, send, recv, |_| listeners)
    }

    /// Like [`Connection::start`], for listeners that reply to commands and
    /// so need the sender before the first frame is read.
    pub fn start_with<F>(link: LinkHandle, send: SendCipher, recv: RecvCipher, build: F) -> Self
    where
        F: FnOnce(&FrameSender) -> Vec<Arc<dyn CommandListener>>,
    {
        let (reader, writer) = tokio::io::split(link);
        let state = Arc::new(ConnectionState::new());
        let sender = FrameSender {
            half: Arc::new(Mutex::new(Some(SendHalf {
                writer,
                cipher: send,
            }))),
            state: Arc::clone(&state),
        };
        let listeners: ListenerList = Arc::new(RwLock::new(build(&sender)));
        let task = tokio::spawn(receive_loop(
            reader,
            recv,
            Arc::clone(&listeners),
            Arc::clone(&state),
        ));
        debug!(target: "tonearm::connection", "receive loop started");
        Self {
            sender,
            listeners,
            state,
            receive_task: SyncMutex::new(Some(task)),
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub async fn send(&self, command: Command, payload: &[u8]) -> Result<u32, ClientError> {
        self.sender.send(command, payload).await
    }

    pub fn add_listener(&self, listener: Arc<dyn CommandListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Why the connection stopped, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.state.reason()
    }

    /// Wait until the connection is closed from either side.
    pub async fn closed(&self) {
        let mut rx = self.state.closed.subscribe();
        // The sender lives in `self.state`, so this only ends on close.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stop the receive loop and shut the write half down.
    pub async fn close(&self) {
        if !self.state.close("closed locally".into()) {
            return;
        }
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
        if let Some(mut half) = self.sender.half.lock().await.take() {
            let _ = half.writer.shutdown().await;
        }
        notify_closed(&self.listeners, &self.state);
        debug!(target: "tonearm::connection", "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.state.is_closed())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

/// Tell every listener once, whichever side noticed the close first.
fn notify_closed(listeners: &ListenerList, state: &ConnectionState) {
    if state.listeners_told.swap(true, Ordering::AcqRel) {
        return;
    }
    let current: Vec<_> = listeners.read().clone();
    for listener in current {
        listener.on_closed();
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn receive_loop(
    mut reader: ReadHalf<LinkHandle>,
    mut cipher: RecvCipher,
    listeners: ListenerList,
    state: Arc<ConnectionState>,
) {
    let closing = wait_closed(state.closed.subscribe());
    tokio::pin!(closing);
    let err = loop {
        let next = tokio::select! {
            next = read_frame(&mut reader, &mut cipher) => next,
            // Closed from the send side; nothing more can be trusted.
            () = &mut closing => break None,
        };
        match next {
            Ok(frame) => {
                trace!(
                    target: "tonearm::connection",
                    command = %command_label(frame.command),
                    len = frame.payload.len(),
                    counter = cipher.counter().wrapping_sub(1),
                    "frame received"
                );
                // Cloned so a listener may register another listener.
                let current: Vec<_> = listeners.read().clone();
                for listener in &current {
                    listener.on_command(frame.command, &frame.payload);
                }
            }
            Err(err) => break Some(err),
        }
    };
    if let Some(err) = err {
        if state.close(err.to_string()) {
            error!(target: "tonearm::connection", error = %err, "receive loop terminated");
        }
    }
    notify_closed(&listeners, &state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tonearm_core::memory_link_pair;

    const KEY_UP: [u8; 32] = [0x11; 32];
    const KEY_DOWN: [u8; 32] = [0x22; 32];

    struct Recorder {
        frames: mpsc::UnboundedSender<(u8, Bytes)>,
        closed: mpsc::UnboundedSender<()>,
    }

    impl CommandListener for Recorder {
        fn on_command(&self, command: u8, payload: &Bytes) {
            let _ = self.frames.send((command, payload.clone()));
        }

        fn on_closed(&self) {
            let _ = self.closed.send(());
        }
    }

    fn recorder() -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<(u8, Bytes)>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { frames, closed }), frames_rx, closed_rx)
    }

    #[tokio::test]
    async fn back_to_back_sends_use_consecutive_counters() {
        let (client, mut server) = memory_link_pair(4096);
        let connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            Vec::new(),
        );

        let first = connection
            .send(Command::Search, b"abc")
            .await
            .expect("search frame");
        let second = connection
            .send(Command::Image, &[0x5a; 20])
            .await
            .expect("image frame");
        assert_eq!(second, first + 1);

        let mut reference = RecvCipher::new(&KEY_UP);
        let frame = read_frame(&mut server, &mut reference).await.expect("first");
        assert_eq!(frame.command, 0x39);
        assert_eq!(&frame.payload[..], b"abc");
        let frame = read_frame(&mut server, &mut reference).await.expect("second");
        assert_eq!(frame.command, 0x19);
        assert_eq!(&frame.payload[..], &[0x5a; 20]);
        assert_eq!(reference.counter(), 2);
    }

    #[tokio::test]
    async fn receive_loop_dispatches_in_arrival_order() {
        let (client, mut server) = memory_link_pair(4096);
        let (listener, mut frames, _closed) = recorder();
        let _connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            vec![listener],
        );

        let mut peer = SendCipher::new(&KEY_DOWN);
        for (command, payload) in [(0x04u8, &b"\0\0\0\0"[..]), (0x1b, b"SE"), (0x69, b"")] {
            write_frame(&mut server, &mut peer, command, payload)
                .await
                .expect("peer frame");
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(frames.recv().await.expect("dispatched frame"));
        }
        assert_eq!(seen[0].0, 0x04);
        assert_eq!(&seen[1].1[..], b"SE");
        assert_eq!(seen[2], (0x69, Bytes::new()));
    }

    #[tokio::test]
    async fn tampered_frame_is_fatal() {
        let (client, mut server) = memory_link_pair(4096);
        let (listener, mut frames, mut closed) = recorder();
        let connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            vec![listener],
        );

        let mut peer = SendCipher::new(&KEY_DOWN);
        let mut frame = peer.seal(0x04, &[0; 4]).expect("seal");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        write_all(&mut server, &frame).await.expect("write tampered");

        closed.recv().await.expect("closed notification");
        assert!(frames.try_recv().is_err());
        assert!(connection.is_closed());
        assert!(connection
            .close_reason()
            .expect("reason recorded")
            .contains("MAC"));
        let err = connection
            .send(Command::Pong, &[0; 4])
            .await
            .expect_err("send after close");
        assert!(matches!(err, ClientError::Closed));
    }

    #[tokio::test]
    async fn peer_hangup_closes_connection() {
        let (client, server) = memory_link_pair(256);
        let (listener, _frames, mut closed) = recorder();
        let connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            vec![listener],
        );
        drop(server);
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("closed promptly");
        closed.recv().await.expect("listener told");
    }

    #[tokio::test]
    async fn concurrent_senders_stay_in_counter_order() {
        let (client, mut server) = memory_link_pair(64 * 1024);
        let connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            Vec::new(),
        );

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let sender = connection.sender();
            tasks.push(tokio::spawn(async move {
                sender.send_raw(0x39, &[i; 8]).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("send");
        }

        // Every frame must open under the reference counter sequence.
        let mut reference = RecvCipher::new(&KEY_UP);
        let mut seen = Vec::new();
        for _ in 0..16 {
            let frame = read_frame(&mut server, &mut reference).await.expect("frame");
            seen.push(frame.payload[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancelled_send_closes_connection() {
        // A tiny pipe nobody drains, so the write stalls partway.
        let (client, _server) = memory_link_pair(64);
        let (listener, _frames, mut closed) = recorder();
        let connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            vec![listener],
        );

        let stalled = tokio::time::timeout(
            Duration::from_millis(50),
            connection.send(Command::Search, &[0x61; 1000]),
        )
        .await;
        assert!(stalled.is_err());
        assert!(connection.is_closed());
        assert_eq!(
            connection.close_reason().as_deref(),
            Some("send cancelled mid-frame")
        );

        let err = connection
            .send(Command::Image, &[0x5a; 20])
            .await
            .expect_err("stream is torn");
        assert!(matches!(err, ClientError::Closed));
        tokio::time::timeout(Duration::from_secs(1), closed.recv())
            .await
            .expect("listener told promptly")
            .expect("closed notification");
    }

    #[tokio::test]
    async fn local_close_notifies_once() {
        let (client, _server) = memory_link_pair(256);
        let (listener, _frames, mut closed) = recorder();
        let connection = Connection::start(
            client,
            SendCipher::new(&KEY_UP),
            RecvCipher::new(&KEY_DOWN),
            vec![listener],
        );
        connection.close().await;
        connection.close().await;
        closed.recv().await.expect("one notification");
        assert!(closed.try_recv().is_err());
        assert_eq!(connection.close_reason().as_deref(), Some("closed locally"));
    }
}
