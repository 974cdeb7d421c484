//! Connection engine.
//!
//! A [`Connection`] owns the socket(s) of one logical VRT connection and at
//! most one background task:
//!
//! - input connections run a receive loop that reads datagrams or stream
//!   bytes, decodes them into units and pushes them onto the bounded
//!   [`PacketQueue`];
//! - TCP-server outputs run an accept loop that collects clients;
//! - UDP and TCP-client outputs have no task at all; [`Connection::send`]
//!   writes on the caller's task.
//!
//! Sockets come from a [`Connector`] at start and again whenever one is
//! lost. They live behind a `tokio::sync::Mutex` that is held for a whole
//! swap, so the receive loop never sees a half-closed socket.
//!
//! Stopping is two-phase. Phase 1 marks the connection draining: the
//! receive loop keeps reading until the socket goes idle or reaches EOF,
//! and outputs shut down their write side. If the task has not finished
//! within the grace period, phase 2 cancels it and closes everything.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use vrtlib_core::error::{Error, Result};
use vrtlib_core::options::{ConnectionOptions, DEFAULT_READ_TIMEOUT, Direction};
use vrtlib_core::transport::ReadStatus;
use vrtlib_packet::codec::DEFAULT_STALL_LIMIT;
use vrtlib_packet::{StreamDecoder, decode_datagram};
use vrtlib_transport::{Connector, Socket};

use crate::listener::{VrtEvent, VrtListener};
use crate::queue::{Inbound, PacketQueue, PushOutcome};

// ---------------------------------------------------------------------------
// Constants and settings
// ---------------------------------------------------------------------------

/// How long phase 1 of a stop may take before sockets are force-closed.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// First delay between failed reopen attempts.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Upper bound on the delay between reopen attempts.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Bounds on how often a TCP server with clients polls for more.
const ACCEPT_POLL_MIN: Duration = Duration::from_millis(10);
const ACCEPT_POLL_MAX: Duration = Duration::from_secs(1);

/// Per-client read slice when a server is reading from several clients.
const MIN_CLIENT_READ: Duration = Duration::from_millis(5);

/// Large enough for any UDP datagram.
const RECV_BUFFER_SIZE: usize = 65_536;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Set on every task a connection spawns, to detect joins from self.
    static IO_TASK: u64;
}

/// Whether the current task belongs to connection `id`.
pub(crate) fn in_connection_task(id: u64) -> bool {
    IO_TASK.try_with(|current| *current == id).unwrap_or(false)
}

/// Run `fut` tagged as one of connection `id`'s own tasks.
pub(crate) fn spawn_tagged<F>(id: u64, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(IO_TASK.scope(id, fut))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Running,
    Reconnecting,
    ShuttingDown,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Opening => "opening",
            ConnectionState::Running => "running",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting down",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Runtime parameters of a connection.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub direction: Direction,
    /// Bound on every socket read and accept.
    pub read_timeout: Duration,
    pub queue_limit_packets: usize,
    pub queue_limit_octets: usize,
    pub drain_grace: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Idle reads tolerated while a partial unit is buffered.
    pub stall_limit: u32,
}

impl EngineSettings {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            read_timeout: DEFAULT_READ_TIMEOUT,
            queue_limit_packets: vrtlib_core::options::DEFAULT_QUEUE_LIMIT_PACKETS,
            queue_limit_octets: vrtlib_core::options::DEFAULT_QUEUE_LIMIT_OCTETS,
            drain_grace: DEFAULT_DRAIN_GRACE,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            stall_limit: DEFAULT_STALL_LIMIT,
        }
    }

    pub fn from_options(opts: &ConnectionOptions, direction: Direction) -> Self {
        Self {
            read_timeout: opts.socket.effective_read_timeout(),
            queue_limit_packets: opts.queue_limit_packets,
            queue_limit_octets: opts.queue_limit_octets,
            ..Self::new(direction)
        }
    }
}

/// Exponential delay between reopen attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Client {
    socket: Socket,
    decoder: StreamDecoder,
    origin: u64,
}

#[derive(Default)]
struct Sockets {
    /// The UDP socket, TCP stream or listening server.
    primary: Option<Socket>,
    /// Reassembly for a primary stream socket.
    decoder: StreamDecoder,
    /// Accepted clients of a TCP server.
    clients: Vec<Client>,
    /// Tag of the current primary socket.
    origin: u64,
    next_origin: u64,
    /// Where closed sockets' origins are recorded; inputs only.
    retired: Option<Arc<StdMutex<Vec<u64>>>>,
}

impl Sockets {
    fn next_origin(&mut self) -> u64 {
        self.next_origin += 1;
        self.next_origin
    }

    fn retire(&self, origin: u64) {
        if let Some(retired) = &self.retired {
            if let Ok(mut retired) = retired.lock() {
                retired.push(origin);
            }
        }
    }

    /// Close and forget one accepted client.
    async fn drop_client(&mut self, index: usize) -> Client {
        let mut gone = self.clients.remove(index);
        let _ = gone.socket.close().await;
        self.retire(gone.origin);
        gone
    }

    async fn close_all(&mut self) {
        let clients: Vec<Client> = self.clients.drain(..).collect();
        for mut client in clients {
            let _ = client.socket.close().await;
            self.retire(client.origin);
        }
        if let Some(mut socket) = self.primary.take() {
            let _ = socket.close().await;
            self.retire(self.origin);
        }
        self.decoder.clear();
    }
}

struct Shared {
    id: u64,
    event: VrtEvent,
    settings: EngineSettings,
    connector: Box<dyn Connector>,
    listener: Arc<dyn VrtListener>,
    sockets: Mutex<Sockets>,
    queue: PacketQueue,
    state: watch::Sender<ConnectionState>,
    local_addr: StdMutex<Option<SocketAddr>>,
    started: AtomicBool,
    reconnecting: AtomicBool,
    draining: AtomicBool,
    /// Phase 1 of stop.
    stop_requested: CancellationToken,
    /// Phase 2 of stop.
    force: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
    /// Origins of input sockets closed since the reader last collected them.
    retired: Arc<StdMutex<Vec<u64>>>,
}

enum Step {
    /// Something was read (or the socket set changed).
    Progress,
    /// Nothing arrived within the read timeout.
    Idle,
    /// The socket reached EOF or failed.
    Closed,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(connection = %self.event.source, from = %previous, to = %state, "Connection state change");
        }
    }

    fn draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn report_error(&self, message: &str, cause: Option<&Error>) {
        match cause {
            Some(e) => warn!(connection = %self.event.source, error = %e, "{message}"),
            None => warn!(connection = %self.event.source, "{message}"),
        }
        self.listener.error_occurred(&self.event, message, cause);
    }

    fn report_warning(&self, message: &str, cause: Option<&Error>) {
        warn!(connection = %self.event.source, "{message}");
        self.listener.warning_occurred(&self.event, message, cause);
    }

    fn remember_local_addr(&self, socket: &Socket) {
        let addr = socket.local_addr();
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = addr;
        }
    }

    /// Open a primary socket if there is none. Returns whether one was opened.
    async fn ensure_open(&self) -> Result<bool> {
        let mut sockets = self.sockets.lock().await;
        if sockets.primary.is_some() {
            return Ok(false);
        }
        let socket = self.connector.open().await?;
        info!(connection = %self.event.source, socket = %socket.describe(), "Socket opened");
        self.remember_local_addr(&socket);
        sockets.decoder = StreamDecoder::with_stall_limit(self.settings.stall_limit);
        sockets.origin = sockets.next_origin();
        sockets.primary = Some(socket);
        Ok(true)
    }

    /// Close every socket and open a fresh primary, all under the lock.
    async fn reopen(&self) -> Result<()> {
        let mut sockets = self.sockets.lock().await;
        sockets.close_all().await;
        let socket = self.connector.open().await?;
        info!(connection = %self.event.source, socket = %socket.describe(), "Socket reopened");
        self.remember_local_addr(&socket);
        sockets.decoder = StreamDecoder::with_stall_limit(self.settings.stall_limit);
        sockets.origin = sockets.next_origin();
        sockets.primary = Some(socket);
        Ok(())
    }

    fn enqueue(&self, origin: u64, unit: vrtlib_packet::Unit) {
        trace!(origin, octets = unit.wire_len(), "Queueing unit");
        match self.queue.push(Inbound { origin, unit }) {
            PushOutcome::Queued | PushOutcome::Closed => {}
            PushOutcome::Overflow {
                dropped_packets,
                dropped_octets,
            } => self.report_warning(
                &format!(
                    "receive queue full, dropped {dropped_packets} packets ({dropped_octets} octets)"
                ),
                None,
            ),
        }
    }

    fn absorb_datagram(&self, origin: u64, data: &[u8]) {
        match decode_datagram(Bytes::copy_from_slice(data)) {
            Ok(unit) => self.enqueue(origin, unit),
            Err(e) => self.report_error("discarding invalid datagram", Some(&e)),
        }
    }

    fn absorb_stream(&self, origin: u64, decoder: &mut StreamDecoder, data: &[u8]) {
        decoder.push(data);
        loop {
            match decoder.next_unit() {
                Ok(Some(unit)) => self.enqueue(origin, unit),
                Ok(None) => break,
                Err(e) => self.report_error("discarding invalid stream data", Some(&e)),
            }
        }
    }

    /// One pass of the receive loop over whatever sockets are open.
    async fn read_step(&self, buf: &mut [u8], accept: &mut AcceptPoll) -> Step {
        let mut guard = self.sockets.lock().await;
        let sockets = &mut *guard;
        let Some(primary) = sockets.primary.as_mut() else {
            return Step::Closed;
        };

        if primary.is_server() {
            return self.read_server(sockets, buf, accept).await;
        }

        let origin = sockets.origin;
        match primary.read(buf, self.settings.read_timeout).await {
            Ok(ReadStatus::Data(n)) => {
                if primary.is_datagram() {
                    self.absorb_datagram(origin, &buf[..n]);
                } else {
                    self.absorb_stream(origin, &mut sockets.decoder, &buf[..n]);
                }
                Step::Progress
            }
            Ok(ReadStatus::TimedOut) => {
                if let Err(e) = sockets.decoder.note_idle() {
                    self.report_error("stream stalled", Some(&e));
                }
                Step::Idle
            }
            Ok(ReadStatus::Eof) => {
                if !self.draining() {
                    self.report_error("connection closed by peer", Some(&Error::ConnectionLost));
                }
                sockets.close_all().await;
                Step::Closed
            }
            Err(e) => {
                self.report_error("socket read failed", Some(&e));
                if e.is_connection_fatal() {
                    sockets.close_all().await;
                    Step::Closed
                } else {
                    Step::Progress
                }
            }
        }
    }

    async fn read_server(&self, sockets: &mut Sockets, buf: &mut [u8], accept: &mut AcceptPoll) -> Step {
        let mut progress = false;

        if !self.draining() && (sockets.clients.is_empty() || accept.due()) {
            let wait = if sockets.clients.is_empty() {
                self.settings.read_timeout
            } else {
                Duration::ZERO
            };
            if let Some(client) = self.accept_client(sockets, wait, accept).await {
                let origin = sockets.next_origin();
                sockets.clients.push(Client {
                    socket: client,
                    decoder: StreamDecoder::with_stall_limit(self.settings.stall_limit),
                    origin,
                });
                progress = true;
            }
            if sockets.primary.is_none() {
                return Step::Closed;
            }
        }

        if sockets.clients.is_empty() {
            return if progress { Step::Progress } else { Step::Idle };
        }

        let slice = (self.settings.read_timeout / sockets.clients.len() as u32).max(MIN_CLIENT_READ);
        let mut i = 0;
        while i < sockets.clients.len() {
            let client = &mut sockets.clients[i];
            match client.socket.read(buf, slice).await {
                Ok(ReadStatus::Data(n)) => {
                    self.absorb_stream(client.origin, &mut client.decoder, &buf[..n]);
                    progress = true;
                    i += 1;
                }
                Ok(ReadStatus::TimedOut) => {
                    if let Err(e) = client.decoder.note_idle() {
                        self.report_error("client stream stalled", Some(&e));
                    }
                    i += 1;
                }
                Ok(ReadStatus::Eof) => {
                    info!(connection = %self.event.source, client = %client.socket.describe(), "TCP client disconnected");
                    sockets.drop_client(i).await;
                    progress = true;
                }
                Err(e) => {
                    self.report_error("client read failed", Some(&e));
                    if e.is_connection_fatal() {
                        sockets.drop_client(i).await;
                    } else {
                        i += 1;
                    }
                    progress = true;
                }
            }
        }
        if progress { Step::Progress } else { Step::Idle }
    }

    /// Poll a listening primary for one client.
    async fn accept_client(&self, sockets: &mut Sockets, wait: Duration, accept: &mut AcceptPoll) -> Option<Socket> {
        let server = sockets.primary.as_mut()?;
        match server.accept(wait).await {
            Ok(Some(client)) => {
                debug!(connection = %self.event.source, client = %client.describe(), "Client added");
                accept.reset();
                Some(client)
            }
            Ok(None) => {
                accept.backoff();
                None
            }
            Err(e) => {
                self.report_error("accept failed", Some(&e));
                if e.is_connection_fatal() {
                    sockets.close_all().await;
                } else {
                    accept.backoff();
                }
                None
            }
        }
    }

    /// Force-close and mark the connection finished.
    async fn finish(&self) {
        self.force.cancel();
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            match tokio::time::timeout(self.settings.drain_grace, handle).await {
                Ok(_) => {}
                Err(_) => warn!(connection = %self.event.source, "I/O task did not exit after force close"),
            }
        }
        self.sockets.lock().await.close_all().await;
        self.queue.close();
        self.set_state(ConnectionState::Closed);
        info!(connection = %self.event.source, "Connection closed");
    }
}

/// Accept polling schedule for a server that already has clients.
#[derive(Debug)]
struct AcceptPoll {
    backoff: Backoff,
    next: Instant,
}

impl AcceptPoll {
    fn new() -> Self {
        Self {
            backoff: Backoff::new(ACCEPT_POLL_MIN, ACCEPT_POLL_MAX),
            next: Instant::now(),
        }
    }

    fn due(&self) -> bool {
        Instant::now() >= self.next
    }

    fn backoff(&mut self) {
        self.next = Instant::now() + self.backoff.next_delay();
    }

    fn reset(&mut self) {
        self.backoff.reset();
        self.next = Instant::now();
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Sleep for the next backoff delay. Returns `false` if the connection is
/// stopping instead.
async fn backoff_sleep(shared: &Shared, backoff: &mut Backoff) -> bool {
    let delay = backoff.next_delay();
    debug!(connection = %shared.event.source, delay_ms = delay.as_millis() as u64, "Waiting before reopening socket");
    tokio::select! {
        biased;
        _ = shared.stop_requested.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut backoff = Backoff::new(shared.settings.backoff_initial, shared.settings.backoff_max);
    let mut accept = AcceptPoll::new();

    debug!(connection = %shared.event.source, "Receive loop started");
    loop {
        if shared.force.is_cancelled() {
            break;
        }
        let draining = shared.draining();

        if !draining {
            let opened = tokio::select! {
                biased;
                _ = shared.stop_requested.cancelled() => continue,
                r = shared.ensure_open() => r,
            };
            match opened {
                Ok(true) => backoff.reset(),
                Ok(false) => {}
                Err(e) => {
                    shared.report_error("failed to open socket", Some(&e));
                    // A stop during the sleep is picked up at the top of the loop.
                    backoff_sleep(&shared, &mut backoff).await;
                    continue;
                }
            }
        }

        let step = tokio::select! {
            biased;
            _ = shared.force.cancelled() => break,
            step = shared.read_step(&mut buf, &mut accept) => step,
        };
        match step {
            Step::Progress => backoff.reset(),
            Step::Idle | Step::Closed if draining => break,
            Step::Idle => {}
            Step::Closed => {
                backoff_sleep(&shared, &mut backoff).await;
            }
        }
    }
    debug!(connection = %shared.event.source, "Receive loop exited");
}

async fn accept_loop(shared: Arc<Shared>) {
    let mut backoff = Backoff::new(shared.settings.backoff_initial, shared.settings.backoff_max);
    let mut accept = AcceptPoll::new();

    debug!(connection = %shared.event.source, "Accept loop started");
    while !shared.stop_requested.is_cancelled() {
        let opened = tokio::select! {
            biased;
            _ = shared.stop_requested.cancelled() => break,
            r = shared.ensure_open() => r,
        };
        if let Err(e) = opened {
            shared.report_error("failed to open server socket", Some(&e));
            if !backoff_sleep(&shared, &mut backoff).await {
                break;
            }
            continue;
        }
        backoff.reset();

        {
            let mut sockets = shared.sockets.lock().await;
            if !sockets.primary.as_ref().is_some_and(Socket::is_server) {
                break;
            }
            if let Some(client) = shared.accept_client(&mut sockets, Duration::ZERO, &mut accept).await {
                let origin = sockets.next_origin();
                sockets.clients.push(Client {
                    socket: client,
                    decoder: StreamDecoder::new(),
                    origin,
                });
            }
        }

        let wait = accept.next.saturating_duration_since(Instant::now());
        tokio::select! {
            biased;
            _ = shared.stop_requested.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(connection = %shared.event.source, "Accept loop exited");
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// One logical VRT connection. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("source", &self.shared.event.source)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(connector: Box<dyn Connector>, settings: EngineSettings, listener: Arc<dyn VrtListener>) -> Self {
        let event = VrtEvent::new(connector.describe());
        let (state, _) = watch::channel(ConnectionState::Opening);
        let queue = PacketQueue::new(settings.queue_limit_packets, settings.queue_limit_octets);
        let retired = Arc::new(StdMutex::new(Vec::new()));
        let sockets = Sockets {
            retired: (settings.direction == Direction::Input).then(|| Arc::clone(&retired)),
            ..Sockets::default()
        };
        Self {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                event,
                settings,
                connector,
                listener,
                sockets: Mutex::new(sockets),
                retired,
                queue,
                state,
                local_addr: StdMutex::new(None),
                started: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                stop_requested: CancellationToken::new(),
                force: CancellationToken::new(),
                task: StdMutex::new(None),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn event(&self) -> &VrtEvent {
        &self.shared.event
    }

    pub fn listener(&self) -> &Arc<dyn VrtListener> {
        &self.shared.listener
    }

    pub fn direction(&self) -> Direction {
        self.shared.settings.direction
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Local address of the current primary socket, once one is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.lock().ok().and_then(|a| *a)
    }

    /// The receive queue. Only input connections fill it.
    /// Take the origins of sockets closed since the last call. Only input
    /// connections record them.
    pub fn take_retired_origins(&self) -> Vec<u64> {
        self.shared
            .retired
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.shared.queue
    }

    /// Number of accepted TCP clients.
    pub async fn client_count(&self) -> usize {
        self.shared.sockets.lock().await.clients.len()
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.shared.stop_requested.is_cancelled()
    }

    /// Token cancelled when a stop is requested.
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop_requested.clone()
    }

    /// Open the socket and spawn the connection's I/O task.
    ///
    /// Inputs that fail to open keep retrying in the background with
    /// backoff. Outputs return the open error.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(Error::Usage("connection already started".into()));
        }
        if shared.stop_requested.is_cancelled() {
            return Err(Error::Stopped);
        }
        shared.set_state(ConnectionState::Opening);

        let direction = shared.settings.direction;
        if let Err(e) = shared.ensure_open().await {
            match direction {
                Direction::Input => shared.report_error("failed to open socket", Some(&e)),
                Direction::Output => {
                    shared.started.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }

        let is_server = shared
            .sockets
            .lock()
            .await
            .primary
            .as_ref()
            .is_some_and(Socket::is_server);
        let task = match direction {
            Direction::Input => Some(spawn_tagged(shared.id, receive_loop(shared.clone()))),
            Direction::Output if is_server => Some(spawn_tagged(shared.id, accept_loop(shared.clone()))),
            Direction::Output => None,
        };
        if let Ok(mut slot) = shared.task.lock() {
            *slot = task;
        }
        shared.set_state(ConnectionState::Running);
        info!(connection = %shared.event.source, "Connection started");
        Ok(())
    }

    /// Write one datagram or stream chunk.
    ///
    /// On a TCP server the bytes go to every connected client; clients
    /// whose write fails are dropped. With no clients the bytes are
    /// discarded.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let shared = &self.shared;
        if shared.settings.direction != Direction::Output {
            return Err(Error::Usage("send on an input connection".into()));
        }
        if !shared.started.load(Ordering::Acquire) {
            return Err(Error::Usage("connection not started".into()));
        }
        if shared.draining() || shared.force.is_cancelled() {
            return Err(Error::Stopped);
        }

        if shared.ensure_open().await? {
            info!(connection = %shared.event.source, "Output socket reopened");
        }
        let mut guard = shared.sockets.lock().await;
        let sockets = &mut *guard;
        let Some(primary) = sockets.primary.as_mut() else {
            return Err(Error::NotConnected);
        };

        if primary.is_server() {
            if sockets.clients.is_empty() {
                trace!(octets = data.len(), "No TCP clients connected; discarding");
                return Ok(());
            }
            let mut i = 0;
            while i < sockets.clients.len() {
                match sockets.clients[i].socket.write(data).await {
                    Ok(()) => i += 1,
                    Err(e) => {
                        let gone = sockets.drop_client(i).await;
                        shared.report_error(&format!("dropping TCP client {}", gone.socket.describe()), Some(&e));
                    }
                }
            }
            return Ok(());
        }

        match primary.write(data).await {
            Ok(()) => {
                trace!(octets = data.len(), "Sent");
                Ok(())
            }
            Err(e) => {
                shared.report_error("socket write failed", Some(&e));
                if e.is_connection_fatal() {
                    sockets.close_all().await;
                }
                Err(e)
            }
        }
    }

    /// Close the current sockets and open new ones.
    ///
    /// Only one reconnect runs at a time; a concurrent call fails with
    /// [`Error::AlreadyReconnecting`]. A stop cancels a running reconnect,
    /// which then returns [`Error::Stopped`].
    pub async fn reconnect(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.stop_requested.is_cancelled() {
            return Err(Error::Stopped);
        }
        if shared.reconnecting.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyReconnecting);
        }
        let _guard = ReconnectGuard(&shared.reconnecting);

        info!(connection = %shared.event.source, "Reconnecting");
        shared.set_state(ConnectionState::Reconnecting);
        let result = tokio::select! {
            biased;
            _ = shared.stop_requested.cancelled() => Err(Error::Stopped),
            r = shared.reopen() => r,
        };
        match &result {
            Ok(()) => shared.set_state(ConnectionState::Running),
            Err(Error::Stopped) => {}
            Err(e) => {
                warn!(connection = %shared.event.source, error = %e, "Reconnect failed");
                shared.set_state(ConnectionState::Running);
            }
        }
        result
    }

    /// Stop the connection.
    ///
    /// With `wait` the call returns once the I/O task has exited and the
    /// sockets are closed. It fails with [`Error::Usage`] when made from
    /// the connection's own task (for example inside a listener callback),
    /// since that task would be waiting on itself. Without `wait` the
    /// shutdown completes in the background.
    pub async fn stop(&self, wait: bool) -> Result<()> {
        let shared = &self.shared;
        if wait && in_connection_task(shared.id) {
            return Err(Error::Usage(
                "stop(wait = true) called from the connection's own task".into(),
            ));
        }

        if shared.draining.swap(true, Ordering::AcqRel) {
            // Another caller is already stopping the connection.
            if wait {
                self.closed().await;
            }
            return Ok(());
        }

        info!(connection = %shared.event.source, "Stopping connection");
        shared.set_state(ConnectionState::ShuttingDown);
        shared.stop_requested.cancel();
        if shared.settings.direction == Direction::Output {
            let mut sockets = shared.sockets.lock().await;
            for client in sockets.clients.iter_mut() {
                let _ = client.socket.shutdown().await;
            }
            if let Some(primary) = sockets.primary.as_mut() {
                let _ = primary.shutdown().await;
            }
        }

        let finisher = {
            let shared = shared.clone();
            async move {
                let handle = shared.task.lock().ok().and_then(|mut t| t.take());
                if let Some(mut handle) = handle {
                    tokio::select! {
                        _ = &mut handle => {}
                        _ = tokio::time::sleep(shared.settings.drain_grace) => {
                            warn!(connection = %shared.event.source, "Drain grace period elapsed; forcing close");
                            if let Ok(mut slot) = shared.task.lock() {
                                *slot = Some(handle);
                            }
                        }
                    }
                }
                shared.finish().await;
            }
        };

        if wait {
            finisher.await;
        } else {
            tokio::spawn(finisher);
        }
        Ok(())
    }

    /// Cancel everything without waiting. The tasks exit at their next
    /// suspension point and drop the sockets.
    pub fn abort(&self) {
        let shared = &self.shared;
        shared.draining.store(true, Ordering::Release);
        shared.stop_requested.cancel();
        shared.force.cancel();
        shared.queue.close();
    }

    /// Resolves once the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, ListenerEvent, NullListener};
    use vrtlib_core::options::TransportKind;
    use vrtlib_packet::{PacketBuilder, VrlFrame};
    use vrtlib_test_harness::{MockConnector, MockStream};
    use vrtlib_transport::NetConnector;

    fn settings(direction: Direction) -> EngineSettings {
        EngineSettings {
            read_timeout: Duration::from_millis(20),
            drain_grace: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(50),
            ..EngineSettings::new(direction)
        }
    }

    fn opts(pairs: &[(&str, &str)]) -> ConnectionOptions {
        ConnectionOptions::from_pairs(pairs.iter().copied()).unwrap()
    }

    async fn pop(conn: &Connection) -> Inbound {
        match conn.queue().pop_wait(Duration::from_secs(2)).await {
            crate::queue::PopResult::Item(item) => item,
            other => panic!("expected a unit, got {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let delays: Vec<u128> = (0..9).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 6400, 10_000, 10_000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn stream_bytes_in_small_chunks_are_reassembled() {
        let frame = VrlFrame::to_bytes(
            3,
            &[PacketBuilder::data(1).payload(&[1; 16]).build().unwrap()],
            true,
        )
        .unwrap();
        let bare = PacketBuilder::data(2).payload(&[2; 8]).build().unwrap();
        let mut wire = frame.to_vec();
        wire.extend_from_slice(bare.as_bytes());

        let stream = MockStream::new().with_inbound(&wire).with_chunk_size(1);
        let conn = Connection::new(
            Box::new(MockConnector::single(stream)),
            settings(Direction::Input),
            Arc::new(NullListener),
        );
        conn.start().await.unwrap();

        let first = pop(&conn).await;
        assert_eq!(first.unit.frame_count(), Some(3));
        let second = pop(&conn).await;
        assert_eq!(second.unit.packets()[0], bare);
        assert_eq!(first.origin, second.origin);

        conn.stop(true).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn double_start_is_a_usage_error() {
        let conn = Connection::new(
            Box::new(MockConnector::single(MockStream::new())),
            settings(Direction::Input),
            Arc::new(NullListener),
        );
        conn.start().await.unwrap();
        assert!(matches!(conn.start().await, Err(Error::Usage(_))));
        conn.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_reconnect_fails_fast() {
        let connector = MockConnector::gated();
        let gate = connector.gate();
        connector.push(MockStream::new());
        connector.push(MockStream::new());
        let conn = Connection::new(Box::new(connector), settings(Direction::Output), Arc::new(NullListener));
        gate.notify_one();
        conn.start().await.unwrap();

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.reconnect().await })
        };
        // Let the first reconnect reach the blocked open.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Reconnecting);
        assert!(matches!(conn.reconnect().await, Err(Error::AlreadyReconnecting)));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Running);
        conn.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn failed_reconnect_returns_the_open_error() {
        // One stream for start, none left for the reconnect.
        let conn = Connection::new(
            Box::new(MockConnector::single(MockStream::new())),
            settings(Direction::Output),
            Arc::new(NullListener),
        );
        conn.start().await.unwrap();

        assert!(matches!(conn.reconnect().await, Err(Error::NotConnected)));
        assert_eq!(conn.state(), ConnectionState::Running);
        // The failed attempt is over, so another may start.
        assert!(matches!(conn.reconnect().await, Err(Error::NotConnected)));
        assert!(matches!(conn.send(b"x").await, Err(Error::NotConnected)));

        conn.stop(true).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn busy_stream_is_force_closed_after_drain_grace() {
        let stream = MockStream::new();
        let feeder = stream.feeder();
        let packet = PacketBuilder::data(5).payload(&[0; 32]).build().unwrap();
        let feeding = tokio::spawn(async move {
            loop {
                feeder.feed(packet.as_bytes());
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let grace = Duration::from_millis(150);
        let conn = Connection::new(
            Box::new(MockConnector::single(stream)),
            EngineSettings {
                read_timeout: Duration::from_millis(500),
                drain_grace: grace,
                ..settings(Direction::Input)
            },
            Arc::new(NullListener),
        );
        conn.start().await.unwrap();
        pop(&conn).await;

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), conn.stop(true))
            .await
            .expect("stop must not hang on a busy stream")
            .unwrap();
        assert!(started.elapsed() >= grace);
        assert_eq!(conn.state(), ConnectionState::Closed);
        feeding.abort();
    }

    #[tokio::test]
    async fn stop_cancels_pending_reconnect() {
        let connector = MockConnector::gated();
        let gate = connector.gate();
        connector.push(MockStream::new());
        let conn = Connection::new(Box::new(connector), settings(Direction::Output), Arc::new(NullListener));
        gate.notify_one();
        conn.start().await.unwrap();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.reconnect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.stop(true).await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(Error::Stopped)));
        assert!(matches!(conn.reconnect().await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn stop_wait_from_own_task_is_rejected() {
        let conn = Connection::new(
            Box::new(MockConnector::single(MockStream::new())),
            settings(Direction::Input),
            Arc::new(NullListener),
        );
        let inner = conn.clone();
        let result = spawn_tagged(conn.id(), async move {
            assert!(matches!(inner.stop(true).await, Err(Error::Usage(_))));
            // A non-waiting stop is fine from anywhere.
            inner.stop(false).await.unwrap();
        })
        .await;
        assert!(result.is_ok());
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn output_writes_reach_the_stream() {
        let stream = MockStream::new();
        let written = stream.written();
        let conn = Connection::new(
            Box::new(MockConnector::single(stream)),
            settings(Direction::Output),
            Arc::new(NullListener),
        );
        assert!(matches!(conn.send(b"abcd").await, Err(Error::Usage(_))));
        conn.start().await.unwrap();
        conn.send(b"abcd").await.unwrap();
        conn.send(b"efgh").await.unwrap();
        assert_eq!(written.lock().unwrap().concat(), b"abcdefgh");

        conn.stop(true).await.unwrap();
        assert!(matches!(conn.send(b"late").await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn peer_eof_is_reported_and_socket_reopened() {
        let connector = MockConnector::new();
        connector.push(MockStream::new().with_inbound(PacketBuilder::data(5).build().unwrap().as_bytes()).eof_after_inbound());
        connector.push(MockStream::new().with_inbound(PacketBuilder::data(6).build().unwrap().as_bytes()));
        let (listener, mut events) = ChannelListener::new();
        let conn = Connection::new(Box::new(connector), settings(Direction::Input), Arc::new(listener));
        conn.start().await.unwrap();

        let a = pop(&conn).await;
        let b = pop(&conn).await;
        assert_eq!(a.unit.packets()[0].stream_id(), Some(5));
        assert_eq!(b.unit.packets()[0].stream_id(), Some(6));
        assert_ne!(a.origin, b.origin);

        match events.recv().await.unwrap() {
            ListenerEvent::Error { message, .. } => assert_eq!(message, "connection closed by peer"),
            other => panic!("unexpected {other:?}"),
        }
        conn.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn queue_overflow_raises_one_warning() {
        let mut wire = Vec::new();
        for _ in 0..5 {
            wire.extend_from_slice(PacketBuilder::data(1).build().unwrap().as_bytes());
        }
        let stream = MockStream::new().with_inbound(&wire);
        let (listener, mut events) = ChannelListener::new();
        let conn = Connection::new(
            Box::new(MockConnector::single(stream)),
            EngineSettings {
                queue_limit_packets: 4,
                ..settings(Direction::Input)
            },
            Arc::new(listener),
        );
        conn.start().await.unwrap();

        match events.recv().await.unwrap() {
            ListenerEvent::Warning { message, .. } => assert!(message.starts_with("receive queue full")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conn.queue().len(), 0);
        conn.stop(true).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn udp_loopback_input() {
        let input = Connection::new(
            Box::new(NetConnector::new(opts(&[("HOST", "127.0.0.1"), ("PORT", "0")]), Direction::Input)),
            settings(Direction::Input),
            Arc::new(NullListener),
        );
        input.start().await.unwrap();
        let port = input.local_addr().unwrap().port();

        let output = Connection::new(
            Box::new(NetConnector::new(
                opts(&[("HOST", "127.0.0.1"), ("PORT", &port.to_string())]),
                Direction::Output,
            )),
            settings(Direction::Output),
            Arc::new(NullListener),
        );
        output.start().await.unwrap();

        let pkt = PacketBuilder::data(42).payload(&[7; 12]).build().unwrap();
        output.send(pkt.as_bytes()).await.unwrap();
        assert_eq!(pop(&input).await.unit.packets()[0], pkt);

        output.stop(true).await.unwrap();
        input.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn tcp_server_input_reads_every_client() {
        let conn = Connection::new(
            Box::new(NetConnector::new(
                opts(&[("TRANSPORT", "TCP_SERVER"), ("HOST", "127.0.0.1"), ("PORT", "0")]),
                Direction::Input,
            )),
            settings(Direction::Input),
            Arc::new(NullListener),
        );
        conn.start().await.unwrap();
        let addr = conn.local_addr().unwrap();

        let mut a = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut b = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        a.write_all(PacketBuilder::data(1).build().unwrap().as_bytes()).await.unwrap();
        b.write_all(PacketBuilder::data(2).build().unwrap().as_bytes()).await.unwrap();

        let mut ids = vec![
            pop(&conn).await.unit.packets()[0].stream_id().unwrap(),
            pop(&conn).await.unit.packets()[0].stream_id().unwrap(),
        ];
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(conn.client_count().await, 2);

        drop(a);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.client_count().await, 1);
        conn.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn tcp_server_output_fans_out() {
        let conn = Connection::new(
            Box::new(NetConnector::new(
                opts(&[("TRANSPORT", "TCP_SERVER"), ("HOST", "127.0.0.1"), ("PORT", "0")]),
                Direction::Output,
            )),
            settings(Direction::Output),
            Arc::new(NullListener),
        );
        conn.start().await.unwrap();
        let addr = conn.local_addr().unwrap();

        // Nothing connected yet: data is discarded.
        conn.send(b"lost").await.unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        for _ in 0..300 {
            if conn.client_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.client_count().await, 1);

        conn.send(b"VRLP").await.unwrap();
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"VRLP");
        conn.stop(true).await.unwrap();
    }

    #[test]
    fn settings_from_options() {
        let o = opts(&[
            ("TRANSPORT", "TCP_CLIENT"),
            ("QUEUE_LIMIT_PACKETS", "16"),
            ("SO_TIMEOUT", "250"),
        ]);
        assert_eq!(o.transport, TransportKind::TcpClient);
        let s = EngineSettings::from_options(&o, Direction::Input);
        assert_eq!(s.queue_limit_packets, 16);
        assert_eq!(s.read_timeout, Duration::from_millis(250));
        assert_eq!(s.drain_grace, DEFAULT_DRAIN_GRACE);
    }
}
