//! VRT reader: receive path from the queue to the listener.
//!
//! A reader owns an input [`Connection`] plus one dispatch task. The
//! dispatch task pops decoded units off the receive queue, checks frame and
//! packet counters for loss, runs initial context acquisition, and then
//! calls the listener. All per-session state (sequence trackers and the
//! acquirer) lives inside that task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use vrtlib_core::error::{Error, Result};
use vrtlib_core::options::{ConnectionOptions, Direction, InitialTimeout};
use vrtlib_packet::{Packet, SequenceTracker};
use vrtlib_transport::{Connector, NetConnector};

use crate::initial_context::{ContextAcquirer, Disposition};
use crate::io::{Connection, ConnectionState, EngineSettings, in_connection_task, spawn_tagged};
use crate::listener::{InitialContext, VrtEvent, VrtListener};
use crate::queue::{Inbound, PopResult};

/// Longest the dispatch task sleeps on an empty queue.
const IDLE_POLL: Duration = Duration::from_millis(250);

pub struct VrtReader {
    connection: Connection,
    initial_timeout: InitialTimeout,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl VrtReader {
    /// A reader on real sockets described by `options`.
    pub fn new(options: ConnectionOptions, listener: Arc<dyn VrtListener>) -> Self {
        let settings = EngineSettings::from_options(&options, Direction::Input);
        let initial_timeout = options.initial_timeout;
        let connector = NetConnector::new(options, Direction::Input);
        Self::with_settings(Box::new(connector), settings, initial_timeout, listener)
    }

    /// A reader whose sockets come from `connector`.
    pub fn with_connector(
        connector: Box<dyn Connector>,
        options: &ConnectionOptions,
        listener: Arc<dyn VrtListener>,
    ) -> Self {
        let settings = EngineSettings::from_options(options, Direction::Input);
        Self::with_settings(connector, settings, options.initial_timeout, listener)
    }

    pub fn with_settings(
        connector: Box<dyn Connector>,
        settings: EngineSettings,
        initial_timeout: InitialTimeout,
        listener: Arc<dyn VrtListener>,
    ) -> Self {
        let settings = EngineSettings {
            direction: Direction::Input,
            ..settings
        };
        Self {
            connection: Connection::new(connector, settings, listener),
            initial_timeout,
            dispatch: Mutex::new(None),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.connection.local_addr()
    }

    /// Open the socket and start receiving.
    pub async fn start(&self) -> Result<()> {
        self.connection.start().await?;
        let dispatcher = Dispatcher {
            connection: self.connection.clone(),
            acquirer: ContextAcquirer::new(self.initial_timeout),
            trackers: HashMap::new(),
            retired: Vec::new(),
        };
        let handle = spawn_tagged(self.connection.id(), dispatcher.run());
        if let Ok(mut slot) = self.dispatch.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connection.reconnect().await
    }

    /// Stop receiving. With `wait`, returns once every queued packet has
    /// been dispatched and the sockets are closed.
    pub async fn stop(&self, wait: bool) -> Result<()> {
        if wait && in_connection_task(self.connection.id()) {
            return Err(Error::Usage(
                "stop(wait = true) called from a reader callback".into(),
            ));
        }
        self.connection.stop(wait).await?;
        if wait {
            let handle = self.dispatch.lock().ok().and_then(|mut h| h.take());
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
        Ok(())
    }
}

impl Drop for VrtReader {
    fn drop(&mut self) {
        if self.connection.state() != ConnectionState::Closed {
            self.connection.abort();
        }
    }
}

impl std::fmt::Debug for VrtReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrtReader")
            .field("connection", &self.connection)
            .field("initial_timeout", &self.initial_timeout)
            .finish()
    }
}

struct Dispatcher {
    connection: Connection,
    acquirer: ContextAcquirer,
    /// Sequence state per socket, keyed by queue origin.
    trackers: HashMap<u64, SequenceTracker>,
    /// Closed origins whose trackers go once the queue drains.
    retired: Vec<u64>,
}

impl Dispatcher {
    fn event(&self) -> &VrtEvent {
        self.connection.event()
    }

    fn listener(&self) -> &dyn VrtListener {
        self.connection.listener().as_ref()
    }

    async fn run(mut self) {
        debug!(connection = %self.event().source, "Dispatch started");
        loop {
            let wait = match self.acquirer.deadline() {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(IDLE_POLL),
                None => IDLE_POLL,
            };
            match self.connection.queue().pop_wait(wait).await {
                PopResult::Item(inbound) => self.dispatch(inbound),
                PopResult::Empty => {}
                PopResult::Closed => break,
            }
            self.prune_trackers();
            if let Some(ic) = self.acquirer.poll_timeout(Instant::now()) {
                self.deliver_initial(&ic);
            }
        }
        debug!(connection = %self.event().source, "Dispatch exited");
    }

    /// Forget sequence state of closed sockets. Units from a closed socket
    /// may still be queued, so pruning waits for an empty queue.
    fn prune_trackers(&mut self) {
        self.retired.extend(self.connection.take_retired_origins());
        if self.retired.is_empty() || !self.connection.queue().is_empty() {
            return;
        }
        for origin in self.retired.drain(..) {
            self.trackers.remove(&origin);
        }
        trace!(live = self.trackers.len(), "Pruned sequence trackers");
    }

    fn dispatch(&mut self, inbound: Inbound) {
        let tracker = self.trackers.entry(inbound.origin).or_default();
        let mut gaps = Vec::new();
        if let Some(count) = inbound.unit.frame_count() {
            gaps.extend(tracker.observe_frame(count));
        }
        let packets = inbound.unit.into_packets();
        let mut per_packet = Vec::with_capacity(packets.len());
        for packet in &packets {
            per_packet.push(tracker.observe_packet(packet));
        }
        for gap in gaps {
            self.warn(&gap.to_string());
        }
        for (packet, gap) in packets.into_iter().zip(per_packet) {
            if let Some(gap) = gap {
                self.warn(&gap.to_string());
            }
            self.deliver(packet);
        }
    }

    fn deliver(&mut self, packet: Packet) {
        let disposition = self.acquirer.accept(packet.clone(), Instant::now());
        for message in self.acquirer.take_warnings() {
            self.warn(&message);
        }
        let event = self.connection.event().clone();
        match disposition {
            Disposition::Absorbed => {
                trace!(stream_id = ?packet.stream_id(), "Held for initial context");
            }
            Disposition::Complete(ic) => self.deliver_initial(&ic),
            Disposition::Raw => self.listener().received_packet(&event, &packet),
            Disposition::Deliver if packet.is_context() => {
                self.listener().received_context_packet(&event, &packet)
            }
            Disposition::Deliver => self.listener().received_data_packet(&event, &packet),
        }
    }

    fn deliver_initial(&self, ic: &InitialContext) {
        info!(
            connection = %self.event().source,
            streams = ic.all_context.len(),
            error = ?ic.error_message,
            "Initial context ready"
        );
        self.listener().received_initial_context(self.event(), ic);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(connection = %self.event().source, "{message}");
        self.listener().warning_occurred(self.event(), message, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ChannelListener, ListenerEvent};
    use vrtlib_packet::{ContextBuilder, PacketBuilder, VrlFrame};
    use vrtlib_test_harness::{MockConnector, MockStream, MockTcpServer, fixtures};

    fn opts(initial_timeout: &str) -> ConnectionOptions {
        ConnectionOptions::from_pairs([
            ("TRANSPORT", "TCP_CLIENT"),
            ("HOST", "127.0.0.1"),
            ("SO_TIMEOUT", "20"),
            ("INITIAL_TIMEOUT", initial_timeout),
        ])
        .unwrap()
    }

    fn data(id: u32, count: u8) -> Packet {
        PacketBuilder::data(id)
            .packet_count(count)
            .payload(&[0; 16])
            .build()
            .unwrap()
    }

    fn reader_over(wire: &[u8], initial_timeout: &str) -> (VrtReader, tokio::sync::mpsc::UnboundedReceiver<ListenerEvent>) {
        let (listener, rx) = ChannelListener::new();
        let stream = MockStream::new().with_inbound(wire);
        let reader = VrtReader::with_connector(
            Box::new(MockConnector::single(stream)),
            &opts(initial_timeout),
            Arc::new(listener),
        );
        (reader, rx)
    }

    async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("listener event")
            .expect("channel open")
    }

    #[tokio::test]
    async fn initial_context_then_steady_state() {
        let ctx = ContextBuilder::new(100).sample_rate(1e6).build().unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(data(100, 0).as_bytes());
        wire.extend_from_slice(ctx.as_bytes());
        wire.extend_from_slice(data(100, 1).as_bytes());

        let (reader, mut rx) = reader_over(&wire, "5");
        reader.start().await.unwrap();

        match next(&mut rx).await {
            ListenerEvent::InitialContext(ic) => {
                assert!(ic.error_message.is_none());
                assert_eq!(ic.all_context.len(), 1);
                assert_eq!(ic.all_context.get(&100), Some(&ctx));
                assert_eq!(ic.paired_data.unwrap().packet_count(), 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut rx).await {
            ListenerEvent::DataPacket(p) => assert_eq!(p.packet_count(), 1),
            other => panic!("unexpected {other:?}"),
        }
        reader.stop(true).await.unwrap();
        assert_eq!(reader.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reversed_order_gives_same_initial_context() {
        let ctx = ContextBuilder::new(100).sample_rate(1e6).build().unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(ctx.as_bytes());
        wire.extend_from_slice(data(100, 0).as_bytes());

        let (reader, mut rx) = reader_over(&wire, "5");
        reader.start().await.unwrap();
        match next(&mut rx).await {
            ListenerEvent::InitialContext(ic) => {
                assert!(ic.error_message.is_none());
                assert_eq!(ic.primary_context, Some(ctx.clone()));
                assert_eq!(ic.all_context.get(&100), Some(&ctx));
            }
            other => panic!("unexpected {other:?}"),
        }
        reader.stop(true).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_without_context_then_steady_state() {
        let (listener, mut rx) = ChannelListener::new();
        let connector = MockConnector::new();
        let stream = MockStream::new().with_inbound(data(100, 0).as_bytes());
        let feeder = stream.feeder();
        connector.push(stream);
        let reader = VrtReader::with_connector(Box::new(connector), &opts("0.2"), Arc::new(listener));
        reader.start().await.unwrap();

        match next(&mut rx).await {
            ListenerEvent::InitialContext(ic) => {
                assert!(ic.error_message.unwrap().contains("no context stream"));
                assert_eq!(ic.paired_data.unwrap().stream_id(), Some(100));
            }
            other => panic!("unexpected {other:?}"),
        }

        feeder.feed(data(100, 1).as_bytes());
        feeder.feed(ContextBuilder::new(100).bandwidth(1e3).build().unwrap().as_bytes());
        assert!(matches!(next(&mut rx).await, ListenerEvent::DataPacket(_)));
        assert!(matches!(next(&mut rx).await, ListenerEvent::ContextPacket(_)));
        reader.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn packet_gap_is_reported_and_delivery_continues() {
        let mut wire = Vec::new();
        for count in [0, 1, 3] {
            wire.extend_from_slice(data(7, count).as_bytes());
        }
        let (reader, mut rx) = reader_over(&wire, "-2");
        reader.start().await.unwrap();

        let mut delivered = Vec::new();
        let mut warnings = Vec::new();
        while delivered.len() < 3 {
            match next(&mut rx).await {
                ListenerEvent::Packet(p) => delivered.push(p.packet_count()),
                ListenerEvent::Warning { message, .. } => warnings.push(message),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delivered, vec![0, 1, 3]);
        assert_eq!(warnings, vec!["missed packets 2 (inclusive) to 3 (exclusive)".to_string()]);
        reader.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn frame_gap_is_reported() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&VrlFrame::to_bytes(4, &[data(1, 0)], false).unwrap());
        wire.extend_from_slice(&VrlFrame::to_bytes(6, &[data(1, 1)], false).unwrap());
        let (reader, mut rx) = reader_over(&wire, "-2");
        reader.start().await.unwrap();

        assert!(matches!(next(&mut rx).await, ListenerEvent::Packet(_)));
        match next(&mut rx).await {
            ListenerEvent::Warning { message, .. } => {
                assert_eq!(message, "missed frames 5 (inclusive) to 6 (exclusive)")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next(&mut rx).await, ListenerEvent::Packet(_)));
        reader.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn stop_wait_inside_callback_is_rejected() {
        struct StopInCallback {
            reader: Mutex<Option<Arc<VrtReader>>>,
            result: tokio::sync::mpsc::UnboundedSender<Result<()>>,
        }

        impl VrtListener for StopInCallback {
            fn received_packet(&self, _event: &VrtEvent, _packet: &Packet) {
                let reader = self.reader.lock().unwrap().clone();
                if let Some(reader) = reader {
                    let result = poll_once(reader.stop(true));
                    let _ = self.result.send(result);
                }
            }
        }

        // stop(wait) rejects before its first await, so polling it once is enough.
        fn poll_once<F: std::future::Future>(fut: F) -> F::Output {
            let mut fut = std::pin::pin!(fut);
            let waker = std::task::Waker::noop();
            let mut cx = std::task::Context::from_waker(waker);
            match fut.as_mut().poll(&mut cx) {
                std::task::Poll::Ready(out) => out,
                std::task::Poll::Pending => panic!("stop(wait) should fail immediately"),
            }
        }

        let (tx, mut results) = tokio::sync::mpsc::unbounded_channel();
        let listener = Arc::new(StopInCallback {
            reader: Mutex::new(None),
            result: tx,
        });
        let stream = MockStream::new().with_inbound(data(1, 0).as_bytes());
        let reader = Arc::new(VrtReader::with_connector(
            Box::new(MockConnector::single(stream)),
            &opts("-2"),
            listener.clone(),
        ));
        *listener.reader.lock().unwrap() = Some(reader.clone());
        reader.start().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Usage(_))));

        listener.reader.lock().unwrap().take();
        reader.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn trackers_of_closed_sockets_are_pruned() {
        let connector = MockConnector::new();
        connector.push(MockStream::new().with_inbound(data(1, 0).as_bytes()).eof_after_inbound());
        connector.push(MockStream::new().with_inbound(data(1, 0).as_bytes()));
        let settings = EngineSettings {
            backoff_initial: Duration::from_millis(5),
            ..EngineSettings::from_options(&opts("-2"), Direction::Input)
        };
        let connection = Connection::new(Box::new(connector), settings, Arc::new(crate::listener::NullListener));
        connection.start().await.unwrap();
        let mut dispatcher = Dispatcher {
            connection: connection.clone(),
            acquirer: ContextAcquirer::new(InitialTimeout::Legacy),
            trackers: HashMap::new(),
            retired: Vec::new(),
        };

        let mut origins = Vec::new();
        while origins.len() < 2 {
            match connection.queue().pop_wait(Duration::from_secs(3)).await {
                PopResult::Item(inbound) => {
                    origins.push(inbound.origin);
                    dispatcher.dispatch(inbound);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_ne!(origins[0], origins[1]);
        assert_eq!(dispatcher.trackers.len(), 2);

        dispatcher.prune_trackers();
        assert_eq!(dispatcher.trackers.keys().copied().collect::<Vec<_>>(), vec![origins[1]]);
        assert!(dispatcher.retired.is_empty());
        connection.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn double_start_fails() {
        let (reader, _rx) = reader_over(&[], "-1");
        reader.start().await.unwrap();
        assert!(matches!(reader.start().await, Err(Error::Usage(_))));
        reader.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn split_tcp_segments_from_a_live_peer() {
        let ctx = fixtures::context_packet(42, 8e6);
        let mut wire = fixtures::frame(0, &[ctx.clone(), fixtures::data_packet(42, 0, 40)], true).to_vec();
        wire.extend_from_slice(&fixtures::frame(1, &[fixtures::data_packet(42, 1, 40)], true));

        let mut server = MockTcpServer::new().await.unwrap();
        server.send_on_accept(&wire);
        server.chunked(7, Duration::from_millis(1));
        server.start();

        let mut options = opts("5");
        options.port = server.port();
        let (listener, mut rx) = ChannelListener::new();
        let reader = VrtReader::new(options, Arc::new(listener));
        reader.start().await.unwrap();

        match next(&mut rx).await {
            ListenerEvent::InitialContext(ic) => {
                assert_eq!(ic.primary_context, Some(ctx));
                assert_eq!(ic.paired_data.unwrap().packet_count(), 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&mut rx).await {
            ListenerEvent::DataPacket(p) => assert_eq!(p.packet_count(), 1),
            other => panic!("unexpected {other:?}"),
        }
        reader.stop(true).await.unwrap();
        assert!(server.wait().await.unwrap().is_empty());
    }
}
