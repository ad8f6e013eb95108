//! Module for the [LinkPump].
//!
//! It is responsible for moving traffic between the virtual interface and the
//! overlay transport. Packets read from the interface and frames received from
//! the transport are queued; on every pump tick both queues are drained
//! through the frame protocol and the address table.
//!
//! Everything runs on one task: the interface, the transport, the timer and
//! the command channel are multiplexed with [select!], so the queues and the
//! table need no locking.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    select,
    sync::{mpsc, oneshot},
    task,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::{
    channel::{DatagramTransport, VirtualInterface},
    error::DaemonError,
    packet::{ethernet_ipv4_destination, ipv4_destination, FrameType, Packet},
    protocol::{FrameProtocol, Strategy},
    switch::{AddressTable, Destination},
};

/// Extra room given to reads beyond the MTU.
pub const READ_OVERHEAD: usize = 64;

/// Consecutive failed reads after which a link gives up on that side.
pub const MAX_READ_FAILURES: u32 = 8;

/// Errors worth retrying; anything else stops the link.
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

/// Counts consecutive failed reads on one side of a link.
#[derive(Debug, Default)]
struct ReadFailures(u32);

impl ReadFailures {
    fn clear(&mut self) {
        self.0 = 0;
    }

    /// Records a failed read, handing the error back when the link should stop.
    fn record(&mut self, error: io::Error) -> Result<(), io::Error> {
        self.0 += 1;
        if !is_transient(&error) || self.0 >= MAX_READ_FAILURES {
            return Err(error);
        }
        Ok(())
    }
}

/// Link parameters taken from the configuration.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub mtu: usize,
    pub pump_interval: Duration,
    pub strategy: Strategy,
    /// The interface carries Ethernet frames rather than IP packets.
    pub tap: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            mtu: 4000,
            pump_interval: Duration::from_millis(500),
            strategy: Strategy::default(),
            tap: false,
        }
    }
}

/// Receiver of control messages from remote peers.
pub trait ControlHandler {
    fn handle_control(&mut self, source: &Destination, payload: &[u8]);
}

impl<F> ControlHandler for F
where
    F: FnMut(&Destination, &[u8]),
{
    fn handle_control(&mut self, source: &Destination, payload: &[u8]) {
        self(source, payload)
    }
}

/// Control handler that only logs what it receives.
pub struct LogControlHandler;

impl ControlHandler for LogControlHandler {
    fn handle_control(&mut self, source: &Destination, payload: &[u8]) {
        debug!(%source, len = payload.len(), "control message");
    }
}

/// A snapshot of a link's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    /// Packets read from the interface and not yet sent.
    pub read_queue: usize,
    /// Frames received from the transport and not yet delivered.
    pub write_queue: usize,
    pub routes: usize,
    /// Peers that have sent at least one keep-alive.
    pub live_peers: usize,
}

enum LinkCommand {
    Reload(AddressTable),
    Status(oneshot::Sender<LinkStatus>),
    Shutdown,
}

/// The address used to talk to a running [LinkPump].
#[derive(Debug, Clone)]
pub struct LinkHandle {
    sender: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    /// Replaces the link's address table. Frame numbering carries on from the
    /// table being replaced.
    ///
    /// Returns `false` when the link has already stopped.
    pub async fn reload(&self, table: AddressTable) -> bool {
        self.sender.send(LinkCommand::Reload(table)).await.is_ok()
    }

    /// Asks the link for its status; `None` once the link has stopped.
    pub async fn status(&self) -> Option<LinkStatus> {
        let (reply, status) = oneshot::channel();
        self.sender.send(LinkCommand::Status(reply)).await.ok()?;
        status.await.ok()
    }

    /// Stops the link. Queued traffic is dropped.
    ///
    /// Returns `false` when the link has already stopped.
    pub async fn shutdown(&self) -> bool {
        self.sender.send(LinkCommand::Shutdown).await.is_ok()
    }
}

/// Bridges a [VirtualInterface] and a [DatagramTransport].
pub struct LinkPump<I, T> {
    interface: I,
    transport: T,
    table: AddressTable,
    protocol: Box<dyn FrameProtocol>,
    /// Type of the frames built from interface packets.
    frame_type: FrameType,
    pump_interval: Duration,

    interface_buffer: Vec<u8>,
    transport_buffer: Vec<u8>,

    /// Packets from the interface, keyed by their destination address.
    read_queue: VecDeque<(Ipv4Addr, Arc<[u8]>)>,
    /// Raw frames from the transport, with their sender.
    write_queue: VecDeque<(Destination, Vec<u8>)>,

    last_seen: HashMap<Destination, Instant>,
    control: Box<dyn ControlHandler>,
    commands: mpsc::Receiver<LinkCommand>,
    span: Span,
}

impl<I, T> LinkPump<I, T>
where
    I: VirtualInterface,
    T: DatagramTransport,
{
    /// Creates a new [LinkPump] and the [LinkHandle] controlling it.
    pub fn new(
        interface: I,
        transport: T,
        table: AddressTable,
        settings: LinkSettings,
    ) -> (Self, LinkHandle) {
        let (sender, commands) = mpsc::channel(16);
        let frame_type = if settings.tap {
            FrameType::Ether
        } else {
            FrameType::Ip
        };
        let span = info_span!("link", mtu = settings.mtu, strategy = ?settings.strategy);
        let pump = Self {
            interface,
            transport,
            table,
            protocol: settings.strategy.protocol(settings.mtu),
            frame_type,
            pump_interval: settings.pump_interval,
            interface_buffer: vec![0u8; settings.mtu + READ_OVERHEAD],
            transport_buffer: vec![0u8; settings.mtu + READ_OVERHEAD],
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            last_seen: HashMap::new(),
            control: Box::new(LogControlHandler),
            commands,
            span,
        };
        (pump, LinkHandle { sender })
    }

    pub fn with_control_handler(mut self, handler: impl ControlHandler + 'static) -> Self {
        self.control = Box::new(handler);
        self
    }

    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            read_queue: self.read_queue.len(),
            write_queue: self.write_queue.len(),
            routes: self.table.len(),
            live_peers: self.last_seen.len(),
        }
    }

    /// When `destination` last sent a keep-alive.
    pub fn last_seen(&self, destination: &Destination) -> Option<Instant> {
        self.last_seen.get(destination).copied()
    }

    /// Swaps in a new address table.
    pub async fn reload(&mut self, mut table: AddressTable) {
        table.continue_sequence_from(&self.table);
        self.transport.prepare(&table).await;
        info!(routes = table.len(), "address table reloaded");
        self.table = table;
    }

    /// Queues a packet read from the interface for sending.
    pub fn queue_outbound(&mut self, packet: Arc<[u8]>) {
        let address = match self.frame_type {
            FrameType::Ether => ethernet_ipv4_destination(&packet),
            _ => ipv4_destination(&packet),
        };
        let Some(address) = address else {
            debug!(len = packet.len(), "dropping packet without an IPv4 destination");
            return;
        };
        self.read_queue.push_back((address, packet));
    }

    /// Queues a frame received from the transport for delivery.
    pub fn queue_inbound(&mut self, source: Destination, frame: Vec<u8>) {
        self.write_queue.push_back((source, frame));
    }

    /// Drains both queues: sends queued packets as frames and delivers the
    /// packets of queued frames in sequence order.
    pub async fn pump(&mut self) {
        self.flush_outbound().await;
        self.deliver_inbound().await;
    }

    async fn flush_outbound(&mut self) {
        if self.read_queue.is_empty() {
            return;
        }
        let mut groups: HashMap<Ipv4Addr, Vec<Arc<[u8]>>> = HashMap::new();
        for (address, packet) in self.read_queue.drain(..) {
            groups.entry(address).or_default().push(packet);
        }

        for (address, packets) in groups {
            let Some(destination) = self.table.destination_for(&address).cloned() else {
                warn!(%address, dropped = packets.len(), "no destination for address");
                continue;
            };
            let table = &self.table;
            let frames = self
                .protocol
                .encode(&packets, self.frame_type, &mut || table.next_sequence());
            for frame in frames {
                let bytes = frame.to_bytes();
                debug!(%destination, sequence = frame.sequence, len = bytes.len(), "sending frame");
                if let Err(error) = self.transport.send_to(&bytes, &destination).await {
                    warn!(%destination, %error, "failed to send frame");
                    break;
                }
            }
        }
    }

    async fn deliver_inbound(&mut self) {
        let mut packets = Vec::new();
        for (source, frame) in self.write_queue.drain(..) {
            match self.protocol.decode(&frame, &source) {
                Ok(decoded) => packets.extend(decoded),
                Err(error) => warn!(%source, %error, "dropping malformed frame"),
            }
        }

        // Stable, so packets of one frame keep their order.
        packets.sort_by_key(|packet| packet.sequence);
        for packet in packets {
            self.dispatch(packet).await;
        }
    }

    async fn dispatch(&mut self, packet: Packet) {
        match packet.frame_type {
            FrameType::Ip | FrameType::Ack | FrameType::Ether => {
                if let Err(error) = self.interface.write_packet(&packet.payload).await {
                    warn!(source = %packet.source, %error, "failed to write to interface");
                }
            }
            FrameType::Control => self.control.handle_control(&packet.source, &packet.payload),
            FrameType::KeepAlive => {
                self.last_seen.insert(packet.source, Instant::now());
            }
        }
    }

    /// Runs the link until it is shut down through its [LinkHandle].
    ///
    /// A failed read is retried while it looks transient. The link stops with
    /// an error once a side fails [MAX_READ_FAILURES] times in a row, fails
    /// with anything else, or the interface is closed.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        let span = self.span.clone();
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> Result<(), DaemonError> {
        let mut ticker = time::interval(self.pump_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut interface_failures = ReadFailures::default();
        let mut transport_failures = ReadFailures::default();
        self.transport.prepare(&self.table).await;
        info!("link up");
        loop {
            select! {
                result = self.interface.read_packet(&mut self.interface_buffer) => match result {
                    Ok(0) => {
                        warn!("interface closed");
                        return Err(DaemonError::InterfaceClosed);
                    }
                    Ok(size) => {
                        interface_failures.clear();
                        let packet = Arc::from(&self.interface_buffer[..size]);
                        self.queue_outbound(packet);
                    }
                    Err(error) => {
                        warn!(%error, "failed to read from interface");
                        interface_failures.record(error).map_err(DaemonError::Interface)?;
                        task::yield_now().await;
                    }
                },
                result = self.transport.recv_from(&mut self.transport_buffer) => match result {
                    Ok((size, source)) => {
                        transport_failures.clear();
                        let frame = self.transport_buffer[..size].to_vec();
                        self.queue_inbound(source, frame);
                    }
                    Err(error) => {
                        warn!(%error, "failed to receive from transport");
                        transport_failures.record(error).map_err(DaemonError::Transport)?;
                        task::yield_now().await;
                    }
                },
                _ = ticker.tick() => self.pump().await,
                Some(command) = self.commands.recv() => match command {
                    LinkCommand::Reload(table) => self.reload(table).await,
                    LinkCommand::Status(reply) => {
                        let _ = reply.send(self.status());
                    }
                    LinkCommand::Shutdown => {
                        info!("link down");
                        return Ok(());
                    }
                },
            }
        }
    }
}
