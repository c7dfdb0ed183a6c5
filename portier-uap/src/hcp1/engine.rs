//! HCP1 bus protocol engine.
//!
//! The drive is the bus master: it broadcasts the door status every
//! cycle, scans slave addresses, and polls each discovered slave for
//! status. This module plays the slave side for a UAP1 accessory. The
//! synchronous [`Engine`] tracks the message counter, classifies each
//! inbound packet and synthesizes responses; the asynchronous
//! [`BusDriver`] pumps bytes between a serial port and the engine and
//! services the command queue.
//!
//! User commands never get their own bus transaction. They wait in a
//! FIFO queue and ride along in the next status response, one command
//! per poll cycle.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::ProtocolError;
use super::packet::{Packet, BROADCAST_ADDR, MASTER_ADDR, UAP1_ADDR, UAP1_TYPE};
use super::parser::FrameParser;
use crate::bus::{BusEvent, TransportError};

/// Bus scan command code, sent by the master during discovery.
pub const CMD_BUS_SCAN: u8 = 0x01;
/// Per-cycle status poll command code.
pub const CMD_STATUS_REQUEST: u8 = 0x20;
/// Command code of our status response.
pub const STATUS_RESPONSE: u8 = 0x29;

/// Mode byte of a normal status response.
pub const MODE_NORMAL: u8 = 0x10;
/// Any other mode byte halts the drive; this is the conventional value.
pub const MODE_EMERGENCY_STOP: u8 = 0x00;

/// The drive discards replies that arrive too early; hold them back at
/// least this long after the poll finished parsing.
pub const MIN_RESPONSE_DELAY: Duration = Duration::from_millis(3);

/// Counter expected before the first broadcast resynchronizes us.
const INITIAL_COUNTER: u8 = 1;

/// Door commands that can ride in a status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandFlag {
    Open = 0,
    Close = 1,
    ToggleLight = 2,
    Venting = 3,
}

/// Folds a set of flags into the command byte of a status response.
pub fn command_bits(flags: &[CommandFlag]) -> u8 {
    flags.iter().fold(0, |bits, flag| bits | 1 << (*flag as u8))
}

/// A queued user command waiting for the next status poll.
pub struct PendingCommand {
    /// Command byte, see [`command_bits`].
    pub flags: u8,
    /// Answer the poll with the emergency-stop mode byte.
    pub emergency_stop: bool,
    /// Fulfilled with the response packet once it is on the wire.
    pub resolver: oneshot::Sender<Result<Packet, TransportError>>,
}

/// What the engine wants done with a classified packet.
#[derive(Debug)]
pub enum Reaction {
    /// A cycle broadcast; the two status bytes go to the door layer.
    Broadcast([u8; 2]),
    /// A packet for us; the reply must go out within the response window.
    Reply(Reply),
    /// Some other slave's turn, nothing to do.
    Ignored,
}

/// A response frame plus what to do after it is written.
#[derive(Debug)]
pub struct Reply {
    pub packet: Packet,
    pub kind: ReplyKind,
}

#[derive(Debug)]
pub enum ReplyKind {
    /// Bus scan answer; signals that the drive now knows us.
    Scan,
    /// Status poll answer, possibly carrying a queued command.
    Status {
        resolver: Option<oneshot::Sender<Result<Packet, TransportError>>>,
    },
}

/// Synchronous protocol core: counter tracking, dispatch, command queue.
pub struct Engine {
    next_counter: u8,
    queue: VecDeque<PendingCommand>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            next_counter: INITIAL_COUNTER,
            queue: VecDeque::new(),
        }
    }

    /// The counter expected on the next inbound packet.
    pub fn next_counter(&self) -> u8 {
        self.next_counter
    }

    /// Number of commands waiting for a poll slot.
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    /// Appends a command to the queue; it is consumed by the next
    /// status poll, strictly in submission order.
    pub fn push_command(&mut self, command: PendingCommand) {
        self.queue.push_back(command);
    }

    /// Classifies one packet and advances the counter state.
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<Reaction, ProtocolError> {
        match packet.address() {
            BROADCAST_ADDR => self.handle_broadcast(packet),
            UAP1_ADDR => self.handle_addressed(packet),
            _ => {
                // Another slave's transaction. A matching counter still
                // moves the cycle along; anything else is not our turn.
                if packet.counter() == self.next_counter {
                    self.advance_counter();
                }
                Ok(Reaction::Ignored)
            }
        }
    }

    /// Rejects every queued command; called when the bus goes away.
    pub fn fail_pending(&mut self) {
        for command in self.queue.drain(..) {
            let _ = command.resolver.send(Err(TransportError::PortClosed));
        }
    }

    fn handle_broadcast(&mut self, packet: &Packet) -> Result<Reaction, ProtocolError> {
        if packet.counter() != self.next_counter {
            debug!(
                got = packet.counter(),
                expected = self.next_counter,
                "broadcast counter off, resynchronizing"
            );
        }
        self.next_counter = (packet.counter() + 1) & 0x0f;

        let payload = packet.payload();
        let status: [u8; 2] = payload
            .try_into()
            .map_err(|_| ProtocolError::BadPayloadLen(payload.len()))?;

        Ok(Reaction::Broadcast(status))
    }

    fn handle_addressed(&mut self, packet: &Packet) -> Result<Reaction, ProtocolError> {
        if packet.counter() != self.next_counter {
            return Err(ProtocolError::BadCounter {
                got: packet.counter(),
                expected: self.next_counter,
            });
        }
        self.advance_counter();

        let payload = packet.payload();
        match payload[0] {
            CMD_BUS_SCAN => {
                if payload != [CMD_BUS_SCAN, MASTER_ADDR] {
                    return Err(ProtocolError::BadScanPayload(hex::encode(payload)));
                }

                let packet = self.build_reply(&[UAP1_TYPE, UAP1_ADDR])?;
                Ok(Reaction::Reply(Reply {
                    packet,
                    kind: ReplyKind::Scan,
                }))
            }
            CMD_STATUS_REQUEST => {
                if payload.len() != 1 {
                    return Err(ProtocolError::BadPayloadLen(payload.len()));
                }

                let (command_byte, mode, resolver) = match self.queue.pop_front() {
                    Some(command) => {
                        let mode = if command.emergency_stop {
                            MODE_EMERGENCY_STOP
                        } else {
                            MODE_NORMAL
                        };
                        (command.flags, mode, Some(command.resolver))
                    }
                    None => (0x00, MODE_NORMAL, None),
                };

                let packet = self.build_reply(&[STATUS_RESPONSE, command_byte, mode])?;
                Ok(Reaction::Reply(Reply {
                    packet,
                    kind: ReplyKind::Status { resolver },
                }))
            }
            other => Err(ProtocolError::UnknownSlaveCommand(other)),
        }
    }

    /// Builds a response carrying the advanced counter, then advances
    /// once more so the next inbound packet is expected one past it.
    fn build_reply(&mut self, payload: &[u8]) -> Result<Packet, ProtocolError> {
        let packet = Packet::from_fields(MASTER_ADDR, self.next_counter, payload, None)?;
        self.advance_counter();
        Ok(packet)
    }

    fn advance_counter(&mut self) {
        self.next_counter = self.next_counter.wrapping_add(1) & 0x0f;
    }

    #[cfg(test)]
    fn force_counter(&mut self, counter: u8) {
        self.next_counter = counter;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an [`Engine`] over an async byte stream.
///
/// Owns the parser, the engine state and the single command channel, so
/// all protocol mutation happens on this task. Events go out over an
/// mpsc channel; see [`BusEvent`].
pub struct BusDriver {
    engine: Engine,
    parser: Box<dyn FrameParser>,
    events: mpsc::Sender<BusEvent>,
    commands: mpsc::Receiver<PendingCommand>,
    shutdown: CancellationToken,
}

impl BusDriver {
    pub fn new(
        parser: Box<dyn FrameParser>,
        events: mpsc::Sender<BusEvent>,
        commands: mpsc::Receiver<PendingCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine: Engine::new(),
            parser,
            events,
            commands,
            shutdown,
        }
    }

    /// Runs until the stream ends, a write fails or shutdown is
    /// requested. Pending and future commands are rejected once the
    /// driver stops.
    pub async fn run<R, W>(mut self, mut reader: R, mut writer: W) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        self.events.send(BusEvent::Opened).await.ok();

        let mut buf = [0u8; 64];
        let mut packets = Vec::new();

        let result = loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("bus stream closed");
                        break Err(TransportError::PortClosed);
                    }
                    Ok(n) => {
                        // Commands already submitted must be queued before
                        // any poll in this chunk gets its answer.
                        while let Ok(command) = self.commands.try_recv() {
                            self.engine.push_command(command);
                        }

                        let parsed_at = Instant::now();
                        packets.clear();
                        self.parser
                            .push(&buf[..n], parsed_at.into_std(), &mut packets);

                        let mut failed = None;
                        for packet in &packets {
                            if let Err(err) =
                                self.dispatch(packet, parsed_at, &mut writer).await
                            {
                                failed = Some(err);
                                break;
                            }
                        }
                        if let Some(err) = failed {
                            break Err(err);
                        }
                    }
                    Err(err) => {
                        warn!(%err, "bus read failed");
                        break Err(TransportError::PortClosed);
                    }
                },

                // On a closed channel this arm stops matching and the
                // driver keeps answering the bus regardless.
                Some(command) = self.commands.recv() => {
                    trace!(
                        flags = command.flags,
                        emergency_stop = command.emergency_stop,
                        queued = self.engine.pending_commands() + 1,
                        "command queued"
                    );
                    self.engine.push_command(command);
                },

                _ = self.shutdown.cancelled() => {
                    debug!("bus driver shutting down");
                    break Ok(());
                }
            }
        };

        self.engine.fail_pending();
        self.events.send(BusEvent::Closed).await.ok();
        result
    }

    async fn dispatch<W>(
        &mut self,
        packet: &Packet,
        parsed_at: Instant,
        writer: &mut W,
    ) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match self.engine.handle_packet(packet) {
            Ok(Reaction::Broadcast(status)) => {
                self.events.send(BusEvent::Broadcast(status)).await.ok();
                Ok(())
            }
            Ok(Reaction::Reply(reply)) => self.send_reply(reply, parsed_at, writer).await,
            Ok(Reaction::Ignored) => Ok(()),
            Err(err) => {
                warn!(%err, packet = %packet, "protocol error");
                self.events.send(BusEvent::Error(err)).await.ok();
                Ok(())
            }
        }
    }

    async fn send_reply<W>(
        &mut self,
        reply: Reply,
        parsed_at: Instant,
        writer: &mut W,
    ) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        tokio::time::sleep_until(parsed_at + MIN_RESPONSE_DELAY).await;

        let written = async {
            writer.write_all(reply.packet.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                trace!(frame = %reply.packet, "response sent");
                match reply.kind {
                    ReplyKind::Scan => {
                        info!("drive scanned us, initialization done");
                        self.events.send(BusEvent::Init(reply.packet)).await.ok();
                    }
                    ReplyKind::Status { resolver: Some(resolver) } => {
                        let _ = resolver.send(Ok(reply.packet));
                    }
                    ReplyKind::Status { resolver: None } => {}
                }
                Ok(())
            }
            Err(err) => {
                let failed = TransportError::WriteFailed(err.to_string());
                if let ReplyKind::Status { resolver: Some(resolver) } = reply.kind {
                    let _ = resolver.send(Err(failed.clone()));
                }
                Err(failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcp1::parser::{ParserConfig, StrictParser};

    fn packet(hex_str: &str) -> Packet {
        Packet::from_bytes(&hex::decode(hex_str).unwrap()).unwrap()
    }

    fn command(flags: &[CommandFlag], emergency_stop: bool) -> (PendingCommand, oneshot::Receiver<Result<Packet, TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingCommand {
                flags: command_bits(flags),
                emergency_stop,
                resolver: tx,
            },
            rx,
        )
    }

    #[test]
    fn bus_scan_is_answered_and_counter_advances_twice() {
        let mut engine = Engine::new();
        engine.force_counter(13);

        let reaction = engine.handle_packet(&packet("28d2018022")).unwrap();
        let Reaction::Reply(reply) = reaction else {
            panic!("expected a reply");
        };

        assert!(matches!(reply.kind, ReplyKind::Scan));
        assert_eq!(reply.packet.hex_string(), "80e21428cb");
        assert_eq!(reply.packet.counter(), 14);
        assert_eq!(engine.next_counter(), 15);
    }

    #[test]
    fn empty_queue_yields_the_default_status_response() {
        let mut engine = Engine::new();
        engine.force_counter(13);

        let reaction = engine.handle_packet(&packet("28d1208c")).unwrap();
        let Reaction::Reply(reply) = reaction else {
            panic!("expected a reply");
        };

        assert_eq!(reply.packet.address(), MASTER_ADDR);
        assert_eq!(reply.packet.counter(), 0x0e);
        assert_eq!(reply.packet.payload(), [STATUS_RESPONSE, 0x00, MODE_NORMAL]);
        assert!(reply.packet.is_valid());
    }

    #[test]
    fn queued_command_rides_the_next_poll() {
        let mut engine = Engine::new();
        engine.force_counter(13);

        let (cmd, _rx) = command(&[CommandFlag::Open], false);
        engine.push_command(cmd);

        let reaction = engine.handle_packet(&packet("28d1208c")).unwrap();
        let Reaction::Reply(reply) = reaction else {
            panic!("expected a reply");
        };

        assert_eq!(reply.packet.payload(), [STATUS_RESPONSE, 0x01, MODE_NORMAL]);
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn emergency_stop_clears_the_mode_byte() {
        let mut engine = Engine::new();
        engine.force_counter(13);

        let (cmd, _rx) = command(&[], true);
        engine.push_command(cmd);

        let reaction = engine.handle_packet(&packet("28d1208c")).unwrap();
        let Reaction::Reply(reply) = reaction else {
            panic!("expected a reply");
        };

        assert_eq!(
            reply.packet.payload(),
            [STATUS_RESPONSE, 0x00, MODE_EMERGENCY_STOP]
        );
    }

    #[test]
    fn commands_are_consumed_in_submission_order() {
        let mut engine = Engine::new();

        let (first, _rx1) = command(&[CommandFlag::Open], false);
        let (second, _rx2) = command(&[CommandFlag::ToggleLight], false);
        engine.push_command(first);
        engine.push_command(second);

        for expected_bits in [0x01u8, 0x04] {
            let counter = engine.next_counter();
            let poll =
                Packet::from_fields(UAP1_ADDR, counter, &[CMD_STATUS_REQUEST], None).unwrap();
            let Reaction::Reply(reply) = engine.handle_packet(&poll).unwrap() else {
                panic!("expected a reply");
            };
            assert_eq!(reply.packet.payload()[1], expected_bits);
        }
    }

    #[test]
    fn broadcast_publishes_status_and_resyncs() {
        let mut engine = Engine::new();
        engine.force_counter(13);

        let reaction = engine.handle_packet(&packet("00d20e0218")).unwrap();
        let Reaction::Broadcast(status) = reaction else {
            panic!("expected a broadcast");
        };

        assert_eq!(status, [0x0e, 0x02]);
        assert_eq!(engine.next_counter(), 14);
    }

    #[test]
    fn broadcast_resyncs_even_from_an_impossible_counter() {
        let mut engine = Engine::new();
        engine.force_counter(255);

        let bcast = Packet::from_fields(BROADCAST_ADDR, 8, &[0x0e, 0x02], None).unwrap();
        let reaction = engine.handle_packet(&bcast).unwrap();

        assert!(matches!(reaction, Reaction::Broadcast(_)));
        assert_eq!(engine.next_counter(), 9);
    }

    #[test]
    fn broadcast_with_wrong_payload_len_is_rejected() {
        let mut engine = Engine::new();

        let bcast = Packet::from_fields(BROADCAST_ADDR, 1, &[0x0e, 0x02, 0x00], None).unwrap();
        let err = engine.handle_packet(&bcast).unwrap_err();

        assert_eq!(err, ProtocolError::BadPayloadLen(3));
        // The counter still resynchronized off the broadcast.
        assert_eq!(engine.next_counter(), 2);
    }

    #[test]
    fn counter_mismatch_on_addressed_packet_is_an_error() {
        let mut engine = Engine::new();
        engine.force_counter(5);

        let err = engine.handle_packet(&packet("28d1208c")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::BadCounter {
                got: 13,
                expected: 5
            }
        );
        // Not consumed; the next matching packet works.
        assert_eq!(engine.next_counter(), 5);
    }

    #[test]
    fn unknown_slave_command_is_reported() {
        let mut engine = Engine::new();

        let poll = Packet::from_fields(UAP1_ADDR, 1, &[0x42], None).unwrap();
        let err = engine.handle_packet(&poll).unwrap_err();

        assert_eq!(err, ProtocolError::UnknownSlaveCommand(0x42));
    }

    #[test]
    fn malformed_scan_payload_is_reported() {
        let mut engine = Engine::new();

        let scan = Packet::from_fields(UAP1_ADDR, 1, &[CMD_BUS_SCAN, 0x00], None).unwrap();
        let err = engine.handle_packet(&scan).unwrap_err();

        assert!(matches!(err, ProtocolError::BadScanPayload(_)));
    }

    #[test]
    fn other_slaves_advance_the_counter_only_on_match() {
        let mut engine = Engine::new();
        engine.force_counter(3);

        let other = Packet::from_fields(0x30, 3, &[0x20], None).unwrap();
        assert!(matches!(
            engine.handle_packet(&other).unwrap(),
            Reaction::Ignored
        ));
        assert_eq!(engine.next_counter(), 4);

        let stale = Packet::from_fields(0x30, 9, &[0x20], None).unwrap();
        assert!(matches!(
            engine.handle_packet(&stale).unwrap(),
            Reaction::Ignored
        ));
        assert_eq!(engine.next_counter(), 4);
    }

    async fn driver_fixture() -> (
        tokio::io::DuplexStream,
        mpsc::Receiver<BusEvent>,
        mpsc::Sender<PendingCommand>,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), TransportError>>,
    ) {
        let (near, far) = tokio::io::duplex(256);
        let (read_half, write_half) = tokio::io::split(near);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let driver = BusDriver::new(
            Box::new(StrictParser::new(ParserConfig::default())),
            event_tx,
            command_rx,
            shutdown.clone(),
        );
        let handle = tokio::spawn(driver.run(read_half, write_half));

        (far, event_rx, command_tx, shutdown, handle)
    }

    #[tokio::test]
    async fn driver_answers_a_poll_cycle() {
        let (mut bus, mut events, commands, shutdown, handle) = driver_fixture().await;
        assert!(matches!(events.recv().await, Some(BusEvent::Opened)));

        // Broadcast resyncs the counter to 14, poll at 14 gets answered.
        bus.write_all(&hex::decode("00d20e0218").unwrap())
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(BusEvent::Broadcast([0x0e, 0x02]))
        ));

        let (tx, rx) = oneshot::channel();
        commands
            .send(PendingCommand {
                flags: command_bits(&[CommandFlag::Open]),
                emergency_stop: false,
                resolver: tx,
            })
            .await
            .unwrap();

        let poll = Packet::from_fields(UAP1_ADDR, 14, &[CMD_STATUS_REQUEST], None).unwrap();
        bus.write_all(poll.as_bytes()).await.unwrap();

        let mut response = [0u8; 6];
        bus.read_exact(&mut response).await.unwrap();
        let response = Packet::from_bytes(&response).unwrap();

        assert_eq!(response.counter(), 15);
        assert_eq!(response.payload(), [STATUS_RESPONSE, 0x01, MODE_NORMAL]);
        assert_eq!(rx.await.unwrap().unwrap(), response);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(matches!(events.recv().await, Some(BusEvent::Closed)));
    }

    #[tokio::test]
    async fn driver_emits_init_after_a_scan() {
        let (mut bus, mut events, _commands, shutdown, handle) = driver_fixture().await;
        assert!(matches!(events.recv().await, Some(BusEvent::Opened)));

        // Broadcast resyncs to 14, then the drive scans our address.
        bus.write_all(&hex::decode("00d20e0218").unwrap())
            .await
            .unwrap();
        events.recv().await;

        bus.write_all(&hex::decode("28e20180c3").unwrap())
            .await
            .unwrap();

        let mut response = [0u8; 5];
        bus.read_exact(&mut response).await.unwrap();
        let response = Packet::from_bytes(&response).unwrap();

        assert_eq!(response.hex_string(), "80f2142869");
        assert_eq!(events.recv().await, Some(BusEvent::Init(response)));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closing_the_bus_rejects_pending_commands() {
        let (bus, _events, commands, _shutdown, handle) = driver_fixture().await;

        let (tx, rx) = oneshot::channel();
        commands
            .send(PendingCommand {
                flags: command_bits(&[CommandFlag::Close]),
                emergency_stop: false,
                resolver: tx,
            })
            .await
            .unwrap();

        // Give the driver a moment to pull the command off the channel.
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(bus);

        assert!(matches!(rx.await.unwrap(), Err(TransportError::PortClosed)));
        assert!(matches!(
            handle.await.unwrap(),
            Err(TransportError::PortClosed)
        ));
    }
}
