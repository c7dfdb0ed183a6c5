//! Bus peer surface shared by the live driver and the mock peer.
//!
//! The door state machine does not care where its bus events come from:
//! in production they originate in the serial [`BusDriver`] task, in
//! tests and bench setups they come from [`MockBusPeer`]. Both sides of
//! the surface are narrow on purpose: a stream of [`BusEvent`]s in, a
//! [`BusPeer::push_command`] future out.
//!
//! [`BusDriver`]: crate::hcp1::BusDriver

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::door::{encode_status, DoorState};
use crate::hcp1::engine::{
    command_bits, CommandFlag, PendingCommand, MODE_EMERGENCY_STOP, MODE_NORMAL, STATUS_RESPONSE,
};
use crate::hcp1::packet::{Packet, MASTER_ADDR};
use crate::hcp1::ProtocolError;

/// Delay before the mock peer reports a pushed command as sent.
const MOCK_SEND_DELAY: Duration = Duration::from_millis(10);

/// Delay before the mock peer broadcasts the state a command causes.
const MOCK_BROADCAST_DELAY: Duration = Duration::from_millis(100);

/// Events a bus peer emits towards the door layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The two status bytes of a cycle broadcast.
    Broadcast([u8; 2]),
    /// The drive scanned our address; carries the response we sent.
    Init(Packet),
    /// The underlying connection came up.
    Opened,
    /// The underlying connection went away.
    Closed,
    /// A protocol-level fault; the session keeps running.
    Error(ProtocolError),
}

/// Transport failures surfaced through command futures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The UART driver refused or lost the response write.
    #[error("bus write failed: {0}")]
    WriteFailed(String),

    /// The connection is gone; resubmit after reopening.
    #[error("bus connection closed")]
    PortClosed,
}

/// A peer on the drive bus that can carry door commands.
///
/// The returned future resolves with the packet that actually went out
/// on the wire, or rejects with a [`TransportError`]; it never dangles.
#[async_trait]
pub trait BusPeer: Send + Sync {
    async fn push_command(
        &self,
        flags: &[CommandFlag],
        emergency_stop: bool,
    ) -> Result<Packet, TransportError>;
}

/// Cloneable handle feeding commands into a live [`BusDriver`] task.
///
/// [`BusDriver`]: crate::hcp1::BusDriver
#[derive(Clone)]
pub struct BusHandle {
    commands: mpsc::Sender<PendingCommand>,
}

impl BusHandle {
    pub fn new(commands: mpsc::Sender<PendingCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl BusPeer for BusHandle {
    async fn push_command(
        &self,
        flags: &[CommandFlag],
        emergency_stop: bool,
    ) -> Result<Packet, TransportError> {
        let (resolver, resolved) = oneshot::channel();

        self.commands
            .send(PendingCommand {
                flags: command_bits(flags),
                emergency_stop,
                resolver,
            })
            .await
            .map_err(|_| TransportError::PortClosed)?;

        // A dropped resolver means the driver died before the next poll.
        resolved.await.map_err(|_| TransportError::PortClosed)?
    }
}

/// In-process stand-in for the drive plus bus.
///
/// Holds a mock door state and acknowledges commands after a short
/// delay. With inference enabled it also computes the state a real
/// drive would enter and emits the matching broadcast about 100 ms
/// later, which makes the door layer observable end to end without
/// hardware.
pub struct MockBusPeer {
    state: Mutex<MockState>,
    inference: bool,
    events: mpsc::Sender<BusEvent>,
}

#[derive(Debug, Clone, Copy)]
struct MockState {
    door: DoorState,
    light: bool,
    counter: u8,
}

impl MockBusPeer {
    /// Creates a mock peer and the event stream it feeds.
    ///
    /// The initial state is announced as a broadcast right away so
    /// consumers see a defined door state without pushing anything.
    pub fn new(door: DoorState, light: bool, inference: bool) -> (Self, mpsc::Receiver<BusEvent>) {
        let (events, event_rx) = mpsc::channel(16);

        let peer = Self {
            state: Mutex::new(MockState {
                door,
                light,
                counter: 1,
            }),
            inference,
            events,
        };

        peer.events
            .try_send(BusEvent::Broadcast([encode_status(door, light), 0x00]))
            .ok();

        (peer, event_rx)
    }

    /// State transition a real drive performs on a command byte.
    fn infer(state: MockState, flags: u8) -> MockState {
        let mut next = state;

        if flags & (1 << CommandFlag::ToggleLight as u8) != 0 {
            next.light = !next.light;
        }
        if flags & (1 << CommandFlag::Venting as u8) != 0 {
            next.door = DoorState::Venting;
        } else if flags & (1 << CommandFlag::Close as u8) != 0 {
            if next.door != DoorState::Closed {
                next.door = DoorState::Closing;
            }
        } else if flags & (1 << CommandFlag::Open as u8) != 0 {
            if next.door != DoorState::Open {
                next.door = DoorState::Opening;
            }
        }

        next
    }
}

#[async_trait]
impl BusPeer for MockBusPeer {
    async fn push_command(
        &self,
        flags: &[CommandFlag],
        emergency_stop: bool,
    ) -> Result<Packet, TransportError> {
        tokio::time::sleep(MOCK_SEND_DELAY).await;

        let bits = command_bits(flags);
        let mode = if emergency_stop {
            MODE_EMERGENCY_STOP
        } else {
            MODE_NORMAL
        };

        let counter = {
            let mut state = self.state.lock().expect("mock state poisoned");
            state.counter = (state.counter + 1) & 0x0f;

            if self.inference && !emergency_stop {
                *state = Self::infer(*state, bits);
                let status = [encode_status(state.door, state.light), 0x00];
                let events = self.events.clone();

                tokio::spawn(async move {
                    tokio::time::sleep(MOCK_BROADCAST_DELAY).await;
                    trace!(status = ?status, "mock broadcast");
                    events.send(BusEvent::Broadcast(status)).await.ok();
                });
            }

            state.counter
        };

        debug!(bits, emergency_stop, "mock command accepted");

        Packet::from_fields(MASTER_ADDR, counter, &[STATUS_RESPONSE, bits, mode], None)
            .map_err(|err| TransportError::WriteFailed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_reports_its_initial_state() {
        let (_peer, mut events) = MockBusPeer::new(DoorState::Closed, false, true);

        let Some(BusEvent::Broadcast(status)) = events.recv().await else {
            panic!("expected an initial broadcast");
        };
        assert_eq!(status[0], 0x01);
    }

    #[tokio::test]
    async fn mock_infers_opening_from_an_open_command() {
        let (peer, mut events) = MockBusPeer::new(DoorState::Closed, false, true);
        events.recv().await;

        let packet = peer.push_command(&[CommandFlag::Open], false).await.unwrap();
        assert_eq!(packet.payload(), [STATUS_RESPONSE, 0x01, MODE_NORMAL]);

        let Some(BusEvent::Broadcast(status)) = events.recv().await else {
            panic!("expected an inferred broadcast");
        };
        // Moving, direction up.
        assert_eq!(status[0], 0x40);
    }

    #[tokio::test]
    async fn mock_does_not_reopen_an_open_door() {
        let (peer, mut events) = MockBusPeer::new(DoorState::Open, true, true);
        events.recv().await;

        peer.push_command(&[CommandFlag::Open], false).await.unwrap();

        let Some(BusEvent::Broadcast(status)) = events.recv().await else {
            panic!("expected an inferred broadcast");
        };
        // Still open, light still on.
        assert_eq!(status[0], 0x02 | 0x08);
    }

    #[tokio::test]
    async fn mock_toggles_the_light() {
        let (peer, mut events) = MockBusPeer::new(DoorState::Closed, false, true);
        events.recv().await;

        peer.push_command(&[CommandFlag::ToggleLight], false)
            .await
            .unwrap();

        let Some(BusEvent::Broadcast(status)) = events.recv().await else {
            panic!("expected an inferred broadcast");
        };
        assert_eq!(status[0], 0x01 | 0x08);
    }

    #[tokio::test]
    async fn mock_without_inference_stays_silent() {
        let (peer, mut events) = MockBusPeer::new(DoorState::Closed, false, false);
        events.recv().await;

        peer.push_command(&[CommandFlag::Open], false).await.unwrap();

        assert!(events.try_recv().is_err());
    }
}
