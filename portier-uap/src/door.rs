//! Door and light state machine on top of a bus peer.
//!
//! Translates the drive's broadcast status bytes into a small domain
//! model (door state, light state) and user intents into command flag
//! sets. All mutable state lives inside the [`GarageDoor`] task;
//! embedders talk to it through a cloneable [`DoorHandle`] and receive
//! [`DoorEvent`]s on a channel.

use bitvec::prelude::*;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, BusPeer, TransportError};
use crate::hcp1::engine::CommandFlag;
use crate::hcp1::ProtocolError;

// Broadcast status byte 0, LSB first. Byte 1 is opaque; it is kept for
// diagnostics but never interpreted.
const BIT_DOOR_CLOSED: usize = 0;
const BIT_DOOR_OPENED: usize = 1;
#[allow(dead_code)]
const BIT_EXT_RELAY: usize = 2;
const BIT_LIGHT_ON: usize = 3;
const BIT_ERROR_ACTIVE: usize = 4;
/// 0 = opening, 1 = closing; only meaningful while the door moves.
const BIT_DOOR_DIRECTION: usize = 5;
const BIT_DOOR_MOVING: usize = 6;
const BIT_DOOR_VENTING: usize = 7;

/// Observable door position.
///
/// Discriminants line up with [`TargetDoorState`] so that a reached
/// target compares equal by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoorState {
    Open = 0,
    Closed = 1,
    Opening = 2,
    Closing = 3,
    Stopped = 4,
    Venting = 5,
}

/// Position the door is asked to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetDoorState {
    Open = 0,
    Closed = 1,
    Venting = 5,
}

impl TargetDoorState {
    /// Whether the door is already where this target points.
    pub fn matches(self, door: DoorState) -> bool {
        self as u8 == door as u8
    }

    /// The command flag that moves the door towards this target.
    pub fn command(self) -> CommandFlag {
        match self {
            Self::Open => CommandFlag::Open,
            Self::Closed => CommandFlag::Close,
            Self::Venting => CommandFlag::Venting,
        }
    }
}

/// Domain-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DoorError {
    /// The drive flags an active error; the status bits are not
    /// trustworthy while it does.
    #[error("drive reports an active error")]
    ErrorActive,

    /// A status byte whose bit pattern maps to no door state.
    #[error("unrecognized status byte {0:#04x}")]
    UnknownStatus(u8),

    /// Queried before the first broadcast or set call populated the cell.
    #[error("state not known yet")]
    NotInitialized,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events emitted towards embedders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoorEvent {
    UpdateDoor(DoorState),
    UpdateLight(bool),
    Error(DoorError),
}

/// Decodes broadcast status byte 0 into door and light state.
pub fn decode_status(byte: u8) -> Result<(DoorState, bool), DoorError> {
    let bits = byte.view_bits::<Lsb0>();
    let light = bits[BIT_LIGHT_ON];

    if bits[BIT_ERROR_ACTIVE] {
        return Err(DoorError::ErrorActive);
    }

    let door = if bits[BIT_DOOR_MOVING] {
        if bits[BIT_DOOR_DIRECTION] {
            DoorState::Closing
        } else {
            DoorState::Opening
        }
    } else if bits[BIT_DOOR_OPENED] {
        DoorState::Open
    } else if bits[BIT_DOOR_CLOSED] {
        DoorState::Closed
    } else if bits[BIT_DOOR_VENTING] {
        DoorState::Venting
    } else {
        return Err(DoorError::UnknownStatus(byte));
    };

    Ok((door, light))
}

/// Inverse of [`decode_status`] for resting and moving states; used by
/// the mock peer to synthesize broadcasts.
pub(crate) fn encode_status(door: DoorState, light: bool) -> u8 {
    let mut byte = 0u8;
    let bits = byte.view_bits_mut::<Lsb0>();

    match door {
        DoorState::Open => bits.set(BIT_DOOR_OPENED, true),
        DoorState::Closed => bits.set(BIT_DOOR_CLOSED, true),
        DoorState::Opening => bits.set(BIT_DOOR_MOVING, true),
        DoorState::Closing => {
            bits.set(BIT_DOOR_MOVING, true);
            bits.set(BIT_DOOR_DIRECTION, true);
        }
        DoorState::Venting => bits.set(BIT_DOOR_VENTING, true),
        // A stopped door has no resting bit of its own.
        DoorState::Stopped => {}
    }
    bits.set(BIT_LIGHT_ON, light);

    byte
}

/// Requests from a [`DoorHandle`] to the [`GarageDoor`] task.
enum DoorCommand {
    SetTarget(TargetDoorState, oneshot::Sender<Result<(), DoorError>>),
    SetLight(bool, oneshot::Sender<Result<(), DoorError>>),
    EmergencyStop(oneshot::Sender<Result<(), DoorError>>),
    Snapshot(oneshot::Sender<DoorSnapshot>),
}

/// Point-in-time copy of the state cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoorSnapshot {
    pub current: Option<DoorState>,
    pub target: Option<TargetDoorState>,
    pub light: Option<bool>,
}

/// The door state machine task.
///
/// Owns the current/target/light cells and the dedupe cache; nothing
/// else mutates them.
pub struct GarageDoor<P> {
    name: String,
    peer: P,
    bus_events: mpsc::Receiver<BusEvent>,
    commands: mpsc::Receiver<DoorCommand>,
    events: mpsc::Sender<DoorEvent>,

    current: Option<DoorState>,
    target: Option<TargetDoorState>,
    light: Option<bool>,
    last_broadcast: Option<[u8; 2]>,
}

impl<P: BusPeer> GarageDoor<P> {
    pub fn new(
        name: impl Into<String>,
        peer: P,
        bus_events: mpsc::Receiver<BusEvent>,
        events: mpsc::Sender<DoorEvent>,
    ) -> (Self, DoorHandle) {
        let (command_tx, commands) = mpsc::channel(8);

        let door = Self {
            name: name.into(),
            peer,
            bus_events,
            commands,
            events,
            current: None,
            target: None,
            light: None,
            last_broadcast: None,
        };

        (door, DoorHandle { commands: command_tx })
    }

    /// Runs until the bus event stream ends.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.bus_events.recv() => match event {
                    Some(BusEvent::Broadcast(status)) => self.apply_broadcast(status).await,
                    Some(BusEvent::Init(response)) => {
                        info!(door = %self.name, response = %response, "registered with the drive");
                    }
                    Some(BusEvent::Opened) => info!(door = %self.name, "bus connected"),
                    Some(BusEvent::Closed) => info!(door = %self.name, "bus disconnected"),
                    Some(BusEvent::Error(err)) => {
                        warn!(door = %self.name, %err, "bus error");
                        self.events.send(DoorEvent::Error(err.into())).await.ok();
                    }
                    None => break,
                },

                Some(command) = self.commands.recv() => self.handle_command(command).await,
            }
        }

        debug!(door = %self.name, "door task stopping");
    }

    async fn handle_command(&mut self, command: DoorCommand) {
        match command {
            DoorCommand::SetTarget(target, reply) => {
                reply.send(self.apply_set_target(target).await).ok();
            }
            DoorCommand::SetLight(on, reply) => {
                reply.send(self.apply_set_light(on).await).ok();
            }
            DoorCommand::EmergencyStop(reply) => {
                reply.send(self.apply_emergency_stop().await).ok();
            }
            DoorCommand::Snapshot(reply) => {
                reply
                    .send(DoorSnapshot {
                        current: self.current,
                        target: self.target,
                        light: self.light,
                    })
                    .ok();
            }
        }
    }

    /// Applies one broadcast. Unchanged status bytes are ignored, so
    /// decoding the same byte twice never yields a second update event.
    async fn apply_broadcast(&mut self, status: [u8; 2]) {
        if self
            .last_broadcast
            .is_some_and(|last| last[0] == status[0])
        {
            self.last_broadcast = Some(status);
            return;
        }
        self.last_broadcast = Some(status);

        match decode_status(status[0]) {
            Ok((door, light)) => {
                if self.current != Some(door) {
                    self.current = Some(door);
                    info!(door = %self.name, state = ?door, "door state");
                    self.events.send(DoorEvent::UpdateDoor(door)).await.ok();
                }
                if self.light != Some(light) {
                    self.light = Some(light);
                    info!(door = %self.name, on = light, "light state");
                    self.events.send(DoorEvent::UpdateLight(light)).await.ok();
                }
            }
            Err(err) => {
                warn!(door = %self.name, status = ?status, %err, "undecodable broadcast");
                self.events.send(DoorEvent::Error(err)).await.ok();
            }
        }
    }

    async fn apply_set_target(&mut self, target: TargetDoorState) -> Result<(), DoorError> {
        if self.target == Some(target) {
            debug!(door = %self.name, ?target, "target unchanged");
            return Ok(());
        }

        if self.current.is_some_and(|current| target.matches(current)) {
            debug!(door = %self.name, ?target, "door already in position");
            self.target = Some(target);
            return Ok(());
        }

        let sent = self.peer.push_command(&[target.command()], false).await?;
        debug!(door = %self.name, ?target, frame = %sent, "target command sent");
        self.target = Some(target);

        Ok(())
    }

    async fn apply_set_light(&mut self, on: bool) -> Result<(), DoorError> {
        if self.light == Some(on) {
            debug!(door = %self.name, on, "light unchanged");
            return Ok(());
        }

        let sent = self
            .peer
            .push_command(&[CommandFlag::ToggleLight], false)
            .await?;
        debug!(door = %self.name, on, frame = %sent, "light toggle sent");

        // The stored light state follows the next broadcast; the drive
        // sends no acknowledgement beyond that.
        Ok(())
    }

    async fn apply_emergency_stop(&mut self) -> Result<(), DoorError> {
        let sent = self.peer.push_command(&[], true).await?;
        warn!(door = %self.name, frame = %sent, "emergency stop sent");
        Ok(())
    }
}

/// Cloneable embedder surface for a running [`GarageDoor`] task.
#[derive(Clone)]
pub struct DoorHandle {
    commands: mpsc::Sender<DoorCommand>,
}

impl DoorHandle {
    pub async fn current_state(&self) -> Result<DoorState, DoorError> {
        self.snapshot().await?.current.ok_or(DoorError::NotInitialized)
    }

    pub async fn target_state(&self) -> Result<TargetDoorState, DoorError> {
        self.snapshot().await?.target.ok_or(DoorError::NotInitialized)
    }

    pub async fn light_on(&self) -> Result<bool, DoorError> {
        self.snapshot().await?.light.ok_or(DoorError::NotInitialized)
    }

    pub async fn set_target_state(&self, target: TargetDoorState) -> Result<(), DoorError> {
        let (reply, response) = oneshot::channel();
        self.request(DoorCommand::SetTarget(target, reply), response)
            .await?
    }

    pub async fn set_light_on(&self, on: bool) -> Result<(), DoorError> {
        let (reply, response) = oneshot::channel();
        self.request(DoorCommand::SetLight(on, reply), response)
            .await?
    }

    /// Halts the drive by answering the next poll with the
    /// emergency-stop mode byte.
    pub async fn emergency_stop(&self) -> Result<(), DoorError> {
        let (reply, response) = oneshot::channel();
        self.request(DoorCommand::EmergencyStop(reply), response)
            .await?
    }

    pub async fn snapshot(&self) -> Result<DoorSnapshot, DoorError> {
        let (reply, response) = oneshot::channel();
        self.request(DoorCommand::Snapshot(reply), response).await
    }

    async fn request<T>(
        &self,
        command: DoorCommand,
        response: oneshot::Receiver<T>,
    ) -> Result<T, DoorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::PortClosed)?;

        response
            .await
            .map_err(|_| DoorError::Transport(TransportError::PortClosed))
    }
}
