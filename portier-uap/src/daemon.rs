//! Daemon lifecycle management.
//!
//! Wires the serial port, bus driver and door state machine together,
//! installs signal handlers and takes everything down cleanly on
//! SIGINT/SIGTERM.

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::bus::{BusHandle, MockBusPeer};
use crate::config::Config;
use crate::door::{DoorEvent, DoorHandle, DoorState, GarageDoor};
use crate::hcp1::BusDriver;
use crate::serial::SerialPort;
use crate::tracing::prelude::*;

/// The main daemon.
pub struct Daemon {
    config: Config,
    use_mock: bool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            use_mock: false,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run against an in-process mock drive instead of a serial port.
    pub fn with_mock(mut self) -> Self {
        self.use_mock = true;
        self
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let (door_event_tx, mut door_events) = mpsc::channel::<DoorEvent>(100);

        let handle = if self.use_mock {
            info!("running against the mock bus peer");
            let (peer, bus_events) = MockBusPeer::new(DoorState::Closed, false, true);
            self.spawn_door(GarageDoor::new(
                self.config.door_name.clone(),
                peer,
                bus_events,
                door_event_tx,
            ))
        } else {
            let port = SerialPort::open(&self.config.path, &self.config.serial_config())?;
            let (reader, writer, control) = port.split();

            let (bus_event_tx, bus_events) = mpsc::channel(100);
            let (command_tx, command_rx) = mpsc::channel(16);

            let driver = BusDriver::new(
                self.config.build_parser(),
                bus_event_tx,
                command_rx,
                self.shutdown.clone(),
            );

            info!(path = %self.config.path, baud = self.config.baud_rate, "bus opened");
            self.tracker.spawn(async move {
                if let Err(err) = driver.run(reader, writer).await {
                    error!(%err, "bus driver stopped");
                }

                let stats = control.stats();
                info!(
                    bytes_read = stats.bytes_read,
                    bytes_written = stats.bytes_written,
                    "serial statistics"
                );
            });

            self.spawn_door(GarageDoor::new(
                self.config.door_name.clone(),
                BusHandle::new(command_tx),
                bus_events,
                door_event_tx,
            ))
        };

        // Surface door activity in the log.
        self.tracker.spawn(async move {
            while let Some(event) = door_events.recv().await {
                match event {
                    DoorEvent::UpdateDoor(state) => info!(?state, "door update"),
                    DoorEvent::UpdateLight(on) => info!(on, "light update"),
                    DoorEvent::Error(err) => warn!(%err, "door error"),
                }
            }
        });
        self.tracker.close();

        info!("Started.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        if let Ok(snapshot) = handle.snapshot().await {
            info!(?snapshot, "final door state");
        }

        // Initiate shutdown
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }

    fn spawn_door<P>(&self, (door, handle): (GarageDoor<P>, DoorHandle)) -> DoorHandle
    where
        P: crate::bus::BusPeer + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = door.run() => {}
                () = shutdown.cancelled() => {}
            }
        });

        handle
    }
}
