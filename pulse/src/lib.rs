//! # Pulse
//!
//! A multi-world block-update server running on the `pulse-core` tick driver.
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    missing_docs,
    clippy::unwrap_used
)]
#![allow(
    clippy::single_call_fn,
    clippy::multiple_inherent_impl,
    clippy::shadow_unrelated,
    clippy::missing_errors_doc,
    clippy::struct_excessive_bools,
    clippy::needless_pass_by_value,
    clippy::cargo_common_metadata
)]
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use pulse_core::{DriverHandle, FatalFault, TickDriver};
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::realm::{Realm, RealmView};

/// The configuration file.
pub mod config;
/// Operator console.
pub mod console;
/// Console logging.
pub mod logger;
/// Worlds, block updates and players.
pub mod realm;
/// Hang detection.
pub mod watchdog;

/// How the server ended.
#[derive(Debug)]
pub enum Shutdown {
    /// A stop was requested and everything was saved.
    Clean,
    /// A fatal fault stopped the loop. Shutdown still ran.
    Fatal(FatalFault),
    /// The loop stopped responding for this long and was abandoned.
    Hung(Duration),
}

/// The main server struct.
pub struct PulseServer {
    /// The cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
    /// Control surface of the tick loop.
    pub handle: DriverHandle,
    /// Shared view of the worlds and players.
    pub realm: RealmView,
    max_tick_time: Duration,
    driver: Option<TickDriver<Realm>>,
    server_thread: Option<JoinHandle<Result<(), FatalFault>>>,
}

impl PulseServer {
    /// Loads the worlds and prepares the tick loop without starting it.
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        log::info!("Starting Pulse server");

        let realm = Realm::load(&config.worlds, &config.data_dir)?;
        let view = realm.view();
        let resume = realm.resume_tick();
        if resume > 0 {
            log::info!("Resuming at tick {resume}");
        }
        let driver = TickDriver::new(
            realm,
            pulse_core::SystemClock,
            config.tick.clone(),
            Realm::phases(),
        )?
        .starting_at(resume);

        Ok(Self {
            cancel_token: CancellationToken::new(),
            handle: driver.handle(),
            realm: view,
            max_tick_time: Duration::from_millis(config.max_tick_time_ms),
            driver: Some(driver),
            server_thread: None,
        })
    }

    /// Starts the tick loop on its own thread, plus the console and Ctrl-C handler.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let mut driver = self.driver.take().context("server already started")?;
        let server_thread = thread::Builder::new()
            .name("Server thread".to_owned())
            .spawn(move || driver.run())
            .context("spawning the server thread")?;
        self.server_thread = Some(server_thread);

        spawn(console::run(
            self.handle.clone(),
            self.realm.clone(),
            self.cancel_token.child_token(),
        ));

        let handle = self.handle.clone();
        let cancel_token = self.cancel_token.clone();
        spawn(async move {
            select! {
                () = cancel_token.cancelled() => {}
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        log::info!("Received Ctrl-C");
                        handle.request_stop();
                    }
                    Err(e) => log::warn!("Failed to listen for Ctrl-C: {e}"),
                },
            }
        });

        log::info!("Started Pulse server with {} world(s)", self.realm.worlds.len());
        Ok(())
    }

    /// Waits for the tick loop to end, or for the watchdog to give up on it.
    pub async fn run(mut self) -> anyhow::Result<Shutdown> {
        let server_thread = self.server_thread.take().context("server was not started")?;
        let joined = tokio::task::spawn_blocking(move || server_thread.join());
        let watchdog = watchdog::watch(
            self.handle.clone(),
            self.max_tick_time,
            self.cancel_token.child_token(),
        );

        let outcome = select! {
            joined = joined => Ok(joined?),
            Some(silent) = watchdog => Err(silent),
        };
        self.stop();

        match outcome {
            Ok(Ok(Ok(()))) => Ok(Shutdown::Clean),
            Ok(Ok(Err(fault))) => Ok(Shutdown::Fatal(fault)),
            Ok(Err(_)) => anyhow::bail!("server thread panicked"),
            Err(silent) => Ok(Shutdown::Hung(silent)),
        }
    }

    /// Asks the loop to stop and cancels the background tasks.
    pub fn stop(&self) {
        self.handle.request_stop();
        self.cancel_token.cancel();
    }
}
