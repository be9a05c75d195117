/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use jackd_rs::{
    config::Config,
    driver::DummyDriver,
    engine::{Engine, cycle::DriverSet},
    error::EngineError,
    observability,
    server::start_server,
};
use miette::Result;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::load().await.map_err(EngineError::from)?;

    observability::init(&config).map_err(EngineError::from)?;

    info!(
        "Starting {} server '{}' at {} Hz, {} frames per period",
        config.app.name,
        config.engine.server_name,
        config.driver.sample_rate,
        config.driver.buffer_size
    );

    let (engine, signal_rx) = Engine::new(&config)?;

    let mut driver = DummyDriver::new(
        config.driver.sample_rate,
        config.driver.buffer_size,
        config.driver.capture_channels,
        config.driver.playback_channels,
    );
    engine.attach_driver(&mut driver)?;

    let watchdog = config.engine.watchdog && config.engine.realtime;
    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("jackd-rs", move |s| async move {
            start_server(&s, engine.clone(), signal_rx).await?;
            let _driver_thread = engine
                .start_driver_thread(DriverSet::new(Box::new(driver)))
                .map_err(EngineError::from)?;
            if watchdog {
                let _watchdog_thread = engine.start_watchdog().map_err(EngineError::from)?;
            }
            Ok::<(), EngineError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}
