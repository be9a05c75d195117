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

use crate::{
    error::{ConfigError, ConfigResult},
    formats::{DEFAULT_PORT_MAX, Frames, SampleRate},
};
use clap::Parser;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "JACKD_RS_CONFIG")]
    config: Option<PathBuf>,
    /// Server name
    #[arg(short = 'n', long, env = "JACK_DEFAULT_SERVER")]
    name: Option<String>,
    /// Directory for sockets, FIFOs and the shm registry
    #[arg(long, env = "JACK_TMPDIR")]
    tmpdir: Option<PathBuf>,
    /// Share one server directory across users
    #[arg(long, env = "JACK_PROMISCUOUS_SERVER")]
    promiscuous: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "jackd-rs".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub server_name: String,
    pub realtime: bool,
    pub rt_priority: u8,
    #[serde(with = "serde_millis")]
    pub client_timeout: Duration,
    pub port_max: u32,
    pub temporary: bool,
    pub promiscuous: bool,
    pub tmpdir: Option<PathBuf>,
    pub memory_lock: bool,
    pub watchdog: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            realtime: true,
            rt_priority: 10,
            client_timeout: Duration::from_millis(500),
            port_max: DEFAULT_PORT_MAX,
            temporary: false,
            promiscuous: false,
            tmpdir: None,
            memory_lock: false,
            watchdog: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub sample_rate: SampleRate,
    pub buffer_size: Frames,
    pub capture_channels: u32,
    pub playback_channels: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 1_024,
            capture_channels: 2,
            playback_channels: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

impl Config {
    #[instrument]
    pub async fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let mut config = Config::load_from_file(args.config.as_deref()).await?;

        if let Some(name) = args.name {
            config.engine.server_name = name;
        }
        if let Some(tmpdir) = args.tmpdir {
            config.engine.tmpdir = Some(tmpdir);
        }
        if args.promiscuous {
            config.engine.promiscuous = true;
        }

        validate_server_name(&config.engine.server_name)?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/jackd-rs/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    pub fn server_context(&self) -> ServerContext {
        ServerContext::new(
            &self.engine.server_name,
            self.engine.tmpdir.clone(),
            self.engine.promiscuous,
        )
    }
}

fn validate_server_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() || name.contains('/') || name.contains(':') {
        Err(ConfigError::InvalidServerName(name.to_owned()))
    } else {
        Ok(())
    }
}

pub fn default_server_name() -> String {
    env::var("JACK_DEFAULT_SERVER").unwrap_or_else(|_| "default".to_owned())
}

fn default_tmpdir(promiscuous: bool) -> PathBuf {
    if let Ok(dir) = env::var("JACK_TMPDIR") {
        return PathBuf::from(dir);
    }
    if promiscuous {
        PathBuf::from("/tmp/jack")
    } else {
        PathBuf::from(format!("/tmp/jack-{}", unsafe { libc::getuid() }))
    }
}

fn promiscuous_from_env() -> bool {
    env::var("JACK_PROMISCUOUS_SERVER").is_ok()
}

lazy_static! {
    /// Fallback context for clients that do not pass an explicit server
    /// name, resolved from the environment on first use.
    static ref DEFAULT_CONTEXT: ServerContext =
        ServerContext::new(&default_server_name(), None, promiscuous_from_env());
}

/// Resolves every on-disk artifact of one server instance: the request and
/// event sockets, the inter-client FIFOs and the shm segment ids. Threaded
/// through construction on both the engine and the client side so that two
/// servers never collide.
#[derive(Debug, Clone)]
pub struct ServerContext {
    server_name: String,
    server_dir: PathBuf,
}

impl ServerContext {
    pub fn new(server_name: &str, tmpdir: Option<PathBuf>, promiscuous: bool) -> Self {
        let tmpdir = tmpdir.unwrap_or_else(|| default_tmpdir(promiscuous));
        let server_dir = tmpdir.join(format!("jack-{server_name}"));
        Self {
            server_name: server_name.to_owned(),
            server_dir,
        }
    }

    pub fn default_context() -> ServerContext {
        DEFAULT_CONTEXT.clone()
    }

    pub fn for_server(server_name: Option<&str>) -> ServerContext {
        match server_name {
            Some(name) => ServerContext::new(name, None, promiscuous_from_env()),
            None => ServerContext::default_context(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_dir(&self) -> &Path {
        &self.server_dir
    }

    pub fn request_socket_path(&self) -> PathBuf {
        self.server_dir.join("jack_0")
    }

    pub fn event_socket_path(&self) -> PathBuf {
        self.server_dir.join("jack_ack_0")
    }

    pub fn fifo_path(&self, engine_pid: u32, index: u32) -> PathBuf {
        self.server_dir
            .join(format!("jack-ack-fifo-{engine_pid}-{index}"))
    }

    /// The per-engine FIFO name prefix; clients append `-<n>`.
    pub fn fifo_prefix(&self, engine_pid: u32) -> String {
        self.server_dir
            .join(format!("jack-ack-fifo-{engine_pid}"))
            .to_string_lossy()
            .into_owned()
    }

    pub fn control_shm_id(&self) -> String {
        format!("jack-{}-control-{}", self.server_name, unsafe {
            libc::getuid()
        })
    }

    pub fn port_segment_shm_id(&self, ptype_id: u32, generation: u64) -> String {
        format!(
            "jack-{}-ports-{ptype_id}-{generation}-{}",
            self.server_name,
            unsafe { libc::getuid() }
        )
    }

    pub fn client_shm_id(&self, client_id: u32) -> String {
        format!("jack-{}-client-{client_id}-{}", self.server_name, unsafe {
            libc::getuid()
        })
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.server_dir.join("metadata.json")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_context_paths_work() {
        let ctx = ServerContext::new("default", Some(PathBuf::from("/tmp")), false);
        assert_eq!(
            ctx.request_socket_path(),
            PathBuf::from("/tmp/jack-default/jack_0")
        );
        assert_eq!(
            ctx.event_socket_path(),
            PathBuf::from("/tmp/jack-default/jack_ack_0")
        );
        assert_eq!(
            ctx.fifo_path(42, 3),
            PathBuf::from("/tmp/jack-default/jack-ack-fifo-42-3")
        );
    }

    #[test]
    fn invalid_server_names_are_rejected() {
        assert!(validate_server_name("default").is_ok());
        assert!(validate_server_name("a/b").is_err());
        assert!(validate_server_name("").is_err());
    }
}
