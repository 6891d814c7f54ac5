// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, fs, path::PathBuf, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let home = env::var("HOME").context("no HOME dir")?;
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("gridpool");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The address of the grid manager that `gridpool worker` dials.
    /// 127.0.0.1 by default.
    pub server_ip: Option<String>,

    /// The TCP port the manager listens on and the worker dials.
    /// 45678 by default.
    pub server_port: Option<u16>,

    /// Cap on the number of workers the manager will accept at one
    /// time. Connections beyond the cap are closed immediately.
    /// 0 (unlimited) by default.
    pub worker_limit: Option<usize>,

    /// How long a worker waits for a single dial attempt before
    /// giving up on it.
    pub connect_timeout_ms: Option<u64>,

    /// How long a worker sleeps after a failed dial attempt before
    /// trying again. Retries continue until the process is shut down.
    pub reconnect_timeout_ms: Option<u64>,

    /// The manager's heartbeat period, which doubles as the worker's
    /// liveness check period. A worker that hears nothing for two full
    /// periods force-disconnects and re-dials.
    pub keep_alive_interval_ms: Option<u64>,
}

impl Config {
    pub fn server_ip(&self) -> String {
        self.server_ip.clone().unwrap_or_else(|| String::from(consts::DEFAULT_SERVER_IP))
    }

    pub fn server_port(&self) -> u16 {
        self.server_port.unwrap_or(consts::DEFAULT_SERVER_PORT)
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit.unwrap_or(0)
    }

    pub fn connect_timeout(&self) -> time::Duration {
        self.connect_timeout_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn reconnect_timeout(&self) -> time::Duration {
        self.reconnect_timeout_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::DEFAULT_RECONNECT_TIMEOUT)
    }

    pub fn keep_alive_interval(&self) -> time::Duration {
        self.keep_alive_interval_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::DEFAULT_KEEP_ALIVE_INTERVAL)
    }
}
