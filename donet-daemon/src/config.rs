/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez <me@maxrdz.com>

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! Deserializes the cluster-wide YAML configuration document.
//!
//! The struct tree mirrors every section of the configuration surface
//! one-to-one; a section being absent (`None`) is how a `donetd`
//! binary decides which services to boot on this process. Loading the
//! document itself (reading the file, handing the `&str` to
//! [`serde_yaml::from_str`]) is left to the binary crate — this module
//! only owns the shape.

use serde::Deserialize;

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DonetConfig {
    pub daemon: Daemon,
    pub global: Global,
    pub services: Services,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Daemon {
    pub name: String,
    pub id: Option<u32>,
    pub log_level: Option<String>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Global {
    pub eventlogger: Option<String>, // '<host>:<port>'
    pub dc_files: Vec<String>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Services {
    pub client_agent: Option<ClientAgent>,
    pub message_director: Option<MessageDirector>,
    pub state_server: Option<StateServer>,
    pub database_server: Option<DBServer>,
    pub dbss: Option<DBSS>,
    pub event_logger: Option<EventLogger>,
    pub metrics: Option<Metrics>,
    pub web_panel: Option<WebPanel>,
}

/// `interests_permission` in the client-agent config section.
///
/// Controls whether a connected client is allowed to open its own
/// [`CLIENT_ADD_INTEREST`](donet_core::Protocol::ClientAddInterest)
/// requests, per §4.4 of the cluster design.
#[derive(Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum InterestsPermission {
    Enabled,
    Visible,
    Disabled,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct UberDog {
    pub id: u64,
    pub class: String,
    pub anonymous: bool,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ClientAgent {
    pub bind: String, // '<host>:<port>'
    pub dc_file_hash: Option<String>,
    pub version_string: String,
    pub heartbeat_interval: u64, // seconds
    pub auth_timeout: u64,       // seconds
    #[serde(default)]
    pub uberdogs: Vec<UberDog>,
    pub interests_permission: InterestsPermission,
    pub interest_timeout: u64, // seconds
    pub relocate_allowed: bool,
    pub channel_range_min: u64,
    pub channel_range_max: u64,
    /// Selects the wire dialect client connections are parsed with.
    /// `"modern"` (the default) speaks the message catalog in this
    /// document; `"legacy"` accepts the older Panda3D/OTP framing.
    #[serde(default)]
    pub dialect: Option<String>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct MessageDirector {
    pub bind: String,             // '<host>:<port>'
    pub upstream: Option<String>, // '<host>:<port>'
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct StateServer {
    pub control_channel: u64,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct GenerateRange {
    pub min: u64,
    pub max: u64,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DBServer {
    pub control_channel: u64,
    pub backing_store: String, // connection URI for the storage backend
    pub generate: GenerateRange,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[allow(clippy::upper_case_acronyms)]
pub struct DBSS {
    pub db_channel: u64,
    pub range_min: u64,
    pub range_max: u64,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct EventLogger {
    pub bind: String,            // '<host>:<port>'
    pub output: String,          // path, relative to fs root
    pub log_format: String,      // e.g. "el-%Y-%m-%d-%H-%M-%S.log"
    pub rotate_interval: String, // e.g. "1d"
}

/// Prometheus metrics exposition. Out of scope per §1; the config
/// section is still accepted so a real exporter can be wired in
/// later without a config format break.
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Metrics {
    pub bind: String, // '<host>:<port>'
}

/// Operator web panel. Out of scope per §1, same rationale as
/// [`Metrics`].
#[derive(Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct WebPanel {
    pub name: String,
    pub bind: String, // '<host>:<port>'
    pub credentials: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_cluster_config() {
        let yaml = r#"
daemon:
  name: "donet-test-daemon"
  id: 1
  log-level: "info"
global:
  eventlogger: "127.0.0.1:7197"
  dc-files:
    - "test.dc"
services:
  message-director:
    bind: "127.0.0.1:7100"
    upstream: null
  state-server:
    control-channel: 100000
"#;
        let conf: DonetConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(conf.daemon.name, "donet-test-daemon");
        assert_eq!(conf.global.dc_files, vec!["test.dc".to_string()]);
        assert!(conf.services.message_director.is_some());
        assert!(conf.services.client_agent.is_none());
    }

    #[test]
    fn parses_client_agent_section() {
        let yaml = r#"
daemon:
  name: "donet-test-daemon"
global:
  dc-files: []
services:
  client-agent:
    bind: "0.0.0.0:6667"
    version-string: "dev"
    heartbeat-interval: 15
    auth-timeout: 60
    interests-permission: "enabled"
    interest-timeout: 10
    relocate-allowed: true
    channel-range-min: 1000000000
    channel-range-max: 1009999999
"#;
        let conf: DonetConfig = serde_yaml::from_str(yaml).unwrap();
        let ca = conf.services.client_agent.unwrap();

        assert_eq!(ca.interests_permission, InterestsPermission::Enabled);
        assert!(ca.relocate_allowed);
        assert!(ca.uberdogs.is_empty());
    }
}
