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

use crate::msgpack::decode_to_json;
use chrono::{DateTime, Utc};
use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::DatagramIterator;
use donet_daemon::config;
use donet_daemon::service::{DCFile, DonetService};
use log::{debug, error, info, warn};
use regex::Regex;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

use donet_network::udp;

/// Receives [`LoggedEvent`](donet_daemon::event::LoggedEvent) msgpack
/// datagrams over UDP and appends them, decoded to JSON, to a rotating
/// log file under the configured output directory.
pub struct EventLogger {
    socket: udp::Socket,
    output: String,
    log_format: String,
    rotate_interval: Duration,
    log_file: Option<File>,
}

impl EventLogger {
    async fn rotate_log(&mut self) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        // `chrono::DateTime::format` mirrors C `strftime`, same as the
        // `log-format` pattern documented in the cluster config schema.
        let filename: String = format!("{}", now.format(&self.log_format));
        let path: String = format!("{}/{}", self.output.trim_end_matches('/'), filename);

        self.log_file.take(); // drop + close the previous file, if any

        let file = match File::create_new(&path).await {
            Ok(file) => file,
            // Two rotations within the same format resolution collide on
            // the same filename; append to the existing file instead of
            // failing the service outright.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                tokio::fs::OpenOptions::new().append(true).open(&path).await?
            }
            Err(err) => return Err(err),
        };

        info!("Event Logger rotated to new log file: {}", path);
        self.log_file = Some(file);
        Ok(())
    }

    async fn process_packet(&mut self, buf: &[u8], from: SocketAddr) -> Result<()> {
        let mut dg = Datagram::default();

        if dg.add_data(buf.to_vec()).is_err() {
            warn!("Dropping oversized datagram from {}.", from);
            return Ok(());
        }

        let mut dgi = DatagramIterator::from(dg);
        let mut decoded = String::new();
        decode_to_json(&mut decoded, &mut dgi);

        if dgi.tell() != buf.len() {
            error!(
                "Received event log packet with {} extraneous byte(s) from {}.",
                buf.len() - dgi.tell(),
                from
            );
        }
        debug!("Logged event from {}: {}", from, decoded);

        let line = format!("{} {}\n", Utc::now().to_rfc3339(), decoded);

        if let Some(file) = self.log_file.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Parses the `rotate-interval` config value (e.g. `"1d"`, `"30m"`,
/// `"12h"`, `"90s"`) into a [`Duration`].
fn parse_rotate_interval(raw: &str) -> Result<Duration> {
    let pattern = Regex::new(r"^(\d+)([smhd])$").expect("static regex is valid");
    let caps = pattern
        .captures(raw)
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, format!("invalid rotate-interval: {}", raw)))?;

    let amount: u64 = caps[1].parse().expect("regex guarantees digits");
    let secs = match &caps[2] {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        _ => unreachable!("regex only captures s/m/h/d"),
    };
    Ok(Duration::from_secs(secs))
}

impl DonetService for EventLogger {
    type Service = Self;
    type Configuration = config::EventLogger;

    async fn create(conf: Self::Configuration, _dc: Option<DCFile>) -> Result<Arc<Mutex<Self::Service>>> {
        let socket = udp::Socket::bind(&conf.bind).await?;
        let rotate_interval = parse_rotate_interval(&conf.rotate_interval)?;

        Ok(Arc::new(Mutex::new(Self {
            socket,
            output: conf.output,
            log_format: conf.log_format,
            rotate_interval,
            log_file: None,
        })))
    }

    async fn start(conf: config::DonetConfig, dc: Option<DCFile>) -> Result<JoinHandle<Result<()>>> {
        let el_conf = conf
            .services
            .event_logger
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "no event-logger section in the daemon config"))?;

        let service = Self::create(el_conf, dc).await?;
        Ok(Self::spawn_async_task(Self::main(service)))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let mut guard = service.lock().await;
        guard.rotate_log().await?;

        let mut rotate_timer = interval(guard.rotate_interval);
        rotate_timer.tick().await; // first tick fires immediately; we just rotated

        let mut buf = [0_u8; 2048];

        loop {
            tokio::select! {
                _ = rotate_timer.tick() => {
                    guard.rotate_log().await?;
                }
                res = guard.socket.socket.recv_from(&mut buf) => {
                    let (len, from) = res?;
                    let data = buf[..len].to_vec();
                    guard.process_packet(&data, from).await?;
                }
            }
        }
    }
}
