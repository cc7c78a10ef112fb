// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! UDP JSON telemetry channel: a single bound client, a 512-byte receive buffer,
//! and a `connect`/`disconnect`/rate-gated-stream command set driven off one
//! shared timer tick.

use crate::datalog::DataLog;
use crate::error::TelemetryError;
use crate::farm::Farm;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const RECV_BUFFER_LEN: usize = 512;
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(120);
const TIMER_TICK: Duration = Duration::from_millis(50);
const CHUNK_SIZE: usize = 20;
const CHUNK_SPACING: Duration = Duration::from_millis(10);

const RATE_OFF: i64 = -3;
const RATE_ONE_TIME: i64 = -2;
const RATE_ON_CHANGE: i64 = -1;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RateSpec {
    Off,
    OneTime,
    OnChange,
    Periodic(u64),
}

impl RateSpec {
    fn from_i64(rate: i64) -> Option<Self> {
        match rate {
            RATE_OFF => Some(RateSpec::Off),
            RATE_ONE_TIME => Some(RateSpec::OneTime),
            RATE_ON_CHANGE => Some(RateSpec::OnChange),
            ms if ms >= 1 => Some(RateSpec::Periodic(ms as u64)),
            _ => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
struct Request {
    #[serde(default)]
    id: Option<u64>,
    command: String,
    #[serde(default)]
    return_port: Option<u16>,
    #[serde(default)]
    miner_id: Option<u32>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    rate: Option<i64>,
    #[serde(default)]
    delta: Option<f64>,
    #[serde(default)]
    gpu: Option<u32>,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Clone, Debug)]
struct ClientState {
    addr: IpAddr,
    return_port: u16,
    miner_id: u32,
    deadline: Instant,
}

struct StreamEntry {
    rate: RateSpec,
    delta: f64,
    last: Option<Value>,
    next_due: Instant,
}

pub struct Telemetry {
    socket: UdpSocket,
    farm: Arc<Farm>,
    datalog: Arc<DataLog>,
    password: String,
    client: Mutex<Option<ClientState>>,
    streams: Mutex<HashMap<&'static str, StreamEntry>>,
    close_hit_threshold: AtomicU32,
    seq: StdMutex<u64>,
}

const STREAM_COMMANDS: &[&str] = &[
    "best_hash",
    "work_package",
    "hash_rates",
    "hash_samples",
    "peer_count",
    "account_balance",
    "gpu_temps",
    "fan_speeds",
];

impl Telemetry {
    pub async fn bind(listen_port: u16, password: String, farm: Arc<Farm>, datalog: Arc<DataLog>) -> Result<Self, TelemetryError> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port)).await?;
        Ok(Self {
            socket,
            farm,
            datalog,
            password,
            client: Mutex::new(None),
            streams: Mutex::new(HashMap::new()),
            close_hit_threshold: AtomicU32::new(0xFFFF_FF00),
            seq: StdMutex::new(0),
        })
    }

    fn next_id(&self) -> u64 {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        *seq
    }

    /// Runs the receive loop and the periodic-stream timer concurrently until the
    /// Farm signals shutdown.
    pub async fn run(&self) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut ticker = tokio::time::interval(TIMER_TICK);

        loop {
            if self.farm.is_shutting_down() {
                return;
            }
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(err) => warn!(error = %err, "telemetry recv error"),
                    }
                }
                _ = ticker.tick() => {
                    self.check_keep_alive().await;
                    self.drive_periodic_streams().await;
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        let request: Request = match serde_json::from_slice(bytes) {
            Ok(req) => req,
            Err(err) => {
                debug!(error = %err, "malformed telemetry packet, dropping");
                return;
            }
        };
        self.dispatch(request, peer).await;
    }

    async fn dispatch(&self, request: Request, peer: SocketAddr) {
        match request.command.as_str() {
            "connect" => self.handle_connect(request, peer).await,
            "ping" => self.handle_ping(request, peer).await,
            "keep_alive" => self.handle_keep_alive(request, peer).await,
            "disconnect" => self.handle_disconnect_request(peer).await,
            "reset_best_hash" => {
                self.farm.reset_best_hash();
                self.send_response(&request, peer, json!({"ok": true})).await;
            }
            "close_hit_threshold" => self.handle_close_hit_threshold(request, peer).await,
            "solutions" => self.handle_chunked(&request, peer, "solutions").await,
            "close_hits" => self.handle_chunked(&request, peer, "close_hits").await,
            "hash_faults" => self.handle_chunked(&request, peer, "hash_faults").await,
            "miner_count" => {
                let count = self.farm.miners().len();
                self.send_response(&request, peer, json!(count)).await;
            }
            "gpu_throttle" => {
                if let (Some(miner_id), Some(percent)) = (request.miner_id, request.extra.get("percent").and_then(Value::as_u64)) {
                    self.farm.set_gpu_throttle(miner_id, percent as u32);
                }
                self.send_response(&request, peer, json!({"ok": true})).await;
            }
            "thermal_protection" => {
                let max_temp = request.extra.get("max_temp").and_then(Value::as_f64).unwrap_or(80.0);
                let shutdown_seconds = request.extra.get("shutdown_seconds").and_then(Value::as_u64).unwrap_or(30);
                self.farm.thermal_protection(max_temp, shutdown_seconds);
                self.send_response(&request, peer, json!({"ok": true})).await;
            }
            "pid_controller_tuning" => {
                if let Some(miner_id) = request.miner_id {
                    let kp = request.extra.get("kp").and_then(Value::as_f64).unwrap_or(8.0);
                    let ki = request.extra.get("ki").and_then(Value::as_f64).unwrap_or(4.0);
                    let kd = request.extra.get("kd").and_then(Value::as_f64).unwrap_or(1.0);
                    self.farm.tune_pid(miner_id, kp, ki, kd);
                }
                self.send_response(&request, peer, json!({"ok": true})).await;
            }
            cmd if STREAM_COMMANDS.contains(&cmd) => self.handle_stream_command(request, peer).await,
            other => {
                debug!(command = other, "unknown telemetry command");
            }
        }
    }

    async fn handle_connect(&self, request: Request, peer: SocketAddr) {
        let (Some(return_port), Some(miner_id)) = (request.return_port, request.miner_id) else {
            self.send_error(&request, peer, request.return_port.unwrap_or(peer.port()), "Invalid arguments: expecting 'return_port' and 'miner_id'").await;
            return;
        };

        if request.password.as_deref().unwrap_or("") != self.password {
            self.send_error(&request, peer, return_port, "Invalid password").await;
            return;
        }

        let mut client = self.client.lock().await;
        if let Some(existing) = client.as_ref() {
            if existing.addr != peer.ip() || existing.return_port != return_port {
                self.send_error(&request, peer, return_port, "Already connected to another instance").await;
                return;
            }
        }

        *client = Some(ClientState {
            addr: peer.ip(),
            return_port,
            miner_id,
            deadline: Instant::now() + KEEP_ALIVE_TIMEOUT,
        });
        drop(client);

        info!(peer = %peer, "telemetry client connected");
        self.send_response(&request, peer, json!({"ok": true})).await;
    }

    async fn handle_ping(&self, request: Request, peer: SocketAddr) {
        // the source's `ping` path sometimes swallows its own response; this
        // implementation always answers.
        self.send_response(&request, peer, json!({"pong": true})).await;
    }

    async fn handle_keep_alive(&self, request: Request, peer: SocketAddr) {
        let mut client = self.client.lock().await;
        match client.as_mut() {
            Some(state) if state.addr == peer.ip() => {
                state.deadline = Instant::now() + KEEP_ALIVE_TIMEOUT;
                drop(client);
                self.send_response(&request, peer, json!({"ok": true})).await;
            }
            _ => warn!(peer = %peer, "keep_alive from unconnected peer, ignored"),
        }
    }

    async fn handle_disconnect_request(&self, peer: SocketAddr) {
        let mut client = self.client.lock().await;
        if matches!(client.as_ref(), Some(state) if state.addr == peer.ip()) {
            *client = None;
            self.streams.lock().await.clear();
        }
    }

    async fn handle_close_hit_threshold(&self, request: Request, peer: SocketAddr) {
        if let Some(value) = request.extra.get("value").and_then(Value::as_u64) {
            self.close_hit_threshold.store(value as u32, Ordering::Relaxed);
        }
        let current = self.close_hit_threshold.load(Ordering::Relaxed);
        self.send_response(&request, peer, json!(current)).await;
    }

    /// Streaming "value" commands (the rate model): `OFF` cancels,
    /// `ONE_TIME` answers once, `ON_CHANGE`/periodic arm a push registered against
    /// the shared timer driven from [`Telemetry::run`].
    async fn handle_stream_command(&self, request: Request, peer: SocketAddr) {
        let command: &'static str = match STREAM_COMMANDS.iter().find(|c| **c == request.command) {
            Some(c) => c,
            None => return,
        };
        let Some(rate) = request.rate.and_then(RateSpec::from_i64) else {
            self.send_error(&request, peer, request.return_port.unwrap_or(peer.port()), "Invalid 'rate'").await;
            return;
        };
        let delta = request.delta.unwrap_or(0.0);

        match rate {
            RateSpec::Off => {
                self.streams.lock().await.remove(command);
            }
            RateSpec::OneTime => {
                let value = self.current_value(command, request.gpu);
                self.send_response(&request, peer, value).await;
            }
            RateSpec::OnChange => {
                let value = self.current_value(command, request.gpu);
                self.streams.lock().await.insert(
                    command,
                    StreamEntry { rate, delta, last: Some(value.clone()), next_due: Instant::now() },
                );
                self.send_response(&request, peer, value).await;
            }
            RateSpec::Periodic(ms) => {
                let value = self.current_value(command, request.gpu);
                self.streams.lock().await.insert(
                    command,
                    StreamEntry {
                        rate,
                        delta,
                        last: Some(value.clone()),
                        next_due: Instant::now() + Duration::from_millis(ms),
                    },
                );
                self.send_response(&request, peer, value).await;
            }
        }
    }

    fn current_value(&self, command: &str, gpu: Option<u32>) -> Value {
        match command {
            "best_hash" => json!(self.farm.best_hash()),
            "work_package" => {
                let pkg = self.farm.current_work();
                json!({
                    "challenge": hex::encode(pkg.challenge),
                    "target": hex::encode(pkg.target.to_be_bytes()),
                    "difficulty": pkg.difficulty,
                })
            }
            "hash_rates" => {
                let rates: Vec<f64> = self.farm.miners().iter().map(|m| m.hash_rate_mhs()).collect();
                json!(rates)
            }
            "hash_samples" => {
                let samples: Vec<Value> = self
                    .farm
                    .miners()
                    .iter()
                    .filter(|m| gpu.is_none() || gpu == Some(m.id))
                    .map(|m| json!(m.current_hash_sample()))
                    .collect();
                json!(samples)
            }
            "peer_count" => json!(0),
            "account_balance" => json!(0),
            "gpu_temps" => {
                let temps: Vec<f64> = self.farm.miners().iter().map(|m| m.snapshot().temperature_celsius).collect();
                json!(temps)
            }
            "fan_speeds" => {
                let speeds: Vec<u32> = self.farm.miners().iter().map(|m| m.snapshot().fan_rpm).collect();
                json!(speeds)
            }
            _ => Value::Null,
        }
    }

    async fn check_keep_alive(&self) {
        let mut client = self.client.lock().await;
        if let Some(state) = client.as_ref() {
            if Instant::now() >= state.deadline {
                let return_port = state.return_port;
                let addr = SocketAddr::new(state.addr, return_port);
                *client = None;
                drop(client);
                self.streams.lock().await.clear();
                self.send_notify(addr, "disconnect", Value::Null).await;
                info!(peer = %addr, "telemetry keep-alive expired");
            }
        }
    }

    async fn drive_periodic_streams(&self) {
        let client = self.client.lock().await.clone();
        let Some(client) = client else { return };
        let addr = SocketAddr::new(client.addr, client.return_port);

        let mut due: Vec<(&'static str, Value)> = Vec::new();
        {
            let mut streams = self.streams.lock().await;
            let now = Instant::now();
            for (command, entry) in streams.iter_mut() {
                match entry.rate {
                    RateSpec::Periodic(ms) if now >= entry.next_due => {
                        entry.next_due = now + Duration::from_millis(ms);
                        let value = self.current_value(command, None);
                        if changed_enough(entry.last.as_ref(), &value, entry.delta) {
                            entry.last = Some(value.clone());
                            due.push((command, value));
                        }
                    }
                    RateSpec::OnChange => {
                        let value = self.current_value(command, None);
                        if changed_enough(entry.last.as_ref(), &value, entry.delta) {
                            entry.last = Some(value.clone());
                            due.push((command, value));
                        }
                    }
                    _ => {}
                }
            }
        }

        for (command, value) in due {
            self.send_notify(addr, command, value).await;
        }
    }

    async fn send_response(&self, request: &Request, peer: SocketAddr, data: Value) {
        let return_port = request.return_port.unwrap_or(peer.port());
        let envelope = json!({
            "id": request.id.unwrap_or_else(|| self.next_id()),
            "type": "response",
            "data_id": request.command,
            "data": data,
        });
        self.send_to(SocketAddr::new(peer.ip(), return_port), envelope).await;
    }

    async fn send_error(&self, request: &Request, peer: SocketAddr, return_port: u16, message: &str) {
        let envelope = json!({
            "id": request.id.unwrap_or_else(|| self.next_id()),
            "type": "response",
            "data_id": request.command,
            "error": message,
        });
        self.send_to(SocketAddr::new(peer.ip(), return_port), envelope).await;
    }

    async fn send_notify(&self, addr: SocketAddr, data_id: &str, data: Value) {
        let envelope = json!({"data_id": data_id, "type": "notify", "data": data});
        self.send_to(addr, envelope).await;
    }

    async fn send_to(&self, addr: SocketAddr, mut envelope: Value) {
        let miner_id = self.client.lock().await.as_ref().map(|c| c.miner_id).unwrap_or(0);
        if let Value::Object(map) = &mut envelope {
            map.insert("miner_id".to_string(), json!(miner_id));
        }
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(err) => {
                warn!(error = %err, "failed to serialize telemetry message");
                return;
            }
        };
        if let Err(err) = self.socket.send_to(&bytes, addr).await {
            warn!(error = %err, "failed to send telemetry datagram");
        }
    }

    /// Large payload retrieval, chunked into batches of [`CHUNK_SIZE`] with
    /// [`CHUNK_SPACING`] between packets.
    async fn handle_chunked(&self, request: &Request, peer: SocketAddr, which: &str) {
        let return_port = request.return_port.unwrap_or(peer.port());
        let addr = SocketAddr::new(peer.ip(), return_port);

        let records: Vec<Value> = match which {
            "solutions" => self
                .datalog
                .retrieve_solutions(true)
                .into_iter()
                .map(|r| json!({"date": r.date, "block": r.block, "state": r.state, "stale": r.stale, "gpu_miner": r.gpu_miner}))
                .collect(),
            "close_hits" => self
                .datalog
                .retrieve_close_hits(true)
                .into_iter()
                .map(|r| json!({"date": r.date, "close_hit": r.close_hit, "work": r.work, "gpu_miner": r.gpu_miner}))
                .collect(),
            "hash_faults" => self
                .datalog
                .retrieve_hash_faults(true)
                .into_iter()
                .map(|r| json!({"date": r.date, "gpu_miner": r.gpu_miner}))
                .collect(),
            _ => Vec::new(),
        };

        if records.is_empty() {
            self.send_response(request, peer, json!([])).await;
            return;
        }

        for (i, chunk) in records.chunks(CHUNK_SIZE).enumerate() {
            let envelope = json!({
                "id": request.id.unwrap_or_else(|| self.next_id()),
                "type": "response",
                "data_id": request.command,
                "data": chunk,
            });
            self.send_to(addr, envelope).await;
            if i > 0 {
                tokio::time::sleep(CHUNK_SPACING).await;
            }
        }
    }
}

fn changed_enough(last: Option<&Value>, current: &Value, delta: f64) -> bool {
    match (last, current) {
        (None, _) => true,
        (Some(Value::Array(prev)), Value::Array(now)) => {
            prev.len() != now.len() || prev.iter().zip(now.iter()).any(|(a, b)| value_changed(a, b, delta))
        }
        (Some(prev), now) => value_changed(prev, now, delta),
    }
}

/// `delta <= 0` means "any actual change", not "always" — a tick with an
/// unchanged value must not push.
fn value_changed(a: &Value, b: &Value, delta: f64) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => {
            let diff = (a - b).abs();
            if delta <= 0.0 {
                diff > 0.0
            } else {
                diff >= delta
            }
        }
        _ => a != b,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rate_spec_parses_sentinel_values() {
        assert_eq!(RateSpec::from_i64(-3), Some(RateSpec::Off));
        assert_eq!(RateSpec::from_i64(-2), Some(RateSpec::OneTime));
        assert_eq!(RateSpec::from_i64(-1), Some(RateSpec::OnChange));
        assert_eq!(RateSpec::from_i64(1000), Some(RateSpec::Periodic(1000)));
        assert_eq!(RateSpec::from_i64(0), None);
        assert_eq!(RateSpec::from_i64(-4), None);
    }

    #[test]
    fn changed_enough_detects_scalar_delta() {
        assert!(!changed_enough(Some(&json!(10.0)), &json!(10.0), 0.0));
        assert!(changed_enough(Some(&json!(10.0)), &json!(10.5), 0.0));
        assert!(!changed_enough(Some(&json!(10.0)), &json!(10.5), 1.0));
    }
}
