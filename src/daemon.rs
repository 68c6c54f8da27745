//! The top-level coordinator: owns the `ListenInterface → Server` map,
//! the current `Backend`, and the event bus that absorbs config reloads
//! without downtime.
//!
//! `MailLaser` has no equivalent — it drives one listener directly from
//! `main.rs`. This module is grounded in the daemon/supervisor shape
//! `remails-com-remails` uses for its multi-listener lifecycle, adapted to
//! a diff-and-publish reconfiguration flow that applies config reloads
//! without restarting the process.

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::backend::webhook::WebhookBackend;
use crate::backend::Backend;
use crate::bus::EventBus;
use crate::config::diff::{self, ConfigEvent};
use crate::config::{AllowedHosts, AppConfig, LogLevel};
use crate::error::{BackendError, ConfigError};
use crate::logging::{LogDest, Logger};
use crate::pidfile;
use crate::server::Server;
use crate::tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    New,
    Started,
    Stopped,
}

struct Shared {
    config: AppConfig,
    servers: HashMap<String, Arc<Server>>,
    handles: HashMap<String, tokio::task::JoinHandle<()>>,
}

pub struct Daemon {
    shared: std::sync::Mutex<Shared>,
    backend: ArcSwap<dyn Backend>,
    logger: ArcSwap<Logger>,
    allowed_hosts: ArcSwap<AllowedHosts>,
    bus: EventBus,
    state: std::sync::Mutex<DaemonState>,
}

fn build_backend(config: &AppConfig) -> Result<Arc<dyn Backend>, BackendError> {
    WebhookBackend::new(&config.backend_config)
        .map(|b| Arc::new(b) as Arc<dyn Backend>)
}

fn build_logger(name: &str, dest_str: &str, level: LogLevel) -> std::io::Result<Arc<Logger>> {
    Ok(Arc::new(Logger::new(
        name,
        LogDest::parse(dest_str),
        level.to_log_level_filter(),
    )?))
}

impl Daemon {
    pub fn new(config: AppConfig) -> Result<Arc<Daemon>, ConfigError> {
        config.validate()?;

        let logger = build_logger("maild", &config.log_file, config.log_level)
            .map_err(|source| ConfigError::Io {
                path: config.log_file.clone(),
                source,
            })?;
        let backend = build_backend(&config)
            .map_err(|e| ConfigError::Io {
                path: "backend_config".into(),
                source: std::io::Error::other(e.to_string()),
            })?;
        backend.set_mainlog(logger.clone());
        let allowed_hosts = Arc::new(config.allowed_hosts_snapshot());

        let daemon = Arc::new(Daemon {
            shared: std::sync::Mutex::new(Shared {
                config,
                servers: HashMap::new(),
                handles: HashMap::new(),
            }),
            backend: ArcSwap::new(backend),
            logger: ArcSwap::new(logger),
            allowed_hosts: ArcSwap::new(allowed_hosts),
            bus: EventBus::new(),
            state: std::sync::Mutex::new(DaemonState::New),
        });
        daemon.clone().bind_reload_handlers();
        Ok(daemon)
    }

    /// Wires the reload handler policies to the bus once, at
    /// construction — the same set for the daemon's whole lifetime.
    fn bind_reload_handlers(self: Arc<Self>) {
        let d = self.clone();
        self.bus.subscribe("config.log_file", move |event| {
            if let ConfigEvent::LogFile(cfg) = event {
                match build_logger("maild", &cfg.log_file, cfg.log_level) {
                    Ok(logger) => {
                        d.backend.load().set_mainlog(logger.clone());
                        d.logger.store(logger);
                    }
                    Err(e) => d.logger.load().error(format_args!("log_file reload failed: {e}")),
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.log_level", move |event| {
            if let ConfigEvent::LogLevel(cfg) = event {
                d.logger.load().set_level(cfg.log_level.to_log_level_filter());
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.allowed_hosts", move |event| {
            if let ConfigEvent::AllowedHosts(cfg) = event {
                let hosts = Arc::new(cfg.allowed_hosts_snapshot());
                d.allowed_hosts.store(hosts.clone());
                for server in d.shared.lock().unwrap().servers.values() {
                    server.swap_allowed_hosts(hosts.clone());
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.backend", move |event| {
            if let ConfigEvent::Backend(cfg) = event {
                match build_backend(cfg) {
                    Ok(new_backend) => {
                        new_backend.set_mainlog(d.logger.load_full());
                        d.backend.store(new_backend.clone());
                        for server in d.shared.lock().unwrap().servers.values() {
                            server.swap_backend(new_backend.clone());
                        }
                    }
                    Err(e) => d
                        .logger
                        .load()
                        .error(format_args!("backend swap failed, keeping previous backend: {e}")),
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_tls", move |event| {
            if let ConfigEvent::ServerTls(server_config) = event {
                if !server_config.requires_tls_material() {
                    return;
                }
                let servers = d.shared.lock().unwrap();
                if let Some(server) = servers.servers.get(&server_config.listen_interface) {
                    match tls::build_server_config(server_config) {
                        Ok(tls_config) => server.swap_tls_config(tls_config),
                        Err(e) => d.logger.load().error(format_args!(
                            "TLS reload for {} failed, keeping previous config: {e}",
                            server_config.listen_interface
                        )),
                    }
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_timeout", move |event| {
            if let ConfigEvent::ServerTimeout(server_config) = event {
                let servers = d.shared.lock().unwrap();
                if let Some(server) = servers.servers.get(&server_config.listen_interface) {
                    server.swap_config(server_config.clone());
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_max_clients", move |event| {
            if let ConfigEvent::ServerMaxClients(server_config) = event {
                let servers = d.shared.lock().unwrap();
                if let Some(server) = servers.servers.get(&server_config.listen_interface) {
                    server.swap_config(server_config.clone());
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_log_file", move |event| {
            if let ConfigEvent::ServerLogFile(server_config) = event {
                let dest = server_config.log_file.as_deref().unwrap_or("stderr");
                match build_logger(&server_config.listen_interface, dest, LogLevel::Info) {
                    Ok(logger) => {
                        let servers = d.shared.lock().unwrap();
                        if let Some(server) = servers.servers.get(&server_config.listen_interface) {
                            server.swap_logger(logger);
                        }
                    }
                    Err(e) => d.logger.load().error(format_args!(
                        "log_file reload for {} failed: {e}",
                        server_config.listen_interface
                    )),
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.pid_file", move |event| {
            if let ConfigEvent::PidFile(cfg) = event {
                if let Err(e) = pidfile::write(&cfg.pid_file) {
                    d.logger
                        .load()
                        .error(format_args!("failed to rewrite pid file {}: {e}", cfg.pid_file));
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_stop", move |event| {
            if let ConfigEvent::ServerStop(server_config) = event {
                let servers = d.shared.lock().unwrap();
                if let Some(server) = servers.servers.get(&server_config.listen_interface) {
                    server.request_shutdown();
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_start", move |event| {
            if let ConfigEvent::ServerStart(server_config) = event {
                let already_running = d
                    .shared
                    .lock()
                    .unwrap()
                    .servers
                    .get(&server_config.listen_interface)
                    .map(|s| s.state() == crate::server::ServerState::Running)
                    .unwrap_or(false);
                if already_running {
                    return; // reject no-ops silently
                }
                if let Err(e) = d.spawn_server(server_config.clone()) {
                    d.logger.load().error(format_args!(
                        "failed to start server {}: {e}",
                        server_config.listen_interface
                    ));
                }
            }
        });

        let d = self.clone();
        self.bus.subscribe("config.server_remove", move |event| {
            if let ConfigEvent::ServerRemove(server_config) = event {
                let iface = server_config.listen_interface.clone();
                let server = d.shared.lock().unwrap().servers.get(&iface).cloned();
                if let Some(server) = server {
                    server.request_shutdown();
                }
                let mut shared = d.shared.lock().unwrap();
                shared.servers.remove(&iface);
                shared.handles.remove(&iface);
            }
        });
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().unwrap()
    }

    /// Checks every enabled listener address can be bound before spawning
    /// any server task, so a misconfigured port fails startup atomically
    /// rather than leaving earlier listeners running.
    fn validate_listen_addresses(config: &AppConfig) -> Result<(), ConfigError> {
        for server in &config.servers {
            if !server.is_enabled {
                continue;
            }
            StdTcpListener::bind(&server.listen_interface).map_err(|source| ConfigError::Io {
                path: server.listen_interface.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Starts every enabled server concurrently. Idempotent: starting an
    /// already-started daemon is a no-op. Restarting a daemon previously
    /// stopped by `shutdown()` reinitialises the backend rather than
    /// starting it fresh.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let previous_state = {
            let state = self.state.lock().unwrap();
            if *state == DaemonState::Started {
                return Ok(());
            }
            *state
        };

        let config = self.shared.lock().unwrap().config.clone();
        Self::validate_listen_addresses(&config)?;
        pidfile::write(&config.pid_file)?;

        if previous_state == DaemonState::Stopped {
            self.backend.load().reinitialize().await?;
        } else {
            self.backend.load().start().await?;
        }

        for server_config in &config.servers {
            if !server_config.is_enabled {
                continue;
            }
            self.spawn_server(server_config.clone())?;
        }

        *self.state.lock().unwrap() = DaemonState::Started;
        Ok(())
    }

    fn spawn_server(self: &Arc<Self>, server_config: crate::config::ServerConfig) -> anyhow::Result<()> {
        let tls_config = if server_config.requires_tls_material() {
            Some(tls::build_server_config(&server_config)?)
        } else {
            None
        };

        let server = Server::new(
            server_config.clone(),
            self.backend.load_full(),
            self.logger.load_full(),
            self.allowed_hosts.load_full(),
        );
        if let Some(tls) = tls_config {
            server.swap_tls_config(tls);
        }

        let iface = server_config.listen_interface.clone();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    eprintln!("server {} exited with error: {e}", server.listen_interface());
                }
            })
        };

        let mut shared = self.shared.lock().unwrap();
        shared.servers.insert(iface.clone(), server);
        shared.handles.insert(iface, handle);
        Ok(())
    }

    /// Stops every running server concurrently, then shuts down the
    /// backend. Waits up to `SHUTDOWN_DEADLINE` for each listener's pool
    /// to drain before force-aborting its task.
    pub async fn shutdown(self: &Arc<Self>) -> anyhow::Result<()> {
        let (servers, handles): (Vec<Arc<Server>>, HashMap<String, tokio::task::JoinHandle<()>>) = {
            let mut shared = self.shared.lock().unwrap();
            let servers = shared.servers.values().cloned().collect();
            let handles = std::mem::take(&mut shared.handles);
            (servers, handles)
        };
        for server in &servers {
            server.request_shutdown();
        }
        for (iface, handle) in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(crate::server::SHUTDOWN_DEADLINE, handle).await.is_err() {
                self.logger
                    .load()
                    .warn(format_args!("server {iface} did not drain before the shutdown deadline; forcing close"));
                abort.abort();
            }
        }
        self.backend.load().shutdown().await?;
        pidfile::remove(&self.shared.lock().unwrap().config.pid_file);
        *self.state.lock().unwrap() = DaemonState::Stopped;
        Ok(())
    }

    /// Diffs `new` against the running config and publishes the resulting
    /// events in a fixed order: new servers first, then process-wide
    /// settings, then per-server settings, then stopped/removed servers.
    pub fn reload_config(self: &Arc<Self>, new: AppConfig) -> Result<(), ConfigError> {
        new.validate()?;
        let old = {
            let mut shared = self.shared.lock().unwrap();
            let old = shared.config.clone();
            shared.config = new.clone();
            old
        };

        for server_config in &new.servers {
            if !old.servers.iter().any(|s| s.listen_interface == server_config.listen_interface)
                && server_config.is_enabled
            {
                if let Err(e) = self.spawn_server(server_config.clone()) {
                    self.logger
                        .load()
                        .error(format_args!("failed to start new server {}: {e}", server_config.listen_interface));
                }
            }
        }

        for event in diff::diff(&old, &new) {
            self.bus.publish(&event);
        }
        Ok(())
    }

    pub fn reopen_logs(&self) {
        self.logger.load().reopen().ok();
        for server in self.shared.lock().unwrap().servers.values() {
            server.reopen_log();
        }
    }

    pub fn subscribe(
        &self,
        topic: &'static str,
        handler: impl Fn(&ConfigEvent) + Send + Sync + 'static,
    ) -> crate::bus::HandlerId {
        self.bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, topic: &'static str, id: crate::bus::HandlerId) {
        self.bus.unsubscribe(topic, id)
    }

    pub fn publish(&self, event: &ConfigEvent) {
        self.bus.publish(event)
    }
}
