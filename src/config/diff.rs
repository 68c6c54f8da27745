//! Diffs two `AppConfig` snapshots into the typed event stream below,
//! in publish order.

use super::{AppConfig, ServerConfig};

/// One reconfiguration event, as published by `diff` in the order listed
/// the table below.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    NewConfig(AppConfig),
    PidFile(AppConfig),
    LogFile(AppConfig),
    LogLevel(AppConfig),
    AllowedHosts(AppConfig),
    Backend(AppConfig),
    ServerNew(ServerConfig),
    ServerRemove(ServerConfig),
    ServerStart(ServerConfig),
    ServerStop(ServerConfig),
    ServerTls(ServerConfig),
    ServerTimeout(ServerConfig),
    ServerMaxClients(ServerConfig),
    ServerLogFile(ServerConfig),
}

impl ConfigEvent {
    /// The event bus topic this event publishes under.
    pub fn topic(&self) -> &'static str {
        match self {
            ConfigEvent::NewConfig(_) => "config.new_config",
            ConfigEvent::PidFile(_) => "config.pid_file",
            ConfigEvent::LogFile(_) => "config.log_file",
            ConfigEvent::LogLevel(_) => "config.log_level",
            ConfigEvent::AllowedHosts(_) => "config.allowed_hosts",
            ConfigEvent::Backend(_) => "config.backend",
            ConfigEvent::ServerNew(_) => "config.server_new",
            ConfigEvent::ServerRemove(_) => "config.server_remove",
            ConfigEvent::ServerStart(_) => "config.server_start",
            ConfigEvent::ServerStop(_) => "config.server_stop",
            ConfigEvent::ServerTls(_) => "config.server_tls",
            ConfigEvent::ServerTimeout(_) => "config.server_timeout",
            ConfigEvent::ServerMaxClients(_) => "config.server_max_clients",
            ConfigEvent::ServerLogFile(_) => "config.server_log_file",
        }
    }
}

/// Computes the ordered event stream that takes `old` to `new`.
pub fn diff(old: &AppConfig, new: &AppConfig) -> Vec<ConfigEvent> {
    let mut events = Vec::new();

    if old == new {
        return events;
    }
    events.push(ConfigEvent::NewConfig(new.clone()));

    if old.pid_file != new.pid_file {
        events.push(ConfigEvent::PidFile(new.clone()));
    }
    if old.log_file != new.log_file {
        events.push(ConfigEvent::LogFile(new.clone()));
    }
    if old.log_level != new.log_level {
        events.push(ConfigEvent::LogLevel(new.clone()));
    }
    if old.allowed_hosts != new.allowed_hosts {
        events.push(ConfigEvent::AllowedHosts(new.clone()));
    }
    if old.backend_config != new.backend_config {
        events.push(ConfigEvent::Backend(new.clone()));
    }

    for new_server in &new.servers {
        match old
            .servers
            .iter()
            .find(|s| s.listen_interface == new_server.listen_interface)
        {
            None => events.push(ConfigEvent::ServerNew(new_server.clone())),
            Some(old_server) => {
                if !old_server.is_enabled && new_server.is_enabled {
                    events.push(ConfigEvent::ServerStart(new_server.clone()));
                }
                if old_server.is_enabled && !new_server.is_enabled {
                    events.push(ConfigEvent::ServerStop(new_server.clone()));
                }
                if !old_server.tls_fields_eq(new_server) {
                    events.push(ConfigEvent::ServerTls(new_server.clone()));
                }
                if old_server.timeout != new_server.timeout {
                    events.push(ConfigEvent::ServerTimeout(new_server.clone()));
                }
                if old_server.max_clients != new_server.max_clients {
                    events.push(ConfigEvent::ServerMaxClients(new_server.clone()));
                }
                if old_server.log_file != new_server.log_file {
                    events.push(ConfigEvent::ServerLogFile(new_server.clone()));
                }
            }
        }
    }

    for old_server in &old.servers {
        if !new
            .servers
            .iter()
            .any(|s| s.listen_interface == old_server.listen_interface)
        {
            events.push(ConfigEvent::ServerRemove(old_server.clone()));
        }
    }

    events
}
