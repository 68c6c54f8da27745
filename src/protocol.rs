//! The SMTP command/DATA state machine — the largest single
//! piece of the core. Generalizes `MailLaser`'s `SmtpProtocol<R, W>` (which
//! drove a five-state, single-recipient conversation) into the full
//! `Greet/Cmd/Data/StartTls/Shutdown` machine, generic over one duplex
//! `IO` type so it can be driven either by a real socket (`server::Conn`)
//! or, in tests, by `tokio::io::duplex`'s in-memory pair — the same
//! "mock the transport, keep the state machine" approach `MailLaser`'s
//! own protocol test module uses.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::address::{self, EmailAddress};
use crate::backend::Backend;
use crate::config::{AllowedHosts, ServerConfig};
use crate::envelope::Envelope;
use crate::error::{replies, AddressError, ProtocolError, Reply};
use crate::logging::Logger;
use crate::session::{ClientSession, SessionState};

/// Hard cap on one command line, CRLF included.
pub const COMMAND_MAX_LENGTH: usize = 1024;
/// DATA is allowed to exceed `ServerConfig.max_size` by this much before
/// the connection is killed outright.
pub const DATA_HARD_MARGIN: u64 = 1024 * 1024;
/// Consecutive unrecognized commands tolerated before the session is killed.
const MAX_UNKNOWN_COMMANDS: u32 = 3;

/// How the engine's `run` loop ended — `server` decides what to do next.
#[derive(Debug)]
pub enum EngineExit {
    /// `QUIT`, a fatal protocol error, idle timeout, or EOF.
    Closed,
    /// `STARTTLS` was accepted and the 220 reply already written; the
    /// caller should take the raw transport back out (`into_io`), perform
    /// the TLS handshake, and build a fresh engine around the upgraded
    /// stream.
    StartTlsRequested,
}

/// Drives one `ClientSession` to completion over a concrete transport.
pub struct SmtpEngine<IO> {
    io: BufReader<IO>,
    session: ClientSession,
    server: ServerConfig,
    allowed_hosts: Arc<AllowedHosts>,
    backend: Arc<dyn Backend>,
    logger: Arc<Logger>,
    shutdown: CancellationToken,
    active_clients: usize,
}

impl<IO> SmtpEngine<IO>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io: IO,
        session: ClientSession,
        server: ServerConfig,
        allowed_hosts: Arc<AllowedHosts>,
        backend: Arc<dyn Backend>,
        logger: Arc<Logger>,
        shutdown: CancellationToken,
        active_clients: usize,
    ) -> Self {
        SmtpEngine {
            io: BufReader::new(io),
            session,
            server,
            allowed_hosts,
            backend,
            logger,
            shutdown,
            active_clients,
        }
    }

    /// Hands the raw transport back to the caller. Only safe to call right
    /// after `EngineExit::StartTlsRequested` — no further reads have
    /// happened since the greeting reply was flushed, so the buffer is
    /// empty.
    pub fn into_io(self) -> IO {
        self.io.into_inner()
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Sends the SMTP greeting and drives the
    /// command/DATA loop until the session closes or requests a TLS
    /// upgrade.
    pub async fn run(&mut self) -> anyhow::Result<EngineExit> {
        self.send_greeting().await?;
        self.session.state = SessionState::Cmd;

        loop {
            match self.session.state {
                SessionState::Cmd => match self.run_cmd_iteration().await? {
                    Some(exit) => return Ok(exit),
                    None => continue,
                },
                SessionState::Data => {
                    if let Some(exit) = self.run_data().await? {
                        return Ok(exit);
                    }
                }
                SessionState::Shutdown => {
                    self.write_reply(&replies::SHUTTING_DOWN).await?;
                    return Ok(EngineExit::Closed);
                }
                SessionState::Greet | SessionState::StartTls => unreachable!(
                    "Greet/StartTls are transient; run() never re-enters them directly"
                ),
            }
        }
    }

    async fn send_greeting(&mut self) -> anyhow::Result<()> {
        let line = format!(
            "220 {} SMTP {}/{} #{} ({}) {}",
            self.server.host_name,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            self.session.client_id,
            self.active_clients,
            crate::logging::now_rfc1123(),
        );
        self.write_line(&line).await
    }

    /// One command read+dispatch. Returns `Some(exit)` when the session
    /// should stop; `None` to read another command.
    async fn run_cmd_iteration(&mut self) -> anyhow::Result<Option<EngineExit>> {
        if self.shutdown.is_cancelled() {
            self.session.state = SessionState::Shutdown;
            return Ok(None);
        }

        let line = match self.read_command_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(Some(EngineExit::Closed)), // EOF
            Err(ProtocolError::LineTooLong) => {
                self.write_reply(&replies::LINE_TOO_LONG).await?;
                return Ok(Some(EngineExit::Closed));
            }
            Err(ProtocolError::Timeout) => {
                self.write_reply(&replies::TIMEOUT).await?;
                return Ok(Some(EngineExit::Closed));
            }
            Err(other) => return Err(other.into()),
        };

        if line.is_empty() {
            return Ok(None);
        }

        self.dispatch(&line).await
    }

    async fn dispatch(&mut self, line: &str) -> anyhow::Result<Option<EngineExit>> {
        let command = line.split_whitespace().next().unwrap_or("").to_uppercase();
        let rest = line[command.len()..].trim_start();

        match command.as_str() {
            "HELO" => {
                self.handle_helo(rest).await?;
            }
            "EHLO" => {
                self.handle_ehlo(rest).await?;
            }
            "MAIL" if starts_with_ci(rest, "FROM:") || starts_with_ci(line, "MAIL FROM:") => {
                self.handle_mail_from(strip_prefix_ci(line, "MAIL FROM:")).await?;
            }
            "RCPT" if starts_with_ci(rest, "TO:") || starts_with_ci(line, "RCPT TO:") => {
                self.handle_rcpt_to(strip_prefix_ci(line, "RCPT TO:")).await?;
            }
            "DATA" => {
                return self.handle_data_command().await;
            }
            "RSET" => {
                self.session.reset_envelope();
                self.write_reply(&replies::RSET_OK).await?;
            }
            "NOOP" => {
                self.write_reply(&replies::NOOP_OK).await?;
            }
            "QUIT" => {
                self.write_reply(&replies::BYE).await?;
                return Ok(Some(EngineExit::Closed));
            }
            "STARTTLS" => {
                return self.handle_starttls().await;
            }
            "HELP" => {
                self.write_line("214 2.0.0 Help!").await?;
            }
            "XCLIENT" => {
                self.handle_xclient(rest).await?;
            }
            _ => {
                return self.handle_unknown().await;
            }
        }
        Ok(None)
    }

    async fn handle_helo(&mut self, arg: &str) -> anyhow::Result<()> {
        match address::parse_helo_domain(arg) {
            Ok(domain) => {
                self.session.helo = domain.to_string();
                self.session.reset_envelope();
                let line = format!("250 {} Hello {}", self.server.host_name, domain);
                self.write_line(&line).await?;
            }
            Err(e) => self.write_reply(&e.to_reply()).await?,
        }
        Ok(())
    }

    async fn handle_ehlo(&mut self, arg: &str) -> anyhow::Result<()> {
        match address::parse_helo_domain(arg) {
            Ok(domain) => {
                self.session.helo = domain.to_string();
                self.session.reset_envelope();
                self.write_line(&format!(
                    "250-{} Hello {}[{}]",
                    self.server.host_name, self.session.helo, self.session.remote_ip
                ))
                .await?;
                self.write_line(&format!("250-SIZE {}", self.server.max_size))
                    .await?;
                self.write_line("250-PIPELINING").await?;
                if self.server.start_tls_on && !self.session.tls {
                    self.write_line("250-STARTTLS").await?;
                }
                self.write_line("250 HELP").await?;
            }
            Err(e) => self.write_reply(&e.to_reply()).await?,
        }
        Ok(())
    }

    async fn handle_mail_from(&mut self, arg: &str) -> anyhow::Result<()> {
        if self.session.envelope.is_some() {
            self.write_reply(&replies::NESTED_MAIL).await?;
            return Ok(());
        }
        match address::parse_reverse_path(arg) {
            Ok((sender, _params)) => {
                self.session.start_envelope();
                if let Some(env) = self.session.envelope.as_mut() {
                    env.set_mail_from(sender);
                }
                self.write_reply(&replies::OK_SENDER).await?;
            }
            Err(e) => self.write_reply(&e.to_reply()).await?,
        }
        Ok(())
    }

    async fn handle_rcpt_to(&mut self, arg: &str) -> anyhow::Result<()> {
        if self.session.envelope.is_none() {
            self.write_line("503 5.5.1 Error: need MAIL command").await?;
            return Ok(());
        }
        match address::parse_forward_path(arg) {
            Ok((rcpt, _params)) => self.accept_or_reject_rcpt(rcpt).await,
            Err(e) => self.write_reply(&e.to_reply()).await,
        }
    }

    async fn accept_or_reject_rcpt(&mut self, rcpt: EmailAddress) -> anyhow::Result<()> {
        if !self.allowed_hosts.is_allowed(&rcpt.domain_str()) {
            self.write_reply(&replies::RELAY_DENIED).await?;
            return Ok(());
        }
        let env = self.session.envelope.as_mut().expect("checked above");
        match env.add_rcpt_to(rcpt) {
            Ok(_) => self.write_reply(&replies::OK_RECIPIENT).await,
            Err(_) => self.write_reply(&replies::TOO_MANY_RECIPIENTS).await,
        }
    }

    async fn handle_data_command(&mut self) -> anyhow::Result<Option<EngineExit>> {
        let has_rcpt = self
            .session
            .envelope
            .as_ref()
            .map(Envelope::has_accepted_rcpt)
            .unwrap_or(false);
        if !has_rcpt {
            self.write_reply(&replies::DATA_REQUIRES_RCPT).await?;
            return Ok(None);
        }
        self.write_reply(&replies::START_DATA).await?;
        self.session.state = SessionState::Data;
        Ok(None)
    }

    async fn handle_starttls(&mut self) -> anyhow::Result<Option<EngineExit>> {
        if !self.server.start_tls_on || self.session.tls {
            self.write_line("503 5.5.1 Error: TLS not available").await?;
            return Ok(None);
        }
        self.write_reply(&replies::READY_FOR_TLS).await?;
        Ok(Some(EngineExit::StartTlsRequested))
    }

    async fn handle_xclient(&mut self, arg: &str) -> anyhow::Result<()> {
        // Trust is applied unconditionally, matching the reference
        // behavior; see DESIGN.md for why XCLIENT trust was a judgment call.
        for token in arg.split_whitespace() {
            if let Some(ip) = token.strip_prefix("ADDR=") {
                self.session.remote_ip = ip.to_string();
            }
        }
        self.write_line("250 OK").await?;
        Ok(())
    }

    async fn handle_unknown(&mut self) -> anyhow::Result<Option<EngineExit>> {
        self.session.error_count += 1;
        if self.session.error_count > MAX_UNKNOWN_COMMANDS {
            self.write_reply(&replies::TOO_MANY_UNKNOWN).await?;
            return Ok(Some(EngineExit::Closed));
        }
        self.write_reply(&replies::INVALID_COMMAND).await?;
        Ok(None)
    }

    /// Reads the DATA body until the CRLF-dot-CRLF terminator, applying
    /// dot-unstuffing and inline `Subject:` extraction, then hands the
    /// envelope to the backend.
    async fn run_data(&mut self) -> anyhow::Result<Option<EngineExit>> {
        let max_size = self.server.max_size;
        let hard_limit = max_size.saturating_add(DATA_HARD_MARGIN);

        let mut data = Vec::new();
        let mut subject = String::new();
        let mut in_headers = true;
        let mut in_subject_header = false;
        let mut soft_exceeded = false;
        let mut total_read: u64 = 0;

        loop {
            let line = match self.read_data_line(hard_limit).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(Some(EngineExit::Closed)), // EOF mid-DATA
                Err(ProtocolError::Timeout) => {
                    self.write_reply(&replies::TIMEOUT).await?;
                    return Ok(Some(EngineExit::Closed));
                }
                Err(ProtocolError::LineTooLong) => {
                    self.write_reply(&replies::DATA_SIZE_EXCEEDED_HARD).await?;
                    return Ok(Some(EngineExit::Closed));
                }
                Err(other) => return Err(other.into()),
            };

            if line == "." {
                break;
            }

            let unstuffed = if let Some(rest) = line.strip_prefix('.') {
                rest
            } else {
                line.as_str()
            };

            total_read += unstuffed.len() as u64 + 2;
            if total_read > hard_limit {
                self.write_reply(&replies::DATA_SIZE_EXCEEDED_HARD).await?;
                return Ok(Some(EngineExit::Closed));
            }

            if !soft_exceeded {
                if in_headers {
                    if unstuffed.is_empty() {
                        in_headers = false;
                    } else if (unstuffed.starts_with(' ') || unstuffed.starts_with('\t'))
                        && in_subject_header
                    {
                        subject.push(' ');
                        subject.push_str(unstuffed.trim());
                    } else if unstuffed.to_lowercase().starts_with("subject:") {
                        subject = unstuffed[8..].trim().to_string();
                        in_subject_header = true;
                    } else {
                        in_subject_header = false;
                    }
                }

                data.extend_from_slice(unstuffed.as_bytes());
                data.extend_from_slice(b"\r\n");

                if data.len() as u64 > max_size {
                    soft_exceeded = true;
                }
            }
        }

        if soft_exceeded {
            self.write_reply(&replies::DATA_SIZE_EXCEEDED_SOFT).await?;
            self.session.reset_envelope();
            self.session.state = SessionState::Cmd;
            return Ok(None);
        }

        let mut envelope = self.session.envelope.take().expect("checked in handle_data_command");
        envelope.data = data;
        envelope.subject = subject;

        let reply_line = self.backend.process(&envelope).await;
        self.write_line(&reply_line).await?;

        self.session.reset_envelope();
        self.session.state = if self.shutdown.is_cancelled() {
            SessionState::Shutdown
        } else {
            SessionState::Cmd
        };
        Ok(None)
    }

    async fn write_reply(&mut self, reply: &Reply) -> anyhow::Result<()> {
        self.write_line(&reply.render()).await
    }

    async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.logger.debug(format_args!(
            "client#{} <- {}",
            self.session.client_id, line
        ));
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        self.io.flush().await?;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout.max(1))
    }

    /// Reads one CRLF- (or bare LF-) terminated line bounded by
    /// `COMMAND_MAX_LENGTH`, under the server's read deadline. `Ok(None)`
    /// signals a clean EOF.
    async fn read_command_line(&mut self) -> Result<Option<String>, ProtocolError> {
        match tokio::time::timeout(self.timeout(), self.read_bounded_line(COMMAND_MAX_LENGTH)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Like `read_command_line`, but DATA lines are not bounded by the
    /// command line-length limit — only by `hard_limit`, so a single line
    /// with no terminator can't buffer unbounded memory before `run_data`
    /// gets a chance to enforce the size limits itself.
    async fn read_data_line(&mut self, hard_limit: u64) -> Result<Option<String>, ProtocolError> {
        let deadline = self.timeout();
        let cap = usize::try_from(hard_limit).unwrap_or(usize::MAX);
        match tokio::time::timeout(deadline, self.read_bounded_line(cap)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    async fn read_bounded_line(&mut self, max_len: usize) -> Result<Option<String>, ProtocolError> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = self
                .io
                .read(&mut byte)
                .await
                .map_err(|_| ProtocolError::Timeout)?;
            if n == 0 {
                return if buf.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string()))
                };
            }
            buf.push(byte[0]);
            if byte[0] == b'\n' {
                let trimmed = buf.len().saturating_sub(if buf.ends_with(b"\r\n") { 2 } else { 1 });
                return Ok(Some(String::from_utf8_lossy(&buf[..trimmed]).to_string()));
            }
            if buf.len() > max_len {
                return Err(ProtocolError::LineTooLong);
            }
        }
    }
}

fn starts_with_ci(haystack: &str, needle: &str) -> bool {
    haystack.len() >= needle.len() && haystack[..needle.len()].eq_ignore_ascii_case(needle)
}

fn strip_prefix_ci<'a>(haystack: &'a str, needle: &str) -> &'a str {
    if starts_with_ci(haystack, needle) {
        haystack[needle.len()..].trim_start()
    } else {
        haystack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::config::ServerConfig;
    use std::collections::HashSet;
    use tokio::io::DuplexStream;

    fn test_server() -> ServerConfig {
        ServerConfig {
            listen_interface: "127.0.0.1:2525".into(),
            host_name: "mail.test.com".into(),
            max_size: 1024,
            max_clients: 10,
            timeout: 5,
            private_key_file: None,
            public_key_file: None,
            start_tls_on: true,
            tls_always_on: false,
            protocols: vec![],
            ciphers: vec![],
            client_auth_type: Default::default(),
            root_cas: None,
            log_file: None,
            is_enabled: true,
        }
    }

    fn allowed(hosts: &[&str]) -> Arc<AllowedHosts> {
        Arc::new(AllowedHosts::new(
            hosts.iter().map(|h| h.to_string()).collect::<HashSet<_>>(),
        ))
    }

    async fn new_engine(
        server: ServerConfig,
        hosts: Arc<AllowedHosts>,
    ) -> (SmtpEngine<DuplexStream>, DuplexStream) {
        let (client, server_io) = tokio::io::duplex(8192);
        let session = ClientSession::new(1, "127.0.0.1".into());
        let engine = SmtpEngine::new(
            server_io,
            session,
            server,
            hosts,
            Arc::new(NullBackend),
            Arc::new(Logger::null("test")),
            CancellationToken::new(),
            1,
        );
        (engine, client)
    }

    async fn write(client: &mut DuplexStream, line: &str) {
        client.write_all(line.as_bytes()).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();
    }

    async fn read_line(client: &mut DuplexStream) -> String {
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    #[tokio::test]
    async fn full_happy_path_transaction() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["grr.la"])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });

        {
            let mut reader = BufReader::new(&mut client);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("220 mail.test.com SMTP"));
        }

        write(&mut client, "HELO there").await;
        assert_eq!(read_line(&mut client).await, "250 mail.test.com Hello there");

        write(&mut client, "MAIL FROM:<a@grr.la>").await;
        assert_eq!(read_line(&mut client).await, "250 2.1.0 OK");

        write(&mut client, "RCPT TO:<b@grr.la>").await;
        assert_eq!(read_line(&mut client).await, "250 2.1.5 OK");

        write(&mut client, "DATA").await;
        assert_eq!(
            read_line(&mut client).await,
            "354 Enter message, ending with \".\" on a line by itself"
        );

        write(&mut client, "Subject: hi").await;
        write(&mut client, "").await;
        write(&mut client, "body").await;
        write(&mut client, ".").await;
        assert_eq!(read_line(&mut client).await, "250 2.0.0 OK");

        write(&mut client, "QUIT").await;
        assert_eq!(read_line(&mut client).await, "221 2.0.0 Bye");

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_disallowed_recipient() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["grr.la"])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await; // greeting
        write(&mut client, "HELO x").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<a@grr.la>").await;
        read_line(&mut client).await;
        write(&mut client, "RCPT TO:<x@notallowed.example>").await;
        assert_eq!(
            read_line(&mut client).await,
            "454 4.1.1 Error: Relay access denied"
        );
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_nested_mail() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        write(&mut client, "HELO x").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<a@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<b@example.com>").await;
        assert_eq!(
            read_line(&mut client).await,
            "503 5.5.1 Error: nested MAIL command"
        );
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn data_without_rcpt_is_rejected() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        write(&mut client, "HELO x").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<a@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "DATA").await;
        assert_eq!(read_line(&mut client).await, "554 5.5.1 Error: no valid recipients");
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn command_line_too_long_closes_connection() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        let long_line = format!("NOOP {}\r\n", "a".repeat(COMMAND_MAX_LENGTH + 10));
        client.write_all(long_line.as_bytes()).await.unwrap();
        assert_eq!(read_line(&mut client).await, "554 5.5.1 Line too long");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn too_many_unknown_commands_kills_session() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        for _ in 0..3 {
            write(&mut client, "BOGUS").await;
            assert_eq!(read_line(&mut client).await, "500 5.5.1 Invalid command");
        }
        write(&mut client, "BOGUS").await;
        assert_eq!(read_line(&mut client).await, "500 Too many unrecognized commands");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ehlo_advertises_starttls_until_upgraded() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        engine.session.tls = false;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        write(&mut client, "EHLO x").await;
        assert_eq!(read_line(&mut client).await, "250-mail.test.com Hello x[127.0.0.1]");
        assert_eq!(read_line(&mut client).await, "250-SIZE 1024");
        assert_eq!(read_line(&mut client).await, "250-PIPELINING");
        assert_eq!(read_line(&mut client).await, "250-STARTTLS");
        assert_eq!(read_line(&mut client).await, "250 HELP");
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn command_line_at_max_length_boundary_is_accepted() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        // "NOOP " (5 bytes) + filler + "\r\n" (2 bytes) == COMMAND_MAX_LENGTH exactly:
        // buf.len() never exceeds max_len, so this must be accepted, not rejected.
        let filler = "a".repeat(COMMAND_MAX_LENGTH - 5 - 2);
        let long_line = format!("NOOP {filler}\r\n");
        client.write_all(long_line.as_bytes()).await.unwrap();
        assert_eq!(read_line(&mut client).await, "250 2.0.0 OK");
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn data_exceeding_soft_limit_gets_451_and_session_continues() {
        let mut server = test_server();
        server.max_size = 10;
        let (mut engine, mut client) = new_engine(server, allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        write(&mut client, "HELO x").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<a@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "RCPT TO:<b@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "DATA").await;
        read_line(&mut client).await;
        write(&mut client, "this line alone is already past the 10 byte max_size").await;
        write(&mut client, ".").await;
        assert_eq!(
            read_line(&mut client).await,
            "451 4.3.0 Error: Maximum DATA size exceeded"
        );

        // The session survives a soft-exceeded DATA: still in Cmd state.
        write(&mut client, "NOOP").await;
        assert_eq!(read_line(&mut client).await, "250 2.0.0 OK");
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn data_exceeding_hard_limit_closes_connection() {
        let mut server = test_server();
        server.max_size = 10;
        let (mut engine, mut client) = new_engine(server, allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        write(&mut client, "HELO x").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<a@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "RCPT TO:<b@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "DATA").await;
        read_line(&mut client).await;

        // hard_limit is max_size (10) + 1 MiB; stream well past it so
        // total_read keeps climbing even after the soft limit (already
        // tripped after the first line) freezes the `data` buffer. The
        // server closes its half as soon as it crosses hard_limit, so the
        // writer may see a broken pipe before it finishes — that's expected
        // and not what this test is checking.
        let (read_half, mut write_half) = tokio::io::split(client);
        tokio::spawn(async move {
            let line = "a".repeat(1000);
            let mut body = String::new();
            for _ in 0..1100 {
                body.push_str(&line);
                body.push_str("\r\n");
            }
            let _ = write_half.write_all(body.as_bytes()).await;
        });

        let mut reader = BufReader::new(read_half);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(
            reply.trim_end_matches(['\r', '\n']),
            "451 4.3.0 Error: Maximum DATA size exceeded"
        );

        // The hard limit kills the connection outright: no further reply,
        // the server closes its end.
        let mut buf = [0u8; 1];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dot_stuffing_is_reversed() {
        let (mut engine, mut client) = new_engine(test_server(), allowed(&["."])).await;
        let handle = tokio::spawn(async move { engine.run().await.unwrap(); });
        read_line(&mut client).await;
        write(&mut client, "HELO x").await;
        read_line(&mut client).await;
        write(&mut client, "MAIL FROM:<a@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "RCPT TO:<b@example.com>").await;
        read_line(&mut client).await;
        write(&mut client, "DATA").await;
        read_line(&mut client).await;
        write(&mut client, "..text").await;
        write(&mut client, ".").await;
        assert_eq!(read_line(&mut client).await, "250 2.0.0 OK");
        write(&mut client, "QUIT").await;
        read_line(&mut client).await;
        handle.await.unwrap();
    }
}
