//! `ClientSession`: the per-connection state machine, independent of the
//! concrete transport (see `protocol::SmtpEngine`, which drives a session
//! over a concrete `IO`).

use crate::envelope::Envelope;

/// The session's place in the SMTP conversation. Generalizes
/// `MailLaser`'s five-state `SmtpState` into the explicit
/// `Greet/Cmd/Data/StartTls/Shutdown` set, so shutdown semantics can be
/// expressed as a state transition rather than a side flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greet,
    Cmd,
    Data,
    StartTls,
    Shutdown,
}

/// One TCP connection's SMTP session state, independent of the transport.
pub struct ClientSession {
    pub client_id: u64,
    pub remote_ip: String,
    pub state: SessionState,
    pub helo: String,
    pub tls: bool,
    pub envelope: Option<Envelope>,
    pub error_count: u32,
}

impl ClientSession {
    pub fn new(client_id: u64, remote_ip: String) -> Self {
        ClientSession {
            client_id,
            remote_ip,
            state: SessionState::Greet,
            helo: String::new(),
            tls: false,
            envelope: None,
            error_count: 0,
        }
    }

    /// Destroys any in-flight envelope and returns to a clean slate.
    /// Invoked by RSET, HELO/EHLO, and after a message is accepted/rejected.
    pub fn reset_envelope(&mut self) {
        self.envelope = None;
    }

    /// Begins a new envelope for a `MAIL FROM` transaction.
    pub fn start_envelope(&mut self) {
        self.envelope = Some(Envelope::new(
            self.remote_ip.clone(),
            self.helo.clone(),
            self.tls,
        ));
    }
}
