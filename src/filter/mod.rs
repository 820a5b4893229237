//! The per-connection transaction state machine.
//!
//! The embedding transport owns one [`ContentFilter`] per accepted SMTP
//! connection and drives it with the ordered transaction events. The filter
//! accumulates envelope metadata, stages the message through the spool
//! manager, runs the engine exchange at end-of-message, and answers every
//! event with exactly one [`Verdict`]. All internal failures are converted
//! to a verdict here; nothing panics or leaks an error across this surface.

use crate::config::Config;
use crate::engine::{dispatch_response, EngineClient, ScanRequest};
use crate::spool::Spool;
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};

// Default SMTP reply installed whenever a message fails inside the filter,
// unless the engine already set a more specific 4xx/5xx reply.
const TEMPFAIL_RCODE: &str = "451";
const TEMPFAIL_XCODE: &str = "4.6.0";
const TEMPFAIL_REASON: &str = "Content scanner malfunction";

const NOQUEUE: &str = "NOQUEUE";

/// Terminal decision returned to the transport for each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep processing the transaction.
    Continue,
    /// Accept the message outright; skip further filtering.
    Accept,
    /// Reject the message permanently.
    Reject,
    /// Silently drop the message.
    Discard,
    /// Fail the message temporarily; the client may retry.
    TempFail,
}

/// Mutation API of the live SMTP transaction, implemented by the embedding
/// transport. Header indexes count occurrences of the named field, starting
/// at the transport's own origin.
pub trait SmtpTransaction {
    fn add_recipient(&mut self, rcpt: &str) -> Result<()>;
    fn delete_recipient(&mut self, rcpt: &str) -> Result<()>;
    fn add_header(&mut self, field: &str, value: &str) -> Result<()>;
    fn change_header(&mut self, field: &str, index: u32, value: &str) -> Result<()>;
    fn delete_header(&mut self, field: &str, index: u32) -> Result<()>;
    /// Overrides the SMTP reply code, extended code and text for the
    /// current event's answer.
    fn set_reply(&mut self, rcode: &str, xcode: &str, text: &str) -> Result<()>;
}

/// Per-message state. Created at envelope-sender time, disposed at end of
/// message, at abort, or when the next message begins, whichever first. The
/// owned [`Spool`] tears the work area down when this drops.
struct MessageContext {
    queue_id: Option<String>,
    sender: String,
    recipients: Vec<String>,
    spool: Spool,
}

impl MessageContext {
    fn queue_label(&self) -> &str {
        self.queue_id.as_deref().unwrap_or(NOQUEUE)
    }
}

/// Per-connection state, carrying at most one live message at a time.
struct ConnectionContext {
    client_addr: Option<String>,
    client_name: Option<String>,
    helo: Option<String>,
    message: Option<MessageContext>,
}

/// State machine for one SMTP connection.
pub struct ContentFilter {
    config: Config,
    engine: EngineClient,
    conn: Option<ConnectionContext>,
}

impl ContentFilter {
    pub fn new(config: Config) -> Self {
        let engine = EngineClient::new(config.engine_socket.clone());
        ContentFilter {
            config,
            engine,
            conn: None,
        }
    }

    /// Connection start: probe the engine and allocate the connection
    /// context. The hostname and address may be unknown to the transport.
    pub fn on_connect<T: SmtpTransaction>(
        &mut self,
        txn: &mut T,
        hostname: Option<&str>,
        addr: Option<&str>,
    ) -> Verdict {
        info!("{}: CONNECT: {}", NOQUEUE, hostname.unwrap_or("unknown"));

        if !self.engine.is_available() {
            return self.fail(
                txn,
                anyhow!(
                    "engine socket {} is not available",
                    self.engine.socket().display()
                ),
            );
        }

        self.conn = Some(ConnectionContext {
            client_addr: addr.filter(|a| !a.is_empty()).map(str::to_string),
            client_name: hostname.filter(|h| !h.is_empty()).map(str::to_string),
            helo: None,
            message: None,
        });
        Verdict::Continue
    }

    /// HELO/EHLO greeting; may arrive zero to three times per connection,
    /// each non-empty greeting replacing the previous one.
    pub fn on_helo<T: SmtpTransaction>(&mut self, txn: &mut T, helo: &str) -> Verdict {
        debug!("{}: HELO: {}", self.queue_label(), helo);
        if self.conn.is_none() {
            return self.missing_context(txn);
        }
        if let Some(conn) = self.conn.as_mut() {
            if !helo.is_empty() {
                conn.helo = Some(helo.to_string());
            }
        }
        Verdict::Continue
    }

    /// Envelope sender: begins a message transaction. Any prior message on
    /// this connection is disposed first. The queue identifier, when the
    /// transport supplies one, is fixed here for the life of the message.
    pub fn on_mail_from<T: SmtpTransaction>(
        &mut self,
        txn: &mut T,
        queue_id: Option<&str>,
        sender: &str,
    ) -> Verdict {
        match self.try_mail_from(queue_id, sender) {
            Ok(()) => Verdict::Continue,
            Err(e) => self.fail(txn, e),
        }
    }

    fn try_mail_from(&mut self, queue_id: Option<&str>, sender: &str) -> Result<()> {
        let work_dir = self.config.work_dir.clone();
        let conn = self
            .conn
            .as_mut()
            .context("connection context is not set")?;

        // One live message per connection; release the previous work area
        // before staging a new one.
        conn.message.take();

        let queue_id = queue_id
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        info!(
            "{}: MAIL FROM: {}",
            queue_id.as_deref().unwrap_or(NOQUEUE),
            sender
        );

        let spool = Spool::create(&work_dir, queue_id.as_deref())?;
        conn.message = Some(MessageContext {
            queue_id,
            sender: sender.to_string(),
            recipients: Vec::new(),
            spool,
        });
        Ok(())
    }

    /// Envelope recipient, one or more per message, order preserved.
    pub fn on_rcpt_to<T: SmtpTransaction>(&mut self, txn: &mut T, rcpt: &str) -> Verdict {
        match self.try_rcpt_to(rcpt) {
            Ok(()) => Verdict::Continue,
            Err(e) => self.fail(txn, e),
        }
    }

    fn try_rcpt_to(&mut self, rcpt: &str) -> Result<()> {
        let msg = self.message_mut()?;
        info!("{}: RCPT TO: {}", msg.queue_label(), rcpt);
        msg.recipients.push(rcpt.to_string());
        Ok(())
    }

    /// One message header, spooled as a normalized `field: value` line.
    pub fn on_header<T: SmtpTransaction>(
        &mut self,
        txn: &mut T,
        field: &str,
        value: &str,
    ) -> Verdict {
        match self.try_header(field, value) {
            Ok(()) => Verdict::Continue,
            Err(e) => self.fail(txn, e),
        }
    }

    fn try_header(&mut self, field: &str, value: &str) -> Result<()> {
        let msg = self.message_mut()?;
        debug!("{}: HEADER: {}: {}", msg.queue_label(), field, value);
        msg.spool.write_header(field, value)
    }

    /// End of headers: spool the header/body separator line.
    pub fn on_end_of_headers<T: SmtpTransaction>(&mut self, txn: &mut T) -> Verdict {
        match self.try_end_of_headers() {
            Ok(()) => Verdict::Continue,
            Err(e) => self.fail(txn, e),
        }
    }

    fn try_end_of_headers(&mut self) -> Result<()> {
        let msg = self.message_mut()?;
        debug!("{}: END OF HEADERS", msg.queue_label());
        msg.spool.end_headers()
    }

    /// One raw body chunk, spooled verbatim.
    pub fn on_body_chunk<T: SmtpTransaction>(&mut self, txn: &mut T, chunk: &[u8]) -> Verdict {
        match self.try_body_chunk(chunk) {
            Ok(()) => Verdict::Continue,
            Err(e) => self.fail(txn, e),
        }
    }

    fn try_body_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let msg = self.message_mut()?;
        debug!("{}: body chunk: {}", msg.queue_label(), chunk.len());
        msg.spool.write_chunk(chunk)
    }

    /// End of message: close the spool, run the engine exchange, apply its
    /// instructions and return its verdict. The message context, work
    /// directory and spool file are released before this returns, on every
    /// path.
    pub async fn on_end_of_message<T: SmtpTransaction>(&mut self, txn: &mut T) -> Verdict {
        let mut reply_overridden = false;
        let verdict = match self.scan_message(txn, &mut reply_overridden).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("{}: {:#}", self.queue_label(), e);
                if !reply_overridden {
                    Self::set_default_reply(txn);
                }
                Verdict::TempFail
            }
        };
        if let Some(conn) = self.conn.as_mut() {
            conn.message.take();
        }
        verdict
    }

    async fn scan_message<T: SmtpTransaction>(
        &mut self,
        txn: &mut T,
        reply_overridden: &mut bool,
    ) -> Result<Verdict> {
        let engine = self.engine.clone();
        let ConnectionContext {
            client_addr,
            client_name,
            helo,
            message,
        } = self
            .conn
            .as_mut()
            .context("connection context is not set")?;
        let msg = message.as_mut().context("message context is not set")?;

        info!("{}: CONTENT CHECK", msg.queue_label());
        msg.spool.close()?;

        // Fresh connection per message, dropped (closed) on every exit
        // from this scope.
        let mut proto = engine.connect().await?;

        let request = ScanRequest {
            queue_id: msg.queue_id.as_deref(),
            sender: &msg.sender,
            recipients: &msg.recipients,
            work_dir: msg
                .spool
                .work_dir()
                .context("spool work directory is not set")?,
            mail_file: msg
                .spool
                .mail_file()
                .context("spool file path is not set")?,
            client_addr: client_addr.as_deref(),
            client_name: client_name.as_deref(),
            helo: helo.as_deref(),
        };
        request.write_to(&mut proto).await?;

        let verdict = dispatch_response(&mut proto, txn, reply_overridden).await?;
        debug!("{}: engine verdict {:?}", msg.queue_label(), verdict);
        Ok(verdict)
    }

    /// Message abort: release the message context only. Never fails, and is
    /// tolerant of arriving with no live message or connection at all.
    pub fn on_abort(&mut self) -> Verdict {
        info!("{}: ABORT", self.queue_label());
        match self.conn.as_mut() {
            Some(conn) => {
                conn.message.take();
            }
            None => debug!("{}: connection context is not set", NOQUEUE),
        }
        Verdict::Continue
    }

    /// Connection close: release the message context if present, then the
    /// connection context. Never fails.
    pub fn on_close(&mut self) -> Verdict {
        info!("{}: CLOSE", self.queue_label());
        // Dropping the contexts runs the spool disposal.
        self.conn.take();
        Verdict::Continue
    }

    fn message_mut(&mut self) -> Result<&mut MessageContext> {
        self.conn
            .as_mut()
            .context("connection context is not set")?
            .message
            .as_mut()
            .context("message context is not set")
    }

    fn queue_label(&self) -> &str {
        self.conn
            .as_ref()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.queue_label())
            .unwrap_or(NOQUEUE)
    }

    /// Single failure path for every event handler: log the error, install
    /// the default temporary-failure reply, and fail the message while the
    /// connection stays usable.
    fn fail<T: SmtpTransaction>(&self, txn: &mut T, err: anyhow::Error) -> Verdict {
        error!("{}: {:#}", self.queue_label(), err);
        Self::set_default_reply(txn);
        Verdict::TempFail
    }

    fn missing_context<T: SmtpTransaction>(&self, txn: &mut T) -> Verdict {
        self.fail(txn, anyhow!("connection context is not set"))
    }

    fn set_default_reply<T: SmtpTransaction>(txn: &mut T) {
        if let Err(e) = txn.set_reply(TEMPFAIL_RCODE, TEMPFAIL_XCODE, TEMPFAIL_REASON) {
            warn!(
                "could not set SMTP reply {} {} {}: {:#}",
                TEMPFAIL_RCODE, TEMPFAIL_XCODE, TEMPFAIL_REASON, e
            );
        }
    }
}
