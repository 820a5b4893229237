//! Line protocol bridge to the external content-analysis engine.
//!
//! One exchange happens per message: the spooled message's metadata is sent
//! as `name=value` lines terminated by a blank line, and the engine answers
//! in the same shape with a sequence of mutation instructions plus a final
//! `return_value`. This module owns both directions: building and sending
//! the request ([`ScanRequest`]), and parsing/dispatching the response
//! ([`dispatch_response`]) against the transport's mutation API.

use crate::filter::{SmtpTransaction, Verdict};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// A connected exchange with the engine over its Unix socket.
pub type EngineConnection = EngineProtocol<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Locator for the analysis engine's socket.
///
/// Connections are opened fresh for each message and dropped when the
/// exchange ends; nothing is pooled or reused.
#[derive(Debug, Clone)]
pub struct EngineClient {
    socket: PathBuf,
}

impl EngineClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        EngineClient {
            socket: socket.into(),
        }
    }

    /// Path of the engine socket.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Cheap liveness probe used at connection start: the socket path must
    /// at least exist before we accept a transaction we would later have to
    /// fail at end-of-message.
    pub fn is_available(&self) -> bool {
        self.socket.exists()
    }

    /// Opens one connection to the engine. A single attempt, no retry.
    pub async fn connect(&self) -> Result<EngineConnection> {
        let stream = UnixStream::connect(&self.socket).await.with_context(|| {
            format!(
                "could not connect to engine socket {}",
                self.socket.display()
            )
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(EngineProtocol::new(BufReader::new(read_half), write_half))
    }
}

/// Manages line-oriented I/O for one engine exchange.
///
/// It's generic over the Reader (`R`) and Writer (`W`) types to allow
/// for testing with in-memory buffers.
pub struct EngineProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
}

impl<R, W> EngineProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        EngineProtocol { reader, writer }
    }

    /// Writes one `name=value` request line.
    pub async fn send_field(&mut self, name: &str, value: &str) -> Result<()> {
        debug!("engine request: {}={}", name, value);
        self.writer
            .write_all(format!("{name}={value}\n").as_bytes())
            .await
            .context("could not write to engine socket")
    }

    /// Writes the terminating blank line and flushes the request.
    pub async fn finish_request(&mut self) -> Result<()> {
        self.writer
            .write_all(b"\n")
            .await
            .context("could not write to engine socket")?;
        self.writer
            .flush()
            .await
            .context("could not write to engine socket")
    }

    /// Reads a single response line, with the trailing line ending trimmed.
    ///
    /// Returns `Ok(None)` when the engine closed the connection. An empty
    /// `Some` line is the response terminator, so EOF before it is reported
    /// by the caller as a truncated response.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buffer = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut buffer)
            .await
            .context("could not read from engine socket")?;

        if bytes_read == 0 {
            Ok(None)
        } else {
            Ok(Some(buffer.trim_end_matches(['\r', '\n']).to_string()))
        }
    }
}

/// Metadata of one spooled message, serialized into the outbound request.
///
/// Field order follows the original wire convention; the engine does not
/// depend on it except for the leading request marker and the terminating
/// blank line.
pub struct ScanRequest<'a> {
    pub queue_id: Option<&'a str>,
    pub sender: &'a str,
    pub recipients: &'a [String],
    pub work_dir: &'a Path,
    pub mail_file: &'a Path,
    pub client_addr: Option<&'a str>,
    pub client_name: Option<&'a str>,
    pub helo: Option<&'a str>,
}

impl ScanRequest<'_> {
    /// Sends the full request, terminated by the blank line.
    pub async fn write_to<R, W>(&self, proto: &mut EngineProtocol<R, W>) -> Result<()>
    where
        R: AsyncBufReadExt + Unpin,
        W: AsyncWriteExt + Unpin,
    {
        proto.send_field("request", "AM.PDP").await?;
        if let Some(queue_id) = self.queue_id {
            proto.send_field("queue_id", queue_id).await?;
        }
        proto.send_field("sender", self.sender).await?;
        for recipient in self.recipients {
            proto.send_field("recipient", recipient).await?;
        }
        proto
            .send_field("tempdir", &self.work_dir.to_string_lossy())
            .await?;
        // The work directory is ours to remove, not the engine's.
        proto.send_field("tempdir_removed_by", "server").await?;
        proto
            .send_field("mail_file", &self.mail_file.to_string_lossy())
            .await?;
        // Delivery stays with the MTA; the engine only renders a verdict.
        proto.send_field("delivery_care_of", "client").await?;
        if let Some(addr) = self.client_addr {
            proto.send_field("client_address", addr).await?;
        }
        if let Some(name) = self.client_name {
            proto.send_field("client_name", name).await?;
        }
        if let Some(helo) = self.helo {
            proto.send_field("helo_name", helo).await?;
        }
        proto.finish_request().await
    }
}

/// Reads the engine's response and applies each recognized instruction to
/// the live transaction, accumulating the final verdict.
///
/// The verdict defaults to [`Verdict::TempFail`] and is replaced by each
/// `return_value` line (last one wins). Reaching the blank line cleanly
/// returns the accumulated verdict. A grammar violation, a failed mutation,
/// or a truncated response aborts immediately with an error; the caller maps
/// that to a temporary failure and drops the connection.
///
/// `reply_overridden` is set once the engine has installed a 4xx/5xx SMTP
/// reply, so the caller knows not to clobber it with the default failure
/// reply afterwards.
pub async fn dispatch_response<R, W, T>(
    proto: &mut EngineProtocol<R, W>,
    txn: &mut T,
    reply_overridden: &mut bool,
) -> Result<Verdict>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
    T: SmtpTransaction,
{
    let mut verdict = Verdict::TempFail;

    loop {
        let line = match proto.read_line().await? {
            Some(line) => line,
            None => bail!("engine closed the connection before finishing the response"),
        };

        // End of response.
        if line.is_empty() {
            return Ok(verdict);
        }

        let (name, value) = line
            .split_once('=')
            .with_context(|| format!("malformed line: {line}"))?;

        match name {
            "addrcpt" => {
                info!("addrcpt={}", value);
                txn.add_recipient(value)
                    .with_context(|| format!("could not add recipient {value}"))?;
            }
            "delrcpt" => {
                info!("delrcpt={}", value);
                txn.delete_recipient(value)
                    .with_context(|| format!("could not delete recipient {value}"))?;
            }
            "addheader" => {
                info!("addheader={}", value);
                let (field, text) = value
                    .split_once(' ')
                    .with_context(|| format!("malformed line: {line}"))?;
                txn.add_header(field, text)
                    .with_context(|| format!("could not add header {field}: {text}"))?;
            }
            "chgheader" => {
                info!("chgheader={}", value);
                let (index, rest) = value
                    .split_once(' ')
                    .with_context(|| format!("malformed line: {line}"))?;
                let index: u32 = index
                    .parse()
                    .with_context(|| format!("malformed header index in line: {line}"))?;
                let (field, text) = rest
                    .split_once(' ')
                    .with_context(|| format!("malformed line: {line}"))?;
                txn.change_header(field, index, text).with_context(|| {
                    format!("could not change header {index} {field}: {text}")
                })?;
            }
            "delheader" => {
                info!("delheader={}", value);
                let (index, field) = value
                    .split_once(' ')
                    .with_context(|| format!("malformed line: {line}"))?;
                let index: u32 = index
                    .parse()
                    .with_context(|| format!("malformed header index in line: {line}"))?;
                txn.delete_header(field, index)
                    .with_context(|| format!("could not delete header {index} {field}"))?;
            }
            "return_value" => {
                info!("return_value={}", value);
                verdict = match value {
                    "continue" => Verdict::Continue,
                    "accept" => Verdict::Accept,
                    "reject" => Verdict::Reject,
                    "discard" => Verdict::Discard,
                    "tempfail" => Verdict::TempFail,
                    other => bail!("unknown return value {other}"),
                };
            }
            "setreply" => {
                let (rcode, rest) = value
                    .split_once(' ')
                    .with_context(|| format!("malformed line: {line}"))?;
                let (xcode, text) = rest
                    .split_once(' ')
                    .with_context(|| format!("malformed line: {line}"))?;
                if rcode.starts_with('4') || rcode.starts_with('5') {
                    info!("setreply={} {} {}", rcode, xcode, text);
                    txn.set_reply(rcode, xcode, text).with_context(|| {
                        format!("could not set reply {rcode} {xcode} {text}")
                    })?;
                    *reply_overridden = true;
                } else {
                    // Only 4xx/5xx are legal SMTP reply overrides; accept
                    // the line but do nothing.
                    debug!("ignore setreply={} {} {}", rcode, xcode, text);
                }
            }
            "exit_code" => {
                // Legacy field, carried by older engines.
                debug!("ignore legacy exit_code={}", value);
            }
            _ => {
                warn!("ignore unknown response {}={}", name, value);
            }
        }
    }
}
