//! End-to-end transaction tests against a scripted engine listening on a
//! real Unix socket.

use anyhow::Result;
use mail_gate::config::Config;
use mail_gate::{ContentFilter, SmtpTransaction, Verdict};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct MockTransaction {
    mutations: Vec<String>,
    reply: Option<(String, String, String)>,
}

impl SmtpTransaction for MockTransaction {
    fn add_recipient(&mut self, rcpt: &str) -> Result<()> {
        self.mutations.push(format!("addrcpt {rcpt}"));
        Ok(())
    }
    fn delete_recipient(&mut self, rcpt: &str) -> Result<()> {
        self.mutations.push(format!("delrcpt {rcpt}"));
        Ok(())
    }
    fn add_header(&mut self, field: &str, value: &str) -> Result<()> {
        self.mutations.push(format!("addheader {field}: {value}"));
        Ok(())
    }
    fn change_header(&mut self, field: &str, index: u32, value: &str) -> Result<()> {
        self.mutations
            .push(format!("chgheader {index} {field}: {value}"));
        Ok(())
    }
    fn delete_header(&mut self, field: &str, index: u32) -> Result<()> {
        self.mutations.push(format!("delheader {index} {field}"));
        Ok(())
    }
    fn set_reply(&mut self, rcode: &str, xcode: &str, text: &str) -> Result<()> {
        self.reply = Some((rcode.to_string(), xcode.to_string(), text.to_string()));
        Ok(())
    }
}

/// Binds the engine socket and serves exactly one scripted exchange: read
/// request lines up to the blank terminator, answer with `response`, and
/// hand the collected request lines back to the test.
fn spawn_engine(socket: &Path, response: &'static str) -> JoinHandle<Vec<String>> {
    let listener = UnixListener::bind(socket).unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap() == 0 {
                break;
            }
            let line = line.trim_end_matches('\n').to_string();
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        write_half.write_all(response.as_bytes()).await.unwrap();
        write_half.flush().await.unwrap();
        lines
    })
}

fn filter_for(base: &Path, socket: &Path) -> ContentFilter {
    ContentFilter::new(Config {
        engine_socket: socket.to_path_buf(),
        work_dir: base.to_path_buf(),
    })
}

fn socket_path(base: &Path) -> PathBuf {
    base.join("engine.sock")
}

fn work_area_count(base: &Path) -> usize {
    std::fs::read_dir(base)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("af")
        })
        .count()
}

fn default_reply() -> Option<(String, String, String)> {
    Some((
        "451".to_string(),
        "4.6.0".to_string(),
        "Content scanner malfunction".to_string(),
    ))
}

#[tokio::test]
async fn test_full_transaction_with_accepting_engine() {
    let base = tempfile::tempdir().unwrap();
    let socket = socket_path(base.path());
    let engine = spawn_engine(
        &socket,
        "addrcpt=d@w\naddheader=X-Spam-Status No\nreturn_value=accept\n\n",
    );

    let mut filter = filter_for(base.path(), &socket);
    let mut txn = MockTransaction::default();

    assert_eq!(
        filter.on_connect(&mut txn, Some("mx.example.org"), Some("192.0.2.1")),
        Verdict::Continue
    );
    assert_eq!(filter.on_helo(&mut txn, "first.example.org"), Verdict::Continue);
    assert_eq!(
        filter.on_helo(&mut txn, "client.example.org"),
        Verdict::Continue
    );
    assert_eq!(
        filter.on_mail_from(&mut txn, Some("QID77"), "a@x"),
        Verdict::Continue
    );
    assert_eq!(filter.on_rcpt_to(&mut txn, "b@y"), Verdict::Continue);
    assert_eq!(filter.on_rcpt_to(&mut txn, "c@z"), Verdict::Continue);
    assert_eq!(
        filter.on_header(&mut txn, "Subject", "hello"),
        Verdict::Continue
    );
    assert_eq!(filter.on_end_of_headers(&mut txn), Verdict::Continue);
    assert_eq!(
        filter.on_body_chunk(&mut txn, b"line one\r\n"),
        Verdict::Continue
    );

    assert_eq!(filter.on_end_of_message(&mut txn).await, Verdict::Accept);

    // The engine saw the complete request in envelope order, with the
    // replacing greeting and this message's work area paths.
    let work = base.path().join("afQID77");
    let request = engine.await.unwrap();
    assert_eq!(
        request,
        vec![
            "request=AM.PDP".to_string(),
            "queue_id=QID77".to_string(),
            "sender=a@x".to_string(),
            "recipient=b@y".to_string(),
            "recipient=c@z".to_string(),
            format!("tempdir={}", work.display()),
            "tempdir_removed_by=server".to_string(),
            format!("mail_file={}", work.join("email.txt").display()),
            "delivery_care_of=client".to_string(),
            "client_address=192.0.2.1".to_string(),
            "client_name=mx.example.org".to_string(),
            "helo_name=client.example.org".to_string(),
        ]
    );

    assert_eq!(
        txn.mutations,
        vec!["addrcpt d@w", "addheader X-Spam-Status: No"]
    );
    assert!(txn.reply.is_none());

    // The work area is released with the message, and close still answers.
    assert_eq!(work_area_count(base.path()), 0);
    assert_eq!(filter.on_close(), Verdict::Continue);
}

#[tokio::test]
async fn test_malformed_response_tempfails_with_default_reply() {
    let base = tempfile::tempdir().unwrap();
    let socket = socket_path(base.path());
    let _engine = spawn_engine(&socket, "addheadervalue\n\n");

    let mut filter = filter_for(base.path(), &socket);
    let mut txn = MockTransaction::default();

    filter.on_connect(&mut txn, None, None);
    filter.on_mail_from(&mut txn, Some("BAD1"), "a@x");
    filter.on_rcpt_to(&mut txn, "b@y");
    filter.on_header(&mut txn, "Subject", "hello");
    filter.on_end_of_headers(&mut txn);
    filter.on_body_chunk(&mut txn, b"body\r\n");

    assert_eq!(filter.on_end_of_message(&mut txn).await, Verdict::TempFail);
    assert!(txn.mutations.is_empty());
    assert_eq!(txn.reply, default_reply());
    assert_eq!(work_area_count(base.path()), 0);

    filter.on_close();
}

#[tokio::test]
async fn test_reject_with_engine_supplied_reply() {
    let base = tempfile::tempdir().unwrap();
    let socket = socket_path(base.path());
    let _engine = spawn_engine(
        &socket,
        "setreply=550 5.7.1 Spam rejected\nreturn_value=reject\n\n",
    );

    let mut filter = filter_for(base.path(), &socket);
    let mut txn = MockTransaction::default();

    filter.on_connect(&mut txn, None, None);
    filter.on_mail_from(&mut txn, None, "a@x");
    filter.on_rcpt_to(&mut txn, "b@y");
    filter.on_header(&mut txn, "Subject", "hello");
    filter.on_end_of_headers(&mut txn);
    filter.on_body_chunk(&mut txn, b"body\r\n");

    assert_eq!(filter.on_end_of_message(&mut txn).await, Verdict::Reject);
    assert_eq!(
        txn.reply,
        Some((
            "550".to_string(),
            "5.7.1".to_string(),
            "Spam rejected".to_string()
        ))
    );

    filter.on_close();
}

#[tokio::test]
async fn test_engine_reply_survives_a_later_protocol_error() {
    let base = tempfile::tempdir().unwrap();
    let socket = socket_path(base.path());
    let _engine = spawn_engine(
        &socket,
        "setreply=451 4.7.1 Try again later\nbadline\n\n",
    );

    let mut filter = filter_for(base.path(), &socket);
    let mut txn = MockTransaction::default();

    filter.on_connect(&mut txn, None, None);
    filter.on_mail_from(&mut txn, Some("KEEP1"), "a@x");
    filter.on_rcpt_to(&mut txn, "b@y");
    filter.on_header(&mut txn, "Subject", "hello");
    filter.on_end_of_headers(&mut txn);
    filter.on_body_chunk(&mut txn, b"body\r\n");

    // The exchange fails, but the engine's own 4xx reply is kept rather
    // than replaced by the default malfunction reply.
    assert_eq!(filter.on_end_of_message(&mut txn).await, Verdict::TempFail);
    assert_eq!(
        txn.reply,
        Some((
            "451".to_string(),
            "4.7.1".to_string(),
            "Try again later".to_string()
        ))
    );

    filter.on_close();
}

#[tokio::test]
async fn test_second_message_on_same_connection() {
    let base = tempfile::tempdir().unwrap();
    let socket = socket_path(base.path());
    let engine = spawn_engine(&socket, "return_value=continue\n\n");

    let mut filter = filter_for(base.path(), &socket);
    let mut txn = MockTransaction::default();

    filter.on_connect(&mut txn, Some("mx.example.org"), None);

    // First message is abandoned before end of message.
    filter.on_mail_from(&mut txn, Some("ONE"), "first@x");
    filter.on_rcpt_to(&mut txn, "drop@y");
    assert_eq!(filter.on_abort(), Verdict::Continue);
    assert_eq!(work_area_count(base.path()), 0);

    // Second message goes through; its request carries only its own
    // envelope.
    filter.on_mail_from(&mut txn, Some("TWO"), "second@x");
    filter.on_rcpt_to(&mut txn, "keep@y");
    filter.on_header(&mut txn, "Subject", "again");
    filter.on_end_of_headers(&mut txn);
    filter.on_body_chunk(&mut txn, b"body\r\n");
    assert_eq!(filter.on_end_of_message(&mut txn).await, Verdict::Continue);

    let request = engine.await.unwrap();
    assert!(request.contains(&"queue_id=TWO".to_string()));
    assert!(request.contains(&"sender=second@x".to_string()));
    assert!(request.contains(&"recipient=keep@y".to_string()));
    assert!(!request.iter().any(|l| l.contains("first@x")));
    assert!(!request.iter().any(|l| l.contains("drop@y")));

    assert_eq!(filter.on_close(), Verdict::Continue);
}
