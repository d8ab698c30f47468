//! One SMTP conversation

use super::SmtpLimits;
use crate::alarm_parser::RawEvent;
use crate::error::Result;
use crate::mail_decoder::MailMessage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::net::IpAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Longest accepted command line; also the read granularity for DATA
const MAX_LINE: usize = 4096;

enum AuthStep {
    PlainResponse,
    LoginUsername,
    LoginPassword,
}

enum Line {
    Data(Vec<u8>),
    TooLong,
    Closed,
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Transaction {
    from: Option<String>,
    recipients: Vec<String>,
}

struct Session<'a> {
    limits: &'a SmtpLimits,
    peer: Option<IpAddr>,
    authenticated: bool,
    auth_step: Option<AuthStep>,
    tx: Transaction,
}

/// Run the SMTP dialogue on `stream` until QUIT, EOF, timeout or cancellation
pub(crate) async fn serve_session<S>(
    stream: S,
    peer: Option<IpAddr>,
    limits: &SmtpLimits,
    events: &mpsc::Sender<RawEvent>,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let mut session = Session {
        limits,
        peer,
        authenticated: false,
        auth_step: None,
        tx: Transaction::default(),
    };

    reply(&mut write, &format!("220 {} ESMTP ready", limits.domain)).await?;

    loop {
        let line = match read_line(&mut reader, limits, cancel).await? {
            Line::Data(line) => line,
            Line::TooLong => {
                tracing::warn!(peer = ?session.peer, "Command line too long, closing connection");
                reply(&mut write, "500 5.5.2 Line too long, closing connection").await?;
                break;
            }
            Line::Closed => break,
            Line::TimedOut => {
                reply(&mut write, "421 4.4.2 Idle timeout, closing connection").await?;
                break;
            }
            Line::Cancelled => {
                reply(&mut write, "421 4.3.2 Service shutting down").await?;
                break;
            }
        };

        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(step) = session.auth_step.take() {
            let response = session.continue_auth(step, line);
            reply(&mut write, &response).await?;
            continue;
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "EHLO" => {
                let ehlo = format!(
                    "250-{}\r\n250-AUTH PLAIN LOGIN\r\n250-SIZE {}\r\n250 8BITMIME",
                    limits.domain, limits.max_message_bytes
                );
                reply(&mut write, &ehlo).await?;
            }
            "HELO" => reply(&mut write, &format!("250 {}", limits.domain)).await?,
            "AUTH" => {
                let response = session.start_auth(args);
                reply(&mut write, &response).await?;
            }
            "MAIL" => {
                let response = session.mail(args);
                reply(&mut write, &response).await?;
            }
            "RCPT" => {
                let response = session.rcpt(args);
                reply(&mut write, &response).await?;
            }
            "DATA" => {
                if session.tx.from.is_none() || session.tx.recipients.is_empty() {
                    reply(&mut write, "503 5.5.1 Bad sequence of commands").await?;
                    continue;
                }
                reply(&mut write, "354 Start mail input; end with <CRLF>.<CRLF>").await?;

                match read_data(&mut reader, limits, cancel).await? {
                    Some(data) if data.len() <= limits.max_message_bytes => {
                        session.deliver(data, events);
                        reply(&mut write, "250 2.0.0 OK: queued").await?;
                    }
                    Some(_) => {
                        tracing::warn!(peer = ?session.peer, "Mail exceeds size limit, rejected");
                        session.tx = Transaction::default();
                        reply(&mut write, "552 5.3.4 Message size exceeds fixed limit").await?;
                    }
                    None => break,
                }
            }
            "RSET" => {
                session.tx = Transaction::default();
                session.authenticated = false;
                tracing::debug!(peer = ?session.peer, "Session reset");
                reply(&mut write, "250 2.0.0 OK").await?;
            }
            "NOOP" => reply(&mut write, "250 2.0.0 OK").await?,
            "QUIT" => {
                reply(&mut write, "221 2.0.0 Bye").await?;
                break;
            }
            _ => reply(&mut write, "500 5.5.2 Command not recognized").await?,
        }
    }

    let _ = write.shutdown().await;
    Ok(())
}

impl Session<'_> {
    fn start_auth(&mut self, args: &str) -> String {
        if self.authenticated {
            return "503 5.5.1 Already authenticated".to_string();
        }

        let mut parts = args.split_whitespace();
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let initial = parts.next();

        match (mechanism.as_str(), initial) {
            ("PLAIN", Some(initial)) => self.finish_plain(initial),
            ("PLAIN", None) => {
                self.auth_step = Some(AuthStep::PlainResponse);
                "334 ".to_string()
            }
            ("LOGIN", Some(username)) => {
                self.log_username(username);
                self.auth_step = Some(AuthStep::LoginPassword);
                "334 UGFzc3dvcmQ6".to_string()
            }
            ("LOGIN", None) => {
                self.auth_step = Some(AuthStep::LoginUsername);
                "334 VXNlcm5hbWU6".to_string()
            }
            _ => "504 5.5.4 Unrecognized authentication type".to_string(),
        }
    }

    fn continue_auth(&mut self, step: AuthStep, line: &str) -> String {
        if line.trim() == "*" {
            return "501 5.0.0 Authentication cancelled".to_string();
        }

        match step {
            AuthStep::PlainResponse => self.finish_plain(line),
            AuthStep::LoginUsername => {
                self.log_username(line);
                self.auth_step = Some(AuthStep::LoginPassword);
                "334 UGFzc3dvcmQ6".to_string()
            }
            AuthStep::LoginPassword => self.accept_auth(),
        }
    }

    /// PLAIN response: base64("authzid\0username\0password")
    fn finish_plain(&mut self, encoded: &str) -> String {
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return "501 5.5.2 Cannot decode response".to_string();
        };
        let username = decoded
            .split(|b| *b == 0)
            .nth(1)
            .map(|u| String::from_utf8_lossy(u).into_owned())
            .unwrap_or_default();
        tracing::debug!(peer = ?self.peer, username = %username, "AUTH PLAIN");
        self.accept_auth()
    }

    fn log_username(&self, encoded: &str) {
        let username = STANDARD
            .decode(encoded.trim())
            .map(|u| String::from_utf8_lossy(&u).into_owned())
            .unwrap_or_default();
        tracing::debug!(peer = ?self.peer, username = %username, "AUTH LOGIN");
    }

    /// Any credentials are accepted
    fn accept_auth(&mut self) -> String {
        self.authenticated = true;
        "235 2.7.0 Authentication successful".to_string()
    }

    fn mail(&mut self, args: &str) -> String {
        if !self.authenticated {
            tracing::warn!(peer = ?self.peer, "MAIL before AUTH rejected");
            return "530 5.7.0 Authentication required".to_string();
        }
        let Some(from) = path_argument(args, "FROM:") else {
            return "501 5.5.4 Syntax: MAIL FROM:<address>".to_string();
        };
        tracing::debug!(peer = ?self.peer, from = %from, "Mail from");
        self.tx = Transaction {
            from: Some(from),
            recipients: Vec::new(),
        };
        "250 2.0.0 OK".to_string()
    }

    fn rcpt(&mut self, args: &str) -> String {
        if self.tx.from.is_none() {
            return "503 5.5.1 Bad sequence of commands".to_string();
        }
        if self.tx.recipients.len() >= self.limits.max_recipients {
            return "452 4.5.3 Too many recipients".to_string();
        }
        let Some(to) = path_argument(args, "TO:") else {
            return "501 5.5.4 Syntax: RCPT TO:<address>".to_string();
        };
        tracing::debug!(peer = ?self.peer, to = %to, "Rcpt to");
        self.tx.recipients.push(to);
        "250 2.0.0 OK".to_string()
    }

    fn deliver(&mut self, data: Vec<u8>, events: &mpsc::Sender<RawEvent>) {
        let tx = std::mem::take(&mut self.tx);
        let from = tx.from.unwrap_or_default();
        tracing::debug!(peer = ?self.peer, from = %from, size = data.len(), "Mail received");

        let mail = MailMessage::from_raw(from, tx.recipients, data, self.peer);
        match events.try_send(RawEvent::Mail(mail)) {
            Ok(()) => tracing::info!(peer = ?self.peer, "Mail queued for alarm processing"),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(peer = ?self.peer, "Mail channel is full, dropping mail");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(peer = ?self.peer, "Mail channel closed, dropping mail");
            }
        }
    }
}

/// `<addr>` after a case-insensitive keyword; ESMTP parameters are ignored
fn path_argument(args: &str, keyword: &str) -> Option<String> {
    let head = args.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args[keyword.len()..].trim();
    let path = match rest.strip_prefix('<') {
        Some(inner) => inner.split('>').next()?,
        None => rest.split_whitespace().next()?,
    };
    Some(path.to_string())
}

async fn reply<W: AsyncWrite + Unpin>(write: &mut W, line: &str) -> Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\r\n").await?;
    write.flush().await?;
    Ok(())
}

/// Read through the next newline, at most `limit` bytes
async fn read_bounded<R>(
    reader: &mut R,
    limit: usize,
    limits: &SmtpLimits,
    cancel: &CancellationToken,
) -> Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut bounded = (&mut *reader).take(limit as u64);
    let read = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(Line::Cancelled),
        read = tokio::time::timeout(limits.command_timeout, bounded.read_until(b'\n', &mut line)) => read,
    };

    match read {
        Err(_) => Ok(Line::TimedOut),
        Ok(Ok(0)) => Ok(Line::Closed),
        Ok(Ok(_)) => Ok(Line::Data(line)),
        Ok(Err(e)) => Err(e.into()),
    }
}

/// One command line; a line that does not end within `MAX_LINE` bytes is `TooLong`
async fn read_line<R>(reader: &mut R, limits: &SmtpLimits, cancel: &CancellationToken) -> Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    match read_bounded(reader, MAX_LINE, limits, cancel).await? {
        Line::Data(line) if line.len() >= MAX_LINE && !line.ends_with(b"\n") => Ok(Line::TooLong),
        other => Ok(other),
    }
}

/// Message body up to the lone `.` line, dot-unstuffed.
///
/// Input is consumed in chunks of at most `MAX_LINE` bytes. Bytes beyond the
/// size limit are read and discarded so the dialogue stays in sync; the
/// returned body is then one byte over the limit. `None` means the
/// connection ended first.
async fn read_data<R>(reader: &mut R, limits: &SmtpLimits, cancel: &CancellationToken) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut data = Vec::new();
    let mut oversized = false;
    let mut line_start = true;

    loop {
        let chunk = match read_bounded(reader, MAX_LINE, limits, cancel).await? {
            Line::Data(chunk) => chunk,
            _ => return Ok(None),
        };
        let complete = chunk.ends_with(b"\n");

        if line_start && complete {
            let content = chunk.strip_suffix(b"\n").unwrap_or(&chunk);
            let content = content.strip_suffix(b"\r").unwrap_or(content);
            if content == b"." {
                break;
            }
        }

        if !oversized {
            let unstuffed = if line_start && chunk.starts_with(b"..") { &chunk[1..] } else { &chunk[..] };
            data.extend_from_slice(unstuffed);
            if data.len() > limits.max_message_bytes {
                oversized = true;
                data.truncate(limits.max_message_bytes + 1);
            }
        }

        line_start = complete;
    }

    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf};

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\r\n").await.unwrap();
        }

        /// Full (possibly multi-line) reply
        async fn reply(&mut self) -> String {
            let mut all = String::new();
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                all.push_str(&line);
                if line.len() < 4 || line.as_bytes()[3] == b' ' {
                    break;
                }
            }
            all
        }

        async fn command(&mut self, line: &str) -> String {
            self.send(line).await;
            self.reply().await
        }
    }

    fn start(
        limits: SmtpLimits,
        capacity: usize,
    ) -> (Client, mpsc::Receiver<RawEvent>, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(capacity);
        let peer: Option<IpAddr> = Some("192.168.1.108".parse().unwrap());
        let handle = tokio::spawn(async move {
            serve_session(server, peer, &limits, &tx, &CancellationToken::new()).await
        });
        let (read, writer) = tokio::io::split(client);
        (
            Client {
                reader: BufReader::new(read),
                writer,
            },
            rx,
            handle,
        )
    }

    async fn authenticated(limits: SmtpLimits, capacity: usize) -> (Client, mpsc::Receiver<RawEvent>, tokio::task::JoinHandle<Result<()>>) {
        let (mut client, rx, handle) = start(limits, capacity);
        assert!(client.reply().await.starts_with("220"));
        assert!(client.command("EHLO cam").await.contains("AUTH PLAIN LOGIN"));
        // "\0admin\0pw"
        assert!(client.command("AUTH PLAIN AGFkbWluAHB3").await.starts_with("235"));
        (client, rx, handle)
    }

    #[tokio::test]
    async fn test_full_transaction_delivers_mail() {
        let (mut client, mut rx, handle) = authenticated(SmtpLimits::default(), 4).await;

        assert!(client.command("MAIL FROM:<cam@example.com> SIZE=100").await.starts_with("250"));
        assert!(client.command("RCPT TO:<alarm@bridge>").await.starts_with("250"));
        assert!(client.command("DATA").await.starts_with("354"));
        client.send("Subject: alarm").await;
        client.send("").await;
        client.send("Alarm Event: Motion Detect").await;
        client.send("..leading dot").await;
        assert!(client.command(".").await.starts_with("250"));
        assert!(client.command("QUIT").await.starts_with("221"));
        handle.await.unwrap().unwrap();

        let RawEvent::Mail(mail) = rx.recv().await.unwrap();
        assert_eq!(mail.from, "cam@example.com");
        assert_eq!(mail.to, vec!["alarm@bridge".to_string()]);
        assert_eq!(mail.peer, Some("192.168.1.108".parse().unwrap()));
        let text = String::from_utf8_lossy(&mail.raw);
        assert!(text.contains("\r\n.leading dot\r\n"));
        assert_eq!(mail.parts.len(), 1);
    }

    #[tokio::test]
    async fn test_mail_requires_auth() {
        let (mut client, _rx, _handle) = start(SmtpLimits::default(), 4);
        client.reply().await;
        client.command("HELO cam").await;
        assert!(client.command("MAIL FROM:<a@b>").await.starts_with("530"));
    }

    #[tokio::test]
    async fn test_auth_login_and_rset_clears_auth() {
        let (mut client, _rx, _handle) = start(SmtpLimits::default(), 4);
        client.reply().await;
        assert!(client.command("AUTH LOGIN").await.starts_with("334 VXNlcm5hbWU6"));
        assert!(client.command("YWRtaW4=").await.starts_with("334 UGFzc3dvcmQ6"));
        assert!(client.command("cHc=").await.starts_with("235"));
        assert!(client.command("MAIL FROM:<a@b>").await.starts_with("250"));
        assert!(client.command("RSET").await.starts_with("250"));
        assert!(client.command("MAIL FROM:<a@b>").await.starts_with("530"));
    }

    #[tokio::test]
    async fn test_recipient_limit() {
        let limits = SmtpLimits {
            max_recipients: 2,
            ..SmtpLimits::default()
        };
        let (mut client, _rx, _handle) = authenticated(limits, 4).await;
        client.command("MAIL FROM:<a@b>").await;
        assert!(client.command("RCPT TO:<1@x>").await.starts_with("250"));
        assert!(client.command("RCPT TO:<2@x>").await.starts_with("250"));
        assert!(client.command("RCPT TO:<3@x>").await.starts_with("452"));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let limits = SmtpLimits {
            max_message_bytes: 16,
            ..SmtpLimits::default()
        };
        let (mut client, mut rx, _handle) = authenticated(limits, 4).await;
        client.command("MAIL FROM:<a@b>").await;
        client.command("RCPT TO:<c@d>").await;
        client.command("DATA").await;
        client.send("this line is definitely longer than sixteen bytes").await;
        assert!(client.command(".").await.starts_with("552"));
        assert!(client.command("NOOP").await.starts_with("250"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_drops_but_accepts() {
        let (mut client, mut rx, _handle) = authenticated(SmtpLimits::default(), 1).await;
        for _ in 0..2 {
            client.command("MAIL FROM:<a@b>").await;
            client.command("RCPT TO:<c@d>").await;
            client.command("DATA").await;
            client.send("body").await;
            assert!(client.command(".").await.starts_with("250"));
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes() {
        let limits = SmtpLimits {
            command_timeout: Duration::from_secs(10),
            ..SmtpLimits::default()
        };
        let (mut client, _rx, handle) = start(limits, 1);
        client.reply().await;
        assert!(client.reply().await.starts_with("421"));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overlong_command_line_closes() {
        let (mut client, _rx, handle) = start(SmtpLimits::default(), 1);
        client.reply().await;
        client.writer.write_all(&vec![b'A'; MAX_LINE + 1000]).await.unwrap();
        assert!(client.reply().await.starts_with("500"));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_body_without_newlines_rejected() {
        let limits = SmtpLimits {
            max_message_bytes: 16,
            ..SmtpLimits::default()
        };
        let (mut client, mut rx, _handle) = authenticated(limits, 4).await;
        client.command("MAIL FROM:<a@b>").await;
        client.command("RCPT TO:<c@d>").await;
        client.command("DATA").await;
        client.writer.write_all(&vec![b'x'; 200 * 1024]).await.unwrap();
        client.send("").await;
        assert!(client.command(".").await.starts_with("552"));
        assert!(client.command("NOOP").await.starts_with("250"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_data_keeps_only_limit_plus_one() {
        let limits = SmtpLimits {
            max_message_bytes: 16,
            ..SmtpLimits::default()
        };
        let mut input = vec![b'x'; 100_000];
        input.extend_from_slice(b"\r\n.\r\nNOOP\r\n");
        let mut reader = BufReader::new(&input[..]);

        let data = read_data(&mut reader, &limits, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.len(), 17);

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "NOOP\r\n");
    }

    #[tokio::test]
    async fn test_read_data_dots_inside_long_lines() {
        // a chunk boundary right before ".." or "." is not a line start
        let mut input = vec![b'a'; MAX_LINE];
        input.extend_from_slice(b"..x\r\n");
        input.extend_from_slice(&vec![b'b'; MAX_LINE]);
        input.extend_from_slice(b".\r\n");
        input.extend_from_slice(b"..y\r\n.\r\n");
        let mut reader = BufReader::new(&input[..]);

        let data = read_data(&mut reader, &SmtpLimits::default(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let mut expected = vec![b'a'; MAX_LINE];
        expected.extend_from_slice(b"..x\r\n");
        expected.extend_from_slice(&vec![b'b'; MAX_LINE]);
        expected.extend_from_slice(b".\r\n.y\r\n");
        assert_eq!(data, expected);
    }

    #[test]
    fn test_path_argument() {
        assert_eq!(path_argument("FROM:<a@b> SIZE=1", "FROM:"), Some("a@b".to_string()));
        assert_eq!(path_argument("from: <a@b>", "FROM:"), Some("a@b".to_string()));
        assert_eq!(path_argument("TO:c@d", "TO:"), Some("c@d".to_string()));
        assert_eq!(path_argument("<a@b>", "FROM:"), None);
    }
}
