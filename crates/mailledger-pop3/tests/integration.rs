//! Integration tests for the POP3 session driver.
//!
//! Each test runs a scripted server on one end of an in-memory duplex pipe
//! and a [`Session`] on the other, then checks the commands the server saw
//! and the events the browser received.

#![allow(clippy::unwrap_used)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use mailledger_pop3::connection::StartTls;
use mailledger_pop3::time::MockClock;
use mailledger_pop3::{
    AuthMethod, ChannelHandler, Config, Error, MailboxEvent, Security, Session, SessionHandle,
};

/// Client end of the pipe. STLS "succeeds" without encrypting anything.
struct MockStream {
    inner: DuplexStream,
    upgrades: Arc<AtomicUsize>,
}

impl StartTls for MockStream {
    async fn start_tls(self, _host: &str) -> mailledger_pop3::Result<Self> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(self)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// One scripted exchange: the command line expected, then the raw reply.
type Step = (String, String);

fn step(command: &str, reply: impl Into<String>) -> Step {
    (command.to_string(), reply.into())
}

/// Multi-line reply: `+OK`, the lines, the terminator.
fn block(lines: &[&str]) -> String {
    let mut out = String::from("+OK\r\n");
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

fn header_block(subject: &str, from: &str) -> String {
    block(&[
        &format!("Subject: {subject}"),
        &format!("From: {from}"),
        "Date: Tue, 1 Jul 2025 10:00:00 +0000",
        "",
    ])
}

/// Greets, then answers `steps` in order, asserting each command.
///
/// Returns every command line received, including any after the script.
fn serve(server: DuplexStream, greeting: &str, steps: Vec<Step>) -> JoinHandle<Vec<String>> {
    let greeting = format!("{greeting}\r\n");
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();

        write.write_all(greeting.as_bytes()).await.unwrap();
        for (expected, reply) in steps {
            let Some(line) = lines.next_line().await.unwrap() else {
                break;
            };
            assert_eq!(line, expected);
            received.push(line);
            write.write_all(reply.as_bytes()).await.unwrap();
        }
        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line);
        }
        received
    })
}

fn config(security: Security, auth: AuthMethod) -> Config {
    Config::builder("pop.example.com")
        .security(security)
        .auth(auth)
        .username("alice")
        .secret("secret")
        .io_timeout(Duration::from_secs(5))
        .build()
}

fn start(
    config: Config,
    upgrades: Arc<AtomicUsize>,
) -> (SessionHandle, mpsc::UnboundedReceiver<MailboxEvent>, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let stream = MockStream {
        inner: client,
        upgrades,
    };
    let (handler, rx) = ChannelHandler::new();
    let handle = Session::new(config)
        .with_clock(MockClock::shared())
        .spawn_on(stream, handler);
    (handle, rx, server)
}

/// Receives events until `done` matches one, returning all of them.
async fn until(
    rx: &mut mpsc::UnboundedReceiver<MailboxEvent>,
    done: impl Fn(&MailboxEvent) -> bool,
) -> Vec<MailboxEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let stop = done(&event) || event.is_terminal();
        events.push(event);
        if stop {
            break;
        }
    }
    events
}

fn user_login() -> Vec<Step> {
    vec![step("USER alice", "+OK\r\n"), step("PASS secret", "+OK\r\n")]
}

fn listing_steps(count: u32) -> Vec<Step> {
    let sizes: Vec<String> = (1..=count).map(|n| format!("{n} {}", n * 500)).collect();
    let uids: Vec<String> = (1..=count).map(|n| format!("{n} uid-{n}")).collect();
    let mut steps = vec![
        step("STAT", format!("+OK {count} {}\r\n", count * 500)),
        step(
            "UIDL",
            block(&uids.iter().map(String::as_str).collect::<Vec<_>>()),
        ),
        step(
            "LIST",
            block(&sizes.iter().map(String::as_str).collect::<Vec<_>>()),
        ),
    ];
    for n in 1..=count {
        steps.push(step(
            &format!("TOP {n} 0"),
            header_block(&format!("message {n}"), "bob@example.com"),
        ));
    }
    steps
}

#[tokio::test]
async fn test_full_listing_then_close() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(3));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    let events = until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    assert_eq!(events.last(), Some(&MailboxEvent::ListingComplete(3)));
    assert!(events.contains(&MailboxEvent::MailboxSize {
        count: 3,
        total_bytes: 1500
    }));
    assert!(events.contains(&MailboxEvent::Status(
        "Retrieving message headers (2 / 3)".to_string()
    )));

    let headers: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MailboxEvent::HeaderReady(h) => Some(h),
            _ => None,
        })
        .collect();
    assert_eq!(headers.len(), 3);
    assert_eq!(
        headers.iter().map(|h| h.ordinal).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(headers[1].subject, "message 2");
    assert_eq!(headers[1].from, "bob@example.com");
    assert_eq!(headers[2].size, 1500);

    handle.close();
    let rest = until(&mut rx, |_| false).await;
    assert_eq!(rest.last(), Some(&MailboxEvent::SessionDone));
    handle.wait().await.unwrap();

    let received = server.await.unwrap();
    assert_eq!(received.first().map(String::as_str), Some("USER alice"));
    assert_eq!(received.last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_delete_batch() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(7));
    steps.push(step("DELE 2", "+OK message 2 deleted\r\n"));
    steps.push(step("DELE 5", "+OK message 5 deleted\r\n"));
    steps.push(step("DELE 7", "+OK message 7 deleted\r\n"));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    handle.delete(vec![2, 5, 7]).unwrap();

    let events = until(&mut rx, |e| {
        matches!(e, MailboxEvent::DeletionBatchComplete(_))
    })
    .await;
    let deleted: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            MailboxEvent::MessageDeleted(n) => Some(*n),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, vec![2, 5, 7]);
    assert_eq!(
        events.last(),
        Some(&MailboxEvent::DeletionBatchComplete(3))
    );

    handle.close();
    handle.wait().await.unwrap();
    let received = server.await.unwrap();
    assert_eq!(received.last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_invalid_delete_request_keeps_session() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(2));
    steps.push(step("DELE 1", "+OK\r\n"));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    handle.delete(vec![9]).unwrap();
    handle.delete(vec![1]).unwrap();

    let events = until(&mut rx, |e| {
        matches!(e, MailboxEvent::DeletionBatchComplete(_))
    })
    .await;
    assert!(events.contains(&MailboxEvent::MessageDeleted(1)));

    handle.close();
    handle.wait().await.unwrap();
    let received = server.await.unwrap();
    assert!(!received.iter().any(|l| l == "DELE 9"));
}

#[tokio::test]
async fn test_stls_then_apop() {
    let upgrades = Arc::new(AtomicUsize::new(0));
    let config = Config::builder("pop.example.com")
        .security(Security::StartTls)
        .auth(AuthMethod::Apop)
        .username("mrose")
        .secret("tanstaaf")
        .build();
    let (handle, mut rx, server) = start(config, Arc::clone(&upgrades));
    let server = serve(
        server,
        "+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>",
        vec![
            step("STLS", "+OK begin TLS negotiation\r\n"),
            step(
                "APOP mrose c4c9334bac560ecc979e58001b3e22fb",
                "+OK maildrop locked and ready\r\n",
            ),
            step("STAT", "+OK 0 0\r\n"),
            step("QUIT", "+OK bye\r\n"),
        ],
    );

    let events = until(&mut rx, |_| false).await;
    assert!(events.contains(&MailboxEvent::MailboxEmpty));
    assert_eq!(events.last(), Some(&MailboxEvent::SessionDone));
    handle.wait().await.unwrap();
    assert_eq!(upgrades.load(Ordering::SeqCst), 1);

    let received = server.await.unwrap();
    assert_eq!(received.len(), 4);
}

#[tokio::test]
async fn test_empty_mailbox_logs_out() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.push(step("STAT", "+OK 0 0\r\n"));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    let events = until(&mut rx, |_| false).await;
    assert!(events.contains(&MailboxEvent::Status("No message".to_string())));
    assert!(events.contains(&MailboxEvent::MailboxEmpty));
    assert!(!events.iter().any(|e| matches!(e, MailboxEvent::ListingComplete(_))));
    handle.wait().await.unwrap();

    let received = server.await.unwrap();
    assert_eq!(received, vec!["USER alice", "PASS secret", "STAT", "QUIT"]);
}

#[tokio::test]
async fn test_uidl_and_last_unsupported() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.push(step("STAT", "+OK 2 700\r\n"));
    steps.push(step("UIDL", "-ERR unknown command\r\n"));
    steps.push(step("LAST", "-ERR unknown command\r\n"));
    steps.push(step("LIST", block(&["1 300", "2 400"])));
    steps.push(step("TOP 1 0", header_block("first", "a@example.com")));
    steps.push(step("TOP 2 0", header_block("second", "b@example.com")));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    let events = until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    assert_eq!(events.last(), Some(&MailboxEvent::ListingComplete(2)));

    handle.close();
    handle.wait().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_last_covers_every_message() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.push(step("STAT", "+OK 2 700\r\n"));
    steps.push(step("UIDL", "-ERR unknown command\r\n"));
    steps.push(step("LAST", "+OK 2\r\n"));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    let events = until(&mut rx, |_| false).await;
    assert!(events.contains(&MailboxEvent::MailboxEmpty));
    handle.wait().await.unwrap();
    assert_eq!(server.await.unwrap().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_cancel_during_header_listing() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let (reached_tx, reached_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"+OK POP3 ready\r\n").await.unwrap();

        for (expected, reply) in [
            ("USER alice", "+OK\r\n".to_string()),
            ("PASS secret", "+OK\r\n".to_string()),
            ("STAT", "+OK 3 1500\r\n".to_string()),
            ("UIDL", block(&["1 a", "2 b", "3 c"])),
            ("LIST", block(&["1 500", "2 500", "3 500"])),
        ] {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), expected);
            write.write_all(reply.as_bytes()).await.unwrap();
        }

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "TOP 1 0");
        reached_tx.send(()).unwrap();
        release_rx.await.unwrap();
        write
            .write_all(header_block("first", "a@example.com").as_bytes())
            .await
            .unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "QUIT");
        write.write_all(b"+OK bye\r\n").await.unwrap();
    });

    reached_rx.await.unwrap();
    handle.cancel();
    release_tx.send(()).unwrap();

    let events = until(&mut rx, |_| false).await;
    let headers = events
        .iter()
        .filter(|e| matches!(e, MailboxEvent::HeaderReady(_)))
        .count();
    assert_eq!(headers, 1);
    assert!(!events.iter().any(|e| matches!(e, MailboxEvent::ListingComplete(_))));
    assert_eq!(events.last(), Some(&MailboxEvent::SessionDone));

    handle.wait().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_locked_maildrop_is_reported() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let server = serve(
        server,
        "+OK POP3 ready",
        vec![
            step("USER alice", "+OK\r\n"),
            step("PASS secret", "-ERR [IN-USE] maildrop already locked\r\n"),
        ],
    );

    let events = until(&mut rx, |_| false).await;
    assert!(matches!(events.last(), Some(MailboxEvent::SessionError(_))));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(handle.wait().await, Err(Error::Locked(_))));

    drop(rx);
    server.await.unwrap();
}

#[tokio::test]
async fn test_bad_password_is_auth_error() {
    let (handle, _rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let server = serve(
        server,
        "+OK POP3 ready",
        vec![
            step("USER alice", "+OK\r\n"),
            step("PASS secret", "-ERR invalid password\r\n"),
        ],
    );

    assert!(matches!(handle.wait().await, Err(Error::Auth(_))));
    server.await.unwrap();
}

#[tokio::test]
async fn test_open_message() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(1));
    steps.push(step(
        "RETR 1",
        block(&["Subject: message 1", "", "hello", "..leading dot"]),
    ));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    handle.open(1).unwrap();

    let events = until(&mut rx, |e| matches!(e, MailboxEvent::MessageReady { .. })).await;
    let Some(MailboxEvent::MessageReady { ordinal, raw }) = events.last() else {
        panic!("expected MessageReady, got {events:?}");
    };
    assert_eq!(*ordinal, 1);
    assert_eq!(
        &raw[..],
        b"Subject: message 1\r\n\r\nhello\r\n.leading dot\r\n"
    );

    handle.close();
    handle.wait().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_hangup_is_session_error() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let server = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"+OK POP3 ready\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "USER alice");
        write.write_all(b"+OK\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PASS secret");
    });

    let events = until(&mut rx, |_| false).await;
    assert!(matches!(events.last(), Some(MailboxEvent::SessionError(_))));
    assert!(matches!(
        handle.wait().await,
        Err(Error::ConnectionClosed)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_dropping_handle_logs_out_when_idle() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(1));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    drop(handle);

    let events = until(&mut rx, |_| false).await;
    assert_eq!(events.last(), Some(&MailboxEvent::SessionDone));
    server.await.unwrap();
}

#[tokio::test]
async fn test_delete_then_close_before_listing_finishes() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(3));
    steps.push(step("DELE 1", "+OK message 1 deleted\r\n"));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    handle.delete(vec![1]).unwrap();
    handle.close();

    let events = until(&mut rx, |_| false).await;
    assert!(events.contains(&MailboxEvent::ListingComplete(3)));
    assert!(events.contains(&MailboxEvent::MessageDeleted(1)));
    assert!(events.contains(&MailboxEvent::DeletionBatchComplete(1)));
    assert_eq!(events.last(), Some(&MailboxEvent::SessionDone));
    handle.wait().await.unwrap();

    let received = server.await.unwrap();
    let dele = received.iter().position(|l| l == "DELE 1").unwrap();
    let quit = received.iter().position(|l| l == "QUIT").unwrap();
    assert!(dele < quit);
}

#[tokio::test]
async fn test_wait_applies_queued_delete() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(2));
    steps.push(step("DELE 2", "+OK\r\n"));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    handle.delete(vec![2]).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();

    let events = until(&mut rx, |_| false).await;
    assert!(events.contains(&MailboxEvent::DeletionBatchComplete(1)));
    assert_eq!(events.last(), Some(&MailboxEvent::SessionDone));
    assert_eq!(server.await.unwrap().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_cancel_while_idle_logs_out() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(1));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    handle.cancel();

    let rest = tokio::time::timeout(Duration::from_secs(5), until(&mut rx, |_| false))
        .await
        .unwrap();
    assert_eq!(rest.last(), Some(&MailboxEvent::SessionDone));
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.await.unwrap().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_wait_while_idle_logs_out() {
    let (handle, mut rx, server) = start(
        config(Security::None, AuthMethod::User),
        Arc::default(),
    );
    let mut steps = user_login();
    steps.extend(listing_steps(1));
    steps.push(step("QUIT", "+OK bye\r\n"));
    let server = serve(server, "+OK POP3 ready", steps);

    until(&mut rx, |e| matches!(e, MailboxEvent::ListingComplete(_))).await;
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();

    let rest = until(&mut rx, |_| false).await;
    assert_eq!(rest.last(), Some(&MailboxEvent::SessionDone));
    assert_eq!(server.await.unwrap().last().map(String::as_str), Some("QUIT"));
}
