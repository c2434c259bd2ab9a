//! Session driver.
//!
//! A [`Session`] runs one remote-mailbox inspection as a tokio task: it owns
//! the transport, pumps responses into the [`Protocol`] state machine, writes
//! the commands it yields and forwards its events to a [`MailboxHandler`].
//! The browser talks back through the returned [`SessionHandle`].
//!
//! ## Example
//!
//! ```no_run
//! use mailledger_pop3::connection::{Config, Session};
//! use mailledger_pop3::handler::LoggingHandler;
//!
//! # async fn run() -> mailledger_pop3::Result<()> {
//! let config = Config::new("pop.example.com", "alice", "secret");
//! let handle = Session::new(config).spawn(LoggingHandler);
//!
//! handle.delete(vec![2, 5, 7])?;
//! handle.close();
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::Config;
use super::framed::FramedStream;
use super::stream::{self, StartTls};
use crate::handler::{self, MailboxHandler};
use crate::protocol::{CancelHandle, Protocol, ProtocolEvent, ReadMode, ResponseReceiver, State};
use crate::time::{Clock, SystemClock};
use crate::{Error, Result};

/// A request from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Delete these ordinals, in order.
    Delete(Vec<u32>),
    /// Retrieve one message.
    Open(u32),
    /// Log out once every earlier request was handled.
    Close,
}

/// Handle to a running session.
///
/// Requests are applied in the order they were sent. Dropping the handle
/// makes the session log out once it is idle.
#[derive(Debug)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    cancel: CancelHandle,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    /// Asks the session to delete `ordinals`.
    ///
    /// The batch is applied once the session is idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session already ended.
    pub fn delete(&self, ordinals: Vec<u32>) -> Result<()> {
        self.send(Request::Delete(ordinals))
    }

    /// Asks the session to retrieve one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session already ended.
    pub fn open(&self, ordinal: u32) -> Result<()> {
        self.send(Request::Open(ordinal))
    }

    /// Asks the session to end. A no-op once it has.
    pub fn close(&self) {
        if self.send(Request::Close).is_err() {
            tracing::trace!("close requested after session end");
        }
    }

    /// Stops the session at its next loop decision, ahead of any queued
    /// request. A running delete batch still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // Wakes a driver parked on an idle session.
        if self.send(Request::Close).is_err() {
            tracing::trace!("cancel requested after session end");
        }
    }

    /// Returns `true` once the session task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the session to end.
    ///
    /// No further requests can be sent, so the session handles what is
    /// queued and then logs out.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session, the same one passed to
    /// [`MailboxHandler::on_session_error`].
    pub async fn wait(self) -> Result<()> {
        let Self { requests, task, .. } = self;
        drop(requests);
        task.await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// One remote-mailbox inspection run.
pub struct Session {
    config: Config,
    clock: Arc<dyn Clock>,
}

impl Session {
    /// Creates a session for `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for deletion timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connects and runs the session on a new task.
    ///
    /// The secret is resolved before connecting.
    pub fn spawn<H>(self, handler: H) -> SessionHandle
    where
        H: MailboxHandler + 'static,
    {
        self.spawn_with(handler, |config| async move { stream::connect(&config).await })
    }

    /// Runs the session over an already connected transport.
    pub fn spawn_on<S, H>(self, stream: S, handler: H) -> SessionHandle
    where
        S: StartTls + 'static,
        H: MailboxHandler + 'static,
    {
        self.spawn_with(handler, |_| async move { Ok(stream) })
    }

    fn spawn_with<S, H, F, Fut>(self, mut handler: H, connect: F) -> SessionHandle
    where
        S: StartTls + 'static,
        H: MailboxHandler + 'static,
        F: FnOnce(Config) -> Fut + Send + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelHandle::new();
        let driver_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let result = self.run(rx, driver_cancel, connect, &mut handler).await;
            match &result {
                Ok(()) => handler.on_session_done(),
                Err(e) => handler.on_session_error(e),
            }
            result
        });

        SessionHandle {
            requests: tx,
            cancel,
            task,
        }
    }

    async fn run<S, H, F, Fut>(
        self,
        requests: mpsc::UnboundedReceiver<Request>,
        cancel: CancelHandle,
        connect: F,
        handler: &mut H,
    ) -> Result<()>
    where
        S: StartTls,
        H: MailboxHandler,
        F: FnOnce(Config) -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let credentials = self.config.credentials()?;
        handler.on_status(&format!(
            "Connecting to {}:{}",
            self.config.host, self.config.port
        ));
        let stream = connect(self.config.clone()).await?;

        let driver = Driver {
            protocol: Protocol::new(credentials, self.config.starttls())
                .with_clock(self.clock)
                .with_cancel_handle(cancel),
            config: self.config,
            requests,
            pending: VecDeque::new(),
        };
        driver.run(stream, handler).await
    }
}

/// The read/decide/write loop of one session.
struct Driver {
    protocol: Protocol,
    config: Config,
    requests: mpsc::UnboundedReceiver<Request>,
    /// Requests received while the protocol was busy.
    pending: VecDeque<Request>,
}

impl Driver {
    async fn run<S, H>(mut self, stream: S, handler: &mut H) -> Result<()>
    where
        S: StartTls,
        H: MailboxHandler,
    {
        let mut framed = FramedStream::new(stream, self.config.io_timeout);
        self.protocol.start()?;

        loop {
            while let Some(transmit) = self.protocol.poll_transmit() {
                framed.write_command(&transmit).await?;
            }

            let mut upgraded = false;
            while let Some(event) = self.protocol.poll_event() {
                if handler::dispatch(handler, &event) {
                    continue;
                }
                match event {
                    ProtocolEvent::UpgradeTls => {
                        framed = self.upgrade(framed).await?;
                        self.protocol.tls_established()?;
                        upgraded = true;
                    }
                    ProtocolEvent::Closed => {
                        if let Err(e) = framed.shutdown().await {
                            tracing::debug!(error = %e, "shutdown after QUIT failed");
                        }
                        return Ok(());
                    }
                    _ => {}
                }
            }
            if upgraded {
                continue;
            }

            if self.protocol.state() == State::Idle {
                self.next_request().await?;
                continue;
            }

            self.poll_requests();
            match self.protocol.read_mode() {
                ReadMode::Line => {
                    let line = framed.read_line().await?;
                    self.protocol.on_line(&line)?;
                }
                ReadMode::Block => {
                    let block = framed.read_block().await?;
                    self.protocol.on_block(&block)?;
                }
                ReadMode::Spool => {
                    let mut spool = Vec::new();
                    framed.read_block_into(&mut spool).await?;
                    self.protocol.on_spooled_block(&mut spool.as_slice())?;
                }
            }
        }
    }

    /// Swaps the plaintext transport for a TLS one after STLS.
    async fn upgrade<S: StartTls>(&self, framed: FramedStream<S>) -> Result<FramedStream<S>> {
        let stream = framed.into_inner()?;
        let timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, stream.start_tls(&self.config.host))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        tracing::debug!(host = %self.config.host, "STLS negotiated");
        Ok(FramedStream::new(stream, self.config.io_timeout))
    }

    /// Picks up requests that arrived while the protocol was busy.
    ///
    /// A `Close` with nothing queued ahead of it cancels the running loop.
    /// Everything else waits, in order, for the session to become idle.
    fn poll_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            if request == Request::Close && self.pending.is_empty() {
                self.protocol.close();
            } else {
                self.pending.push_back(request);
            }
        }
    }

    /// Waits for and applies the next browser request while idle.
    async fn next_request(&mut self) -> Result<()> {
        if self.protocol.is_cancelled() {
            self.protocol.close();
            return Ok(());
        }

        let request = match self.pending.pop_front() {
            Some(request) => Some(request),
            None => self.requests.recv().await,
        };
        let Some(request) = request else {
            tracing::debug!("all session handles dropped");
            self.protocol.close();
            return Ok(());
        };

        let result = match request {
            Request::Delete(ordinals) => self.protocol.request_delete(&ordinals),
            Request::Open(ordinal) => self.protocol.open(ordinal),
            Request::Close => {
                self.protocol.close();
                Ok(())
            }
        };
        match result {
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "request rejected");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::connection::Secret;
    use crate::handler::{CollectingHandler, MailboxEvent};
    use std::sync::Mutex;

    /// Shares collected events with the test after the task moved the handler.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<CollectingHandler>>);

    impl MailboxHandler for Shared {
        fn on_status(&mut self, text: &str) {
            self.0.lock().unwrap().on_status(text);
        }

        fn on_session_error(&mut self, error: &Error) {
            self.0.lock().unwrap().on_session_error(error);
        }
    }

    #[tokio::test]
    async fn test_deferred_secret_refused() {
        let config = Config::builder("pop.example.com")
            .secret(Secret::deferred(|| None))
            .build();
        let shared = Shared::default();
        let handle = Session::new(config).spawn(shared.clone());

        assert!(matches!(handle.wait().await, Err(Error::Auth(_))));
        let events = shared.0.lock().unwrap().take();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], MailboxEvent::SessionError(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_reported_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config::builder("127.0.0.1")
            .security(crate::connection::Security::None)
            .port(port)
            .secret("x")
            .build();
        let shared = Shared::default();
        let handle = Session::new(config).spawn(shared.clone());

        assert!(handle.wait().await.is_err());
        let events = shared.0.lock().unwrap().take();
        assert_eq!(
            events[0],
            MailboxEvent::Status(format!("Connecting to 127.0.0.1:{port}"))
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}
