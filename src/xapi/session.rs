//! Connection lifecycle for one broker session.
//!
//! A [`Session`] owns the command socket and the stream socket of one
//! account login. Commands are serialized through an async mutex so exactly
//! one request is in flight at a time. The stream socket is split: the write
//! half stays here for subscriptions, the read half is handed to a
//! [`StreamRouter`](super::StreamRouter) via [`Session::take_stream_reader`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::framing::{FrameReader, FrameWriter, FramedConnection};
use super::{BoxedStream, Connector, Endpoint};
use crate::config::{RetryPolicy, SessionConfig, XapiConfig};
use crate::models::{Command, Response, Secret, StreamSubscription};
use crate::{Result, XapiError};

/// Read half of the stream socket.
pub type StreamReader = FrameReader<ReadHalf<BoxedStream>>;

type StreamWriter = FrameWriter<WriteHalf<BoxedStream>>;

/// Observable connection state of a [`Session`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub command_connected: bool,
    pub stream_connected: bool,
    pub logged_in: bool,
    /// Issued by a successful login; empty until then.
    pub stream_session_id: Option<String>,
}

/// One logged-in account session over a command and a stream socket.
pub struct Session {
    login: String,
    password: Secret,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    command: Mutex<Option<FramedConnection<BoxedStream>>>,
    stream_writer: Mutex<Option<StreamWriter>>,
    stream_reader: std::sync::Mutex<Option<StreamReader>>,
    status: std::sync::Mutex<SessionStatus>,
    /// Bumped every time a new stream socket is established.
    stream_generation: AtomicU64,
    reconnecting: Mutex<()>,
}

impl Session {
    #[must_use]
    pub fn new(xapi: &XapiConfig, connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self {
            login: xapi.login.clone(),
            password: xapi.password.clone(),
            connector,
            config,
            command: Mutex::new(None),
            stream_writer: Mutex::new(None),
            stream_reader: std::sync::Mutex::new(None),
            status: std::sync::Mutex::new(SessionStatus::default()),
            stream_generation: AtomicU64::new(0),
            reconnecting: Mutex::new(()),
        }
    }

    /// Returns a snapshot of the connection state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status_lock().clone()
    }

    #[must_use]
    pub fn stream_session_id(&self) -> Option<String> {
        self.status_lock().stream_session_id.clone()
    }

    /// Number of stream sockets established so far.
    #[must_use]
    pub fn stream_generation(&self) -> u64 {
        self.stream_generation.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }

    fn status_lock(&self) -> MutexGuard<'_, SessionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut self.status_lock());
    }

    /// Connects the command socket, retrying per the connect policy.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::RetriesExhausted`] when every attempt failed.
    pub async fn connect(&self) -> Result<()> {
        retry(self.config.connect, "connect", |_| self.establish_command()).await
    }

    /// Connects the stream socket, retrying per the connect policy.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::RetriesExhausted`] when every attempt failed.
    pub async fn connect_stream(&self) -> Result<()> {
        retry(self.config.connect, "connect stream", |_| {
            self.establish_stream()
        })
        .await
    }

    async fn establish_command(&self) -> Result<()> {
        let socket = self.connector.connect(Endpoint::Command).await?;
        *self.command.lock().await = Some(FramedConnection::new(socket));
        self.update_status(|s| s.command_connected = true);
        info!("Command socket connected");
        Ok(())
    }

    async fn establish_stream(&self) -> Result<()> {
        let socket = self.connector.connect(Endpoint::Stream).await?;
        let (reader, writer) = FramedConnection::new(socket).split();
        *self.stream_writer.lock().await = Some(writer);
        let generation = {
            let mut slot = self
                .stream_reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(reader);
            self.stream_generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.update_status(|s| s.stream_connected = true);
        info!(generation, "Stream socket connected");
        Ok(())
    }

    /// Logs in with the configured account and stores the stream session id.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::AuthFailure`] if the broker rejects the login or
    /// omits the stream session id, or a connection error if the exchange fails.
    pub async fn login(&self) -> Result<()> {
        let command = Command::Login {
            user_id: self.login.clone(),
            password: self.password.clone(),
        };
        let response = self.exchange(&command).await?;

        if !response.status {
            self.update_status(|s| {
                s.logged_in = false;
                s.stream_session_id = None;
            });
            let reason = format!(
                "[{}] {}",
                response.error_code.unwrap_or_default(),
                response.error_descr.unwrap_or_default()
            );
            error!(login = %self.login, %reason, "Login rejected");
            return Err(XapiError::AuthFailure(reason));
        }

        let Some(stream_session_id) = response.stream_session_id.filter(|id| !id.is_empty())
        else {
            return Err(XapiError::AuthFailure(
                "login response carried no streamSessionId".to_string(),
            ));
        };

        self.update_status(|s| {
            s.logged_in = true;
            s.stream_session_id = Some(stream_session_id);
        });
        info!(login = %self.login, "Logged in");
        Ok(())
    }

    /// Logs out. On failure the logged-in flag is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::CommandFailure`] if the broker refuses, or a
    /// connection error if the exchange fails.
    pub async fn logout(&self) -> Result<()> {
        self.exchange(&Command::Logout)
            .await?
            .into_result("logout")?;
        self.update_status(|s| {
            s.logged_in = false;
            s.stream_session_id = None;
        });
        info!(login = %self.login, "Logged out");
        Ok(())
    }

    /// Closes the command socket.
    pub async fn disconnect(&self) {
        let connection = self.command.lock().await.take();
        self.update_status(|s| s.command_connected = false);
        if let Some(mut connection) = connection
            && let Err(e) = connection.shutdown().await
        {
            debug!(error = %e, "Command socket shutdown was not clean");
        }
        info!("Command socket disconnected");
    }

    /// Closes the stream socket, including a reader nobody has taken yet.
    pub async fn disconnect_stream(&self) {
        let writer = self.stream_writer.lock().await.take();
        self.stream_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.update_status(|s| s.stream_connected = false);
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            debug!(error = %e, "Stream socket shutdown was not clean");
        }
        info!("Stream socket disconnected");
    }

    /// Connects both sockets and logs in.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn open(&self) -> Result<()> {
        self.connect().await?;
        self.connect_stream().await?;
        self.login().await
    }

    /// Logs out and closes both sockets. A failed logout is logged, not returned.
    pub async fn close(&self) {
        if self.status().logged_in
            && let Err(e) = self.logout().await
        {
            warn!(error = %e, "Logout failed during close");
        }
        self.disconnect_stream().await;
        self.disconnect().await;
    }

    /// Sends one command and waits for its response envelope.
    ///
    /// A transport or framing failure drops the command socket and marks it
    /// down; a later [`reconnect`](Self::reconnect) restores it.
    async fn exchange(&self, command: &Command) -> Result<Response> {
        let mut guard = self.command.lock().await;
        let Some(connection) = guard.as_mut() else {
            return Err(XapiError::NotConnected("command"));
        };

        let result = round_trip(connection, command, self.config.read_timeout).await;
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            *guard = None;
            drop(guard);
            self.update_status(|s| s.command_connected = false);
            warn!(command = command.name(), error = %e, "Command socket marked down");
        }
        result
    }

    /// Sends a command and returns its response, failing on `status: false`.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::NotConnected`] without a command socket,
    /// [`XapiError::CommandFailure`] if the broker rejects the command, and
    /// connection errors for transport failures.
    pub async fn send_command(&self, command: &Command) -> Result<Response> {
        self.exchange(command).await?.into_result(command.name())
    }

    /// Like [`send_command`](Self::send_command), but first restores a
    /// command socket that was marked down.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command) and [`reconnect`](Self::reconnect).
    pub async fn execute(&self, command: &Command) -> Result<Response> {
        if !self.status().command_connected {
            self.reconnect().await?;
        }
        self.send_command(command).await
    }

    /// Executes a command and decodes its `returnData`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute) and [`Response::data`].
    pub async fn request<T: DeserializeOwned>(&self, command: &Command) -> Result<T> {
        self.execute(command).await?.data()
    }

    /// Pings the command socket.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the exchange fails.
    pub async fn ping(&self) -> Result<()> {
        self.send_command(&Command::Ping).await?;
        debug!("Ping acknowledged");
        Ok(())
    }

    /// Writes a subscribe request to the stream socket.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::MissingStreamSession`] before a successful login
    /// and [`XapiError::NotConnected`] without a stream socket.
    pub async fn subscribe(&self, subscription: &StreamSubscription) -> Result<()> {
        let stream_session_id = self
            .stream_session_id()
            .ok_or(XapiError::MissingStreamSession)?;

        let mut guard = self.stream_writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(XapiError::NotConnected("stream"));
        };

        let result = writer.send(&subscription.request(&stream_session_id)).await;
        if let Err(e) = &result
            && e.is_connection_broken()
        {
            *guard = None;
            drop(guard);
            self.update_status(|s| s.stream_connected = false);
            warn!(error = %e, "Stream socket marked down");
        }
        result?;

        info!(
            channel = subscription.as_str(),
            symbol = subscription.symbol(),
            "Subscribed to stream channel"
        );
        Ok(())
    }

    /// Hands out the read half of the current stream socket together with
    /// its generation. Returns `None` if it was already taken.
    pub fn take_stream_reader(&self) -> Option<(StreamReader, u64)> {
        let mut slot = self
            .stream_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let reader = slot.take()?;
        Some((reader, self.stream_generation.load(Ordering::SeqCst)))
    }

    /// Marks the stream socket as unusable after a read failure.
    pub fn mark_stream_down(&self) {
        self.update_status(|s| s.stream_connected = false);
    }

    /// Re-establishes a session whose command socket is down: both sockets
    /// are reopened and the account logged in again. A no-op while the
    /// command socket is up.
    ///
    /// # Errors
    ///
    /// Returns [`XapiError::RetriesExhausted`] when the reconnect bound is
    /// hit and [`XapiError::AuthFailure`] if the login is rejected.
    pub async fn reconnect(&self) -> Result<()> {
        let _guard = self.reconnecting.lock().await;
        if self.status().command_connected {
            debug!("Command socket is up; reconnect skipped");
            return Ok(());
        }
        self.reconnect_all().await
    }

    async fn reconnect_all(&self) -> Result<()> {
        retry(self.config.reconnect, "reconnect", |attempt| async move {
            info!(attempt, "Reconnecting session");
            self.establish_command().await?;
            self.establish_stream().await?;
            self.login().await
        })
        .await?;
        info!("Session re-established");
        Ok(())
    }

    /// Re-establishes the stream socket after the reader at generation
    /// `seen_generation` failed. Skipped if a newer socket already exists;
    /// falls back to a full reconnect while the command socket is down.
    ///
    /// # Errors
    ///
    /// Same as [`reconnect`](Self::reconnect).
    pub async fn reconnect_stream(&self, seen_generation: u64) -> Result<()> {
        let _guard = self.reconnecting.lock().await;
        let status = self.status();
        if !status.command_connected {
            return self.reconnect_all().await;
        }
        if status.stream_connected && self.stream_generation() > seen_generation {
            debug!("Stream socket already replaced; reconnect skipped");
            return Ok(());
        }

        retry(self.config.reconnect, "stream reconnect", |attempt| async move {
            info!(attempt, "Reconnecting stream socket");
            self.establish_stream().await
        })
        .await
    }
}

async fn round_trip(
    connection: &mut FramedConnection<BoxedStream>,
    command: &Command,
    read_timeout: Duration,
) -> Result<Response> {
    connection.send(command).await?;
    debug!(command = command.name(), "Sent command");

    let value = tokio::time::timeout(read_timeout, connection.receive())
        .await
        .map_err(|_| XapiError::Timeout(read_timeout))??;

    serde_json::from_value(value).map_err(|e| {
        XapiError::ProtocolFailure(format!("unexpected response to {}: {e}", command.name()))
    })
}

/// Runs `attempt_fn` until it succeeds, at most `policy.attempts` times.
///
/// Fatal errors end the loop at once. The closure receives the 1-based
/// attempt number.
///
/// # Errors
///
/// Returns [`XapiError::RetriesExhausted`] when no attempt succeeded, or the
/// first fatal error.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, operation: &'static str, mut attempt_fn: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=policy.attempts {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.attempts,
                    error = %e,
                    "Attempt failed"
                );
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    error!(operation, attempts = policy.attempts, "Giving up");
    Err(XapiError::RetriesExhausted {
        operation,
        attempts: policy.attempts,
    })
}
