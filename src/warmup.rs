//! Speculative connection warm-up
//!
//! A [`WarmSlot`] starts connecting in the background before the connection
//! is needed. [`WarmSlot::take`] hands out the warm connection when it is
//! fresh and still usable, and otherwise connects cold, so callers never
//! depend on warm-up having happened.

use crate::error::Result;
use crate::recognition::{RecognitionConfig, RecognitionSession};
use crate::signing::Credentials;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something that can open a fresh connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    /// Whether a warm connection can still be handed out.
    fn is_usable(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

/// At most one pre-opened connection, consumed at most once.
pub struct WarmSlot<C: Connector> {
    name: &'static str,
    connector: Arc<C>,
    max_idle: Duration,
    pending: Option<(Instant, JoinHandle<Result<C::Conn>>)>,
}

impl<C: Connector> WarmSlot<C> {
    pub fn new(name: &'static str, connector: C, max_idle: Duration) -> Self {
        Self {
            name,
            connector: Arc::new(connector),
            max_idle,
            pending: None,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Start a background connect unless one is already held.
    pub fn prime(&mut self) {
        if self.pending.is_some() {
            return;
        }
        debug!("🔥 Warming {} connection", self.name);
        let connector = self.connector.clone();
        let handle = tokio::spawn(async move { connector.connect().await });
        self.pending = Some((Instant::now(), handle));
    }

    pub fn is_primed(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the held connection, if any.
    pub fn discard(&mut self) {
        if let Some((_, handle)) = self.pending.take() {
            handle.abort();
        }
    }

    /// Warm connection if it is fresh and usable, cold connection otherwise.
    pub async fn take(&mut self) -> Result<C::Conn> {
        if let Some((primed_at, handle)) = self.pending.take() {
            if primed_at.elapsed() > self.max_idle {
                debug!("Warm {} connection is stale, discarding", self.name);
                handle.abort();
            } else {
                match handle.await {
                    Ok(Ok(conn)) if self.connector.is_usable(&conn) => {
                        info!("♨️ Using warm {} connection", self.name);
                        return Ok(conn);
                    }
                    Ok(Ok(_)) => debug!("Warm {} connection was dropped, discarding", self.name),
                    Ok(Err(e)) => warn!("Warm {} connect failed: {}", self.name, e),
                    Err(e) => warn!("Warm {} connect task failed: {}", self.name, e),
                }
            }
        }
        self.connector.connect().await
    }
}

impl<C: Connector> Drop for WarmSlot<C> {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Opens recognition sessions against the configured service.
pub struct RecognizerConnector {
    pub config: RecognitionConfig,
    pub credentials: Credentials,
}

#[async_trait]
impl Connector for RecognizerConnector {
    type Conn = RecognitionSession;

    async fn connect(&self) -> Result<RecognitionSession> {
        RecognitionSession::connect(&self.config, &self.credentials).await
    }

    fn is_usable(&self, conn: &RecognitionSession) -> bool {
        conn.is_open() && conn.frames_sent() == 0
    }
}
