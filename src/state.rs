//! # Application State
//!
//! Everything the HTTP handlers, media sockets and per-leg coordinators
//! share. Actix hands it to handlers as `web::Data<AppState>`, which is an
//! `Arc` underneath, so the whole struct is shared rather than cloned.
//!
//! ## Shared Pieces:
//! - **config**: immutable after startup
//! - **sessions**: live call sessions (`SessionRegistry`)
//! - **pools**: the three audio transform pools
//! - **transcripts**: observer fan-out
//! - **call_control / translator**: external services behind traits, so
//!   tests can swap in fakes
//! - **metrics**: lock-free call counters
//!
//! ## Rust Concepts:
//! The external services are `Arc<dyn Trait>`: dynamic dispatch keeps
//! `AppState` a plain, non-generic type that handlers can name directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::call::control::{CallControl, TwilioCallControl};
use crate::call::registry::SessionRegistry;
use crate::config::AppConfig;
use crate::pool::TransformPools;
use crate::transcript::TranscriptHub;
use crate::translation::{PalabraConnector, TranslationConnector};

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub pools: Arc<TransformPools>,
    pub transcripts: Arc<TranscriptHub>,
    pub call_control: Arc<dyn CallControl>,
    pub translator: Arc<dyn TranslationConnector>,
    pub metrics: CallMetrics,
    pub start_time: Instant,
}

/// Call counters since server start.
#[derive(Debug, Default)]
pub struct CallMetrics {
    calls_received: AtomicU64,
    calls_rejected: AtomicU64,
    bridges_started: AtomicU64,
    bridges_failed: AtomicU64,
    teardowns: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallMetricsSnapshot {
    pub calls_received: u64,
    pub calls_rejected: u64,
    pub bridges_started: u64,
    pub bridges_failed: u64,
    pub teardowns: u64,
}

impl CallMetrics {
    pub fn call_received(&self) {
        self.calls_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_rejected(&self) {
        self.calls_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_started(&self) {
        self.bridges_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_failed(&self) {
        self.bridges_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            calls_received: self.calls_received.load(Ordering::Relaxed),
            calls_rejected: self.calls_rejected.load(Ordering::Relaxed),
            bridges_started: self.bridges_started.load(Ordering::Relaxed),
            bridges_failed: self.bridges_failed.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Build the state with the real telephony and translation clients.
    pub fn new(config: AppConfig) -> std::io::Result<Self> {
        let call_control = Arc::new(TwilioCallControl::new(&config.telephony));
        let translator = Arc::new(PalabraConnector::new(&config.translation));
        Self::with_services(config, call_control, translator)
    }

    /// Build the state around the given external services.
    ///
    /// Fails only if the pool worker threads cannot be spawned.
    pub fn with_services(
        config: AppConfig,
        call_control: Arc<dyn CallControl>,
        translator: Arc<dyn TranslationConnector>,
    ) -> std::io::Result<Self> {
        let pools = TransformPools::new(&config.audio, &config.pool)?;
        Ok(Self {
            sessions: Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions)),
            pools: Arc::new(pools),
            transcripts: Arc::new(TranscriptHub::new()),
            call_control,
            translator,
            metrics: CallMetrics::default(),
            start_time: Instant::now(),
            config: Arc::new(config),
        })
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session.rendezvous_timeout_secs)
    }

    /// `https://{public_host}{path}`
    pub fn webhook_url(&self, path: &str) -> String {
        format!("https://{}{}", self.config.server.public_host, path)
    }

    /// `wss://{public_host}{path}`
    pub fn stream_url(&self, path: &str) -> String {
        format!("wss://{}{}", self.config.server.public_host, path)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
