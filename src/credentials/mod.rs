//! Lazily acquired credentials for the event stream
//!
//! The stream connection string lives in a secret store. It is fetched the
//! first time a stream publish needs it, turned into a long-lived
//! [`StreamClient`], and reused for every later publish.
//!
//! Initialization is single-flight: concurrent first callers all await the
//! same attempt, which keeps running if the caller that started it goes away. The outcome is memoized whether it succeeded or failed, so the
//! secret store is contacted at most once per [`CredentialCache`].

pub mod vault;

pub use vault::{KeyVaultSecretProvider, VaultSettings};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::logging::Timer;
use crate::sinks::stream::StreamSendError;

/// Credential acquisition failures
///
/// `Clone` so the memoized failure can be handed to every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("required setting is missing: {0}")]
    ConfigMissing(String),

    #[error("secret store authentication failed: {0}")]
    Auth(String),

    #[error("secret fetch failed: {0}")]
    SecretFetch(String),

    #[error("connection string is unusable: {0}")]
    InvalidConnectionString(String),
}

/// Source of the stream connection string
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Authenticate and fetch the connection string
    async fn fetch_connection_string(&self) -> Result<String, CredentialError>;
}

/// Handle able to send one record to the event stream
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Send a single record
    async fn send(&self, payload: &[u8]) -> Result<(), StreamSendError>;
}

/// Builds a [`StreamClient`] from a connection string
pub trait StreamClientFactory: Send + Sync {
    fn build(&self, connection_string: &str) -> Result<Arc<dyn StreamClient>, CredentialError>;
}

type CachedClient = Result<Arc<dyn StreamClient>, CredentialError>;

/// Handle on the one initialization task, awaitable by any number of callers
type Initialization = Shared<BoxFuture<'static, CachedClient>>;

/// Single-flight cache for the stream client
pub struct CredentialCache {
    provider: Arc<dyn SecretProvider>,
    factory: Arc<dyn StreamClientFactory>,
    client: OnceCell<Initialization>,
}

impl CredentialCache {
    /// Create an empty cache; nothing is fetched until the first request
    pub fn new(provider: Arc<dyn SecretProvider>, factory: Arc<dyn StreamClientFactory>) -> Self {
        Self {
            provider,
            factory,
            client: OnceCell::new(),
        }
    }

    /// Get the stream client, initializing it on first use
    ///
    /// Initialization runs in its own task. A caller dropped mid-way (for
    /// example by an invocation deadline) leaves it running for everyone else.
    pub async fn stream_client(&self) -> Result<Arc<dyn StreamClient>, CredentialError> {
        let initialization = self
            .client
            .get_or_init(|| async { self.start_initialization() })
            .await
            .clone();
        initialization.await
    }

    /// Whether a caller has observed the initialization outcome
    pub fn is_initialized(&self) -> bool {
        self.client
            .get()
            .and_then(|initialization| initialization.peek())
            .is_some()
    }

    fn start_initialization(&self) -> Initialization {
        let task = tokio::spawn(initialize(
            Arc::clone(&self.provider),
            Arc::clone(&self.factory),
        ));

        async move {
            task.await.unwrap_or_else(|e| {
                Err(CredentialError::SecretFetch(format!(
                    "credential task failed: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared()
    }
}

async fn initialize(
    provider: Arc<dyn SecretProvider>,
    factory: Arc<dyn StreamClientFactory>,
) -> CachedClient {
    let timer = Timer::start("credential_cache_init");
    info!("Acquiring stream connection from secret store");

    let result = match provider.fetch_connection_string().await {
        Ok(connection_string) => factory.build(&connection_string),
        Err(e) => Err(e),
    };

    let duration = timer.stop();
    match &result {
        Ok(_) => info!(
            duration_ms = duration.as_millis(),
            "Stream client initialized"
        ),
        Err(e) => error!(
            error = %e,
            duration_ms = duration.as_millis(),
            "Stream client initialization failed"
        ),
    }
    result
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
