//! Client orchestrator (component C8): opens the four household
//! connections in parallel and aggregates their throughput.

use std::{sync::Arc, time::Duration};

use netprobe_core::{archetype::UserArchetype, prng::PayloadPool, protocol::RedirectDescriptor};
use tokio::sync::mpsc;
use tracing::info;

use crate::{errors::ClientError, measurement::{CurrentMeasurement, ThroughputEvent}, transport::ArchetypeWorker};

/// Runs the virtual-household scenario against one supervisor: fetches a
/// redirect descriptor per archetype, opens the four direct connections in
/// parallel, and folds their throughput events into a [`CurrentMeasurement`].
pub struct HouseholdOrchestrator {
    http: reqwest::Client,
    supervisor_base_url: String,
}

impl HouseholdOrchestrator {
    /// Build an orchestrator targeting `supervisor_base_url`
    /// (e.g. `"https://probe.example.com"`).
    #[must_use]
    pub fn new(supervisor_base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            supervisor_base_url: supervisor_base_url.into(),
        }
    }

    /// Resolve the redirect descriptor for one archetype.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Redirect`] if the request fails or the
    /// response can't be parsed.
    pub async fn resolve_redirect(&self, archetype: UserArchetype) -> Result<RedirectDescriptor, ClientError> {
        let url = format!(
            "{}/ws/virtual-household/{}",
            self.supervisor_base_url.trim_end_matches('/'),
            archetype.tag()
        );
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|source| ClientError::Redirect { archetype: archetype.tag().to_string(), source })?
            .json::<RedirectDescriptor>()
            .await
            .map_err(|source| ClientError::Redirect { archetype: archetype.tag().to_string(), source })
    }

    /// Open all four household connections in parallel and run until every
    /// one of them has disconnected (or `duration` elapses, if given).
    ///
    /// Returns a receiver the caller drains to build its own view of
    /// [`CurrentMeasurement`] (the CLI binary does this by folding every
    /// event into one with [`CurrentMeasurement::apply`]); each archetype
    /// worker keeps running independently of the others, matching the
    /// "no cross-session ordering guarantee" contract on the server side.
    pub async fn run(
        &self,
        duration: Option<Duration>,
    ) -> mpsc::UnboundedReceiver<ThroughputEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(PayloadPool::from_os_entropy());

        for archetype in UserArchetype::ALL {
            let redirect = match self.resolve_redirect(archetype).await {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(?archetype, %err, "failed to resolve redirect, skipping archetype");
                    continue;
                }
            };
            let ws_url = format!(
                "{}://{}/ws/virtual-household/{}",
                redirect.scheme,
                host_of(&self.supervisor_base_url, redirect.port),
                redirect.archetype
            );
            info!(?archetype, %ws_url, "opening household connection");
            let tx = tx.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                if let Some(duration) = duration {
                    tokio::select! {
                        () = ArchetypeWorker::run(archetype, ws_url, pool, tx) => {}
                        () = tokio::time::sleep(duration) => {}
                    }
                } else {
                    ArchetypeWorker::run(archetype, ws_url, pool, tx).await;
                }
            });
        }

        rx
    }
}

/// Replace the base URL's own port (if any) with `port`, keeping its host.
fn host_of(base_url: &str, port: u16) -> String {
    let without_scheme = base_url.split("://").nth(1).unwrap_or(base_url);
    let host = without_scheme.split(':').next().unwrap_or(without_scheme);
    let host = host.trim_end_matches('/');
    format!("{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_strips_scheme_and_swaps_port() {
        assert_eq!(host_of("https://probe.example.com:8000", 8001), "probe.example.com:8001");
        assert_eq!(host_of("http://127.0.0.1", 8002), "127.0.0.1:8002");
    }
}
