use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use tracing::debug;

use crate::connection_manager::ConnectionBackend;
use crate::profiles::{BackendKind, ConnectionConfig};
use crate::resolver::resolve;

pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityResult {
    /// Position of the connection in the list that was probed.
    pub index: usize,
    pub reachable: bool,
    pub round: u64,
}

/// Checks saved connections on throwaway handles, one task per connection.
#[derive(Debug, Clone)]
pub struct ReachabilityProber<B> {
    backend: B,
    round: u64,
}

impl<B> ReachabilityProber<B>
where
    B: ConnectionBackend + Clone + 'static,
{
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend, round: 0 }
    }

    /// Round of the most recent [`probe_all`](Self::probe_all) call.
    #[must_use]
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Results arrive in completion order; the channel closes once every probe has reported.
    pub fn probe_all(
        &mut self,
        configs: &[ConnectionConfig],
        timeout: Duration,
    ) -> UnboundedReceiver<ReachabilityResult> {
        self.round += 1;
        let round = self.round;
        let (sender, receiver) = mpsc::unbounded_channel();

        for (index, config) in configs.iter().enumerate() {
            let backend = self.backend.clone();
            let config = config.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                let reachable = probe(&backend, &config, timeout).await;
                debug!(connection = %config.name, reachable, round, "reachability probed");
                let _ = sender.send(ReachabilityResult {
                    index,
                    reachable,
                    round,
                });
            });
        }

        receiver
    }
}

/// A single bounded check. File backends are stat-ed, never opened.
pub async fn probe<B: ConnectionBackend>(
    backend: &B,
    config: &ConnectionConfig,
    timeout: Duration,
) -> bool {
    if config.backend == BackendKind::Sqlite {
        let path = config.file_path.trim();
        if path.is_empty() {
            return false;
        }
        return matches!(
            tokio::time::timeout(timeout, tokio::fs::metadata(path)).await,
            Ok(Ok(_))
        );
    }

    let Ok(target) = resolve(config) else {
        return false;
    };
    let target = target.with_connect_timeout(timeout);

    let deadline = Instant::now() + timeout;
    let connection = match tokio::time::timeout_at(deadline, backend.connect(&target)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(err)) => {
            debug!(connection = %config.name, error = %err, "probe connect failed");
            return false;
        }
        Err(_) => return false,
    };

    let pinged = matches!(
        tokio::time::timeout_at(deadline, backend.ping(&connection)).await,
        Ok(Ok(()))
    );

    // The handle is released even when the ping ran out of time.
    match tokio::time::timeout(timeout, backend.disconnect(connection)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(connection = %config.name, error = %err, "probe disconnect failed");
        }
        Err(_) => debug!(connection = %config.name, "probe disconnect timed out"),
    }
    pinged
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{probe, ReachabilityProber, ReachabilityResult};
    use crate::connection_manager::tests::FakeBackend;
    use crate::query_runner::tests::FakeHandle;
    use crate::profiles::{BackendKind, ConnectionConfig};

    fn network(name: &str) -> ConnectionConfig {
        ConnectionConfig::network(name, BackendKind::Postgres, name, "app", "app")
    }

    #[tokio::test]
    async fn file_backends_are_checked_by_stat() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let existing = temp_dir.path().join("notes.db");
        fs::write(&existing, b"").expect("failed to create database file");
        let backend = FakeBackend::default();

        let present = ConnectionConfig::sqlite("notes", existing.display().to_string());
        let absent = ConnectionConfig::sqlite(
            "gone",
            temp_dir.path().join("gone.db").display().to_string(),
        );

        assert!(probe(&backend, &present, Duration::from_secs(3)).await);
        assert!(!probe(&backend, &absent, Duration::from_secs(3)).await);
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn network_probes_use_throwaway_handles() {
        let backend = FakeBackend::default();
        backend.refuse("down");

        assert!(probe(&backend, &network("up"), Duration::from_secs(3)).await);
        assert!(!probe(&backend, &network("down"), Duration::from_secs(3)).await);
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn incomplete_configs_are_unreachable() {
        let backend = FakeBackend::default();
        let config = ConnectionConfig::network("blank", BackendKind::MySql, "", "app", "app");
        assert!(!probe(&backend, &config, Duration::from_secs(3)).await);
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backends_fail_within_the_timeout() {
        let backend = FakeBackend {
            connect_delay: Some(Duration::from_secs(60)),
            ..FakeBackend::default()
        };
        assert!(!probe(&backend, &network("slow"), Duration::from_secs(3)).await);
        assert_eq!(backend.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_ping_still_releases_the_handle() {
        let backend = FakeBackend {
            handle: FakeHandle {
                ping_delay: Some(Duration::from_secs(60)),
                ..FakeHandle::default()
            },
            ..FakeBackend::default()
        };

        let started = tokio::time::Instant::now();
        assert!(!probe(&backend, &network("stuck"), Duration::from_secs(3)).await);
        assert!(started.elapsed() <= Duration::from_secs(3));
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.disconnects(), 1);
    }

    #[tokio::test]
    async fn probe_all_reports_every_connection_once() {
        let backend = FakeBackend::default();
        backend.refuse("b-host");
        let mut prober = ReachabilityProber::new(backend);
        let configs = vec![network("a-host"), network("b-host"), network("c-host")];

        let mut receiver = prober.probe_all(&configs, Duration::from_secs(3));
        let mut results = Vec::new();
        while let Some(result) = receiver.recv().await {
            results.push(result);
        }
        results.sort_by_key(|result| result.index);

        assert_eq!(prober.round(), 1);
        assert_eq!(
            results,
            vec![
                ReachabilityResult {
                    index: 0,
                    reachable: true,
                    round: 1
                },
                ReachabilityResult {
                    index: 1,
                    reachable: false,
                    round: 1
                },
                ReachabilityResult {
                    index: 2,
                    reachable: true,
                    round: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn each_round_is_numbered() {
        let mut prober = ReachabilityProber::new(FakeBackend::default());
        let configs = vec![network("a-host")];

        let mut first = prober.probe_all(&configs, Duration::from_secs(3));
        let mut second = prober.probe_all(&configs, Duration::from_secs(3));

        assert_eq!(first.recv().await.map(|result| result.round), Some(1));
        assert_eq!(second.recv().await.map(|result| result.round), Some(2));
    }
}
