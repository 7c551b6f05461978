//! Periodically writes a millisecond timestamp to a marker file
//! so external supervision can detect a wedged process.

use crate::shutdown;
use crate::util;
use slog::Logger;
use std::path::PathBuf;
use std::time::Duration;

pub struct AlivenessMarker {
    path: PathBuf,
    period: Duration,
    logger: Logger,
}

impl AlivenessMarker {
    pub fn new(path: PathBuf, period: Duration, logger: &Logger) -> Self {
        Self {
            logger: logger.new(slog::o!(
                "component" => "aliveness_marker",
                "marker_path" => path.display().to_string(),
            )),
            path,
            period,
        }
    }

    /// Touches the marker on an interval until shutdown,
    /// then removes it so supervision doesn't read a stale timestamp
    pub async fn run(&self, mut shutdown: shutdown::Receiver) {
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stamp = util::millisecond_ts().to_string();
                    if let Err(err) = tokio::fs::write(&self.path, stamp).await {
                        slog::warn!(
                            self.logger,
                            "writing aliveness marker failed";
                            "error" => ?err,
                        );
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            slog::debug!(
                self.logger,
                "removing aliveness marker at shutdown failed";
                "error" => ?err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AlivenessMarker;
    use crate::shutdown::Shutdown;
    use std::time::Duration;

    #[tokio::test]
    async fn test_marker_written_and_removed() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("aura-relay-alive-{}", std::process::id()));
        let marker = AlivenessMarker::new(
            path.clone(),
            Duration::from_millis(10),
            &crate::testutils::logger("alive"),
        );

        let shutdown = Shutdown::new();
        let receiver = shutdown.subscribe();
        let task = tokio::spawn(async move { marker.run(receiver).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.parse::<u64>().unwrap() > 0);

        shutdown.trigger();
        task.await.unwrap();
        assert!(tokio::fs::metadata(&path).await.is_err());
    }
}
