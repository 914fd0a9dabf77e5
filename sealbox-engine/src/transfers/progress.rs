//! Throttled progress reporting from a running stage

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use sealbox_common::{JobKey, Stage, TransferProgress};

/// Sends progress for one job and stage to its coordinator
///
/// Positions never decrease unless [`restart`](Self::restart) is called, and
/// updates closer together than the interval are dropped.
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<TransferProgress>,
    stage: Stage,
    job: JobKey,
    total: u64,
    interval: Duration,
    position: u64,
    last_sent: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(
        tx: mpsc::UnboundedSender<TransferProgress>,
        stage: Stage,
        job: JobKey,
        total: u64,
        interval: Duration,
    ) -> Self {
        Self {
            tx,
            stage,
            job,
            total,
            interval,
            position: 0,
            last_sent: None,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Report `position` if the interval has passed since the last report
    pub fn report(&mut self, position: u64) {
        self.position = self.position.max(position);
        let due = self
            .last_sent
            .is_none_or(|sent| sent.elapsed() >= self.interval);
        if due {
            self.send(false, None);
        }
    }

    /// Report `position` immediately
    pub fn force(&mut self, position: u64) {
        self.position = self.position.max(position);
        self.send(false, None);
    }

    /// Start over from `position` after the stage discarded data
    pub fn restart(&mut self, position: u64) {
        self.position = position;
        self.send(false, None);
    }

    /// Terminal success report
    pub fn finish(mut self, content_id: impl Into<String>) {
        self.position = self.position.max(self.total);
        self.send(true, Some(content_id.into()));
    }

    /// Terminal failure report
    pub fn fail(mut self) {
        self.send(true, None);
    }

    fn send(&mut self, done: bool, content_id: Option<String>) {
        self.last_sent = Some(Instant::now());
        // The coordinator may already have stopped; progress is advisory
        let _ = self.tx.send(TransferProgress {
            stage: self.stage,
            job: self.job.clone(),
            position: self.position,
            total: self.total,
            done,
            content_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(interval: Duration) -> (ProgressReporter, mpsc::UnboundedReceiver<TransferProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(tx, Stage::Upload, JobKey::upload(1), 100, interval);
        (reporter, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransferProgress>) -> Vec<TransferProgress> {
        let mut out = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            out.push(progress);
        }
        out
    }

    #[test]
    fn test_reports_are_throttled() {
        let (mut reporter, mut rx) = reporter(Duration::from_secs(3600));
        reporter.report(10);
        reporter.report(20);
        reporter.report(30);
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].position, 10);

        reporter.force(40);
        assert_eq!(drain(&mut rx)[0].position, 40);
    }

    #[test]
    fn test_positions_never_decrease() {
        let (mut reporter, mut rx) = reporter(Duration::ZERO);
        for position in [5, 50, 20, 60, 0] {
            reporter.report(position);
        }
        let positions: Vec<u64> = drain(&mut rx).iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![5, 50, 50, 60, 60]);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_finish_and_fail() {
        let (reporter, mut rx) = reporter(Duration::ZERO);
        reporter.finish("cid");
        let done = drain(&mut rx).pop().unwrap();
        assert!(done.done);
        assert_eq!(done.position, 100);
        assert_eq!(done.content_id.as_deref(), Some("cid"));

        let (mut reporter, mut rx) = self::reporter(Duration::ZERO);
        reporter.report(30);
        reporter.fail();
        let failed = drain(&mut rx).pop().unwrap();
        assert!(failed.is_failure());
        assert_eq!(failed.position, 30);
    }
}
