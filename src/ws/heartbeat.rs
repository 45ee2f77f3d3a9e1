//! Application-level liveness probing.
//!
//! One monitor task runs per connection generation. It keeps at most one probe outstanding,
//! measures the round trip on the monotonic clock and reports a stall after `max_missed`
//! consecutive probes went unanswered within `timeout`.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;

use super::config::HeartbeatConfig;
use super::message::Envelope;
use crate::types::{TimestampMillis, now_millis};

/// What the monitor tells its channel.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReport {
    /// A probe was echoed in time
    Beat {
        /// Timestamp embedded in the probe and carried back by the echo
        timestamp: TimestampMillis,
        latency: Duration,
    },
    /// `missed` consecutive probes went unanswered; the monitor has stopped
    Stalled { missed: u32 },
}

/// A report tagged with the connection generation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GenerationReport {
    pub(crate) generation: u64,
    pub(crate) report: HeartbeatReport,
}

/// An echo as seen by the reader, stamped when it arrived.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Echo {
    pub(crate) timestamp: TimestampMillis,
    pub(crate) received_at: Instant,
}

/// Owns a running monitor. Dropping it stops the monitor and its timers.
#[derive(Debug)]
pub(crate) struct HeartbeatHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    echo_tx: mpsc::UnboundedSender<Echo>,
}

impl HeartbeatHandle {
    /// Forwards an echo to the monitor.
    pub(crate) fn echo(&self, timestamp: TimestampMillis) {
        _ = self.echo_tx.send(Echo {
            timestamp,
            received_at: Instant::now(),
        });
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

pub(crate) struct HeartbeatMonitor {
    config: HeartbeatConfig,
    device_id: String,
    generation: u64,
    probes: mpsc::UnboundedSender<Envelope>,
    reports: mpsc::UnboundedSender<GenerationReport>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(
        config: HeartbeatConfig,
        device_id: String,
        generation: u64,
        probes: mpsc::UnboundedSender<Envelope>,
        reports: mpsc::UnboundedSender<GenerationReport>,
    ) -> Self {
        Self {
            config,
            device_id,
            generation,
            probes,
            reports,
        }
    }

    /// Starts probing. The first probe goes out one interval from now.
    pub(crate) fn spawn(self) -> HeartbeatHandle {
        let token = CancellationToken::new();
        let (echo_tx, echo_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(self.run(token.clone(), echo_rx));

        HeartbeatHandle {
            token,
            task,
            echo_tx,
        }
    }

    async fn run(self, token: CancellationToken, mut echoes: mpsc::UnboundedReceiver<Echo>) {
        let interval = self.config.interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let max_missed = self.config.max_missed.max(1);
        let mut outstanding: Option<(TimestampMillis, Instant)> = None;
        let mut deadline = Instant::now();
        let mut last_timestamp: TimestampMillis = 0;
        let mut missed = 0_u32;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick(), if outstanding.is_none() => {
                    // Strictly increasing so a stale echo can never match a newer probe.
                    let timestamp = now_millis().max(last_timestamp + 1);
                    last_timestamp = timestamp;

                    #[cfg(feature = "tracing")]
                    tracing::trace!(generation = self.generation, timestamp, "sending heartbeat probe");

                    if self.probes.send(Envelope::heartbeat(timestamp, &self.device_id)).is_err() {
                        break;
                    }
                    let sent_at = Instant::now();
                    outstanding = Some((timestamp, sent_at));
                    deadline = sent_at + self.config.timeout;
                }
                () = sleep_until(deadline), if outstanding.is_some() => {
                    outstanding = None;
                    missed += 1;

                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        generation = self.generation,
                        missed,
                        timeout = ?self.config.timeout,
                        "heartbeat echo missed"
                    );

                    if missed >= max_missed {
                        self.report(HeartbeatReport::Stalled { missed });
                        break;
                    }
                }
                Some(echo) = echoes.recv() => {
                    match outstanding {
                        Some((timestamp, sent_at)) if timestamp == echo.timestamp => {
                            outstanding = None;
                            missed = 0;
                            self.report(HeartbeatReport::Beat {
                                timestamp,
                                latency: echo.received_at.saturating_duration_since(sent_at),
                            });
                        }
                        _ => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(
                                generation = self.generation,
                                timestamp = echo.timestamp,
                                "ignoring stale heartbeat echo"
                            );
                        }
                    }
                }
            }
        }
    }

    fn report(&self, report: HeartbeatReport) {
        _ = self.reports.send(GenerationReport {
            generation: self.generation,
            report,
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;
    use crate::ws::message::MessageType;

    struct Harness {
        handle: HeartbeatHandle,
        probes: mpsc::UnboundedReceiver<Envelope>,
        reports: mpsc::UnboundedReceiver<GenerationReport>,
    }

    fn start(generation: u64) -> Harness {
        let (probe_tx, probes) = mpsc::unbounded_channel();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let handle = HeartbeatMonitor::new(
            HeartbeatConfig::default(),
            "dev-1".to_owned(),
            generation,
            probe_tx,
            report_tx,
        )
        .spawn();

        Harness {
            handle,
            probes,
            reports,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_probe_waits_one_interval() {
        let mut harness = start(1);
        let started = Instant::now();

        let probe = harness.probes.recv().await.expect("probe");

        assert_eq!(probe.kind, MessageType::Heartbeat);
        assert_eq!(probe.device_id.as_deref(), Some("dev-1"));
        assert!(probe.timestamp.is_some());
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn echo_reports_monotonic_latency() {
        let mut harness = start(7);

        for latency_ms in [100, 500, 900] {
            let probe = harness.probes.recv().await.expect("probe");
            let timestamp = probe.timestamp.expect("timestamp");

            advance(Duration::from_millis(latency_ms)).await;
            harness.handle.echo(timestamp);

            let report = harness.reports.recv().await.expect("report");
            assert_eq!(report.generation, 7);
            assert_eq!(
                report.report,
                HeartbeatReport::Beat {
                    timestamp,
                    latency: Duration::from_millis(latency_ms),
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_after_consecutive_misses() {
        let mut harness = start(1);
        let started = Instant::now();

        let report = harness.reports.recv().await.expect("report");

        assert_eq!(report.report, HeartbeatReport::Stalled { missed: 3 });
        // probes at 15s, 30s, 45s; each times out 5s later
        assert_eq!(started.elapsed(), Duration::from_secs(50));
        assert!(harness.reports.recv().await.is_none(), "monitor stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn timely_echo_resets_miss_counter() {
        let mut harness = start(1);

        // Miss two probes.
        for _ in 0..2 {
            harness.probes.recv().await.expect("probe");
        }
        let probe = harness.probes.recv().await.expect("probe");
        harness.handle.echo(probe.timestamp.expect("timestamp"));
        assert!(matches!(
            harness.reports.recv().await.expect("report").report,
            HeartbeatReport::Beat { .. }
        ));

        // Two further misses do not stall.
        for _ in 0..2 {
            harness.probes.recv().await.expect("probe");
        }
        let probe = harness.probes.recv().await.expect("probe");
        harness.handle.echo(probe.timestamp.expect("timestamp"));
        assert!(matches!(
            harness.reports.recv().await.expect("report").report,
            HeartbeatReport::Beat { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_echo_is_ignored() {
        let mut harness = start(1);

        let first = harness.probes.recv().await.expect("probe");
        // Let the first probe time out, then echo it late.
        let second = harness.probes.recv().await.expect("probe");
        harness.handle.echo(first.timestamp.expect("timestamp"));
        harness.handle.echo(second.timestamp.expect("timestamp"));

        let report = harness.reports.recv().await.expect("report");
        assert!(matches!(
            report.report,
            HeartbeatReport::Beat { timestamp, .. } if Some(timestamp) == second.timestamp
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_probes() {
        let Harness {
            handle,
            mut probes,
            reports: _reports,
        } = start(1);

        drop(handle);

        assert!(probes.recv().await.is_none());
    }
}
