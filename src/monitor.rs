use crate::report::Reporter;
use crate::state::ActivityState;
use chrono::{DateTime, Utc};
use procfs::net::TcpState;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("интервал опроса активности должен быть больше нуля")]
    InvalidInterval,
    #[error("не удалось прочитать таблицу соединений: {0}")]
    Sample(#[from] procfs::ProcError),
}

pub struct ActivityMonitor {
    state: Arc<ActivityState>,
    reporter: Option<Arc<dyn Reporter>>,
    ide_port: u16,
    ssh_port: u16,
    interval: Duration,

    last_ide_count: u32,
    last_ssh_count: u32,
}

impl ActivityMonitor {
    pub fn new(
        state: Arc<ActivityState>,
        interval: Duration,
        ide_port: u16,
        ssh_port: u16,
        reporter: Option<Arc<dyn Reporter>>,
    ) -> Self {
        Self {
            state,
            reporter,
            ide_port,
            ssh_port,
            interval,
            last_ide_count: 0,
            last_ssh_count: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), MonitorError> {
        if self.interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.interval.as_secs(), "запущен опрос активности");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("опрос активности остановлен");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sample().await {
                        warn!(error = %err, "не удалось снять показания активности");
                    }
                }
            }
        }
    }

    async fn sample(&mut self) -> Result<(), MonitorError> {
        let (ide_count, ssh_count) = count_established(self.ide_port, self.ssh_port)?;
        self.record(Utc::now(), ide_count, ssh_count).await;
        Ok(())
    }

    async fn record(&mut self, now: DateTime<Utc>, ide_count: u32, ssh_count: u32) {
        self.state.update_ide(now, ide_count).await;
        self.state.update_ssh(now, ssh_count).await;

        if ide_count == self.last_ide_count && ssh_count == self.last_ssh_count {
            return;
        }

        info!(
            ide_connections = ide_count,
            ssh_connections = ssh_count,
            "изменилась активность рабочего пространства"
        );
        self.last_ide_count = ide_count;
        self.last_ssh_count = ssh_count;

        if let Some(reporter) = &self.reporter {
            let snapshot = self.state.snapshot().await;
            if let Err(err) = reporter.report(&snapshot).await {
                warn!(error = %err, "не удалось отправить отчёт об активности");
            }
        }
    }
}

fn count_established(ide_port: u16, ssh_port: u16) -> Result<(u32, u32), MonitorError> {
    let mut entries = procfs::net::tcp()?;
    entries.extend(procfs::net::tcp6()?);

    let mut ide_count = 0_u32;
    let mut ssh_count = 0_u32;
    for entry in entries {
        if entry.state != TcpState::Established {
            continue;
        }
        let port = entry.local_address.port();
        if port == ide_port {
            ide_count += 1;
        } else if port == ssh_port {
            ssh_count += 1;
        }
    }

    Ok((ide_count, ssh_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportError;
    use crate::state::ActivitySnapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingReporter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Reporter for CountingReporter {
        async fn report(&self, _snapshot: &ActivitySnapshot) -> Result<(), ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingReporter;

    #[async_trait]
    impl Reporter for FailingReporter {
        async fn report(&self, _snapshot: &ActivitySnapshot) -> Result<(), ReportError> {
            Err(ReportError::InvalidConfig("тестовый сбой".to_string()))
        }
    }

    fn monitor_with_reporter(reporter: Option<Arc<dyn Reporter>>) -> ActivityMonitor {
        ActivityMonitor::new(
            Arc::new(ActivityState::default()),
            Duration::from_secs(30),
            8080,
            2222,
            reporter,
        )
    }

    #[tokio::test]
    async fn run_rejects_zero_interval() {
        let monitor = ActivityMonitor::new(
            Arc::new(ActivityState::default()),
            Duration::ZERO,
            8080,
            2222,
            None,
        );
        let (_tx, rx) = watch::channel(false);

        let err = monitor.run(rx).await.expect_err("нулевой интервал должен отвергаться");
        assert!(matches!(err, MonitorError::InvalidInterval));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let state = Arc::new(ActivityState::default());
        let monitor =
            ActivityMonitor::new(state, Duration::from_millis(50), 1, 2, None);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).expect("отправка сигнала остановки");

        let result = task.await.expect("задача мониторинга");
        assert!(result.is_ok(), "остановка по сигналу не является ошибкой");
    }

    #[tokio::test]
    async fn reporter_called_only_on_change() {
        let reporter = Arc::new(CountingReporter {
            calls: AtomicU32::new(0),
        });
        let mut monitor = monitor_with_reporter(Some(reporter.clone()));
        let now = Utc::now();

        monitor.record(now, 0, 0).await;
        monitor.record(now, 2, 0).await;
        monitor.record(now, 2, 0).await;

        assert_eq!(
            reporter.calls.load(Ordering::SeqCst),
            1,
            "отчёт должен уходить только при изменении счётчиков"
        );
    }

    #[tokio::test]
    async fn state_updated_even_without_change() {
        let mut monitor = monitor_with_reporter(None);
        let first = Utc::now();
        let second = first + chrono::Duration::seconds(5);

        monitor.record(first, 2, 0).await;
        monitor.record(second, 2, 0).await;

        let snapshot = monitor.state.snapshot().await;
        assert_eq!(snapshot.active_ide, 2);
        assert_eq!(
            snapshot.last_ide_activity,
            Some(second),
            "время активности обновляется на каждой выборке с ненулевым счётчиком"
        );
    }

    #[tokio::test]
    async fn reporter_failure_does_not_panic() {
        let mut monitor = monitor_with_reporter(Some(Arc::new(FailingReporter)));

        monitor.record(Utc::now(), 1, 1).await;

        let snapshot = monitor.state.snapshot().await;
        assert_eq!(snapshot.active_ide, 1, "сбой отчёта не должен мешать учёту");
    }

    #[test]
    fn count_established_on_unused_ports_is_zero() {
        let (ide, ssh) = count_established(1, 2).expect("чтение таблицы соединений");
        assert_eq!(ide, 0);
        assert_eq!(ssh, 0);
    }
}
