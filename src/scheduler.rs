//! Periodic fetch-and-write loop over the configured chat targets.

use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use log::{error, info, warn};
use thiserror::Error;

use crate::{
    client::{ClientError, FetchRequest, MessageSource},
    config::{ChatTarget, HarvesterConfig},
    state::SchedulerState,
    store::{ResultSink, StoreError},
    types::{ChatId, FetchResult},
};

/// Why a single chat target failed within a cycle.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Fetch(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one pass over the enabled chat targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The cycle fell outside the active-hours window.
    pub skipped: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<ChatId>,
    /// Chats whose newest message is newer than their previous fetch.
    pub new_messages: Vec<ChatId>,
    pub written: Vec<PathBuf>,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

impl From<&ChatTarget> for FetchRequest {
    fn from(target: &ChatTarget) -> Self {
        FetchRequest::new(target.chat_id.clone())
            .with_limit(target.limit)
            .with_sort(target.sort_by.clone(), target.sort_order)
    }
}

/// Runs fetch cycles immediately and then every configured interval.
pub struct Scheduler<S, W> {
    config: HarvesterConfig,
    source: S,
    sink: W,
    state: SchedulerState,
    poll_step: Duration,
    interval: Option<Duration>,
}

impl<S: MessageSource, W: ResultSink> Scheduler<S, W> {
    pub fn new(config: HarvesterConfig, source: S, sink: W) -> Self {
        Self {
            config,
            source,
            sink,
            state: SchedulerState::new(),
            poll_step: Duration::from_secs(1),
            interval: None,
        }
    }

    /// Use `interval` between cycles instead of the configured minutes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// How often the loop wakes to check for shutdown and due work.
    pub fn with_poll_step(mut self, poll_step: Duration) -> Self {
        self.poll_step = poll_step;
        self
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(Local::now())
    }

    /// Fetch every enabled target once, if `now` is inside active hours.
    /// A failing target is logged and the cycle moves on.
    pub fn run_cycle_at(&mut self, now: DateTime<Local>) -> CycleReport {
        if !self.config.schedule.is_active_at(now.time()) {
            info!("outside enabled hours, skipping fetch");
            return CycleReport::skipped();
        }

        let targets: Vec<ChatTarget> = self.config.enabled_chats().cloned().collect();
        if targets.is_empty() {
            warn!("no enabled chats found");
            return CycleReport::default();
        }

        info!("starting scheduled fetch for {} chats", targets.len());
        let mut report = CycleReport::default();

        for target in &targets {
            report.attempted += 1;
            let name = target.display_name();
            info!("fetching messages for {name} ({})", target.chat_id);

            match self.harvest(target) {
                Ok((path, has_new)) => {
                    report.succeeded += 1;
                    report.written.push(path);
                    if has_new {
                        info!("new messages detected for {name}");
                        report.new_messages.push(target.chat_id.clone());
                    }
                }
                Err(err) => {
                    error!("failed to fetch messages for {name}: {err}");
                    if let HarvestError::Fetch(client_err) = &err {
                        if let Some(hint) = client_err.hint() {
                            warn!("{hint}");
                        }
                    }
                    report.failed.push(target.chat_id.clone());
                }
            }
        }

        info!(
            "fetch completed: {}/{} chats successful",
            report.succeeded, report.attempted
        );
        report
    }

    fn harvest(&mut self, target: &ChatTarget) -> Result<(PathBuf, bool), HarvestError> {
        let result = self.source.fetch(&FetchRequest::from(target))?;
        let path = self.sink.persist(&target.chat_id, &result)?;

        let has_new = self.state.has_new_messages(&target.chat_id, &result);
        self.state.record_fetch(&target.chat_id, result.retrieved_at);
        Ok((path, has_new))
    }

    /// Run until `shutdown` is set: one cycle now, then one per interval.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        let interval = self
            .interval
            .unwrap_or_else(|| self.config.schedule.interval());
        info!(
            "scheduler running every {}s, enabled hours {}",
            interval.as_secs(),
            self.config
                .schedule
                .enabled_hours
                .as_ref()
                .map(|w| format!("{}-{}", w.start, w.end))
                .unwrap_or_else(|| "24/7".to_string())
        );

        // `None` when the interval overflows the clock: no further cycles.
        let mut next_run = Instant::now().checked_add(interval);
        self.run_cycle();

        while !shutdown.load(Ordering::SeqCst) {
            if matches!(next_run, Some(due) if Instant::now() >= due) {
                next_run = Instant::now().checked_add(interval);
                self.run_cycle();
                continue;
            }
            thread::sleep(self.poll_step);
        }

        info!("scheduler stopped");
    }
}

/// Fetch with up to `retries` extra attempts for transient failures, waiting
/// `delay` between attempts. Other failures return at once.
pub fn fetch_with_retry<S: MessageSource + ?Sized>(
    source: &mut S,
    request: &FetchRequest,
    retries: u32,
    delay: Duration,
) -> Result<FetchResult, ClientError> {
    let mut attempt = 0;
    loop {
        info!("attempt {}: getting messages for chat {}", attempt + 1, request.chat_id);
        match source.fetch(request) {
            Ok(result) => return Ok(result),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!("{err}; retry {attempt}/{retries} in {}s", delay.as_secs());
                thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ActiveHours, ScheduleConfig},
        mock::MockSource,
        store::MemorySink,
    };
    use chrono::TimeZone;
    use std::collections::VecDeque;

    struct ScriptedSource {
        failing: Option<ChatId>,
        inner: MockSource,
        calls: Vec<ChatId>,
    }

    impl MessageSource for ScriptedSource {
        fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResult, ClientError> {
            self.calls.push(request.chat_id.clone());
            if self.failing.as_ref() == Some(&request.chat_id) {
                return Err(ClientError::QrScanRequired("SCAN_QR_CODE".into()));
            }
            self.inner.fetch(request)
        }
    }

    struct QueueSource(VecDeque<Result<FetchResult, ClientError>>);

    impl MessageSource for QueueSource {
        fn fetch(&mut self, _request: &FetchRequest) -> Result<FetchResult, ClientError> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::Decode("exhausted".into())))
        }
    }

    fn config(chats: Vec<ChatTarget>, window: Option<ActiveHours>) -> HarvesterConfig {
        HarvesterConfig {
            chats,
            schedule: ScheduleConfig {
                interval_minutes: 30,
                enabled_hours: window,
            },
            ..HarvesterConfig::default()
        }
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn mock() -> MockSource {
        MockSource::new().with_base_time(Local.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    fn targets() -> Vec<ChatTarget> {
        let mut disabled = ChatTarget::new(ChatId::user("3"), "Three");
        disabled.enabled = false;
        vec![
            ChatTarget::new(ChatId::user("1"), "One"),
            disabled,
            ChatTarget::new(ChatId::user("2"), "Two"),
        ]
    }

    #[test]
    fn test_cycle_fetches_enabled_targets_in_order() {
        let source = ScriptedSource {
            failing: None,
            inner: mock(),
            calls: Vec::new(),
        };
        let mut scheduler = Scheduler::new(config(targets(), None), source, MemorySink::new());

        let report = scheduler.run_cycle_at(noon());
        assert!(!report.skipped);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.written.len(), 2);
        assert_eq!(scheduler.source.calls, vec![ChatId::user("1"), ChatId::user("2")]);
        assert_eq!(scheduler.sink().results().len(), 2);
        assert!(scheduler.state().last_fetch(&ChatId::user("1")).is_some());
    }

    #[test]
    fn test_failing_target_does_not_abort_cycle() {
        let source = ScriptedSource {
            failing: Some(ChatId::user("1")),
            inner: mock(),
            calls: Vec::new(),
        };
        let mut scheduler = Scheduler::new(config(targets(), None), source, MemorySink::new());

        let report = scheduler.run_cycle_at(noon());
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, vec![ChatId::user("1")]);
        assert!(scheduler.state().last_fetch(&ChatId::user("1")).is_none());
        assert!(scheduler.state().last_fetch(&ChatId::user("2")).is_some());
    }

    #[test]
    fn test_outside_active_hours_skips() {
        let window = Some(ActiveHours::new("22:00", "08:00"));
        let mut scheduler = Scheduler::new(config(targets(), window), mock(), MemorySink::new());

        let report = scheduler.run_cycle_at(noon());
        assert!(report.skipped);
        assert!(scheduler.sink().results().is_empty());

        let late = Local.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap();
        assert_eq!(scheduler.run_cycle_at(late).succeeded, 2);
    }

    #[test]
    fn test_new_messages_only_on_first_tick() {
        let mut scheduler = Scheduler::new(config(targets(), None), mock(), MemorySink::new());

        let first = scheduler.run_cycle_at(noon());
        assert_eq!(first.new_messages.len(), 2);

        let second = scheduler.run_cycle_at(noon());
        assert_eq!(second.succeeded, 2);
        assert!(second.new_messages.is_empty());
    }

    #[test]
    fn test_no_enabled_chats() {
        let mut only_disabled = ChatTarget::new(ChatId::user("9"), "Nine");
        only_disabled.enabled = false;
        let mut scheduler =
            Scheduler::new(config(vec![only_disabled], None), mock(), MemorySink::new());
        let report = scheduler.run_cycle_at(noon());
        assert_eq!(report.attempted, 0);
        assert!(!report.skipped);
    }

    #[test]
    fn test_run_returns_after_initial_cycle_when_stopped() {
        let mut scheduler = Scheduler::new(config(targets(), None), mock(), MemorySink::new())
            .with_poll_step(Duration::from_millis(1));
        let shutdown = AtomicBool::new(true);

        scheduler.run(&shutdown);
        assert_eq!(scheduler.sink().results().len(), 2);
    }

    #[test]
    fn test_run_repeats_cycles_on_interval() {
        let mut scheduler = Scheduler::new(config(targets(), None), mock(), MemorySink::new())
            .with_interval(Duration::from_millis(20))
            .with_poll_step(Duration::from_millis(1));
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(200));
                shutdown.store(true, Ordering::SeqCst);
            });
            scheduler.run(&shutdown);
        });

        let results = scheduler.sink().results().len();
        assert!(results >= 4, "expected a second cycle, got {results} results");
        assert_eq!(results % 2, 0);
    }

    #[test]
    fn test_run_stops_when_flag_set_from_another_thread() {
        let mut scheduler = Scheduler::new(config(targets(), None), mock(), MemorySink::new())
            .with_interval(Duration::from_secs(3600))
            .with_poll_step(Duration::from_millis(1));
        let shutdown = AtomicBool::new(false);

        let started = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(30));
                shutdown.store(true, Ordering::SeqCst);
            });
            scheduler.run(&shutdown);
        });

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(scheduler.sink().results().len(), 2);
    }

    #[test]
    fn test_run_with_unrepresentable_interval_only_runs_once() {
        let mut scheduler = Scheduler::new(config(targets(), None), mock(), MemorySink::new())
            .with_interval(Duration::MAX)
            .with_poll_step(Duration::from_millis(1));
        let shutdown = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                shutdown.store(true, Ordering::SeqCst);
            });
            scheduler.run(&shutdown);
        });

        assert_eq!(scheduler.sink().results().len(), 2);
    }

    #[test]
    fn test_retry_recovers_from_transient_errors() {
        let ok = mock().generate(&FetchRequest::new(ChatId::user("1")).with_limit(3));
        let mut source = QueueSource(VecDeque::from(vec![
            Err(ClientError::Network("refused".into())),
            Err(ClientError::Network("timed out".into())),
            Ok(ok.clone()),
        ]));

        let result = fetch_with_retry(
            &mut source,
            &FetchRequest::new(ChatId::user("1")),
            3,
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(result, ok);
    }

    #[test]
    fn test_retry_gives_up_after_limit() {
        let mut source = QueueSource(VecDeque::from(vec![
            Err(ClientError::Network("1".into())),
            Err(ClientError::Network("2".into())),
            Err(ClientError::Network("3".into())),
        ]));

        let err = fetch_with_retry(
            &mut source,
            &FetchRequest::new(ChatId::user("1")),
            1,
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Network(ref m) if m == "2"));
    }

    #[test]
    fn test_retry_skips_session_errors() {
        let mut source = QueueSource(VecDeque::from(vec![
            Err(ClientError::Unauthorized("no".into())),
            Err(ClientError::Network("unreached".into())),
        ]));

        let err = fetch_with_retry(
            &mut source,
            &FetchRequest::new(ChatId::user("1")),
            5,
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(_)));
        assert_eq!(source.0.len(), 1);
    }
}
