use crate::address::is_valid_email;
use crate::bounce::{self, BounceError, BounceSet, BounceSource};
use crate::composer::MessageComposer;
use crate::config::Config;
use crate::contacts::Contact;
use crate::gate::{wait_until_open, Clock, SendWindow, WarmupSchedule};
use crate::ledger::{ErrorLog, FailureReason, LedgerError, SendLedger};
use crate::transport::{Transport, TransportError};
use anyhow::Context;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Scheduling knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub window: SendWindow,
    pub warmup: WarmupSchedule,
    pub inter_send_delay: Duration,
    pub window_poll_interval: Duration,
    pub error_log_path: PathBuf,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: config.schedule.window(),
            warmup: config.warmup,
            inter_send_delay: config.schedule.inter_send_delay(),
            window_poll_interval: config.schedule.window_poll_interval(),
            error_log_path: config.files.error_log.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    WindowClosed,
    LimitReached,
    Exhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::WindowClosed => write!(f, "sending window closed"),
            StopReason::LimitReached => write!(f, "daily limit reached"),
            StopReason::Exhausted => write!(f, "no candidates left"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Block until the window opens instead of skipping the primary pass
    pub wait_for_window: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait_for_window: true,
        }
    }
}

/// Per-invocation counters.
#[derive(Debug, Default)]
pub struct RunState {
    pub daily_limit: usize,
    pub sent_this_run: usize,
    pub failed_this_run: usize,
    pub skipped_invalid: usize,
    pub retried: usize,
    pub retry_succeeded: usize,
    pub bounces_reconciled: usize,
    pub stop_reason: Option<StopReason>,
    pub error_log: ErrorLog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub bounces_reconciled: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped_invalid: usize,
    pub retried: usize,
    pub retry_succeeded: usize,
    pub daily_limit: usize,
    pub stop_reason: Option<StopReason>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sent {} new emails (limit {}), {} failed, {} skipped as invalid. \
             Retried {} failures, {} succeeded. Bounces reconciled: {}.",
            self.sent,
            self.daily_limit,
            self.failed,
            self.skipped_invalid,
            self.retried,
            self.retry_succeeded,
            self.bounces_reconciled
        )?;
        if let Some(reason) = self.stop_reason {
            write!(f, " Primary pass stopped: {reason}.")?;
        }
        Ok(())
    }
}

/// Everything one invocation mutates, passed explicitly instead of living in
/// globals. Dropping it without `finish` still flushes the ledger.
pub struct RunContext {
    settings: RunSettings,
    ledger: SendLedger,
    transport: Box<dyn Transport>,
    composer: MessageComposer,
    clock: Box<dyn Clock>,
    state: RunState,
    bounces_checked: bool,
    finished: bool,
}

impl RunContext {
    pub fn new(
        settings: RunSettings,
        ledger: SendLedger,
        transport: Box<dyn Transport>,
        composer: MessageComposer,
        clock: Box<dyn Clock>,
    ) -> Self {
        let days = ledger.distinct_send_days();
        let daily_limit = settings.warmup.daily_limit(days);
        log::info!("📈 Warm-up: {days} prior sending days, daily limit {daily_limit}");

        Self {
            settings,
            ledger,
            transport,
            composer,
            clock,
            state: RunState {
                daily_limit,
                ..RunState::default()
            },
            bounces_checked: false,
            finished: false,
        }
    }

    pub fn ledger(&self) -> &SendLedger {
        &self.ledger
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn daily_limit(&self) -> usize {
        self.state.daily_limit
    }

    /// Apply a bounce scan result to the ledger. Scan errors count as zero
    /// bounces. Only the first call per run has any effect.
    pub fn apply_bounce_scan(
        &mut self,
        scan: Result<BounceSet, BounceError>,
    ) -> Result<usize, LedgerError> {
        if self.bounces_checked {
            log::warn!("Bounce reconciliation already ran for this invocation, ignoring");
            return Ok(0);
        }
        self.bounces_checked = true;

        let bounces = match scan {
            Ok(bounces) => bounces,
            Err(e) => {
                log::warn!("⚠️ Bounce check failed, continuing without it: {e}");
                BounceSet::new()
            }
        };
        log::info!("📮 Detected {} bounces", bounces.len());

        let reconciled = bounce::reconcile(&mut self.ledger, &bounces);
        self.state.bounces_reconciled = reconciled.len();
        if self.ledger.is_dirty() {
            self.ledger.persist()?;
        }
        Ok(reconciled.len())
    }

    pub async fn verify_transport(&self) -> Result<(), TransportError> {
        self.transport.verify().await
    }

    /// Contacts eligible for a first send, in source order: deduplicated,
    /// containing an `@`, and not already sent.
    pub fn candidates<'a>(&self, contacts: &'a [Contact]) -> Vec<&'a Contact> {
        let mut seen = HashSet::new();
        contacts
            .iter()
            .filter(|c| c.email.contains('@'))
            .filter(|c| seen.insert(c.key()))
            .filter(|c| !self.ledger.is_sent(&c.email))
            .collect()
    }

    pub async fn wait_for_window(&self) {
        wait_until_open(
            &self.settings.window,
            self.clock.as_ref(),
            self.settings.window_poll_interval,
        )
        .await;
    }

    pub fn window_open(&self) -> bool {
        self.settings.window.is_open(self.clock.as_ref())
    }

    /// Send to new candidates until the window closes, the daily limit is
    /// hit, or candidates run out. The ledger is flushed after every attempt.
    pub async fn run_primary_pass(&mut self, contacts: &[Contact]) -> Result<StopReason, LedgerError> {
        let candidates = self.candidates(contacts);
        log::info!(
            "📬 {} candidates, daily limit {}",
            candidates.len(),
            self.state.daily_limit
        );

        let mut stop = StopReason::Exhausted;
        for contact in candidates {
            if !self.window_open() {
                log::info!("⏰ Time window closed");
                stop = StopReason::WindowClosed;
                break;
            }
            if self.state.sent_this_run >= self.state.daily_limit {
                log::info!("✅ Max email limit reached ({})", self.state.daily_limit);
                stop = StopReason::LimitReached;
                break;
            }
            if !is_valid_email(&contact.email) {
                log::debug!("Skipping malformed address '{}'", contact.email);
                self.state.skipped_invalid += 1;
                continue;
            }

            let email = self.composer.compose(contact);
            match self.transport.send(&email).await {
                Ok(()) => {
                    let today = self.clock.now().date();
                    self.ledger
                        .record_sent(&contact.email, &contact.organization, &email.subject, today);
                    self.state.sent_this_run += 1;
                    self.ledger.persist()?;
                    log::info!("📧 Sent to {}", contact.email);
                    tokio::time::sleep(self.settings.inter_send_delay).await;
                }
                Err(e) => {
                    log::error!("❌ Failed to send to {}: {e}", contact.email);
                    self.ledger.record_failed(&contact.email, FailureReason::SendError);
                    self.state.error_log.record(&contact.email, e.to_string());
                    self.state.failed_this_run += 1;
                    self.ledger.persist()?;
                }
            }
        }

        self.state.stop_reason = Some(stop);
        Ok(stop)
    }

    /// Re-attempt every failed address found in the contact source. Not
    /// capped and not gated by the window.
    pub async fn run_retry_pass(&mut self, contacts: &[Contact]) -> Result<(), LedgerError> {
        let mut seen = HashSet::new();
        let retries: Vec<&Contact> = contacts
            .iter()
            .filter(|c| self.ledger.is_failed(&c.email) && !self.ledger.is_sent(&c.email))
            .filter(|c| seen.insert(c.key()))
            .collect();
        if retries.is_empty() {
            return Ok(());
        }
        log::info!("🔁 Retrying {} failed emails (not counted toward limit)", retries.len());

        for contact in retries {
            if self.ledger.is_sent(&contact.email) || !is_valid_email(&contact.email) {
                continue;
            }
            self.state.retried += 1;

            let email = self.composer.compose(contact);
            match self.transport.send(&email).await {
                Ok(()) => {
                    let today = self.clock.now().date();
                    let previous = self.ledger.remove_failed(&contact.email);
                    self.ledger
                        .record_sent(&contact.email, &contact.organization, &email.subject, today);
                    self.state.retry_succeeded += 1;
                    self.ledger.persist()?;
                    match previous {
                        Some(record) => log::info!(
                            "✅ Retry succeeded: {} (was {})",
                            contact.email,
                            record.reason
                        ),
                        None => log::info!("✅ Retry succeeded: {}", contact.email),
                    }
                    tokio::time::sleep(self.settings.inter_send_delay).await;
                }
                Err(e) => {
                    log::warn!("❌ Retry failed: {}: {e}", contact.email);
                    self.state.error_log.record(&contact.email, e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Flush the ledger and the error log, and report what happened.
    pub fn finish(mut self) -> Result<RunSummary, LedgerError> {
        self.finished = true;
        self.flush()?;
        Ok(RunSummary {
            bounces_reconciled: self.state.bounces_reconciled,
            sent: self.state.sent_this_run,
            failed: self.state.failed_this_run,
            skipped_invalid: self.state.skipped_invalid,
            retried: self.state.retried,
            retry_succeeded: self.state.retry_succeeded,
            daily_limit: self.state.daily_limit,
            stop_reason: self.state.stop_reason,
        })
    }

    fn flush(&mut self) -> Result<(), LedgerError> {
        if self.ledger.is_dirty() {
            self.ledger.persist()?;
        }
        if !self.state.error_log.is_empty() {
            self.state.error_log.persist(&self.settings.error_log_path)?;
            log::info!(
                "📝 Wrote {} errors to {}",
                self.state.error_log.len(),
                self.settings.error_log_path.display()
            );
        }
        Ok(())
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.flush() {
            log::error!("Failed to flush ledger during shutdown: {e}");
        }
    }
}

/// One full invocation: bounce reconciliation, transport check, primary
/// pass, retry pass.
pub async fn run(
    mut ctx: RunContext,
    contacts: &[Contact],
    bounce_source: Option<Arc<dyn BounceSource>>,
    options: RunOptions,
) -> anyhow::Result<RunSummary> {
    let scan = match bounce_source {
        Some(source) => bounce::scan_for_bounces(source).await,
        None => {
            log::info!("Bounce check disabled");
            Ok(BounceSet::new())
        }
    };
    ctx.apply_bounce_scan(scan)
        .context("Failed to persist ledger after bounce reconciliation")?;

    ctx.verify_transport()
        .await
        .context("Cannot send without a working transport")?;

    let stop = if options.wait_for_window {
        ctx.wait_for_window().await;
        ctx.run_primary_pass(contacts).await?
    } else if ctx.window_open() {
        ctx.run_primary_pass(contacts).await?
    } else {
        log::info!("⏰ Outside sending window ({}), skipping new sends", ctx.settings.window);
        ctx.state.stop_reason = Some(StopReason::WindowClosed);
        StopReason::WindowClosed
    };
    log::debug!("Primary pass finished: {stop}");

    ctx.run_retry_pass(contacts).await?;

    Ok(ctx.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{MessageConfig, OutreachEmail};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        attempts: Arc<Mutex<Vec<String>>>,
        failing: HashSet<String>,
        reject_verify: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn verify(&self) -> Result<(), TransportError> {
            if self.reject_verify {
                return Err(TransportError::Authentication("535 bad credentials".to_string()));
            }
            Ok(())
        }

        async fn send(&self, email: &OutreachEmail) -> Result<(), TransportError> {
            self.attempts.lock().unwrap().push(email.to.clone());
            if self.failing.contains(&email.to) {
                return Err(TransportError::Send("550 mailbox unavailable".to_string()));
            }
            Ok(())
        }
    }

    /// Returns each scripted time once, then repeats the last one.
    struct ScriptedClock(Mutex<Vec<NaiveDateTime>>);

    impl ScriptedClock {
        fn fixed(at: NaiveDateTime) -> Self {
            Self(Mutex::new(vec![at]))
        }
    }

    impl Clock for ScriptedClock {
        fn now(&self) -> NaiveDateTime {
            let mut times = self.0.lock().unwrap();
            if times.len() > 1 {
                times.remove(0)
            } else {
                times[0]
            }
        }
    }

    struct FailingSource;

    impl BounceSource for FailingSource {
        fn fetch_notifications(&self) -> Result<Vec<Vec<u8>>, BounceError> {
            Err(BounceError::Task("connection refused".to_string()))
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 3).unwrap()
    }

    fn at(hour: u32) -> NaiveDateTime {
        today().and_hms_opt(hour, 15, 0).unwrap()
    }

    fn contact(email: &str) -> Contact {
        Contact {
            email: email.to_string(),
            name: "MR JOHN SMITH".to_string(),
            organization: "Cedar Ridge High".to_string(),
        }
    }

    fn settings(dir: &Path, warmup: WarmupSchedule) -> RunSettings {
        RunSettings {
            window: SendWindow::new(8, 9),
            warmup,
            inter_send_delay: Duration::ZERO,
            window_poll_interval: Duration::ZERO,
            error_log_path: dir.join("error_log.json"),
        }
    }

    fn load_ledger(dir: &Path) -> SendLedger {
        SendLedger::load(dir.join("sent_log.json"), dir.join("failed_log.json")).unwrap()
    }

    fn context(
        dir: &Path,
        warmup: WarmupSchedule,
        transport: RecordingTransport,
        clock: ScriptedClock,
    ) -> RunContext {
        let composer =
            MessageComposer::new("Alex Rivera", "alex@example.com", &MessageConfig::default())
                .unwrap();
        RunContext::new(
            settings(dir, warmup),
            load_ledger(dir),
            Box::new(transport),
            composer,
            Box::new(clock),
        )
    }

    #[tokio::test]
    async fn test_sends_all_when_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport::default();
        let attempts = transport.attempts.clone();
        let contacts = vec![
            contact("a@cedar.org"),
            contact("b@cedar.org"),
            contact("c@cedar.org"),
        ];

        let ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(8)),
        );
        let summary = run(ctx, &contacts, None, RunOptions::default()).await.unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.daily_limit, 20);
        assert_eq!(summary.stop_reason, Some(StopReason::Exhausted));
        assert_eq!(attempts.lock().unwrap().len(), 3);

        let ledger = load_ledger(dir.path());
        assert_eq!(ledger.sent().len(), 3);
        assert!(ledger.sent().values().all(|r| r.date == today()));
        assert!(!dir.path().join("error_log.json").exists());
    }

    #[tokio::test]
    async fn test_limit_caps_new_sends() {
        let dir = tempfile::tempdir().unwrap();
        let warmup = WarmupSchedule {
            base_limit: 2,
            per_day_increment: 1,
            absolute_ceiling: 10,
        };
        {
            let mut ledger = load_ledger(dir.path());
            ledger.record_sent("old@cedar.org", "", "", NaiveDate::from_ymd_opt(2024, 9, 2).unwrap());
            ledger.persist().unwrap();
        }
        let contacts: Vec<Contact> = (0..6).map(|i| contact(&format!("n{i}@cedar.org"))).collect();

        let mut ctx = context(
            dir.path(),
            warmup,
            RecordingTransport::default(),
            ScriptedClock::fixed(at(8)),
        );
        assert_eq!(ctx.daily_limit(), 3);
        let stop = ctx.run_primary_pass(&contacts).await.unwrap();

        assert_eq!(stop, StopReason::LimitReached);
        assert_eq!(ctx.state().sent_this_run, 3);
        assert!(ctx.ledger().is_sent("n2@cedar.org"));
        assert!(!ctx.ledger().is_sent("n3@cedar.org"));
    }

    #[tokio::test]
    async fn test_already_sent_and_duplicates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = load_ledger(dir.path());
            ledger.record_sent("done@cedar.org", "Cedar", "Hi", today());
            ledger.persist().unwrap();
        }
        let transport = RecordingTransport::default();
        let attempts = transport.attempts.clone();
        let contacts = vec![
            contact("DONE@cedar.org"),
            contact("new@cedar.org"),
            contact(" New@Cedar.org "),
            contact("no-at-sign"),
        ];

        let mut ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(8)),
        );
        assert_eq!(ctx.candidates(&contacts).len(), 1);
        ctx.run_primary_pass(&contacts).await.unwrap();

        assert_eq!(*attempts.lock().unwrap(), vec!["new@cedar.org".to_string()]);
        assert_eq!(ctx.ledger().sent().len(), 2);
        assert_eq!(ctx.ledger().sent_record("done@cedar.org").unwrap().subject, "Hi");
    }

    #[tokio::test]
    async fn test_invalid_addresses_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport::default();
        let attempts = transport.attempts.clone();
        let contacts = vec![contact("broken@nodot"), contact("ok@cedar.org")];

        let mut ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(8)),
        );
        ctx.run_primary_pass(&contacts).await.unwrap();

        assert_eq!(ctx.state().skipped_invalid, 1);
        assert_eq!(attempts.lock().unwrap().len(), 1);
        assert!(!ctx.ledger().is_sent("broken@nodot"));
        assert!(!ctx.ledger().is_failed("broken@nodot"));
    }

    #[tokio::test]
    async fn test_send_failure_is_recorded_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport {
            failing: ["bad@cedar.org".to_string()].into_iter().collect(),
            ..RecordingTransport::default()
        };
        let contacts = vec![
            contact("bad@cedar.org"),
            contact("good@cedar.org"),
        ];

        let mut ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(8)),
        );
        let stop = ctx.run_primary_pass(&contacts).await.unwrap();
        assert_eq!(stop, StopReason::Exhausted);
        assert_eq!(ctx.state().failed_this_run, 1);
        assert_eq!(ctx.state().sent_this_run, 1);
        assert_eq!(
            ctx.state().error_log.get("bad@cedar.org"),
            Some("Send failed: 550 mailbox unavailable")
        );

        // flushed after the attempt, before finish
        let on_disk = load_ledger(dir.path());
        assert_eq!(on_disk.failed_reason("bad@cedar.org"), Some(FailureReason::SendError));
        assert!(on_disk.is_sent("good@cedar.org"));

        ctx.finish().unwrap();
        assert!(dir.path().join("error_log.json").exists());
    }

    #[tokio::test]
    async fn test_window_closing_mid_run_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport::default();
        let attempts = transport.attempts.clone();
        let contacts = vec![
            contact("a@cedar.org"),
            contact("b@cedar.org"),
            contact("c@cedar.org"),
        ];
        // window check, send date, then closed
        let clock = ScriptedClock(Mutex::new(vec![at(8), at(8), at(9)]));

        let mut ctx = context(dir.path(), WarmupSchedule::default(), transport, clock);
        let stop = ctx.run_primary_pass(&contacts).await.unwrap();

        assert_eq!(stop, StopReason::WindowClosed);
        assert_eq!(*attempts.lock().unwrap(), vec!["a@cedar.org".to_string()]);
        assert!(!ctx.ledger().is_sent("b@cedar.org"));
        assert!(!ctx.ledger().is_failed("b@cedar.org"));
    }

    #[tokio::test]
    async fn test_no_wait_outside_window_skips_primary_but_retries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = load_ledger(dir.path());
            ledger.record_failed("retry@cedar.org", FailureReason::SendError);
            ledger.persist().unwrap();
        }
        let transport = RecordingTransport::default();
        let attempts = transport.attempts.clone();
        let contacts = vec![contact("fresh@cedar.org"), contact("retry@cedar.org")];

        let ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(14)),
        );
        let summary = run(
            ctx,
            &contacts,
            None,
            RunOptions {
                wait_for_window: false,
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::WindowClosed));
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.retry_succeeded, 1);
        assert_eq!(*attempts.lock().unwrap(), vec!["retry@cedar.org".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_is_exempt_from_limit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = load_ledger(dir.path());
            ledger.record_failed("r1@cedar.org", FailureReason::SendError);
            ledger.record_failed("r2@cedar.org", FailureReason::Bounce);
            ledger.record_failed("r3@cedar.org", FailureReason::SendError);
            ledger.persist().unwrap();
        }
        let warmup = WarmupSchedule {
            base_limit: 1,
            per_day_increment: 0,
            absolute_ceiling: 1,
        };
        let transport = RecordingTransport {
            failing: ["r3@cedar.org".to_string()].into_iter().collect(),
            ..RecordingTransport::default()
        };
        let contacts = vec![
            contact("new1@cedar.org"),
            contact("new2@cedar.org"),
            contact("r1@cedar.org"),
            contact("r2@cedar.org"),
            contact("r2@cedar.org"),
            contact("r3@cedar.org"),
        ];

        let ctx = context(dir.path(), warmup, transport, ScriptedClock::fixed(at(8)));
        let summary = run(ctx, &contacts, None, RunOptions::default()).await.unwrap();

        // r1..r3 are failed candidates too; the primary pass takes new1 and
        // stops at the limit before reaching them
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.stop_reason, Some(StopReason::LimitReached));
        assert_eq!(summary.retried, 3);
        assert_eq!(summary.retry_succeeded, 2);

        let ledger = load_ledger(dir.path());
        assert!(ledger.is_sent("r1@cedar.org"));
        assert!(ledger.is_sent("r2@cedar.org"));
        assert!(!ledger.is_failed("r1@cedar.org"));
        assert!(!ledger.is_failed("r2@cedar.org"));
        assert_eq!(ledger.failed_reason("r3@cedar.org"), Some(FailureReason::SendError));
        assert!(!ledger.is_sent("new2@cedar.org"));
    }

    #[tokio::test]
    async fn test_ledger_write_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sent_log.json.tmp")).unwrap();
        let transport = RecordingTransport::default();
        let attempts = transport.attempts.clone();
        let contacts = vec![contact("a@cedar.org"), contact("b@cedar.org")];

        let ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(8)),
        );
        let result = run(ctx, &contacts, None, RunOptions::default()).await;

        let err = result.unwrap_err();
        assert!(err
            .chain()
            .any(|cause| cause.downcast_ref::<LedgerError>().is_some()));
        assert_eq!(*attempts.lock().unwrap(), vec!["a@cedar.org".to_string()]);
    }

    #[tokio::test]
    async fn test_bounce_scan_error_counts_as_no_bounces() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = load_ledger(dir.path());
            ledger.record_sent("sent@cedar.org", "", "", today());
            ledger.persist().unwrap();
        }
        let contacts = vec![contact("sent@cedar.org")];
        let ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            RecordingTransport::default(),
            ScriptedClock::fixed(at(8)),
        );

        let summary = run(ctx, &contacts, Some(Arc::new(FailingSource)), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.bounces_reconciled, 0);
        assert_eq!(summary.sent, 0);
        assert!(load_ledger(dir.path()).is_sent("sent@cedar.org"));
    }

    #[tokio::test]
    async fn test_bounce_scan_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = load_ledger(dir.path());
            ledger.record_sent("x@cedar.org", "", "", today());
            ledger.persist().unwrap();
        }
        let mut ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            RecordingTransport::default(),
            ScriptedClock::fixed(at(8)),
        );
        let bounces: BounceSet = ["x@cedar.org".to_string()].into_iter().collect();

        assert_eq!(ctx.apply_bounce_scan(Ok(bounces.clone())).unwrap(), 1);
        assert_eq!(ctx.apply_bounce_scan(Ok(bounces)).unwrap(), 0);
        assert_eq!(
            load_ledger(dir.path()).failed_reason("x@cedar.org"),
            Some(FailureReason::Bounce)
        );
    }

    #[tokio::test]
    async fn test_transport_verification_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RecordingTransport {
            reject_verify: true,
            ..RecordingTransport::default()
        };
        let attempts = transport.attempts.clone();
        let ctx = context(
            dir.path(),
            WarmupSchedule::default(),
            transport,
            ScriptedClock::fixed(at(8)),
        );

        let result = run(ctx, &[contact("a@cedar.org")], None, RunOptions::default()).await;
        assert!(result.is_err());
        assert!(attempts.lock().unwrap().is_empty());
        assert!(load_ledger(dir.path()).sent().is_empty());
    }

    #[tokio::test]
    async fn test_drop_without_finish_flushes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ctx = context(
                dir.path(),
                WarmupSchedule::default(),
                RecordingTransport::default(),
                ScriptedClock::fixed(at(8)),
            );
            ctx.state.error_log.record("x@cedar.org", "timeout");
        }
        assert!(dir.path().join("error_log.json").exists());
    }
}
