//! Command poller — scans the inbox, picks the live command, dispatches it
//! at most once.
//!
//! Each cycle opens a fresh mail session, looks for unread messages inside
//! the freshness window, parses the most recent one as a booking command,
//! hands it to the executor if its fingerprint is new, and marks every
//! evaluated message read so it is never reconsidered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{BookingCommand, parse_booking_command};
use crate::config::PollerConfig;
use crate::error::MailError;
use crate::executor::BookingExecutor;
use crate::ledger::ExecutionLedger;
use crate::mail::{MailStore, Uid};

/// What a completed poll cycle did. Connection-class failures surface as
/// `Err(MailError)` instead; everything here is a normal cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No unread messages at all; no side effects.
    Idle,
    /// Unread messages existed but none fell inside the freshness window.
    NoCandidates { scanned: usize },
    /// The live message carried a new command and the executor succeeded.
    Dispatched(BookingCommand),
    /// The live message's fingerprint was already in the ledger.
    Duplicate(BookingCommand),
    /// The live message's subject did not parse as a booking command.
    Rejected { subject: String },
    /// The executor failed; the fingerprint was not recorded (at-most-once).
    DispatchFailed(BookingCommand),
}

/// An unread message whose timestamp fell inside the freshness window.
struct Candidate {
    uid: Uid,
    timestamp: i64,
}

/// The poller itself. Holds the ledger for the lifetime of the process;
/// sessions with the mail store are per-cycle.
pub struct CommandPoller {
    config: PollerConfig,
    store: Arc<dyn MailStore>,
    executor: Arc<dyn BookingExecutor>,
    ledger: Mutex<ExecutionLedger>,
}

impl CommandPoller {
    pub fn new(
        config: PollerConfig,
        store: Arc<dyn MailStore>,
        executor: Arc<dyn BookingExecutor>,
    ) -> Self {
        let ledger = Mutex::new(ExecutionLedger::new(config.ledger_capacity));
        Self {
            config,
            store,
            executor,
            ledger,
        }
    }

    /// Run a single poll cycle against the current wall clock.
    ///
    /// Blocking — run under `spawn_blocking` from the async loop.
    pub fn poll_once(&self) -> Result<CycleOutcome, MailError> {
        self.cycle(Utc::now())
    }

    fn cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome, MailError> {
        let mut session = self.store.connect()?;

        let uids = session.search_unseen()?;
        if uids.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        debug!(unseen = uids.len(), "Scanning unread messages");

        let window = self.config.freshness_secs;
        let mut candidates: Vec<Candidate> = Vec::new();

        for uid in &uids {
            let header = session.fetch_date_header(uid)?;
            let Some(timestamp) = header_timestamp(&header) else {
                // One malformed message must not block the others.
                warn!(uid = %uid, "Unparseable Date header, skipping message");
                continue;
            };

            let age = now.timestamp() - timestamp;
            if age < -window {
                // Future-dated beyond clock skew: it can never enter the
                // window, so leaving it unread would reprocess it forever.
                warn!(uid = %uid, age, "Discarding future-dated message");
                session.mark_seen(uid)?;
            } else if (0..=window).contains(&age) {
                candidates.push(Candidate {
                    uid: uid.clone(),
                    timestamp,
                });
            }
            // Slightly future (may enter the window later) or already
            // stale: leave unread, no side effects.
        }

        if candidates.is_empty() {
            session.reselect()?;
            return Ok(CycleOutcome::NoCandidates {
                scanned: uids.len(),
            });
        }

        // Most recent candidate wins; ties keep the first in fetch order.
        let mut live = 0;
        for (i, c) in candidates.iter().enumerate().skip(1) {
            if c.timestamp > candidates[live].timestamp {
                live = i;
            }
        }

        let raw = session.fetch_full(&candidates[live].uid)?;
        let subject = decode_subject(&raw);

        let outcome = match parse_booking_command(&subject) {
            None => {
                warn!(subject = %subject, "Live message is not a booking command");
                CycleOutcome::Rejected { subject }
            }
            Some(command) => {
                let fingerprint = command.fingerprint();
                if self.ledger.lock().unwrap().contains(fingerprint) {
                    info!(%command, "Skipping already-dispatched command");
                    CycleOutcome::Duplicate(command)
                } else {
                    match self.executor.execute(&command) {
                        Ok(()) => {
                            self.ledger.lock().unwrap().record(fingerprint);
                            info!(%command, uid = %candidates[live].uid, "Dispatched booking command");
                            CycleOutcome::Dispatched(command)
                        }
                        Err(e) => {
                            error!(%command, error = %e, "Booking executor failed");
                            CycleOutcome::DispatchFailed(command)
                        }
                    }
                }
            }
        };

        // The live message was evaluated this cycle, parse success or not;
        // never reconsider it.
        session.mark_seen(&candidates[live].uid)?;

        // Remaining candidates are duplicate/retry mails of the same intent.
        for (i, c) in candidates.iter().enumerate() {
            if i != live {
                debug!(uid = %c.uid, "Marking sibling candidate read");
                session.mark_seen(&c.uid)?;
            }
        }

        // Flush the store's cached folder state before the session drops.
        session.reselect()?;
        Ok(outcome)
    }
}

/// Parse the `Date` header out of a raw header block.
fn header_timestamp(raw: &[u8]) -> Option<i64> {
    MessageParser::default()
        .parse(raw)
        .and_then(|m| m.date().map(|d| d.to_timestamp()))
}

/// Decode the subject of a raw message, handling RFC 2047 encoded words.
/// Falls back to the raw text when the message does not parse at all, so a
/// mangled but greppable command line still has a chance to match.
fn decode_subject(raw: &[u8]) -> String {
    if let Some(parsed) = MessageParser::default().parse(raw)
        && let Some(subject) = parsed.subject()
    {
        return subject.to_string();
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Spawn the background poll loop.
///
/// Returns a `JoinHandle` and a shutdown flag; set the flag to stop polling
/// after the current cycle. A successful cycle resets the failure counter; a
/// failed cycle backs off for a fixed interval, and after `max_retries`
/// consecutive failures the loop gives up and exits.
pub fn spawn_poller(poller: Arc<CommandPoller>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let interval = poller.config.poll_interval_secs;
    let max_retries = poller.config.max_retries;
    let backoff = Duration::from_secs(poller.config.retry_backoff_secs);

    let handle = tokio::spawn(async move {
        info!("Command poller started — polling every {interval}s");

        let mut tick = tokio::time::interval(Duration::from_secs(interval));
        let mut failures = 0u32;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Command poller shutting down");
                return;
            }

            let p = Arc::clone(&poller);
            let result = tokio::task::spawn_blocking(move || p.poll_once()).await;

            match result {
                Ok(Ok(outcome)) => {
                    failures = 0;
                    match outcome {
                        CycleOutcome::Idle => {}
                        CycleOutcome::NoCandidates { scanned } => {
                            debug!(scanned, "No fresh candidates this cycle");
                        }
                        // Per-message details were logged inside the cycle.
                        _ => {}
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    error!("Poll cycle failed ({failures}/{max_retries}): {e}");
                    if failures >= max_retries {
                        error!("Too many consecutive failures, giving up");
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    failures += 1;
                    error!("Poll cycle panicked ({failures}/{max_retries}): {e}");
                    if failures >= max_retries {
                        error!("Too many consecutive failures, giving up");
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::mail::MailSession;
    use chrono::TimeDelta;

    // ── Fake mail store ─────────────────────────────────────────────

    struct FakeMessage {
        uid: Uid,
        date_header: Vec<u8>,
        full: Vec<u8>,
        seen: bool,
    }

    #[derive(Default)]
    struct FakeState {
        messages: Vec<FakeMessage>,
        full_fetches: Vec<Uid>,
        reselects: usize,
    }

    #[derive(Default)]
    struct FakeStore {
        state: Mutex<FakeState>,
        fail_connect: bool,
    }

    impl FakeStore {
        fn add_message(&self, uid: &str, date: DateTime<Utc>, subject: &str) {
            let date_header = format!("Date: {}\r\n\r\n", date.to_rfc2822()).into_bytes();
            let full = format!(
                "Date: {}\r\nFrom: sender@example.com\r\nSubject: {}\r\n\r\nbody\r\n",
                date.to_rfc2822(),
                subject
            )
            .into_bytes();
            self.state.lock().unwrap().messages.push(FakeMessage {
                uid: uid.to_string(),
                date_header,
                full,
                seen: false,
            });
        }

        fn add_message_with_date_header(&self, uid: &str, header: &str) {
            self.state.lock().unwrap().messages.push(FakeMessage {
                uid: uid.to_string(),
                date_header: header.as_bytes().to_vec(),
                full: b"Subject: whatever\r\n\r\n".to_vec(),
                seen: false,
            });
        }

        fn is_seen(&self, uid: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| m.seen)
                .unwrap_or(false)
        }

        fn reselects(&self) -> usize {
            self.state.lock().unwrap().reselects
        }

        fn full_fetches(&self) -> Vec<Uid> {
            self.state.lock().unwrap().full_fetches.clone()
        }
    }

    impl MailStore for FakeStore {
        fn connect(&self) -> Result<Box<dyn MailSession + '_>, MailError> {
            if self.fail_connect {
                return Err(MailError::AuthFailed {
                    user: "tester".into(),
                });
            }
            Ok(Box::new(FakeSession { state: &self.state }))
        }
    }

    struct FakeSession<'a> {
        state: &'a Mutex<FakeState>,
    }

    impl MailSession for FakeSession<'_> {
        fn search_unseen(&mut self) -> Result<Vec<Uid>, MailError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .messages
                .iter()
                .filter(|m| !m.seen)
                .map(|m| m.uid.clone())
                .collect())
        }

        fn fetch_date_header(&mut self, uid: &str) -> Result<Vec<u8>, MailError> {
            self.state
                .lock()
                .unwrap()
                .messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| m.date_header.clone())
                .ok_or_else(|| MailError::Protocol(format!("no such uid {uid}")))
        }

        fn fetch_full(&mut self, uid: &str) -> Result<Vec<u8>, MailError> {
            let mut state = self.state.lock().unwrap();
            state.full_fetches.push(uid.to_string());
            state
                .messages
                .iter()
                .find(|m| m.uid == uid)
                .map(|m| m.full.clone())
                .ok_or_else(|| MailError::Protocol(format!("no such uid {uid}")))
        }

        fn mark_seen(&mut self, uid: &str) -> Result<(), MailError> {
            let mut state = self.state.lock().unwrap();
            match state.messages.iter_mut().find(|m| m.uid == uid) {
                Some(m) => {
                    m.seen = true;
                    Ok(())
                }
                None => Err(MailError::Protocol(format!("no such uid {uid}"))),
            }
        }

        fn reselect(&mut self) -> Result<(), MailError> {
            self.state.lock().unwrap().reselects += 1;
            Ok(())
        }
    }

    // ── Recording executor ──────────────────────────────────────────

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<BookingCommand>>,
        fail: bool,
    }

    impl RecordingExecutor {
        fn failing() -> Self {
            Self {
                executed: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn count(&self) -> usize {
            self.executed.lock().unwrap().len()
        }
    }

    impl BookingExecutor for RecordingExecutor {
        fn execute(&self, command: &BookingCommand) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Failed {
                    reason: "court unavailable".into(),
                });
            }
            self.executed.lock().unwrap().push(*command);
            Ok(())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn now() -> DateTime<Utc> {
        // Fixed clock so ages are exact.
        DateTime::parse_from_rfc3339("2026-02-23T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ago(secs: i64) -> DateTime<Utc> {
        now() - TimeDelta::seconds(secs)
    }

    fn poller(store: Arc<FakeStore>, executor: Arc<RecordingExecutor>) -> CommandPoller {
        CommandPoller::new(PollerConfig::default(), store, executor)
    }

    // ── Cycle tests ─────────────────────────────────────────────────

    #[test]
    fn empty_inbox_is_idle_with_no_side_effects() {
        let store = Arc::new(FakeStore::default());
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        assert_eq!(p.cycle(now()).unwrap(), CycleOutcome::Idle);
        assert_eq!(exec.count(), 0);
        assert_eq!(store.reselects(), 0);
    }

    #[test]
    fn fresh_command_is_dispatched_and_marked_read() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(5), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        let expected = BookingCommand { day: 3, start_hour: 20, end_hour: 21 };
        assert_eq!(outcome, CycleOutcome::Dispatched(expected));
        assert_eq!(exec.count(), 1);
        assert!(store.is_seen("1"));
        assert!(p.ledger.lock().unwrap().contains(expected.fingerprint()));
        assert_eq!(store.reselects(), 1);
    }

    #[test]
    fn newest_of_two_fresh_duplicates_wins_both_marked_read() {
        let store = Arc::new(FakeStore::default());
        store.add_message("10", ago(50), "订场-3-20-21");
        store.add_message("11", ago(5), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Dispatched(_)));
        assert_eq!(exec.count(), 1);
        assert_eq!(store.full_fetches(), vec!["11".to_string()]);
        assert!(store.is_seen("10"));
        assert!(store.is_seen("11"));
        assert_eq!(p.ledger.lock().unwrap().len(), 1);
    }

    #[test]
    fn timestamp_tie_keeps_first_in_fetch_order() {
        let store = Arc::new(FakeStore::default());
        store.add_message("20", ago(10), "订场-1-8-9");
        store.add_message("21", ago(10), "订场-2-8-9");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        p.cycle(now()).unwrap();
        assert_eq!(store.full_fetches(), vec!["20".to_string()]);
    }

    #[test]
    fn far_future_message_is_discarded_as_read() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(-120), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert_eq!(outcome, CycleOutcome::NoCandidates { scanned: 1 });
        assert!(store.is_seen("1"));
        assert_eq!(exec.count(), 0);
    }

    #[test]
    fn slightly_future_message_is_left_unread() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(-30), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert_eq!(outcome, CycleOutcome::NoCandidates { scanned: 1 });
        assert!(!store.is_seen("1"));
    }

    #[test]
    fn stale_message_is_left_untouched() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(300), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert_eq!(outcome, CycleOutcome::NoCandidates { scanned: 1 });
        assert!(!store.is_seen("1"));
        assert_eq!(exec.count(), 0);
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(60), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        assert!(matches!(
            p.cycle(now()).unwrap(),
            CycleOutcome::Dispatched(_)
        ));
    }

    #[test]
    fn ledgered_command_is_not_dispatched_twice_across_cycles() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(5), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        p.cycle(now()).unwrap();
        assert_eq!(exec.count(), 1);

        // Same intent arrives again a cycle later.
        store.add_message("2", ago(3), "re: 订场-3-20-21");
        let outcome = p.cycle(now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Duplicate(_)));
        assert_eq!(exec.count(), 1);
        assert!(store.is_seen("2"));
    }

    #[test]
    fn malformed_subject_is_rejected_but_still_marked_read() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(5), "订场-8-10-5");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Rejected { .. }));
        assert_eq!(exec.count(), 0);
        assert!(store.is_seen("1"));

        // Nothing unread is left, so the next cycle is idle.
        assert_eq!(p.cycle(now()).unwrap(), CycleOutcome::Idle);
    }

    #[test]
    fn non_command_subject_yields_no_dispatch() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(5), "lunch tomorrow?");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        assert!(matches!(
            p.cycle(now()).unwrap(),
            CycleOutcome::Rejected { .. }
        ));
        assert_eq!(exec.count(), 0);
    }

    #[test]
    fn unparseable_date_skips_message_without_blocking_others() {
        let store = Arc::new(FakeStore::default());
        store.add_message_with_date_header("1", "Date: not a real date\r\n\r\n");
        store.add_message("2", ago(5), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Dispatched(_)));
        assert!(!store.is_seen("1"));
        assert!(store.is_seen("2"));
    }

    #[test]
    fn dispatch_failure_records_no_fingerprint_but_marks_read() {
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(5), "订场-3-20-21");
        let exec = Arc::new(RecordingExecutor::failing());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::DispatchFailed(_)));
        assert!(p.ledger.lock().unwrap().is_empty());
        assert!(store.is_seen("1"));
    }

    #[test]
    fn connect_failure_surfaces_as_mail_error() {
        let store = Arc::new(FakeStore {
            fail_connect: true,
            ..FakeStore::default()
        });
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        assert!(matches!(
            p.cycle(now()),
            Err(MailError::AuthFailed { .. })
        ));
    }

    #[test]
    fn encoded_word_subject_is_decoded_before_parsing() {
        // "订场-3-20-21" as a UTF-8 base64 encoded word.
        let store = Arc::new(FakeStore::default());
        store.add_message("1", ago(5), "=?utf-8?B?6K6i5Zy6LTMtMjAtMjE=?=");
        let exec = Arc::new(RecordingExecutor::default());
        let p = poller(Arc::clone(&store), Arc::clone(&exec));

        let outcome = p.cycle(now()).unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Dispatched(BookingCommand { day: 3, start_hour: 20, end_hour: 21 })
        );
    }
}
