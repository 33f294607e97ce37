//! Change-aware periodic polling of card readers.
//!
//! A [`Poller`] runs one synchronous polling round: it sends its commands
//! through a [`CardReader`], merges every response of the round into one
//! candidate snapshot and runs its task only when that snapshot holds a
//! response the task has not been shown yet.
//!
//! A [`PollingReader`] drives a poller on a tokio interval. The poller and
//! its last-fired snapshot are moved into each round and back out, so the
//! snapshot only ever has one writer. `stop` waits for a round that is
//! already running, and no round starts after `stop` returns.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::apdu::CommandApdu;
use crate::core::error::{Error, Result};
use crate::core::reader::CardReader;
use crate::core::response::{CardResponse, Terminal};

/// Task run with the merged response snapshot of a round that changed
pub trait CardTask: Send + Sync + 'static {
    fn execute(&self, responses: &HashSet<CardResponse>);
}

impl<F> CardTask for F
where
    F: Fn(&HashSet<CardResponse>) + Send + Sync + 'static,
{
    fn execute(&self, responses: &HashSet<CardResponse>) {
        self(responses)
    }
}

/// Task run once per answering terminal of a round that changed
pub trait TerminalTask: Send + Sync + 'static {
    fn execute(&self, terminal: &Terminal, responses: &[CardResponse]);
}

impl<F> TerminalTask for F
where
    F: Fn(&Terminal, &[CardResponse]) + Send + Sync + 'static,
{
    fn execute(&self, terminal: &Terminal, responses: &[CardResponse]) {
        self(terminal, responses)
    }
}

/// Holds the snapshot the task last fired with and decides whether a new
/// round counts as a change.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    last_fired: HashSet<CardResponse>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fired(&self) -> &HashSet<CardResponse> {
        &self.last_fired
    }

    /// Returns `true` when `candidate` is non-empty and holds at least one
    /// response missing from the last-fired snapshot. In that case the
    /// snapshot is replaced by `candidate`; otherwise it is left as is.
    ///
    /// An empty round never counts as a change, so pulling a card does not
    /// fire by itself. Re-presenting the same card afterwards does not fire
    /// either, since its response is still in the snapshot.
    pub fn observe(&mut self, candidate: &HashSet<CardResponse>) -> bool {
        let changed = candidate.iter().any(|r| !self.last_fired.contains(r));
        if changed {
            self.last_fired = candidate.clone();
        }
        changed
    }
}

enum Dispatch {
    Snapshot(Arc<dyn CardTask>),
    PerTerminal(Arc<dyn TerminalTask>),
}

/// The fixed parts of a poller: reader, commands and task
struct PollJob {
    reader: Arc<dyn CardReader>,
    commands: Vec<CommandApdu>,
    dispatch: Dispatch,
}

impl fmt::Debug for PollJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let commands: Vec<String> = self.commands.iter().map(ToString::to_string).collect();
        let task = match self.dispatch {
            Dispatch::Snapshot(_) => "snapshot",
            Dispatch::PerTerminal(_) => "per-terminal",
        };
        f.debug_struct("PollJob")
            .field("commands", &commands)
            .field("task", &task)
            .finish()
    }
}

/// One reader, its command(s), a task, and the last-fired snapshot
#[derive(Debug)]
pub struct Poller {
    job: Arc<PollJob>,
    detector: ChangeDetector,
}

impl Poller {
    /// Poll with a single command; the task gets the merged response set
    pub fn single(reader: Arc<dyn CardReader>, command: CommandApdu, task: impl CardTask) -> Self {
        Self::from_job(Arc::new(PollJob {
            reader,
            commands: vec![command],
            dispatch: Dispatch::Snapshot(Arc::new(task)),
        }))
    }

    /// Poll with several commands; the task runs once per terminal that
    /// answered. Fails when `commands` is empty.
    pub fn per_terminal(
        reader: Arc<dyn CardReader>,
        commands: Vec<CommandApdu>,
        task: impl TerminalTask,
    ) -> Result<Self> {
        if commands.is_empty() {
            return Err(Error::PreconditionViolation(
                "at least one command is required".to_string(),
            ));
        }

        Ok(Self::from_job(Arc::new(PollJob {
            reader,
            commands,
            dispatch: Dispatch::PerTerminal(Arc::new(task)),
        })))
    }

    fn from_job(job: Arc<PollJob>) -> Self {
        Self {
            job,
            detector: ChangeDetector::new(),
        }
    }

    pub fn commands(&self) -> &[CommandApdu] {
        &self.job.commands
    }

    pub fn last_fired(&self) -> &HashSet<CardResponse> {
        self.detector.last_fired()
    }

    /// Run one polling round and return how many times the task ran.
    ///
    /// A reader failure is returned as [`Error::Collaborator`] and leaves the
    /// snapshot untouched.
    pub fn poll_once(&mut self) -> Result<usize> {
        let job = Arc::clone(&self.job);

        match &job.dispatch {
            Dispatch::Snapshot(task) => {
                let responses = job
                    .reader
                    .read(&job.commands[0])
                    .map_err(Error::Collaborator)?;
                log::debug!("Polling round returned {} response(s)", responses.len());

                if !self.detector.observe(&responses) {
                    return Ok(0);
                }

                log::info!("Responses changed, running task");
                task.execute(&responses);
                Ok(1)
            }
            Dispatch::PerTerminal(task) => {
                let grouped = job
                    .reader
                    .read_terminals(&job.commands)
                    .map_err(Error::Collaborator)?;
                let candidate: HashSet<CardResponse> =
                    grouped.values().flatten().cloned().collect();
                log::debug!(
                    "Polling round returned {} response(s) from {} terminal(s)",
                    candidate.len(),
                    grouped.len()
                );

                if !self.detector.observe(&candidate) {
                    return Ok(0);
                }

                // The change test is global: every answering terminal gets
                // the task, including ones whose responses did not change
                let mut fired = 0;
                for (terminal, responses) in grouped.iter().filter(|(_, r)| !r.is_empty()) {
                    log::info!("Responses changed, running task for {}", terminal);
                    task.execute(terminal, responses);
                    fired += 1;
                }
                Ok(fired)
            }
        }
    }
}

struct ActivePoll {
    cancel: CancellationToken,
    task: JoinHandle<Option<Poller>>,
    period: Duration,
}

enum Phase {
    Unstarted,
    Running(ActivePoll),
    Stopped,
}

struct Schedule {
    phase: Phase,
    /// Present whenever no polling task owns it
    poller: Option<Poller>,
}

/// Copy of the last-fired snapshot that stays readable while a round owns
/// the poller
type Published = Arc<StdMutex<HashSet<CardResponse>>>;

fn publish(published: &StdMutex<HashSet<CardResponse>>, snapshot: &HashSet<CardResponse>) {
    *published.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
}

/// Runs a [`Poller`] at a fixed interval on the tokio runtime.
///
/// `start` and `stop` are serialised by one lock. Calling `start` while
/// polling re-arms the schedule with the new interval and keeps the
/// last-fired snapshot. A failed round is logged and polling carries on.
/// A panicking task ends the schedule and resets the snapshot.
pub struct PollingReader {
    job: Arc<PollJob>,
    schedule: Mutex<Schedule>,
    published: Published,
}

impl PollingReader {
    pub fn new(poller: Poller) -> Self {
        Self {
            job: Arc::clone(&poller.job),
            published: Arc::new(StdMutex::new(poller.last_fired().clone())),
            schedule: Mutex::new(Schedule {
                phase: Phase::Unstarted,
                poller: Some(poller),
            }),
        }
    }

    /// Start polling every `period`. The first round runs one full period
    /// after the call.
    pub async fn start(&self, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(Error::InvalidArgument(
                "polling interval must be greater than zero".to_string(),
            ));
        }

        let mut schedule = self.schedule.lock().await;
        self.reap(&mut schedule).await;
        if let Phase::Running(active) = std::mem::replace(&mut schedule.phase, Phase::Stopped) {
            log::info!(
                "Re-arming polling: {:?} -> {:?}",
                active.period,
                period
            );
            schedule.poller = Some(self.finish(active).await);
        }

        let poller = schedule
            .poller
            .take()
            .unwrap_or_else(|| Poller::from_job(Arc::clone(&self.job)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            poller,
            period,
            cancel.clone(),
            Arc::clone(&self.published),
        ));

        log::info!("Polling started every {:?}", period);
        schedule.phase = Phase::Running(ActivePoll {
            cancel,
            task,
            period,
        });
        Ok(())
    }

    /// Stop polling, waiting for a round that is already running.
    ///
    /// Fails when the reader was never started; stopping twice is fine.
    pub async fn stop(&self) -> Result<()> {
        let mut schedule = self.schedule.lock().await;
        self.reap(&mut schedule).await;
        match std::mem::replace(&mut schedule.phase, Phase::Stopped) {
            Phase::Unstarted => {
                schedule.phase = Phase::Unstarted;
                Err(Error::PreconditionViolation(
                    "stop called before start".to_string(),
                ))
            }
            Phase::Stopped => Ok(()),
            Phase::Running(active) => {
                schedule.poller = Some(self.finish(active).await);
                log::info!("Polling stopped");
                Ok(())
            }
        }
    }

    /// False once stopped, and also once a panicking task ended the schedule
    pub async fn is_running(&self) -> bool {
        let mut schedule = self.schedule.lock().await;
        self.reap(&mut schedule).await;
        matches!(schedule.phase, Phase::Running(_))
    }

    /// The snapshot the task last fired with. Updated after every round
    /// that fires, so it can be read while polling.
    pub fn last_fired(&self) -> HashSet<CardResponse> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Moves a schedule whose task ended without being cancelled to `Stopped`
    async fn reap(&self, schedule: &mut Schedule) {
        let ended = matches!(&schedule.phase, Phase::Running(active) if active.task.is_finished());
        if !ended {
            return;
        }
        if let Phase::Running(active) = std::mem::replace(&mut schedule.phase, Phase::Stopped) {
            schedule.poller = Some(self.finish(active).await);
        }
    }

    async fn finish(&self, active: ActivePoll) -> Poller {
        active.cancel.cancel();
        match active.task.await {
            Ok(Some(poller)) => poller,
            Ok(None) | Err(_) => {
                log::error!("Polling task was lost, last-fired snapshot reset");
                let poller = Poller::from_job(Arc::clone(&self.job));
                publish(&self.published, poller.last_fired());
                poller
            }
        }
    }
}

impl fmt::Debug for PollingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingReader")
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

impl Drop for PollingReader {
    fn drop(&mut self) {
        if let Phase::Running(active) = &self.schedule.get_mut().phase {
            active.cancel.cancel();
        }
    }
}

/// Tick loop of one schedule. Hands the poller back when cancelled, or
/// `None` when a round panicked and took the poller with it.
async fn poll_loop(
    mut poller: Poller,
    period: Duration,
    cancel: CancellationToken,
    published: Published,
) -> Option<Poller> {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("Polling task cancelled");
                break;
            }

            _ = ticker.tick() => {}
        }

        // PCSC calls block, so the round runs on the blocking pool
        let round = tokio::task::spawn_blocking(move || {
            let outcome = poller.poll_once();
            (poller, outcome)
        });

        match round.await {
            Ok((returned, outcome)) => {
                poller = returned;
                match outcome {
                    Ok(0) => {}
                    Ok(_) => publish(&published, poller.last_fired()),
                    Err(e) => log::warn!("Polling round failed: {e}"),
                }
            }
            Err(e) => {
                log::error!("Polling round panicked, schedule ended: {e}");
                publish(&published, &HashSet::new());
                return None;
            }
        }
    }

    Some(poller)
}
