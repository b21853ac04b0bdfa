use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use itertools::Itertools;
use rand::{distributions::Distribution, rngs::SmallRng, SeedableRng};
use statrs::distribution::Erlang;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use loadgen::{Action, Observer, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Failure(u32);

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failure {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Started,
    Enter,
    Exit,
    Executed(Result<(), Failure>),
    Panicked(String),
}

/// Everything observed during a run, from both the action and the observer.
#[derive(Debug, Default)]
struct Record {
    events: Mutex<Vec<Event>>,
    dispatch_times: Mutex<Vec<Instant>>,

    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Record {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn executed(&self) -> Vec<Result<(), Failure>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Executed(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }

    fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

enum Latency {
    Fixed(Duration),
    Erlang(Mutex<(Erlang, SmallRng)>),
}

impl Latency {
    /// Erlang distributed latency, with the given mean.
    fn erlang(mean: Duration, seed: u64) -> Self {
        let rate = 2.0 / mean.as_secs_f64();
        Latency::Erlang(Mutex::new((
            Erlang::new(2, rate).unwrap(),
            SmallRng::seed_from_u64(seed),
        )))
    }

    fn sample(&self) -> Duration {
        match self {
            Latency::Fixed(latency) => *latency,
            Latency::Erlang(dist) => {
                let mut dist = dist.lock().unwrap();
                let (erlang, rng) = &mut *dist;
                Duration::from_secs_f64(erlang.sample(rng))
            }
        }
    }
}

/// An action which sleeps, then returns a fixed outcome, recording what it does.
struct Sleeper {
    record: Arc<Record>,
    latency: Latency,
    outcome: Result<(), Failure>,
}

impl Sleeper {
    fn new(record: &Arc<Record>, latency: Duration) -> Self {
        Self {
            record: Arc::clone(record),
            latency: Latency::Fixed(latency),
            outcome: Ok(()),
        }
    }

    fn with_latency(self, latency: Latency) -> Self {
        Self { latency, ..self }
    }

    fn failing_with(self, failure: Failure) -> Self {
        Self {
            outcome: Err(failure),
            ..self
        }
    }
}

#[async_trait]
impl Action for Sleeper {
    type Error = Failure;

    async fn execute(&self, _cancel: &CancellationToken) -> Result<(), Failure> {
        self.record.dispatch_times.lock().unwrap().push(Instant::now());
        self.record.push(Event::Enter);
        let running = self.record.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.record.peak.fetch_max(running, Ordering::SeqCst);

        time::sleep(self.latency.sample()).await;

        self.record.running.fetch_sub(1, Ordering::SeqCst);
        self.record.push(Event::Exit);

        self.outcome
    }
}

struct Recorder {
    record: Arc<Record>,
}

#[async_trait]
impl Observer<Failure> for Recorder {
    async fn started(&self, _cancel: &CancellationToken) {
        self.record.push(Event::Started);
    }

    async fn executed(&self, _cancel: &CancellationToken, outcome: &Result<(), Failure>) {
        self.record.push(Event::Executed(*outcome));
    }

    async fn panicked(&self, _cancel: &CancellationToken, message: &str) {
        self.record.push(Event::Panicked(message.to_owned()));
    }
}

fn scheduler<A: Action<Error = Failure> + 'static>(
    action: A,
    record: &Arc<Record>,
    rate: f64,
    max_concurrency: usize,
) -> Arc<Scheduler<A>> {
    Arc::new(
        Scheduler::new(action, rate, max_concurrency)
            .unwrap()
            .with_observer(Arc::new(Recorder {
                record: Arc::clone(record),
            })),
    )
}

/// Run the scheduler for `duration`, then cancel it and wait for `run` to return.
async fn run_for<A: Action + 'static>(
    scheduler: &Arc<Scheduler<A>>,
    duration: Duration,
) -> loadgen::Error {
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let scheduler = Arc::clone(scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(&cancel).await }
    });

    time::sleep(duration).await;
    cancel.cancel();

    run.await
        .expect("scheduler shouldn't panic")
        .expect_err("run only returns on cancellation or failure")
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_the_limit() {
    for (seed, (rate, max_concurrency)) in [(1.0, 1), (20.0, 2), (200.0, 4), (1000.0, 16)]
        .into_iter()
        .enumerate()
    {
        let record = Arc::new(Record::default());
        let latency = Latency::erlang(Duration::from_millis(50), u64::try_from(seed).unwrap());
        let sleeper = Sleeper::new(&record, Duration::ZERO).with_latency(latency);
        let scheduler = scheduler(sleeper, &record, rate, max_concurrency);

        let err = run_for(&scheduler, Duration::from_secs(3)).await;
        assert!(err.is_cancelled());

        assert!(
            record.peak() <= max_concurrency,
            "rate = {rate}, max concurrency = {max_concurrency}, peak = {}",
            record.peak()
        );
        assert!(record.peak() >= 1);
    }
}

#[tokio::test(start_paused = true)]
async fn saturated_schedulers_use_every_slot() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(500)),
        &record,
        100.0,
        5,
    );

    run_for(&scheduler, Duration::from_secs(2)).await;

    assert_eq!(record.peak(), 5);
}

#[tokio::test(start_paused = true)]
async fn achieved_rate_converges_to_the_target() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(Sleeper::new(&record, Duration::ZERO), &record, 50.0, 10);

    run_for(&scheduler, Duration::from_secs(10)).await;

    let dispatched = scheduler.state().dispatched();
    assert!(
        (499..=502).contains(&dispatched),
        "expected ~500 dispatches, got {dispatched}"
    );

    // Evenly paced, not bursty.
    let min_gap = record
        .dispatch_times
        .lock()
        .unwrap()
        .iter()
        .tuple_windows()
        .map(|(a, b)| b.duration_since(*a))
        .min()
        .unwrap();
    assert!(
        min_gap >= Duration::from_millis(19),
        "dispatches too close together: {min_gap:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn fractional_rates_are_supported() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(Sleeper::new(&record, Duration::ZERO), &record, 0.5, 1);

    run_for(&scheduler, Duration::from_millis(9_500)).await;

    // t = 0, 2, 4, 6, 8
    assert_eq!(scheduler.state().dispatched(), 5);
}

#[tokio::test(start_paused = true)]
async fn cancellation_waits_for_dispatched_work() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(300)),
        &record,
        100.0,
        8,
    );

    let cancel = CancellationToken::new();
    let mut run = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(&cancel).await }
    });

    time::sleep(Duration::from_millis(1_150)).await;
    cancel.cancel();

    let in_flight = scheduler.state().in_flight();
    assert!(in_flight > 0, "work should be in flight when cancelled");

    let cancelled_at = Instant::now();
    let result = tokio::select! {
        result = &mut run => result,
        _ = time::sleep(Duration::from_secs(10)) => panic!("run should return after draining"),
    };
    assert!(result.unwrap().unwrap_err().is_cancelled());
    assert!(cancelled_at.elapsed() > Duration::ZERO, "run returned before draining");

    let dispatched = scheduler.state().dispatched();
    assert_eq!(record.count(&Event::Exit), usize::try_from(dispatched).unwrap());
    assert_eq!(record.executed().len(), usize::try_from(dispatched).unwrap());
    assert_eq!(scheduler.state().in_flight(), 0);
    assert_eq!(scheduler.state().available(), 8);
}

#[tokio::test(start_paused = true)]
async fn started_fires_once_before_any_execution() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(10)),
        &record,
        20.0,
        2,
    );

    run_for(&scheduler, Duration::from_secs(1)).await;

    let events = record.events();
    assert_eq!(events.first(), Some(&Event::Started));
    assert_eq!(record.count(&Event::Started), 1);
    assert!(!record.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn executed_fires_once_per_job_with_its_outcome() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(10)),
        &record,
        20.0,
        2,
    );

    run_for(&scheduler, Duration::from_secs(1)).await;

    let executed = record.executed();
    assert_eq!(executed.len(), record.count(&Event::Enter));
    assert!(executed.iter().all(|outcome| *outcome == Ok(())));
}

#[tokio::test(start_paused = true)]
async fn failing_actions_do_not_stop_the_scheduler() {
    let failure = Failure(7);

    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(10)).failing_with(failure),
        &record,
        10.0,
        1,
    );

    let err = run_for(&scheduler, Duration::from_millis(950)).await;
    assert!(err.is_cancelled());

    let executed = record.executed();
    assert_eq!(executed.len(), 10);
    assert!(executed.iter().all(|outcome| *outcome == Err(failure)));
}

#[tokio::test(start_paused = true)]
async fn ten_per_second_with_two_workers() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(50)),
        &record,
        10.0,
        2,
    );

    run_for(&scheduler, Duration::from_secs(1)).await;

    let completed = record.executed().len();
    assert!(
        (8..=12).contains(&completed),
        "expected roughly 10 completions, got {completed}"
    );
    assert!(record.peak() <= 2);
}

#[tokio::test(start_paused = true)]
async fn single_slot_runs_jobs_one_after_another() {
    let record = Arc::new(Record::default());
    let scheduler = scheduler(
        Sleeper::new(&record, Duration::from_millis(10)),
        &record,
        1000.0,
        1,
    );

    run_for(&scheduler, Duration::from_millis(200)).await;

    let events = record.events();
    assert_eq!(events.first(), Some(&Event::Started));

    let jobs = events[1..].chunks(3).collect::<Vec<_>>();
    assert!(jobs.len() > 1);
    for job in jobs {
        assert_eq!(
            job,
            [Event::Enter, Event::Exit, Event::Executed(Ok(()))],
            "a job started before the previous one released its slot"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_actions_release_their_slot() {
    let panics = Arc::new(AtomicUsize::new(0));
    let action = loadgen::action::from_fn({
        let panics = Arc::clone(&panics);
        move |_| {
            let panics = Arc::clone(&panics);
            async move {
                panics.fetch_add(1, Ordering::SeqCst);
                if true {
                    panic!("action failed hard");
                }
                Ok::<_, Failure>(())
            }
        }
    });

    let record = Arc::new(Record::default());
    let scheduler = scheduler(action, &record, 10.0, 1);

    let err = run_for(&scheduler, Duration::from_millis(950)).await;
    assert!(err.is_cancelled());

    assert_eq!(panics.load(Ordering::SeqCst), 10);
    assert_eq!(scheduler.state().in_flight(), 0);
    assert_eq!(scheduler.state().available(), 1);

    assert!(record.executed().is_empty());
    assert_eq!(
        record.count(&Event::Panicked("action failed hard".to_owned())),
        10,
        "every panicking job should be reported once"
    );
}
