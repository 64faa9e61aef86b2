use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures_util::future::join_all;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};
use url::Url;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const STOP_MARGIN: Duration = Duration::from_secs(5);
const EXPORT_ATTEMPTS: u32 = 3;
const EXPORT_BACKOFF: Duration = Duration::from_millis(200);

/// Highest latency the histogram tracks, in microseconds (one hour).
const MAX_TRACKED_LATENCY_US: u64 = 3_600_000_000;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "http-loadgen")]
#[command(about = "HTTP/1.1 load generator with request-then-sleep virtual users", long_about = None)]
struct Config {
    /// Target scheme (http or https)
    #[arg(long, env = "TARGET_SCHEME", default_value = "http")]
    scheme: String,

    /// Target host
    #[arg(long, env = "SERVER_HOST")]
    host: String,

    /// Target port
    #[arg(long, env = "SERVER_PORT")]
    port: u16,

    /// Request path
    #[arg(long, env = "TARGET_PATH", default_value = "/posts")]
    path: String,

    /// Number of virtual users
    #[arg(long, env = "VUS", default_value = "1")]
    vus: usize,

    /// Total run duration (e.g. 30s, 5m). Runs until interrupted when neither
    /// this nor --iterations is set
    #[arg(long, env = "DURATION", value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Requests per virtual user
    #[arg(long, env = "ITERATIONS")]
    iterations: Option<u64>,

    /// Sleep between two requests of the same virtual user
    #[arg(long, env = "SLEEP", default_value = "2s", value_parser = humantime::parse_duration)]
    delay: Duration,

    /// Where the sleep is measured from
    #[arg(long, env = "PACING", value_enum, default_value_t = Pacing::AfterCompletion)]
    pacing: Pacing,

    /// Per-request timeout
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// How long in-flight requests may run after the run is stopped
    #[arg(long, env = "GRACEFUL_STOP", default_value = "30s", value_parser = humantime::parse_duration)]
    graceful_stop: Duration,

    /// Spread virtual user start-up over this duration
    #[arg(long, env = "RAMP_UP", default_value = "0s", value_parser = humantime::parse_duration)]
    ramp_up: Duration,

    /// Fail the run when the error rate reaches this fraction
    #[arg(long, env = "MAX_ERROR_RATE", default_value = "1.0")]
    max_error_rate: f64,

    /// Summary format on stdout
    #[arg(long, env = "OUTPUT", value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Also write the JSON summary to this file
    #[arg(long, env = "SUMMARY_EXPORT")]
    summary_export: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pacing {
    /// Sleep the full delay after each response
    AfterCompletion,
    /// Start requests one delay apart, measured from request start
    FixedInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("virtual user count must be at least 1")]
    NoVirtualUsers,
    #[error("unsupported scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
    #[error("target host must not be empty")]
    EmptyHost,
    #[error("invalid target host '{0}'")]
    InvalidHost(String),
    #[error("target port must be non-zero")]
    ZeroPort,
    #[error("invalid target '{input}': {source}")]
    InvalidTarget {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("run duration must be greater than zero")]
    ZeroDuration,
    #[error("iteration limit must be at least 1")]
    ZeroIterations,
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("max error rate must be within [0, 1], got {0}")]
    ErrorRateOutOfRange(f64),
}

/// Everything the scheduler and the workers need, fixed for the whole run.
#[derive(Debug, Clone)]
struct RunConfig {
    virtual_users: usize,
    duration: Option<Duration>,
    iterations: Option<u64>,
    delay: Duration,
    pacing: Pacing,
    request_timeout: Duration,
    graceful_stop: Duration,
    ramp_up: Duration,
}

impl Config {
    fn validate(&self) -> Result<(Target, RunConfig), ConfigError> {
        let target = Target::new(&self.scheme, &self.host, self.port, &self.path)?;

        if self.vus == 0 {
            return Err(ConfigError::NoVirtualUsers);
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroDuration);
        }
        if self.iterations == Some(0) {
            return Err(ConfigError::ZeroIterations);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(ConfigError::ErrorRateOutOfRange(self.max_error_rate));
        }

        let run = RunConfig {
            virtual_users: self.vus,
            duration: self.duration,
            iterations: self.iterations,
            delay: self.delay,
            pacing: self.pacing,
            request_timeout: self.timeout,
            graceful_stop: self.graceful_stop,
            ramp_up: self.ramp_up,
        };
        Ok((target, run))
    }
}

// =============================================================================
// Data Structures
// =============================================================================

/// The endpoint under test.
#[derive(Debug, Clone)]
struct Target {
    scheme: String,
    host: String,
    port: u16,
    path: String,
    url: Url,
}

impl Target {
    fn new(scheme: &str, host: &str, port: u16, path: &str) -> Result<Self, ConfigError> {
        let scheme = scheme.trim().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::UnsupportedScheme(scheme));
        }

        let host = host.trim();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if host.contains(['/', '?', '#', '@']) || host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidHost(host.to_string()));
        }
        if port == 0 {
            return Err(ConfigError::ZeroPort);
        }

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let input = format!("{}://{}:{}{}", scheme, host, port, path);
        let url = Url::parse(&input).map_err(|source| ConfigError::InvalidTarget {
            input: input.clone(),
            source,
        })?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
            url,
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Dns,
    Connect,
    Timeout,
    Transport,
    /// Abandoned after the graceful stop period.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeResult {
    Status(u16),
    Error(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Classification {
    Success,
    ClientError,
    ServerError,
    UnexpectedStatus,
    TransportError,
    Timeout,
    Cancelled,
}

impl Classification {
    fn is_error(self) -> bool {
        self != Classification::Success
    }

    fn as_str(self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::ClientError => "client_error",
            Classification::ServerError => "server_error",
            Classification::UnexpectedStatus => "unexpected_status",
            Classification::TransportError => "transport_error",
            Classification::Timeout => "timeout",
            Classification::Cancelled => "cancelled",
        }
    }
}

/// One completed request attempt.
#[derive(Debug, Clone)]
struct RequestOutcome {
    user: usize,
    timestamp: SystemTime,
    duration: Duration,
    result: OutcomeResult,
}

impl RequestOutcome {
    fn classify(&self) -> Classification {
        match self.result {
            OutcomeResult::Status(200..=299) => Classification::Success,
            OutcomeResult::Status(400..=499) => Classification::ClientError,
            OutcomeResult::Status(500..=599) => Classification::ServerError,
            OutcomeResult::Status(_) => Classification::UnexpectedStatus,
            OutcomeResult::Error(ErrorKind::Timeout) => Classification::Timeout,
            OutcomeResult::Error(ErrorKind::Cancelled) => Classification::Cancelled,
            OutcomeResult::Error(_) => Classification::TransportError,
        }
    }
}

// =============================================================================
// Metrics
// =============================================================================

#[derive(Debug, Clone)]
struct Summary {
    count: u64,
    error_count: u64,
    by_class: BTreeMap<Classification, u64>,
    by_status: BTreeMap<u16, u64>,
    by_user: BTreeMap<usize, u64>,
    /// Microseconds. Abandoned requests are not recorded.
    latency: Histogram<u64>,
    first_at: Option<SystemTime>,
    last_at: Option<SystemTime>,
}

impl Summary {
    fn new() -> Result<Self, hdrhistogram::CreationError> {
        Ok(Self {
            count: 0,
            error_count: 0,
            by_class: BTreeMap::new(),
            by_status: BTreeMap::new(),
            by_user: BTreeMap::new(),
            latency: Histogram::<u64>::new_with_bounds(1, MAX_TRACKED_LATENCY_US, 3)?,
            first_at: None,
            last_at: None,
        })
    }

    fn record(&mut self, outcome: &RequestOutcome) {
        let class = outcome.classify();

        self.count += 1;
        if class.is_error() {
            self.error_count += 1;
        }
        *self.by_class.entry(class).or_default() += 1;
        *self.by_user.entry(outcome.user).or_default() += 1;
        if let OutcomeResult::Status(code) = outcome.result {
            *self.by_status.entry(code).or_default() += 1;
        }
        if class != Classification::Cancelled {
            self.latency
                .saturating_record(outcome.duration.as_micros() as u64);
        }

        self.first_at = Some(match self.first_at {
            Some(first) => first.min(outcome.timestamp),
            None => outcome.timestamp,
        });
        self.last_at = Some(match self.last_at {
            Some(last) => last.max(outcome.timestamp),
            None => outcome.timestamp,
        });
    }

    fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.count as f64
        }
    }
}

/// Shared sink for outcomes. The only state workers have in common.
#[derive(Clone)]
struct Aggregator {
    summary: Arc<Mutex<Summary>>,
    active_users: Arc<AtomicUsize>,
}

impl Aggregator {
    fn new() -> Result<Self> {
        let summary = Summary::new().context("Failed to create latency histogram")?;
        Ok(Self {
            summary: Arc::new(Mutex::new(summary)),
            active_users: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn append(&self, outcome: RequestOutcome) {
        self.summary.lock().await.record(&outcome);
    }

    async fn snapshot(&self) -> Summary {
        self.summary.lock().await.clone()
    }

    fn active_users(&self) -> usize {
        self.active_users.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Permission for one request, handed out by [`UserSchedule::admit`].
#[derive(Debug, Clone, Copy)]
struct Slot {
    iteration: u64,
    started: Instant,
}

struct Scheduler {
    config: Arc<RunConfig>,
    started: Instant,
    deadline: Option<Instant>,
    stop: watch::Receiver<bool>,
}

impl Scheduler {
    fn new(config: Arc<RunConfig>, stop: watch::Receiver<bool>) -> Self {
        let started = Instant::now();
        let deadline = config.duration.map(|d| started + d);
        Self {
            config,
            started,
            deadline,
            stop,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn user(&self, id: usize) -> UserSchedule {
        let offset = ramp_offset(self.config.ramp_up, id, self.config.virtual_users);
        UserSchedule {
            id,
            start_at: self.started + offset,
            issued: 0,
            iterations: self.config.iterations,
            deadline: self.deadline,
            delay: self.config.delay,
            pacing: self.config.pacing,
            stop: self.stop.clone(),
        }
    }
}

fn ramp_offset(ramp_up: Duration, id: usize, users: usize) -> Duration {
    if users == 0 || ramp_up.is_zero() {
        return Duration::ZERO;
    }
    ramp_up.mul_f64(id as f64 / users as f64)
}

struct UserSchedule {
    id: usize,
    start_at: Instant,
    issued: u64,
    iterations: Option<u64>,
    deadline: Option<Instant>,
    delay: Duration,
    pacing: Pacing,
    stop: watch::Receiver<bool>,
}

impl UserSchedule {
    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    fn is_exhausted(&self) -> bool {
        self.iterations.is_some_and(|limit| self.issued >= limit)
    }

    /// Waits out this user's ramp-up offset. False if the run ended first.
    async fn wait_for_start(&mut self) -> bool {
        if Instant::now() < self.start_at {
            self.pause_until(self.start_at).await;
        }
        !self.is_stopped() && !self.is_expired(Instant::now())
    }

    fn admit(&mut self) -> Option<Slot> {
        let now = Instant::now();
        if self.is_stopped() || self.is_expired(now) || self.is_exhausted() {
            return None;
        }
        self.issued += 1;
        Some(Slot {
            iteration: self.issued,
            started: now,
        })
    }

    fn pause_after(&self, slot: &Slot, finished: Instant) -> Duration {
        match self.pacing {
            Pacing::AfterCompletion => self.delay,
            Pacing::FixedInterval => self
                .delay
                .saturating_sub(finished.saturating_duration_since(slot.started)),
        }
    }

    async fn idle(&mut self, pause: Duration) {
        self.pause_until(Instant::now() + pause).await;
    }

    async fn pause_until(&mut self, wake: Instant) {
        let wake = match self.deadline {
            Some(deadline) => wake.min(deadline),
            None => wake,
        };
        tokio::select! {
            _ = sleep_until(wake) => {}
            _ = stopped(&mut self.stop) => {
                trace!("User {} woken by stop signal", self.id);
            }
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// Virtual Users
// =============================================================================

#[derive(Debug)]
enum UserState {
    Idle,
    Requesting(Slot),
    Sleeping(Duration),
    Stopped,
}

struct VirtualUser {
    id: usize,
    target: Arc<Target>,
    client: reqwest::Client,
    schedule: UserSchedule,
    aggregator: Aggregator,
    graceful_stop: Duration,
    stop: watch::Receiver<bool>,
}

impl VirtualUser {
    fn new(
        id: usize,
        target: Arc<Target>,
        client: reqwest::Client,
        config: &RunConfig,
        schedule: UserSchedule,
        aggregator: Aggregator,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            target,
            client,
            schedule,
            aggregator,
            graceful_stop: config.graceful_stop,
            stop,
        }
    }

    /// Runs the request/sleep cycle until the schedule stops admitting.
    /// Returns the number of requests issued.
    async fn run(mut self) -> u64 {
        if !self.schedule.wait_for_start().await {
            debug!("User {} stopped before starting", self.id);
            return 0;
        }

        self.aggregator.active_users.fetch_add(1, Ordering::Relaxed);
        debug!("User {} started", self.id);

        let mut issued = 0;
        let mut state = UserState::Idle;
        loop {
            state = match state {
                UserState::Idle => match self.schedule.admit() {
                    Some(slot) => UserState::Requesting(slot),
                    None => UserState::Stopped,
                },
                UserState::Requesting(slot) => {
                    let outcome = self.request(&slot).await;
                    let finished = Instant::now();
                    self.aggregator.append(outcome).await;
                    issued += 1;

                    if self.schedule.is_exhausted() {
                        UserState::Stopped
                    } else {
                        UserState::Sleeping(self.schedule.pause_after(&slot, finished))
                    }
                }
                UserState::Sleeping(pause) => {
                    self.schedule.idle(pause).await;
                    UserState::Idle
                }
                UserState::Stopped => break,
            };
        }

        self.aggregator.active_users.fetch_sub(1, Ordering::Relaxed);
        debug!("User {} stopped after {} requests", self.id, issued);
        issued
    }

    async fn request(&mut self, slot: &Slot) -> RequestOutcome {
        let timestamp = SystemTime::now();

        let result = tokio::select! {
            result = fetch(&self.client, self.target.url()) => result,
            _ = grace_expired(&mut self.stop, self.graceful_stop) => {
                OutcomeResult::Error(ErrorKind::Cancelled)
            }
        };
        let duration = slot.started.elapsed();

        match result {
            OutcomeResult::Status(code) => trace!(
                "User {} request {} -> {} in {:?}",
                self.id,
                slot.iteration,
                code,
                duration
            ),
            OutcomeResult::Error(kind) => debug!(
                "User {} request {} to {} failed: {:?} after {:?}",
                self.id,
                slot.iteration,
                self.target,
                kind,
                duration
            ),
        }

        RequestOutcome {
            user: self.id,
            timestamp,
            duration,
            result,
        }
    }
}

fn build_client(request_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .http1_only()
        .timeout(request_timeout)
        .user_agent(concat!("http-loadgen/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Builds one client per user on the blocking pool; TLS setup is synchronous
/// and slow enough to stall the runtime with many users.
async fn build_clients(count: usize, request_timeout: Duration) -> Result<Vec<reqwest::Client>> {
    let builds = (0..count)
        .map(|_| tokio::task::spawn_blocking(move || build_client(request_timeout)));

    join_all(builds)
        .await
        .into_iter()
        .map(|joined| joined.context("HTTP client build task failed")?)
        .collect()
}

async fn fetch(client: &reqwest::Client, url: &Url) -> OutcomeResult {
    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(e) => return OutcomeResult::Error(classify_error(&e)),
    };

    let status = response.status().as_u16();
    match response.bytes().await {
        Ok(_) => OutcomeResult::Status(status),
        Err(e) => OutcomeResult::Error(classify_error(&e)),
    }
}

async fn grace_expired(stop: &mut watch::Receiver<bool>, graceful_stop: Duration) {
    stopped(stop).await;
    sleep(graceful_stop).await;
}

fn classify_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        return ErrorKind::Timeout;
    }
    if err.is_connect() {
        let mut source: Option<&dyn std::error::Error> = Some(err);
        while let Some(e) = source {
            let message = e.to_string().to_ascii_lowercase();
            if message.contains("dns error") || message.contains("failed to lookup address") {
                return ErrorKind::Dns;
            }
            source = e.source();
        }
        return ErrorKind::Connect;
    }
    ErrorKind::Transport
}

// =============================================================================
// Run Orchestration
// =============================================================================

/// Spawns every virtual user and waits for them. Stops the run when the
/// duration elapses or the first interrupt arrives; a second interrupt stops
/// waiting for in-flight requests. Returns the wall-clock run time, which
/// starts once every user is built.
async fn run_load_test(
    target: Arc<Target>,
    config: Arc<RunConfig>,
    aggregator: Aggregator,
    mut interrupts: mpsc::Receiver<()>,
) -> Result<Duration> {
    info!("Preparing {} virtual users", config.virtual_users);
    let clients = build_clients(config.virtual_users, config.request_timeout).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = Scheduler::new(Arc::clone(&config), stop_rx.clone());
    let run_started = Instant::now();

    info!("Starting load test against {}", target);
    if !config.ramp_up.is_zero() {
        info!(
            "Ramping to {} users over {:?}",
            config.virtual_users, config.ramp_up
        );
    }

    let mut tasks = Vec::with_capacity(config.virtual_users);
    for (id, client) in clients.into_iter().enumerate() {
        let user = VirtualUser::new(
            id,
            Arc::clone(&target),
            client,
            &config,
            scheduler.user(id),
            aggregator.clone(),
            stop_rx.clone(),
        );
        tasks.push(tokio::spawn(user.run()));
    }

    let progress = tokio::spawn(report_progress(aggregator.clone(), PROGRESS_INTERVAL));
    let workers = join_all(tasks);
    tokio::pin!(workers);

    let finished = tokio::select! {
        results = &mut workers => Some(results),
        _ = interrupted(&mut interrupts) => {
            info!("Interrupt received, stopping virtual users (interrupt again to stop waiting)");
            None
        }
        _ = wait_until(scheduler.deadline()) => {
            info!("Run duration elapsed, stopping virtual users");
            None
        }
    };

    let results = match finished {
        Some(results) => results,
        None => {
            stop_tx.send_replace(true);
            let bound = config.graceful_stop + STOP_MARGIN;
            tokio::select! {
                waited = timeout(bound, &mut workers) => match waited {
                    Ok(results) => results,
                    Err(_) => {
                        warn!(
                            "{} users still running {:?} after stop, reporting without them",
                            aggregator.active_users(),
                            bound
                        );
                        Vec::new()
                    }
                },
                _ = interrupted(&mut interrupts) => {
                    warn!(
                        "Second interrupt, reporting without waiting for {} users",
                        aggregator.active_users()
                    );
                    Vec::new()
                }
            }
        }
    };
    progress.abort();

    let joined = results.len();
    let mut issued = 0;
    for result in results {
        match result {
            Ok(count) => issued += count,
            Err(e) => error!("Virtual user task failed: {}", e),
        }
    }
    debug!("{} user tasks joined, {} requests issued by them", joined, issued);

    let elapsed = run_started.elapsed();
    let recorded = aggregator.snapshot().await.count;
    info!("All users stopped: {} requests in {:?}", recorded, elapsed);
    Ok(elapsed)
}

/// Resolves on the next interrupt. Never resolves once the sender is gone.
async fn interrupted(interrupts: &mut mpsc::Receiver<()>) {
    if interrupts.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

async fn report_progress(aggregator: Aggregator, every: Duration) {
    let mut ticker = interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let summary = aggregator.snapshot().await;
        info!(
            "Progress: active_users={}, requests={}, errors={}",
            aggregator.active_users(),
            summary.count,
            summary.error_count
        );
    }
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Serialize)]
struct LatencyReport {
    min: f64,
    mean: f64,
    p50: f64,
    p90: f64,
    p95: f64,
    p99: f64,
    max: f64,
}

#[derive(Debug, Serialize)]
struct PerUserReport {
    users: usize,
    min: u64,
    max: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    target: String,
    virtual_users: usize,
    elapsed_secs: f64,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    error_rate: f64,
    throughput_rps: f64,
    outcomes: BTreeMap<&'static str, u64>,
    status_codes: BTreeMap<String, u64>,
    latency_ms: Option<LatencyReport>,
    requests_per_user: Option<PerUserReport>,
    first_request_unix_ms: Option<u64>,
    last_request_unix_ms: Option<u64>,
}

fn to_ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

fn unix_ms(at: SystemTime) -> Option<u64> {
    at.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}

impl Report {
    fn new(target: &Target, config: &RunConfig, summary: &Summary, elapsed: Duration) -> Self {
        let hist = &summary.latency;
        let latency_ms = (hist.len() > 0).then(|| LatencyReport {
            min: to_ms(hist.min()),
            mean: hist.mean() / 1000.0,
            p50: to_ms(hist.value_at_quantile(0.50)),
            p90: to_ms(hist.value_at_quantile(0.90)),
            p95: to_ms(hist.value_at_quantile(0.95)),
            p99: to_ms(hist.value_at_quantile(0.99)),
            max: to_ms(hist.max()),
        });

        let requests_per_user = match (
            summary.by_user.values().min(),
            summary.by_user.values().max(),
        ) {
            (Some(&min), Some(&max)) => Some(PerUserReport {
                users: summary.by_user.len(),
                min,
                max,
            }),
            _ => None,
        };

        let elapsed_secs = elapsed.as_secs_f64();
        let throughput_rps = if elapsed_secs > 0.0 {
            summary.count as f64 / elapsed_secs
        } else {
            0.0
        };

        Self {
            target: target.to_string(),
            virtual_users: config.virtual_users,
            elapsed_secs,
            total_requests: summary.count,
            successful_requests: summary.count - summary.error_count,
            failed_requests: summary.error_count,
            error_rate: summary.error_rate(),
            throughput_rps,
            outcomes: summary
                .by_class
                .iter()
                .map(|(class, count)| (class.as_str(), *count))
                .collect(),
            status_codes: summary
                .by_status
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
            latency_ms,
            requests_per_user,
            first_request_unix_ms: summary.first_at.and_then(unix_ms),
            last_request_unix_ms: summary.last_at.and_then(unix_ms),
        }
    }

    /// A run passes when at least one request completed and the error rate
    /// stays below `max_error_rate`.
    fn passed(&self, max_error_rate: f64) -> bool {
        if self.total_requests == 0 {
            return false;
        }
        self.failed_requests == 0 || self.error_rate < max_error_rate
    }

    fn render_text(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "╔════════════════════════════════════════════════════════════╗")?;
        writeln!(out, "║                    LOAD TEST SUMMARY                       ║")?;
        writeln!(out, "╚════════════════════════════════════════════════════════════╝")?;
        writeln!(out)?;
        writeln!(out, "Target:              {}", self.target)?;
        writeln!(out, "Virtual Users:       {}", self.virtual_users)?;
        writeln!(out, "Elapsed:             {:.2}s", self.elapsed_secs)?;
        writeln!(out)?;
        writeln!(out, "Request Metrics:")?;
        writeln!(out, "  Total Requests:    {}", self.total_requests)?;
        writeln!(out, "  Successful:        {}", self.successful_requests)?;
        writeln!(out, "  Failed:            {}", self.failed_requests)?;
        writeln!(out, "  Error Rate:        {:.2}%", self.error_rate * 100.0)?;
        writeln!(out, "  Throughput:        {:.2} req/s", self.throughput_rps)?;

        if !self.outcomes.is_empty() {
            writeln!(out)?;
            writeln!(out, "Outcomes:")?;
            for (class, count) in &self.outcomes {
                writeln!(out, "  {:<18} {}", format!("{}:", class), count)?;
            }
        }

        if !self.status_codes.is_empty() {
            writeln!(out)?;
            writeln!(out, "Status Codes:")?;
            for (code, count) in &self.status_codes {
                writeln!(out, "  {:<18} {}", format!("{}:", code), count)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "Latency (ms):")?;
        match &self.latency_ms {
            Some(lat) => {
                writeln!(out, "  Min:    {:.2}", lat.min)?;
                writeln!(out, "  Mean:   {:.2}", lat.mean)?;
                writeln!(out, "  p50:    {:.2}", lat.p50)?;
                writeln!(out, "  p90:    {:.2}", lat.p90)?;
                writeln!(out, "  p95:    {:.2}", lat.p95)?;
                writeln!(out, "  p99:    {:.2}", lat.p99)?;
                writeln!(out, "  Max:    {:.2}", lat.max)?;
            }
            None => writeln!(out, "  No data")?,
        }

        if let Some(per_user) = &self.requests_per_user {
            writeln!(out)?;
            writeln!(
                out,
                "Requests per User:   min={} max={} ({} users)",
                per_user.min, per_user.max, per_user.users
            )?;
        }

        writeln!(out)?;
        writeln!(out, "═══════════════════════════════════════════════════════════")
    }
}

/// Writes the JSON report to `path`, retrying a few times. Failure is only
/// logged. Returns whether the file was written.
async fn export_summary(path: &Path, report: &Report) -> bool {
    let json = match sonic_rs::to_string_pretty(report) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize summary for export: {}", e);
            return false;
        }
    };

    for attempt in 1..=EXPORT_ATTEMPTS {
        match tokio::fs::write(path, &json).await {
            Ok(()) => {
                info!("Summary exported to {:?}", path);
                return true;
            }
            Err(e) if attempt < EXPORT_ATTEMPTS => {
                debug!(
                    "Summary export attempt {} to {:?} failed: {}, retrying",
                    attempt, path, e
                );
                sleep(EXPORT_BACKOFF * attempt).await;
            }
            Err(e) => {
                warn!(
                    "Failed to export summary to {:?} after {} attempts: {}",
                    path, EXPORT_ATTEMPTS, e
                );
            }
        }
    }
    false
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries only the summary
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let (target, run_config) = match config.validate() {
        Ok(validated) => validated,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Ok(ExitCode::from(2));
        }
    };

    info!("════════════════════════════════════════════════════════════");
    info!("                 HTTP LOAD GENERATOR");
    info!("════════════════════════════════════════════════════════════");
    info!("Target: GET {}", target);
    info!("Virtual Users: {}", run_config.virtual_users);
    match (run_config.duration, run_config.iterations) {
        (Some(d), Some(n)) => info!("Limit: {:?} or {} iterations per user", d, n),
        (Some(d), None) => info!("Limit: {:?}", d),
        (None, Some(n)) => info!("Limit: {} iterations per user", n),
        (None, None) => info!("Limit: none, running until interrupted"),
    }
    info!("Delay: {:?} ({:?})", run_config.delay, run_config.pacing);
    info!("Request Timeout: {:?}", run_config.request_timeout);
    info!("════════════════════════════════════════════════════════════");

    let target = Arc::new(target);
    let run_config = Arc::new(run_config);
    let aggregator = Aggregator::new()?;

    let (interrupt_tx, interrupts) = mpsc::channel(2);
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for interrupt: {}", e);
                break;
            }
            if interrupt_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let elapsed = run_load_test(
        Arc::clone(&target),
        Arc::clone(&run_config),
        aggregator.clone(),
        interrupts,
    )
    .await?;

    let summary = aggregator.snapshot().await;
    let report = Report::new(&target, &run_config, &summary, elapsed);

    match config.output {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!(
            "{}",
            sonic_rs::to_string_pretty(&report).context("Failed to serialize summary")?
        ),
    }

    if let Some(path) = &config.summary_export {
        export_summary(path, &report).await;
    }

    if report.passed(config.max_error_rate) {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!(
            "Run failed: {} of {} requests failed (threshold {:.2}%)",
            report.failed_requests,
            report.total_requests,
            config.max_error_rate * 100.0
        );
        Ok(ExitCode::FAILURE)
    }
}
