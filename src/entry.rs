use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use fleetbench::agent::Agent;
use fleetbench::args::{Command, FleetArgs};
use fleetbench::config::{FleetConfig, load_config};
use fleetbench::coordinator::{Coordinator, PhaseOutcome, TestRunReport};
use fleetbench::error::{AppError, AppResult, CoordinationError};
use fleetbench::worker::{IdleWorkload, Worker};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

pub(crate) fn run() -> AppResult<()> {
    let args = FleetArgs::parse();
    fleetbench::logger::init_logging(args.verbose);

    let mut config = load_config(args.config.as_deref())?;
    args.command.apply_overrides(&mut config);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_async(&args.command, &config))
}

async fn run_async(command: &Command, config: &FleetConfig) -> AppResult<()> {
    match command {
        Command::Coordinator(_) => run_coordinator(config).await,
        Command::Agent(_) => run_agent(config).await,
        Command::Worker(_) => run_worker(config).await,
    }
}

async fn run_coordinator(config: &FleetConfig) -> AppResult<()> {
    let section = &config.coordinator;
    let coordinator = Coordinator::new(section.options(&config.broker));
    coordinator.listen(&section.listen).await?;
    let plans = section.plans()?;
    if plans.is_empty() {
        info!("No test plans configured; serving until interrupted");
        tokio::signal::ctrl_c().await?;
        coordinator.shutdown();
        return Ok(());
    }

    coordinator
        .wait_for_agents(section.min_agents, section.agent_wait_timeout())
        .await?;
    let mut failed_tests: Vec<String> = Vec::new();
    let mut failure_count = 0_usize;
    for plan in &plans {
        let report = coordinator.run_test(plan).await?;
        print_report(&report);
        if !report.is_success() {
            failed_tests.push(report.test_id.to_string());
            failure_count = failure_count.saturating_add(report.failures.len());
        }
    }
    let response = coordinator.terminate_workers("all tests finished").await;
    info!("Terminated workers: {}", response);
    coordinator.shutdown();

    if failed_tests.is_empty() {
        return Ok(());
    }
    error!("Failed tests: {}", failed_tests.join(", "));
    Err(AppError::coordination(CoordinationError::RunFailed {
        test_id: failed_tests.join(", "),
        failures: failure_count,
    }))
}

async fn run_agent(config: &FleetConfig) -> AppResult<()> {
    let section = &config.agent;
    let agent = Agent::new(section.index, config.broker.options())?;
    agent.listen(&section.listen).await?;
    if section.min_workers > 0 {
        agent
            .wait_for_workers(section.min_workers, section.worker_wait_timeout())
            .await?;
    }
    connect_with_retry(&section.coordinator, || agent.connect(&section.coordinator)).await?;
    tokio::select! {
        () = agent.run() => {}
        interrupted = tokio::signal::ctrl_c() => {
            if let Err(err) = interrupted {
                warn!("Signal handler failed: {}", err);
            }
            agent.shutdown();
        }
    }
    Ok(())
}

async fn run_worker(config: &FleetConfig) -> AppResult<()> {
    let section = &config.worker;
    let workload = Arc::new(IdleWorkload::new(section.run_duration()));
    let worker = Worker::new(section.options(&config.broker), workload)?;
    connect_with_retry(&section.agent, || worker.connect(&section.agent)).await?;
    tokio::select! {
        () = worker.run() => {}
        interrupted = tokio::signal::ctrl_c() => {
            if let Err(err) = interrupted {
                warn!("Signal handler failed: {}", err);
            }
            worker.shutdown();
        }
    }
    Ok(())
}

/// Retries `connect` while the parent process is still starting up.
async fn connect_with_retry<F, Fut>(target: &str, mut connect: F) -> AppResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let mut attempt = 1_u32;
    loop {
        match connect().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < CONNECT_ATTEMPTS => {
                warn!("Connecting to {} failed (attempt {}): {}", target, attempt, err);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn print_report(report: &TestRunReport) {
    println!("Test {}", report.test_id);
    for result in &report.phases {
        let marker = match result.outcome {
            PhaseOutcome::Complete => "ok",
            PhaseOutcome::Proceeded => "timed out, proceeded",
            PhaseOutcome::TimedOut => "timed out",
            PhaseOutcome::Aborted => "aborted",
        };
        println!(
            "  {:<20} {} ({}/{} done, {} forced)",
            result.phase.as_str(),
            marker,
            result.progress.completed.len(),
            result.progress.expected.len(),
            result.progress.forced.len()
        );
    }
    let throughput = &report.throughput;
    println!(
        "  operations: {}  throughput: {}.{:02} ops/s  sources: {}",
        throughput.operation_count,
        throughput.throughput_x100.checked_div(100).unwrap_or(0),
        throughput.throughput_x100.checked_rem(100).unwrap_or(0),
        throughput.sources
    );
    for probe in &report.probes {
        println!(
            "  probe {:<12} count {} p50 {}us p90 {}us p99 {}us max {}us",
            probe.probe, probe.count, probe.p50, probe.p90, probe.p99, probe.max
        );
    }
    for record in &report.failures {
        println!(
            "  failure {} from {} (x{}): {}",
            record.failure.failure_type,
            record.failure.worker_address,
            record.occurrences,
            record.failure.message
        );
    }
    println!(
        "  result: {}",
        if report.is_success() { "PASSED" } else { "FAILED" }
    );
}
