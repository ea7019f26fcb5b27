//! # perfscope - Main Entry Point
//!
//! Runs the built-in simulation on its own thread, patches the selected
//! profile mode into it, and prints the ranked logs once per sampling
//! interval until the duration limit or Ctrl+C. On exit the patches are
//! torn down and the requested exports are written.

// Main function is long on purpose; durations are converted for display
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use perfscope::analysis::LogStatsSnapshot;
use perfscope::cli::Args;
use perfscope::config::EngineConfig;
use perfscope::domain::{ConfigError, LifecycleError, PatchError, PatchTarget};
use perfscope::export::SessionReport;
use perfscope::host::SampleProgram;
use perfscope::profiling::ProfileLog;
use perfscope::Engine;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// Rows printed per refresh
const TOP_LOGS: usize = 8;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let usage = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(cause.downcast_ref::<LifecycleError>(), Some(LifecycleError::UnknownMode(_)))
            || matches!(cause.downcast_ref::<PatchError>(), Some(PatchError::MalformedTarget(_)))
    });
    if usage {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Defaults, then the config file, then CLI flags.
fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(interval) = args.interval {
        config.sampling_interval_ms = interval;
    }
    if let Some(capacity) = args.capacity {
        config.history_capacity = capacity;
    }
    config.validate()?;
    Ok(config)
}

fn print_logs(logs: &[ProfileLog]) {
    println!("{:<28} {:>10} {:>7} {:>8}", "key", "ms", "%", "calls");
    for log in logs.iter().take(TOP_LOGS) {
        println!(
            "{:<28} {:>10.3} {:>6.1}% {:>8}",
            log.label,
            log.last_duration_ms,
            log.percent * 100.0,
            log.calls
        );
    }
}

fn print_stats(stats: &LogStatsSnapshot) {
    println!("\nstatistics: {}", stats.key);
    println!("  entries:            {}", stats.entries);
    println!("  total calls:        {}", stats.total_calls);
    println!("  total time:         {:.3} ms", stats.total_time);
    println!("  highest time:       {:.3} ms", stats.highest_time);
    println!("  highest calls:      {}", stats.highest_calls);
    println!("  mean time / call:   {:.4} ms", stats.mean_time_per_call);
    println!("  mean calls / frame: {:.2}", stats.mean_calls_per_frame);
    println!("  mean time / frame:  {:.4} ms", stats.mean_time_per_frame);
    println!("  outlier cutoff:     {:.4} ms", stats.outlier_cutoff);
    println!("  spikes:             {}", stats.spikes.len());
}

/// Compute statistics for `key` now, waiting for the worker.
fn collect_stats(engine: &Engine, key: &str) -> Option<Arc<LogStatsSnapshot>> {
    if let Some(handle) = engine.stats().request(key) {
        handle.wait();
    }
    engine.stats().snapshot(key)
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let config = load_config(&args)?;
    let interval = Duration::from_millis(config.sampling_interval_ms);

    let sample = Arc::new(SampleProgram::build(args.pawns));
    let kill_music = Arc::new(AtomicBool::new(args.kill));
    let engine = Engine::new(config, Arc::clone(&sample.program)).context("Failed to start engine")?;
    for mode in SampleProgram::modes(&kill_music) {
        engine.register_mode(mode);
    }

    if args.list_modes {
        for mode in engine.modes() {
            println!("{:<12} {:<8} {}", mode.name, mode.mode, mode.tip);
            for target in &mode.targets {
                println!("    {target}");
            }
        }
        return Ok(());
    }

    if !quiet {
        println!("perfscope v{}", env!("CARGO_PKG_VERSION"));
        println!("mode: {}", args.mode);
        println!("pawns: {}", args.pawns);
    }

    // ── Patch the selected mode ─────────────────────────────────────────
    let report = engine.switch_mode(&args.mode)?;
    for (target, reason) in &report.failed {
        eprintln!("warning: {target} not patched: {reason}");
    }
    if !quiet {
        println!("patched: {} targets", report.applied.len() + report.retained.len());
    }

    let rewrite_target = match &args.rewrite {
        Some(raw) => {
            let target: PatchTarget = raw.parse()?;
            match engine.install_internal_rewrite(&target) {
                Ok(summary) => {
                    if !quiet {
                        println!("rewrote {target}: {} call sites ({} skipped)", summary.wrapped, summary.skipped);
                    }
                    Some(target)
                }
                Err(e) => {
                    warn!("Rewrite of {target} failed: {e}");
                    None
                }
            }
        }
        None => None,
    };

    let sampler = engine.spawn_sampler().context("Failed to start sampler")?;

    // ── Workload thread ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let workload = {
        let sample = Arc::clone(&sample);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("perfscope-host".to_string())
            .spawn(move || {
                let mut frames = 0u64;
                while running.load(Ordering::Relaxed) {
                    if let Err(e) = sample.run_frame() {
                        warn!("Frame {frames} failed: {e}");
                        break;
                    }
                    frames += 1;
                }
                frames
            })
            .context("Failed to start workload thread")?
    };

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let profiling_start = Instant::now();
    let duration_limit = if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if profiling_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }
        if workload.is_finished() {
            exit_reason = "workload stopped";
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(interval) => {
                if !quiet {
                    print_logs(&engine.current_logs());
                    println!();
                }
            }
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    let frames = workload.join().unwrap_or_else(|_| {
        warn!("Workload thread panicked");
        0
    });
    let refreshes = sampler.stop();
    let elapsed = profiling_start.elapsed();

    // ── Collect before teardown resets the registry ─────────────────────
    let stats = args.stats.as_deref().and_then(|key| {
        let stats = collect_stats(&engine, key);
        if stats.is_none() {
            eprintln!("warning: no statistics for {key}");
        }
        stats
    });
    let final_logs = engine.refresh_logs();

    if let Some(path) = &args.export {
        let rows = engine.export_history(path).context("Failed to export history")?;
        if !quiet {
            println!("saved: {} ({rows} keys)", path.display());
        }
    }

    if let Some(path) = &args.json {
        let mut report = SessionReport::new(engine.current_mode(), engine.state(), elapsed.as_secs_f64());
        report.logs = final_logs.as_ref().clone();
        report.statistics = stats.iter().map(|s| s.as_ref().clone()).collect();
        report.modes = engine.modes();
        report.key_collisions = engine.registry().collision_count();

        let file = File::create(path).context("Failed to create report file")?;
        report.export(BufWriter::new(file)).context("Failed to write report")?;
        if !quiet {
            println!("saved: {}", path.display());
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────
    if let Some(target) = &rewrite_target {
        if let Err(e) = engine.remove_internal_rewrite(target) {
            warn!("Failed to restore {target}: {e}");
        }
    }
    let outcome = engine.request_unpatch().wait();
    info!("Teardown finished: {outcome:?}");

    if let Some(stats) = &stats {
        print_stats(stats);
    }

    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} frames, {} refreshes, {} pawn ticks, {} music plays",
            exit_reason,
            elapsed.as_secs_f64(),
            frames,
            refreshes,
            sample.pawn_ticks(),
            sample.music_plays(),
        );
    }

    Ok(())
}
