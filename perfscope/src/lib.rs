//! # perfscope - Runtime Method Instrumentation Engine
//!
//! perfscope attaches interceptors to methods of a running program, measures
//! per-call latency and call counts without recompiling anything, and exposes
//! the resulting time series and statistics for live inspection. Every code
//! modification it makes can be undone exactly.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Host Program                             │
//! │          (method table, interpreter, native bodies)             │
//! └───────────────┬───────────────────────────────▲─────────────────┘
//!                 │ every call runs the           │ bodies swapped
//!                 │ method's hook chain           │ copy-and-swap
//!                 ▼                               │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    perfscope (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Patching   │──▶│  Profiling   │──▶│   Analysis   │         │
//! │  │ (lifecycle)  │   │  (registry)  │   │   (stats)    │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │         │                   │                  │                │
//! │         ▼                   ▼                  ▼                │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Rewrite    │   │   Sampler    │   │   Workers    │         │
//! │  │ (call sites) │   │  (refresh)   │   │ (background) │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │                             │                                   │
//! │                             ▼                                   │
//! │                     ┌──────────────┐                            │
//! │                     │    Export    │                            │
//! │                     │ (csv, json)  │                            │
//! │                     └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Modules
//!
//! - [`patching`]: Interceptor chains, patch specs, profile modes and the
//!   patch lifecycle state machine
//!   - `interceptor`: entry/exit hooks ordered by priority
//!   - `lifecycle`: Uninitialised → Patching → Open → UnpatchingQueued →
//!     Unpatching, with teardown on a background worker
//!
//! - [`profiling`]: The measured path
//!   - `profiler`: nesting-aware start/stop into a fixed-capacity history
//!   - `registry`: one profiler per key, ranked log snapshots
//!   - `sampler`: periodic log refresh thread
//!
//! - [`analysis`]: Means, totals and spike detection over a key's history,
//!   computed single-flight on the worker pool
//!
//! - [`rewrite`]: Wraps the call sites inside a method body with timing and
//!   restores the original instructions verbatim
//!
//! ### Supporting Modules
//!
//! - [`host`]: The in-process program being instrumented
//! - [`engine`]: The context that owns all of the above
//! - [`workers`]: Background worker pool with completion handles
//! - [`export`]: History CSV and JSON session report
//! - [`config`]: Engine configuration
//! - [`cli`]: Command-line arguments of the demo binary
//! - [`domain`]: Core domain types and errors
//!
//! ## Measurement Model
//!
//! A measuring interceptor opens a measurement on entry and closes it on
//! exit. Measurements on one key nest: only the outermost stop commits a
//! sample, so recursion never double-counts. A sample is the outer elapsed
//! time plus the number of starts inside it.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Profile the built-in simulation until Ctrl+C
//! perfscope --mode Pawns
//!
//! # Five seconds, then export the history and a report
//! perfscope --mode Frame --duration 5 --export hist.csv --json report.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Patch target**: `Declaring.Member` name of an interceptable method
//! - **Measurement key**: Name samples are filed under, usually the target
//! - **Profile mode**: Named set of patch specs switched as a unit
//! - **Kill switch**: Interceptor that skips the original body while a flag is set

pub mod analysis;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod export;
pub mod host;
pub mod patching;
pub mod profiling;
pub mod rewrite;
pub mod workers;

pub use engine::Engine;
