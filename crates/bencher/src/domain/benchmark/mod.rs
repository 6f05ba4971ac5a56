//! Benchmark dispatch over a prepared fleet.
//!
//! Exactly one [`BenchmarkSpec`] variant runs per dispatcher. The dispatcher
//! moves `Idle -> Running -> Completed | Failed` and reports one start event
//! and one terminal event through its [`EventSink`].

mod gap;
mod manual;
mod redis;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;
use tracing::error;
use tracing::info;

pub use self::gap::parse_gap_log;
use crate::config::BenchCommand;
use crate::config::HostLayout;
use crate::config::YcsbWorkload;
use crate::domain::fleet::Fleet;
use crate::domain::traits::GuestShell;
use crate::domain::traits::HostShell;
use crate::domain::traits::VmInstance;
use crate::error::BenchmarkError;

/// The benchmark selected for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BenchmarkSpec {
    /// Run a shell command on every VM.
    Manual {
        command: String,
        wait: bool,
        /// Keep the fleet until every hypervisor exits on its own
        hold: bool,
    },
    /// redis in every guest driven by go-ycsb clients on the host.
    KeyValue { workload: YcsbWorkload },
    /// gapbs betweenness centrality.
    Graph { trials: u32, iterations: u32 },
}

impl BenchmarkSpec {
    pub fn name(&self) -> &'static str {
        match self {
            BenchmarkSpec::Manual { .. } => "manual",
            BenchmarkSpec::KeyValue { .. } => "redis",
            BenchmarkSpec::Graph { .. } => "gap_bc",
        }
    }
}

impl From<&BenchCommand> for BenchmarkSpec {
    fn from(command: &BenchCommand) -> Self {
        match command {
            BenchCommand::Manual(args) => BenchmarkSpec::Manual {
                command: args.cmd.clone(),
                wait: args.wait,
                hold: args.hold,
            },
            BenchCommand::Redis(args) => BenchmarkSpec::KeyValue {
                workload: args.workload,
            },
            BenchCommand::Gap(args) => BenchmarkSpec::Graph {
                trials: args.ntrials,
                iterations: args.niters,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BenchmarkEvent {
    Started {
        benchmark: &'static str,
        at: DateTime<Utc>,
    },
    Finished {
        benchmark: &'static str,
        at: DateTime<Utc>,
        elapsed_secs: f64,
    },
    Failed {
        benchmark: &'static str,
        at: DateTime<Utc>,
        elapsed_secs: f64,
    },
}

/// Receives benchmark lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BenchmarkEvent);
}

/// Emits benchmark events as tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: BenchmarkEvent) {
        match event {
            BenchmarkEvent::Started { benchmark, at } => {
                info!(benchmark, %at, "benchmark started");
            }
            BenchmarkEvent::Finished {
                benchmark,
                at,
                elapsed_secs,
            } => {
                info!(benchmark, %at, elapsed_secs, "benchmark finished");
            }
            BenchmarkEvent::Failed {
                benchmark,
                at,
                elapsed_secs,
            } => {
                error!(benchmark, %at, elapsed_secs, "benchmark failed");
            }
        }
    }
}

/// Delays of the key-value preload handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadTiming {
    /// redis needs at least this long to load the dump, polling starts after it
    pub grace: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for PreloadTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Everything a benchmark variant needs besides its own parameters.
pub struct BenchmarkContext<'a, I> {
    pub fleet: &'a Fleet<I>,
    pub guest: &'a dyn GuestShell,
    pub host: &'a dyn HostShell,
    pub layout: &'a HostLayout,
    /// Artifacts of VM `i` go to `<run_dir>/vm<i>`
    pub run_dir: &'a Path,
    /// Threads per load generator
    pub ncpus: usize,
    /// `perf record` event for the key-value server, `None` disables perf
    pub perf_event: Option<&'a str>,
    /// Host CPUs reserved for load generators
    pub client_cpus: &'a [u32],
    /// Host node load generators allocate from
    pub client_membind: u32,
    pub preload: PreloadTiming,
}

impl<I> BenchmarkContext<'_, I> {
    pub fn vm_artifact_dir(&self, ordinal: usize) -> PathBuf {
        self.run_dir.join(format!("vm{ordinal}"))
    }

    /// Writes `contents` to `<run_dir>/vm<ordinal>/<name>`.
    pub async fn save_artifact(
        &self,
        ordinal: usize,
        name: &str,
        contents: &str,
    ) -> Result<(), Report<BenchmarkError>> {
        let dir = self.vm_artifact_dir(ordinal);
        let path = dir.join(name);
        let write = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, contents).await
        };
        write.await.change_context(BenchmarkError::Artifact {
            path: path.display().to_string(),
        })
    }
}

/// Variant specific outcome recorded in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BenchmarkDetail {
    Manual {
        /// Per-VM exit codes, absent when the command was not awaited
        exit_codes: Option<Vec<i32>>,
    },
    KeyValue {
        workload: &'static str,
    },
    Graph {
        /// Trial times in seconds, one list per VM
        trial_times: Vec<Vec<f64>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub benchmark: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub detail: BenchmarkDetail,
}

pub struct Dispatcher<S> {
    state: DispatchState,
    sink: S,
}

impl<S: EventSink> Dispatcher<S> {
    pub fn new(sink: S) -> Self {
        Self {
            state: DispatchState::Idle,
            sink,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs `spec` to completion against the fleet in `ctx`.
    ///
    /// A dispatcher runs a single benchmark; calling this on a dispatcher
    /// that has left `Idle` fails without running anything.
    pub async fn dispatch<I: VmInstance>(
        &mut self,
        spec: &BenchmarkSpec,
        ctx: &BenchmarkContext<'_, I>,
    ) -> Result<BenchmarkReport, Report<BenchmarkError>> {
        let benchmark = spec.name();
        if self.state != DispatchState::Idle {
            return Err(Report::new(BenchmarkError::BenchmarkFailure { benchmark })
                .attach_printable(format!("dispatcher is {:?}, not Idle", self.state)));
        }

        self.state = DispatchState::Running;
        let started_at = Utc::now();
        let clock = Instant::now();
        self.sink.emit(BenchmarkEvent::Started {
            benchmark,
            at: started_at,
        });

        let outcome = match spec {
            BenchmarkSpec::Manual {
                command,
                wait,
                hold,
            } => manual::run(ctx, command, *wait, *hold).await,
            BenchmarkSpec::KeyValue { workload } => redis::run(ctx, *workload).await,
            BenchmarkSpec::Graph { trials, iterations } => {
                gap::run(ctx, *trials, *iterations).await
            }
        };

        let finished_at = Utc::now();
        let elapsed_secs = clock.elapsed().as_secs_f64();
        match outcome {
            Ok(detail) => {
                self.state = DispatchState::Completed;
                self.sink.emit(BenchmarkEvent::Finished {
                    benchmark,
                    at: finished_at,
                    elapsed_secs,
                });
                Ok(BenchmarkReport {
                    benchmark,
                    started_at,
                    finished_at,
                    elapsed_secs,
                    detail,
                })
            }
            Err(report) => {
                self.state = DispatchState::Failed;
                self.sink.emit(BenchmarkEvent::Failed {
                    benchmark,
                    at: finished_at,
                    elapsed_secs,
                });
                Err(report.change_context(BenchmarkError::BenchmarkFailure { benchmark }))
            }
        }
    }
}
