extern crate tokio;

use clap::Parser;
use crossbeam::channel::Receiver;
use env_logger::Env;
use log::{debug, info, warn};
use miette::{IntoDiagnostic, Result};
use mmwave::pipeline::Pipeline;
use mmwave::sensor::open_replay;
use mmwave::{Cli, ClusteredObject, RadarError, VERSION};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::interval;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

const INPUT_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let log_level = args.verbose.log_level_filter();
    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    info!("mmwave-scan {} loglevel {}", VERSION, log_level);

    let settings = args.pipeline_settings().into_diagnostic()?;
    let shutdown_timeout = settings.drain_timeout() + Duration::from_millis(1000);
    let side = settings.vehicle_side;

    let pipeline = Arc::new(Pipeline::new());
    pipeline.configure(settings).into_diagnostic()?;
    if let Some(path) = &args.replay {
        pipeline
            .set_source(open_replay(path.clone()).into_diagnostic()?)
            .into_diagnostic()?;
    }
    let clusters = pipeline.subscribe().into_diagnostic()?;
    pipeline.start().into_diagnostic()?;
    info!("Clustering targets on the {} side", side);

    let scanner = Scanner { pipeline, clusters };

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("Scanner", |a| scanner.run(a)));
    })
    .catch_signals()
    .handle_shutdown_requests(shutdown_timeout)
    .await
    .map_err(Into::into)
}

struct Scanner {
    pipeline: Arc<Pipeline>,
    clusters: Receiver<ClusteredObject>,
}

impl Scanner {
    ///
    /// Writes every cluster as a JSON line to stdout until a shutdown is
    /// requested or the sensor input ends, then lets the pipeline finish
    /// what it already received.
    ///
    async fn run(self, subsys: SubsystemHandle) -> Result<(), RadarError> {
        let clusters = self.clusters;
        let mut forwarder = tokio::task::spawn_blocking(move || forward_clusters(clusters));
        let mut poll = interval(INPUT_POLL);

        loop {
            tokio::select! {
                _ = subsys.on_shutdown_requested() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = &mut forwarder => {
                    warn!("Cluster output closed");
                    break;
                }
                _ = poll.tick() => {
                    if !self.pipeline.flags().is_reading() {
                        info!("Sensor input ended");
                        break;
                    }
                }
            }
        }

        let pipeline = self.pipeline.clone();
        let stopped = tokio::task::spawn_blocking(move || match pipeline.stop_and_process() {
            Err(RadarError::Timeout) => {
                warn!("Cannot finish processing in time, aborting");
                pipeline.abort()
            }
            result => result,
        })
        .await
        .map_err(|e| panicked("pipeline stop", e))?;

        self.pipeline.unsubscribe();
        if !forwarder.is_finished() {
            if let Err(e) = forwarder.await {
                warn!("{}", panicked("cluster output", e));
            }
        }
        info!("{}", self.pipeline.statistics());

        subsys.request_shutdown();
        stopped
    }
}

fn forward_clusters(clusters: Receiver<ClusteredObject>) {
    let stdout = std::io::stdout();
    for cluster in clusters.iter() {
        let line = match serde_json::to_string(&cluster) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot encode cluster {}: {}", cluster, e);
                continue;
            }
        };
        let mut out = stdout.lock();
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            return;
        }
    }
    debug!("Cluster channel closed");
}

fn panicked(what: &str, e: JoinError) -> RadarError {
    RadarError::ThreadPanicked(format!("{}: {}", what, e))
}
