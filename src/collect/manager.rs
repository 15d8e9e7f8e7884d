use super::pipeline::{Pipeline, PipelineOptions};
use super::{JobParams, JobResults, LogPattern};
use crate::error::CollectError;
use crate::fs::FileServiceSelector;
use crate::storage::{LocationLookup, PatternLookup};
use crate::utils::config::Config;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum Command {
    /// Start a job; the reply says whether it was accepted
    Start(JobParams, oneshot::Sender<Result<(), CollectError>>),
    Stop,
}

/// Async front of the pipeline. Commands are handled by one background task;
/// each job runs on the blocking pool so stop requests are served while it works.
#[derive(Clone)]
pub struct JobManager {
    pipeline: Arc<Pipeline>,
    patterns: Arc<dyn PatternLookup>,
    results: JobResults,
    command_tx: mpsc::Sender<Command>,
}

impl JobManager {
    /// Must be called from within a Tokio runtime
    pub fn new(
        config: &Config,
        locations: Arc<dyn LocationLookup>,
        patterns: Arc<dyn PatternLookup>,
    ) -> Self {
        let results = JobResults::new(config.max_results);
        let services = Arc::new(FileServiceSelector::with_timeout(config.remote_timeout()));
        let pipeline = Pipeline::new(
            locations,
            patterns.clone(),
            services,
            results.clone(),
            PipelineOptions::from_config(config),
        );
        Self::with_pipeline(pipeline, patterns)
    }

    pub fn with_pipeline(pipeline: Pipeline, patterns: Arc<dyn PatternLookup>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let pipeline = Arc::new(pipeline);
        let results = pipeline.results().clone();

        tokio::spawn(Self::process_commands(command_rx, pipeline.clone()));

        Self {
            pipeline,
            patterns,
            results,
            command_tx,
        }
    }

    async fn process_commands(mut rx: mpsc::Receiver<Command>, pipeline: Arc<Pipeline>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Start(params, reply) => {
                    let results = pipeline.results().clone();
                    if let Err(e) = results.before_job() {
                        warn!("Not starting job: {}", e);
                        let _ = reply.send(Err(e));
                        continue;
                    }
                    let _ = reply.send(Ok(()));
                    info!(
                        "Starting job: pattern '{}', locations [{}]",
                        params.pattern_code, params.locations
                    );

                    let pipeline = pipeline.clone();
                    tokio::spawn(async move {
                        let runner = pipeline.clone();
                        let outcome = tokio::task::spawn_blocking(move || runner.run(&params)).await;

                        let failure = match outcome {
                            Ok(Ok(summary)) => {
                                info!("Job finished: {:?}", summary);
                                None
                            }
                            Ok(Err(e)) => {
                                error!("Job failed: {}", e);
                                Some(e.to_string())
                            }
                            Err(e) => {
                                error!("Job aborted: {}", e);
                                Some(format!("Job aborted: {}", e))
                            }
                        };
                        pipeline.results().after_job(failure);
                    });
                }

                Command::Stop => {
                    info!("Stopping job");
                    pipeline.results().request_stop();
                }
            }
        }
    }

    /// Resolves once the job has entered RUNNING, or with `AlreadyRunning`
    pub async fn start(&self, params: JobParams) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx.send(Command::Start(params, reply_tx)).await?;
        reply_rx.await??;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.command_tx.send(Command::Stop).await?;
        Ok(())
    }

    pub fn results(&self) -> &JobResults {
        &self.results
    }

    pub fn patterns(&self) -> Vec<LogPattern> {
        self.patterns.get_all()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}
