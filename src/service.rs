//! The assembled service: one of everything, dispatcher on the caller's thread

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use crate::config::{ServerConfig, SinkKind};
use crate::core::{Admission, LocalAdmission, MmapJournal};
use crate::error::ServerError;
use crate::logging::{FileSink, LogPipeline, LogSink, Logger};
use crate::network::{DispatchError, Dispatcher};
use crate::shutdown::{Shutdown, ShutdownReport, StopReason, Teardown};
use crate::stats::{LoadMonitor, ServiceStats};
use crate::worker::{ProcessSpawner, Spawner, ThreadSpawner, WorkerContext, WorkerMode};

pub struct Service {
    config: ServerConfig,
    local_addr: SocketAddr,
    admission: Arc<dyn Admission>,
    pipeline: Option<LogPipeline>,
    logger: Logger,
    dispatcher: Dispatcher,
    shutdown: Shutdown,
    stats: Arc<ServiceStats>,
}

impl Service {
    /// Open the log sink, bind the listener and create the admission
    /// controller. Nothing is accepted until [`run`](Self::run).
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let stats = Arc::new(ServiceStats::new());

        let sink = open_sink(&config)?;
        let pipeline = match &sink {
            Some(sink) => Some(LogPipeline::start_with_fatal_hook(
                Arc::clone(sink),
                config.log.capacity,
                {
                    let shutdown = shutdown.clone();
                    move |err| {
                        shutdown.trigger(StopReason::Fatal(chain(err)));
                    }
                },
            )?),
            None => None,
        };
        let logger = pipeline
            .as_ref()
            .map_or_else(Logger::disabled, LogPipeline::logger);

        let listener = TcpListener::bind(config.bind_addr).map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;

        let admission = create_admission(&config)?;

        let assembled = (|| -> Result<_, ServerError> {
            let spawner = create_spawner(&config, &admission)?;
            let ctx = WorkerContext {
                session: Arc::new(config.session.clone()),
                logger: logger.clone(),
                stats: Arc::clone(&stats),
            };
            Dispatcher::new(
                listener,
                Arc::clone(&admission),
                spawner,
                ctx,
                shutdown.token(),
                config.tick,
            )
            .map_err(|e| ServerError::Dispatch(DispatchError::Poll(e)))
        })();

        let (dispatcher, waker) = match assembled {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(destroy_err) = admission.destroy() {
                    tracing::warn!(error = %destroy_err, "cannot destroy admission resource");
                }
                return Err(err);
            }
        };
        shutdown.register_waker(waker);

        tracing::info!(
            addr = %local_addr,
            mode = %config.mode,
            max_workers = config.max_workers,
            sink = ?config.log.sink,
            "service bound"
        );

        Ok(Self {
            config,
            local_addr,
            admission,
            pipeline,
            logger,
            dispatcher,
            shutdown,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for requesting a stop from another thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<ServiceStats> {
        Arc::clone(&self.stats)
    }

    /// Dispatch until a stop is requested, then tear everything down.
    pub fn run(mut self) -> ShutdownReport {
        let monitor = self.config.monitor_interval.and_then(|interval| {
            LoadMonitor::spawn(
                Arc::clone(&self.admission),
                Arc::clone(&self.stats),
                self.shutdown.token(),
                interval,
            )
            .map_err(|err| tracing::warn!(error = %err, "load monitor not started"))
            .ok()
        });

        if let Err(err) = self.logger.log(format!("Server listening on {}", self.local_addr)) {
            tracing::warn!(error = %err, "startup record dropped");
        }

        if let Err(err) = self.dispatcher.run() {
            tracing::error!(error = %err, "dispatcher failed");
            self.shutdown.trigger(StopReason::Fatal(chain(&err)));
        }

        let report = self.teardown();
        if let Some(monitor) = monitor {
            monitor.join();
        }
        report
    }

    fn teardown(&mut self) -> ShutdownReport {
        self.shutdown.teardown(Teardown {
            admission: self.admission.as_ref(),
            workers: self.dispatcher.registry_mut(),
            pipeline: self.pipeline.as_ref(),
            logger: &self.logger,
            grace: self.config.grace,
        })
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if self.shutdown.report().is_none() {
            self.teardown();
        }
    }
}

fn open_sink(config: &ServerConfig) -> Result<Option<Arc<dyn LogSink>>, ServerError> {
    let path = &config.log.path;
    let sink_error = |source: std::io::Error| ServerError::Sink {
        path: path.display().to_string(),
        source,
    };

    let sink: Arc<dyn LogSink> = match config.log.sink {
        SinkKind::File => Arc::new(FileSink::open(path).map_err(sink_error)?),
        SinkKind::Journal => {
            Arc::new(MmapJournal::open(path, config.log.journal_size).map_err(sink_error)?)
        }
        SinkKind::None => return Ok(None),
    };
    Ok(Some(sink))
}

fn create_admission(config: &ServerConfig) -> Result<Arc<dyn Admission>, ServerError> {
    match config.mode {
        WorkerMode::Thread => Ok(Arc::new(LocalAdmission::new(config.max_workers)?)),
        #[cfg(target_os = "linux")]
        WorkerMode::Process => Ok(Arc::new(crate::core::NamedAdmission::create(
            &config.semaphore_name,
            config.max_workers,
        )?)),
        #[cfg(not(target_os = "linux"))]
        WorkerMode::Process => Err(crate::config::ConfigError::ProcessModeUnsupported.into()),
    }
}

fn create_spawner(
    config: &ServerConfig,
    admission: &Arc<dyn Admission>,
) -> Result<Box<dyn Spawner>, ServerError> {
    match config.mode {
        WorkerMode::Thread => Ok(Box::new(ThreadSpawner::new())),
        WorkerMode::Process => Ok(Box::new(ProcessSpawner::new(admission)?)),
    }
}

/// `err` followed by its sources, `: `-separated.
fn chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
