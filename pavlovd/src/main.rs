//! Pavlov daemon: runs conditioning schedules in the background.
//!
//! The daemon owns one [`Stepper`] and, while a run is live, one worker
//! thread driving the orchestrator. Clients send line-delimited JSON requests
//! over TCP to start, pause, resume or stop the run and to read its state.
//!
//! Storage locations (config.json, catalog.json):
//! - Linux: ~/.local/share/pavlov/
//! - Windows: %APPDATA%\pavlov\
//! - MacOS: ~/Library/Application Support/pavlov/

use std::sync::Arc;
use std::time::Duration;

use pavlov::observer::ScheduleSnapshot;
use pavlov::stepper::{Granularity, RunState, Stepper, StepperSnapshot};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{error, info, warn};

mod config;
mod paths;
mod worker;

use config::{load_catalog, load_config, DaemonConfig};
use paths::AppPaths;
use worker::Worker;

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

fn default_grain() -> Granularity {
    Granularity::Trial
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    Start {
        #[serde(default)]
        run: Option<String>,
        #[serde(default = "default_grain")]
        grain: Granularity,
        #[serde(default)]
        steps: u32,
    },
    Pause,
    Resume {
        #[serde(default = "default_grain")]
        grain: Granularity,
        #[serde(default)]
        steps: u32,
    },
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    State(StateSnapshot),
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateSnapshot {
    state: RunState,
    run: Option<String>,
    worker_alive: bool,
    stepper: Option<StepperSnapshot>,
    schedule: Option<ScheduleSnapshot>,
    last_outcome: Option<String>,
    runs: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

struct DaemonState {
    config: DaemonConfig,
    stepper: Arc<Stepper>,
    worker: Worker,
}

impl DaemonState {
    fn new(config: DaemonConfig, catalog: pavlov::schedule::Catalog) -> Self {
        let stepper = Arc::new(Stepper::new());
        let worker = Worker::new(
            Arc::new(catalog),
            config.orchestrator,
            config.network,
            Arc::clone(&stepper),
        );
        Self {
            config,
            stepper,
            worker,
        }
    }

    fn get_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.stepper.state(),
            run: self.worker.current_run().map(str::to_string),
            worker_alive: self.worker.is_alive(),
            stepper: self.stepper.snapshot().ok(),
            schedule: self.worker.snapshot(),
            last_outcome: self.worker.last_outcome(),
            runs: self.worker.catalog().run_names().map(str::to_string).collect(),
        }
    }

    fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::GetState => Response::State(self.get_snapshot()),
            Request::Start { run, grain, steps } => {
                let state = self.stepper.state();
                if state != RunState::Stopped {
                    warn!(?state, %grain, steps, "start ignored: run already active");
                    return Response::Success {
                        message: format!("Already {:?}; start ignored", state),
                    };
                }
                let run = run.unwrap_or_else(|| self.config.run.clone());
                match self.worker.launch(&run, grain, steps) {
                    Ok(()) => Response::Success {
                        message: format!("Started {} ({} x {})", run, steps, grain),
                    },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                }
            }
            Request::Pause => match self.stepper.pause() {
                Ok(()) => Response::Success {
                    message: "Pause requested".to_string(),
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Resume { grain, steps } => match self.stepper.resume(grain, steps) {
                Ok(()) => Response::Success {
                    message: format!("Resumed ({} x {})", steps, grain),
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Stop => match self.stepper.stop() {
                Ok(()) => Response::Success {
                    message: "Stopped".to_string(),
                },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::Shutdown => {
                if let Err(e) = self.stepper.stop() {
                    warn!("stop before shutdown failed: {}", e);
                }
                info!("Shutdown requested");
                tokio::spawn(async {
                    // Give the response a moment to flush before exiting.
                    time::sleep(Duration::from_millis(50)).await;
                    std::process::exit(0);
                });
                Response::Success {
                    message: "Shutting down".to_string(),
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<DaemonState>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::GetState) => {
                let s = state.read().await;
                Response::State(s.get_snapshot())
            }
            Ok(request) => {
                let mut s = state.write().await;
                s.dispatch(request)
            }
            Err(e) => Response::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());

    let config = load_config(&paths)?;
    let catalog = load_catalog(&paths)?;
    info!(
        "Catalog: {} run(s), {} condition(s)",
        catalog.run_names().count(),
        catalog.condition_names().count()
    );

    let addr = config.addr.clone();
    let state = Arc::new(RwLock::new(DaemonState::new(config, catalog)));

    // Stop the worker cleanly on Ctrl-C.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let s = state.read().await;
                if let Err(e) = s.stepper.stop() {
                    error!("Ctrl-C stop failed: {}", e);
                }
                info!("Ctrl-C: run stopped");
                std::process::exit(0);
            }
        });
    }

    let listener = TcpListener::bind(&addr).await?;
    info!("Pavlov daemon listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Client connected: {}", peer);
        let state_clone = Arc::clone(&state);

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state_clone).await {
                error!("Client handler error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pavlov::experiments::builtin_catalog;
    use pavlov::orchestrator::OrchestratorConfig;
    use pavlov::stepper::StepperEvent;

    fn daemon() -> DaemonState {
        let config = DaemonConfig {
            orchestrator: OrchestratorConfig {
                cycles_per_quarter: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        DaemonState::new(config, builtin_catalog().unwrap())
    }

    fn is_error(r: &Response) -> bool {
        matches!(r, Response::Error { .. })
    }

    #[test]
    fn requests_parse_with_defaults() {
        let r: Request = serde_json::from_str(r#"{"type":"Start"}"#).unwrap();
        assert!(matches!(
            r,
            Request::Start {
                run: None,
                grain: Granularity::Trial,
                steps: 0
            }
        ));
        let r: Request =
            serde_json::from_str(r#"{"type":"Resume","grain":"trial_block","steps":2}"#).unwrap();
        assert!(matches!(
            r,
            Request::Resume {
                grain: Granularity::TrialBlock,
                steps: 2
            }
        ));
    }

    #[test]
    fn control_flow_over_dispatch() {
        let mut d = daemon();
        assert!(is_error(&d.dispatch(Request::Pause)));
        assert!(is_error(&d.dispatch(Request::Resume {
            grain: Granularity::Trial,
            steps: 1
        })));

        let events = d.stepper.subscribe().unwrap();
        let r = d.dispatch(Request::Start {
            run: None,
            grain: Granularity::Trial,
            steps: 1,
        });
        assert!(!is_error(&r), "{r:?}");
        assert_eq!(
            events.recv_timeout(Duration::from_secs(10)),
            Ok(StepperEvent::Paused { at: Granularity::Trial })
        );

        match d.dispatch(Request::GetState) {
            Response::State(s) => {
                assert_eq!(s.state, RunState::Paused);
                assert_eq!(s.run.as_deref(), Some(pavlov::experiments::RENEWAL_RUN));
                assert_eq!(s.schedule.unwrap().counters.trial.cur, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Start while paused is ignored, not an error, and keeps the arming.
        assert!(!is_error(&d.dispatch(Request::Start {
            run: None,
            grain: Granularity::Cycle,
            steps: 0,
        })));
        let armed = d.stepper.snapshot().unwrap();
        assert_eq!(armed.state, RunState::Paused);
        assert_eq!((armed.granularity, armed.steps), (Granularity::Trial, 1));

        assert!(!is_error(&d.dispatch(Request::Stop)));
        d.worker.join();
        assert_eq!(d.worker.last_outcome().as_deref(), Some("Stopped"));
    }

    #[test]
    fn unknown_run_is_reported() {
        let mut d = daemon();
        let r = d.dispatch(Request::Start {
            run: Some("Nope".to_string()),
            grain: Granularity::Trial,
            steps: 1,
        });
        assert!(is_error(&r));
        assert_eq!(d.stepper.state(), RunState::Stopped);
    }
}
