//! CLI client for the `pavlovd` daemon.
//!
//! Examples:
//!   pavlov-cli status
//!   pavlov-cli start --run ABA_Renewal trial 3
//!   pavlov-cli pause
//!   pavlov-cli resume trial_block 1
//!   pavlov-cli stop
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process;
use std::time::Duration;

use pavlov::observer::ScheduleSnapshot;
use pavlov::stepper::{Granularity, RunState, StepperSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    Start {
        run: Option<String>,
        grain: Granularity,
        steps: u32,
    },
    Pause,
    Resume {
        grain: Granularity,
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
    #[serde(default)]
    runs: Vec<String>,
}

fn usage() -> ! {
    eprintln!("pavlov-cli (talks to pavlovd @ 127.0.0.1:9877 by default)");
    eprintln!("Usage: pavlov-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                              Show run and stepper state");
    eprintln!("  start [--run NAME] [GRAIN [STEPS]]  Start a run (default: trial, free-running)");
    eprintln!("  pause                               Pause at the next armed boundary");
    eprintln!("  resume [GRAIN [STEPS]]              Resume a paused run");
    eprintln!("  stop                                Stop the run");
    eprintln!("  shutdown                            Stop and exit the daemon");
    eprintln!();
    eprintln!("GRAIN: cycle | quarter | minus_phase | alpha_cycle | trial | trial_block | condition");
    eprintln!("STEPS: boundaries before auto-pause; 0 runs until stopped");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9877".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

fn fail(msg: &str) -> ! {
    eprintln!("{}", msg);
    process::exit(1);
}

/// `[GRAIN [STEPS]]` with Trial and 0 as defaults.
fn parse_stepping(args: &[String]) -> (Granularity, u32) {
    let grain: Granularity = match args.first() {
        Some(g) => g.parse().unwrap_or_else(|e| fail(&format!("{e}"))),
        None => Granularity::Trial,
    };
    let steps: u32 = match args.get(1) {
        Some(s) => s
            .parse()
            .unwrap_or_else(|_| fail("steps must be a non-negative number")),
        None => 0,
    };
    (grain, steps)
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_state(s: StateSnapshot) {
    println!(
        "state={:?} run={} worker_alive={} last_outcome={}",
        s.state,
        s.run.as_deref().unwrap_or("-"),
        s.worker_alive,
        s.last_outcome.as_deref().unwrap_or("-"),
    );
    if let Some(st) = s.stepper {
        println!(
            "stepper: grain={} steps={} remaining={} pause_requested={}",
            st.granularity, st.steps, st.remaining, st.pause_requested,
        );
    }
    if let Some(sched) = s.schedule {
        println!("schedule: {}", sched);
        if !sched.block_trials.is_empty() {
            println!("block: {}", sched.block_trials.join(" "));
        }
    }
    if !s.runs.is_empty() {
        println!("runs: {}", s.runs.join(", "));
    }
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];

    let req = match cmd.as_str() {
        "status" => Request::GetState,
        "start" => {
            let mut rest = &args[1..];
            let mut run = None;
            if rest.first().map(String::as_str) == Some("--run") {
                match rest.get(1) {
                    Some(name) => run = Some(name.clone()),
                    None => usage(),
                }
                rest = &rest[2..];
            }
            let (grain, steps) = parse_stepping(rest);
            Request::Start { run, grain, steps }
        }
        "pause" => Request::Pause,
        "resume" => {
            let (grain, steps) = parse_stepping(&args[1..]);
            Request::Resume { grain, steps }
        }
        "stop" => Request::Stop,
        "shutdown" => Request::Shutdown,
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(Response::State(s)) => print_state(s),
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
