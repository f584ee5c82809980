//! Standalone headless renderer binary.
//!
//! Usage:
//!   cargo run -p renderer_host -- [--config renderer.json] [--tick-hz 60] [--budget-us 10000]
//!       [--budget-scope global|per_display] [--scenes 2] [--ticks 600]
//!
//! Publishes a number of synthetic scenes, shows them on one display and
//! renders them at the configured rate.
//!
//! Console commands are listed on startup and by `help`.

use std::env;
use std::io::BufRead;

use anyhow::Context;
use renderer_core::prelude::{BudgetScope, RendererConfig, SceneId};
use renderer_core::time::FlushTime;
use renderer_host::{ContentSource, HostState, RendererHost, CONSOLE_HELP};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: RendererConfig,
    scenes: u64,
    ticks: Option<u64>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut parsed = Args {
        cfg: RendererConfig::default(),
        scenes: 2,
        ticks: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                parsed.cfg = RendererConfig::from_json_str(&text).context("parse config")?;
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                parsed.cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--budget-us" if i + 1 < args.len() => {
                parsed.cfg.frame_budget_us = args[i + 1].parse().unwrap_or(10_000);
                i += 2;
            }
            "--budget-scope" if i + 1 < args.len() => {
                parsed.cfg.budget_scope = match args[i + 1].as_str() {
                    "per_display" => BudgetScope::PerDisplay,
                    _ => BudgetScope::Global,
                };
                i += 2;
            }
            "--scenes" if i + 1 < args.len() => {
                parsed.scenes = args[i + 1].parse().unwrap_or(2);
                i += 2;
            }
            "--ticks" if i + 1 < args.len() => {
                parsed.ticks = args[i + 1].parse().ok();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, scenes, ticks } = parse_args()?;
    info!(
        tick_hz = cfg.tick_hz,
        budget_us = cfg.frame_budget_us,
        scope = ?cfg.budget_scope,
        scenes,
        "Starting renderer host"
    );

    let mut host = RendererHost::new(cfg.clone())
        .context("create renderer host")?
        .with_auto_show(true);
    let commands = host.command_channel(256);

    let source = ContentSource {
        scenes: (1..=scenes).map(SceneId).collect(),
        ..ContentSource::default()
    };
    let _source = source.spawn(commands);

    // Console input; lines go to `exec_console` on the tick loop.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        println!("Console commands:");
        for line in CONSOLE_HELP {
            println!("  {line}");
        }
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let line = line.trim();
            if !line.is_empty() && console_tx.blocking_send(line.to_string()).is_err() {
                break;
            }
        }
    });

    let tick_interval = cfg.tick_interval();
    let mut next_tick = tokio::time::Instant::now();

    while host.state() == HostState::Running {
        while let Ok(line) = console_rx.try_recv() {
            match host.exec_console(&line) {
                Ok(output) => output.iter().for_each(|out| println!("{out}")),
                Err(err) => println!("{err:#}"),
            }
        }

        host.step(FlushTime::now())?;
        for event in host.take_scene_events() {
            if event.kind.is_failure() {
                warn!(scene = %event.scene, kind = ?event.kind, "scene event");
            } else {
                info!(scene = %event.scene, kind = ?event.kind, "scene event");
            }
        }
        for event in host.take_renderer_events() {
            info!(?event, "renderer event");
        }

        if ticks.is_some_and(|limit| host.renderer().ticks() >= limit) {
            info!(status = %host.status_json()?, "Tick limit reached");
            break;
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
    Ok(())
}
