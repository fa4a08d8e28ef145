/*
 *  main.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Headless meter daemon: reads a level event stream, paints the
 *	configured meters off-thread and snapshots them on exit
 *
 *	This program is free software: you can redistribute it and/or modify
 *	it under the terms of the GNU General Public License as published by
 *	the Free Software Foundation, either version 3 of the License, or
 *	(at your option) any later version.
 *
 *	This program is distributed in the hope that it will be useful,
 *	but WITHOUT ANY WARRANTY; without even the implied warranty of
 *	MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *	GNU General Public License for more details.
 *
 *	See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *	Public License.
 *
 */

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};

use meterbank::config::{self, Cli, Config};
use meterbank::transport::{self, StreamSummary, TransportSettings};
use meterbank::{BridgeError, CanvasElement, CaptureSink, MeterPipeline, PreviewFrame, Surface, SurfaceId};

const DEFAULT_LINGER_MS: u64 = 200;
const STATUS_INTERVAL_MS: f64 = 500.0;

/// Asynchronously waits for a SIGINT, SIGTERM, or SIGHUP signal.
async fn signal_handler() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received. Initiating graceful shutdown.");
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received. Initiating graceful shutdown.");
        }
        _ = sighup.recv() => {
            info!("SIGHUP received. Initiating graceful shutdown.");
        }
    }
    Ok(())
}

/// A meter or preview we put on screen, and where its frames land.
struct Mounted {
    label: String,
    id: SurfaceId,
    sink: CaptureSink,
}

async fn mount_surfaces(cfg: &Config, pipeline: &MeterPipeline) -> Vec<Mounted> {
    let mut mounted = Vec::new();
    for m in cfg.meters() {
        let sink = CaptureSink::new();
        let element = CanvasElement::new(Surface::new(m.width, m.height, m.dpr, Box::new(sink.clone())));
        match pipeline.register_meter_canvas(&element, m.track.clone(), m.render_config()).await {
            Ok(id) => {
                info!("meter {} mounted as {}", m.track, id);
                mounted.push(Mounted { label: m.track.to_string(), id, sink });
            }
            Err(BridgeError::RegistrationTimedOut { id }) => {
                warn!("meter {}: registration timed out, releasing {}", m.track, id);
                pipeline.unregister_meter_canvas(id);
            }
            Err(e) => warn!("meter {}: {e}", m.track),
        }
    }

    if let Some(p) = cfg.preview.as_ref() {
        let sink = CaptureSink::new();
        let element = CanvasElement::new(Surface::new(p.width, p.height, 1.0, Box::new(sink.clone())));
        match pipeline.register_preview_canvas(&element).await {
            Ok(id) => {
                pipeline.push_preview_frame(id, test_card(p.width, p.height));
                mounted.push(Mounted { label: "preview".into(), id, sink });
            }
            Err(e) => warn!("preview: {e}"),
        }
    }
    mounted
}

/// Colour ramp so a preview surface shows something before real video arrives.
fn test_card(width: u32, height: u32) -> PreviewFrame {
    let mut rgb = Vec::with_capacity(PreviewFrame::expected_len(width, height).unwrap_or(0));
    let (w, h) = (width.max(1) as usize, height.max(1) as usize);
    for y in 0..height as usize {
        for x in 0..width as usize {
            rgb.extend_from_slice(&[(x * 255 / w) as u8, (y * 255 / h) as u8, 0x60]);
        }
    }
    PreviewFrame { width, height, rgb }
}

async fn feed(input: Option<&Path>, settings: &TransportSettings, pipeline: &MeterPipeline) -> Result<StreamSummary> {
    match input {
        Some(p) if p != Path::new("-") => {
            let file = tokio::fs::File::open(p)
                .await
                .with_context(|| format!("opening {}", p.display()))?;
            Ok(transport::run(BufReader::new(file), settings, pipeline).await?)
        }
        _ => Ok(transport::run(BufReader::new(tokio::io::stdin()), settings, pipeline).await?),
    }
}

fn write_snapshots(dir: &Path, mounted: &[Mounted]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for m in mounted {
        let Some(frame) = m.sink.last_frame() else {
            warn!("{}: nothing painted yet, no snapshot", m.label);
            continue;
        };
        let name = format!("{}-{}.ppm", m.id.0, m.label.replace(|c: char| !c.is_ascii_alphanumeric(), "_"));
        let path: PathBuf = dir.join(name);
        let file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);
        frame.write_ppm(&mut out)?;
        out.flush()?;
        info!("{}: wrote {}", m.label, path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli)?;

    if cli.dump_config {
        println!("{}", config::dump(&cfg)?);
        return Ok(());
    }

    env_logger::Builder::from_env(Env::default().default_filter_or(cfg.log_level()))
        .format_timestamp_secs()
        .init();

    info!("{} v.{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let pipeline = MeterPipeline::new(cfg.pipeline_settings());
    let mounted = mount_surfaces(&cfg, &pipeline).await;
    if let Some(shared) = pipeline.shared_levels() {
        info!("shared level region live ({:?})", shared);
    }

    // master readout, twice a second, off the shared render loop
    let status = {
        let p = pipeline.clone();
        let coord = pipeline.coordinator().clone();
        pipeline.coordinator().register("status", move |ts| {
            if coord.should_update("status", ts, STATUS_INTERVAL_MS) {
                let m = p.master_level();
                info!(
                    "master rms {:.3} peak {:.3} ({:.1} dB){}",
                    m.rms,
                    m.peak,
                    m.peak_db,
                    if m.clipping { " CLIP" } else { "" }
                );
            }
        })
    };

    let transport_settings = cfg.transport_settings();
    let linger = Duration::from_millis(cli.linger_ms.unwrap_or(DEFAULT_LINGER_MS));

    tokio::select! {
        _ = signal_handler() => {}
        res = async {
            let res = feed(cli.input.as_deref(), &transport_settings, &pipeline).await;
            tokio::time::sleep(linger).await;
            res
        } => {
            match res {
                Ok(s) => info!("input done: {} level event(s), {} rejected", s.levels, s.rejected),
                Err(e) => error!("input failed: {e:#}"),
            }
        }
    }

    status.unregister();

    if let Some(dir) = cli.snapshot_dir.as_deref() {
        if let Err(e) = write_snapshots(dir, &mounted) {
            error!("snapshots: {e:#}");
        }
    }

    let stats = pipeline.worker_stats();
    info!(
        "worker: {} paint tick(s), {} frame(s) presented, {} dropped payload(s)",
        stats.paint_ticks(),
        stats.frames_presented(),
        stats.dropped_payloads()
    );
    for m in &mounted {
        pipeline.unregister_meter_canvas(m.id);
    }
    pipeline.shutdown();
    info!("bye");
    Ok(())
}
