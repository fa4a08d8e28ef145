/*
 *  transport.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Line-delimited JSON event stream -> pipeline notifications
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
//! One envelope per line:
//!
//! ```text
//! {"event":"audio-levels","payload":{"master":{"rms":0.2,"peak":0.4}}}
//! {"event":"transport-disconnected"}
//! ```

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::pipeline::MeterPipeline;

pub const LEVELS_EVENT: &str = "audio-levels";
pub const DISCONNECT_EVENT: &str = "transport-disconnected";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub levels_event: String,
    pub disconnect_event: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self { levels_event: LEVELS_EVENT.into(), disconnect_event: DISCONNECT_EVENT.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Raw level payload, still JSON text.
    Levels(String),
    Disconnected,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Decode one line. `None` for blank lines, junk and events nobody subscribed to.
pub fn decode_line(line: &str, settings: &TransportSettings) -> Option<TransportEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let env: Envelope = match serde_json::from_str(line) {
        Ok(env) => env,
        Err(e) => {
            debug!("transport: skipping line: {e}");
            return None;
        }
    };
    if env.event == settings.levels_event {
        Some(TransportEvent::Levels(env.payload.to_string()))
    } else if env.event == settings.disconnect_event {
        Some(TransportEvent::Disconnected)
    } else {
        None
    }
}

/// What a stream delivered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub lines: u64,
    pub levels: u64,
    pub rejected: u64,
    pub disconnects: u64,
}

/// Feed a stream into the pipeline until it ends. End of stream counts as a disconnect.
pub async fn run<R>(reader: R, settings: &TransportSettings, pipeline: &MeterPipeline) -> std::io::Result<StreamSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = StreamSummary::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        match decode_line(&line, settings) {
            Some(TransportEvent::Levels(raw)) => {
                summary.levels += 1;
                if pipeline.on_level_event(&raw).is_err() {
                    summary.rejected += 1;
                }
            }
            Some(TransportEvent::Disconnected) => {
                summary.disconnects += 1;
                pipeline.on_transport_disconnected();
            }
            None => {}
        }
    }
    info!(
        "transport: stream ended after {} line(s), {} level event(s), {} rejected",
        summary.lines, summary.levels, summary.rejected
    );
    summary.disconnects += 1;
    pipeline.on_transport_disconnected();
    Ok(summary)
}
