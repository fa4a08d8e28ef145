/*
 *  worker/paint.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Meter and preview painting
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

use core::convert::Infallible;

use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{Line, PrimitiveStyle, PrimitiveStyleBuilder, Rectangle, Triangle};

use crate::levels::{db_from_linear, db_position, PeakBand, StereoLevel, DB_CEIL, DB_FLOOR};
use crate::peak_hold::PeakHold;
use crate::protocol::{MarkerKind, PreviewFrame, RenderConfig};
use crate::surface::DrawContext;
use crate::vframebuf::VarFrameBuf;

// palette
pub const BACKGROUND: Rgb888 = Rgb888::new(0x12, 0x12, 0x16);
pub const CLIP_OFF: Rgb888 = Rgb888::new(0x3a, 0x10, 0x10);
pub const CLIP_ON: Rgb888 = Rgb888::new(0xff, 0x20, 0x20);
const BAR_LOW: Rgb888 = Rgb888::new(0x22, 0xc5, 0x5e);
const BAR_MID: Rgb888 = Rgb888::new(0xea, 0xd3, 0x08);
const BAR_HIGH: Rgb888 = Rgb888::new(0xef, 0x44, 0x44);
const RMS_LINE: Rgb888 = Rgb888::new(0xf0, 0xf0, 0xf0);
const TICK: Rgb888 = Rgb888::new(0x50, 0x50, 0x58);
const GUIDE: Rgb888 = Rgb888::new(0x80, 0x80, 0x8c);
const GATE: Rgb888 = Rgb888::new(0x38, 0xbd, 0xf8);
const COMPRESSOR: Rgb888 = Rgb888::new(0xf9, 0x73, 0x16);
const EXPANDER: Rgb888 = Rgb888::new(0xa8, 0x55, 0xf7);
const HOLD_GREEN: Rgb888 = Rgb888::new(0x4a, 0xde, 0x80);
const HOLD_YELLOW: Rgb888 = Rgb888::new(0xfa, 0xcc, 0x15);
const HOLD_ORANGE: Rgb888 = Rgb888::new(0xfb, 0x92, 0x3c);
const HOLD_RED: Rgb888 = Rgb888::new(0xf8, 0x71, 0x71);
const FADER: Rgb888 = Rgb888::new(0xe5, 0xe7, 0xeb);
const MUTE_SHADE: Rgb888 = Rgb888::new(0x00, 0x00, 0x00);
const MUTE_ALPHA: u8 = 160;

const GUIDES_DB: [f32; 2] = [-20.0, -9.0];
const TICK_STEP_DB: usize = 5;

/// Everything a meter frame depends on. Equal inputs paint equal pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PaintInputs {
    pub level: StereoLevel,
    pub hold: (f32, f32),
    pub config: RenderConfig,
    pub size: (u32, u32),
}

impl PaintInputs {
    pub fn new(level: StereoLevel, hold: Option<&PeakHold>, config: &RenderConfig, ctx: &DrawContext) -> Self {
        Self {
            level,
            hold: hold.map(|h| (h.left, h.right)).unwrap_or((0.0, 0.0)),
            config: config.clone(),
            size: (ctx.width, ctx.height),
        }
    }
}

/// Vertical bar geometry, device pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    clip_h: u32,
    top: i32,
    height: u32,
    bars_w: u32,
    arrow_w: u32,
}

impl Layout {
    fn new(ctx: &DrawContext) -> Self {
        let clip_h = ctx.px(4.0).min(ctx.height / 4);
        let top = (clip_h + ctx.px(1.0)) as i32;
        let height = ctx.height.saturating_sub(top as u32);
        let arrow_w = ctx.px(6.0).min(ctx.width / 3);
        Self { clip_h, top, height, bars_w: ctx.width.saturating_sub(arrow_w), arrow_w }
    }

    /// Row for a dB value; floor maps to one past the last row.
    fn y_of(&self, db: f32) -> i32 {
        let filled = (self.height as f32 * db_position(db) / 100.0).round() as i32;
        self.top + self.height as i32 - filled
    }

    fn bottom(&self) -> i32 {
        self.top + self.height as i32
    }

    /// (x, width) of channel `ch` (0 = left, 1 = right).
    fn channel(&self, ch: u32) -> (i32, u32) {
        let gap = if self.bars_w >= 3 { 1 } else { 0 };
        let w = self.bars_w.saturating_sub(gap) / 2;
        let x = if ch == 0 { 0 } else { (w + gap) as i32 };
        (x, w.max(1))
    }
}

/// Per-row bar colours, rebuilt when the bar height changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    top: i32,
    rows: Vec<Rgb888>,
}

impl Gradient {
    fn build(layout: &Layout) -> Self {
        let h = layout.height.max(1) as f32;
        let rows = (0..layout.height)
            .map(|i| {
                let frac = 1.0 - (i as f32 + 0.5) / h;
                gradient_color(DB_FLOOR + frac * (DB_CEIL - DB_FLOOR))
            })
            .collect();
        Self { top: layout.top, rows }
    }

    fn fits(&self, layout: &Layout) -> bool {
        self.top == layout.top && self.rows.len() == layout.height as usize
    }

    fn at(&self, y: i32) -> Rgb888 {
        let i = (y - self.top).clamp(0, self.rows.len().saturating_sub(1) as i32) as usize;
        self.rows.get(i).copied().unwrap_or(BAR_LOW)
    }
}

fn lerp(a: Rgb888, b: Rgb888, t: f32) -> Rgb888 {
    let t = t.clamp(0.0, 1.0);
    let mix = |x: u8, y: u8| (x as f32 + (y as f32 - x as f32) * t).round() as u8;
    Rgb888::new(mix(a.r(), b.r()), mix(a.g(), b.g()), mix(a.b(), b.b()))
}

fn gradient_color(db: f32) -> Rgb888 {
    if db < -20.0 {
        BAR_LOW
    } else if db < -6.0 {
        lerp(BAR_LOW, BAR_MID, (db + 20.0) / 14.0)
    } else {
        lerp(BAR_MID, BAR_HIGH, (db + 6.0) / 6.0)
    }
}

pub fn hold_color(db: f32) -> Rgb888 {
    match PeakBand::from_db(db) {
        PeakBand::Green => HOLD_GREEN,
        PeakBand::Yellow => HOLD_YELLOW,
        PeakBand::Orange => HOLD_ORANGE,
        PeakBand::Red => HOLD_RED,
    }
}

fn marker_color(kind: MarkerKind) -> Rgb888 {
    match kind {
        MarkerKind::Gate => GATE,
        MarkerKind::Compressor => COMPRESSOR,
        MarkerKind::Expander => EXPANDER,
    }
}

/// Paint one meter frame.
pub fn paint_meter(
    fb: &mut VarFrameBuf<Rgb888>,
    ctx: &DrawContext,
    inputs: &PaintInputs,
    gradient: &mut Option<Gradient>,
) -> Result<(), Infallible> {
    let layout = Layout::new(ctx);
    let level = &inputs.level;
    let cfg = &inputs.config;

    fb.clear(BACKGROUND)?;

    // peak bars
    if !gradient.as_ref().is_some_and(|g| g.fits(&layout)) {
        *gradient = Some(Gradient::build(&layout));
    }
    if let Some(g) = gradient.as_ref() {
        for (ch, peak) in [(0, level.left_peak), (1, level.right_peak)] {
            let (x, w) = layout.channel(ch);
            for y in layout.y_of(db_from_linear(peak))..layout.bottom() {
                fb.fill_solid(&Rectangle::new(Point::new(x, y), Size::new(w, 1)), g.at(y))?;
            }
        }
    }

    // rms
    let rms_style = PrimitiveStyle::with_stroke(RMS_LINE, ctx.px(1.0));
    for (ch, rms) in [(0, level.left_rms), (1, level.right_rms)] {
        let db = db_from_linear(rms);
        if db <= DB_FLOOR {
            continue;
        }
        let (x, w) = layout.channel(ch);
        let y = layout.y_of(db);
        Line::new(Point::new(x, y), Point::new(x + w as i32 - 1, y))
            .into_styled(rms_style)
            .draw(fb)?;
    }

    // scale
    let tick_w = ctx.px(3.0) as i32;
    let tick_style = PrimitiveStyle::with_stroke(TICK, 1);
    for db in (DB_FLOOR as i32..=DB_CEIL as i32).step_by(TICK_STEP_DB) {
        let y = layout.y_of(db as f32).min(layout.bottom() - 1);
        Line::new(Point::new(0, y), Point::new(tick_w - 1, y))
            .into_styled(tick_style)
            .draw(fb)?;
    }
    let guide_style = PrimitiveStyle::with_stroke(GUIDE, 1);
    for db in GUIDES_DB {
        let y = layout.y_of(db);
        Line::new(Point::new(0, y), Point::new(layout.bars_w as i32 - 1, y))
            .into_styled(guide_style)
            .draw(fb)?;
    }

    // threshold markers
    let dash = ctx.px(3.0) as i32;
    let gap = ctx.px(2.0) as i32;
    for marker in cfg.threshold_markers.iter().filter(|m| m.enabled) {
        let y = layout.y_of(marker.db_threshold);
        let color = marker_color(marker.kind);
        let mut x = 0;
        while x < layout.bars_w as i32 {
            let len = dash.min(layout.bars_w as i32 - x) as u32;
            fb.fill_solid(&Rectangle::new(Point::new(x, y), Size::new(len, 1)), color)?;
            x += dash + gap;
        }
    }

    // peak hold
    let hold_h = ctx.px(2.0);
    for (ch, held) in [(0, inputs.hold.0), (1, inputs.hold.1)] {
        let db = db_from_linear(held);
        if db <= DB_FLOOR {
            continue;
        }
        let (x, w) = layout.channel(ch);
        let y = layout.y_of(db).min(layout.bottom() - hold_h as i32);
        fb.fill_solid(&Rectangle::new(Point::new(x, y), Size::new(w, hold_h)), hold_color(db))?;
    }

    // fader
    if layout.arrow_w > 0 && layout.height > 0 {
        let vol = cfg.volume_clamped();
        let y = layout.top + ((1.0 - vol) * (layout.height.saturating_sub(1)) as f32).round() as i32;
        let half = (layout.arrow_w / 2).max(1) as i32;
        let right = ctx.width as i32 - 1;
        let tip = Point::new(right - layout.arrow_w as i32 + 1, y);
        let style = if cfg.is_dragging {
            PrimitiveStyle::with_fill(FADER)
        } else {
            PrimitiveStyleBuilder::new().stroke_color(FADER).stroke_width(1).build()
        };
        Triangle::new(tip, Point::new(right, y - half), Point::new(right, y + half))
            .into_styled(style)
            .draw(fb)?;
    }

    if cfg.muted {
        fb.blend_rect(&Rectangle::new(Point::zero(), Size::new(ctx.width, ctx.height)), MUTE_SHADE, MUTE_ALPHA);
    }

    // clip strip last so it stays readable when muted
    let clip = if level.clipping { CLIP_ON } else { CLIP_OFF };
    fb.fill_solid(&Rectangle::new(Point::zero(), Size::new(ctx.width, layout.clip_h)), clip)?;

    Ok(())
}

/// Nearest-neighbour blit of a packed RGB frame onto the whole surface.
pub fn blit_preview(fb: &mut VarFrameBuf<Rgb888>, frame: &PreviewFrame) -> Result<(), Infallible> {
    let (dw, dh) = (fb.width(), fb.height());
    if dw == 0 || dh == 0 || !frame.is_well_formed() {
        return Ok(());
    }
    let (sw, sh) = (frame.width as usize, frame.height as usize);
    let rgb = &frame.rgb;
    let pixels = (0..dh).flat_map(move |y| {
        let sy = y * sh / dh;
        (0..dw).map(move |x| {
            let sx = x * sw / dw;
            let i = (sy * sw + sx) * 3;
            Pixel(Point::new(x as i32, y as i32), Rgb888::new(rgb[i], rgb[i + 1], rgb[i + 2]))
        })
    });
    fb.draw_iter(pixels)
}
