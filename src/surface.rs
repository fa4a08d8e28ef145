/*
 *  surface.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Drawing surfaces, presentation sinks and one-shot ownership transfer
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
//! A [`Surface`] is a framebuffer plus the sink that puts its pixels
//! somewhere (a window, a file, a test probe). The UI side wraps it in a
//! [`CanvasElement`]; once handed to the worker the element keeps only its
//! identity, so nothing on the UI side can draw on it again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use thiserror::Error;

use crate::vframebuf::VarFrameBuf;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("no drawing context for a {width}x{height} surface")]
    ContextUnavailable { width: u32, height: u32 },
    #[error("present failed: {0}")]
    Present(String),
}

/// Where painted frames go.
pub trait SurfaceSink: Send {
    fn present(&mut self, frame: &VarFrameBuf<Rgb888>) -> Result<(), SurfaceError>;
}

/// Discards frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SurfaceSink for NullSink {
    fn present(&mut self, _frame: &VarFrameBuf<Rgb888>) -> Result<(), SurfaceError> {
        Ok(())
    }
}

/// Shared record of what a [`CaptureSink`] has seen.
#[derive(Debug, Default)]
pub struct CaptureState {
    /// Number of successful presents
    pub presents: usize,
    /// Copy of the last presented frame
    pub last_frame: Option<VarFrameBuf<Rgb888>>,
    /// Make the next presents fail
    pub simulate_failure: bool,
}

/// Keeps the latest frame so someone else can look at it (tests, snapshots).
#[derive(Debug, Clone, Default)]
pub struct CaptureSink {
    state: Arc<Mutex<CaptureState>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<Mutex<CaptureState>> {
        Arc::clone(&self.state)
    }

    pub fn presents(&self) -> usize {
        self.state.lock().map(|s| s.presents).unwrap_or(0)
    }

    pub fn last_frame(&self) -> Option<VarFrameBuf<Rgb888>> {
        self.state.lock().ok().and_then(|s| s.last_frame.clone())
    }
}

impl SurfaceSink for CaptureSink {
    fn present(&mut self, frame: &VarFrameBuf<Rgb888>) -> Result<(), SurfaceError> {
        let mut state = self.state.lock().map_err(|e| SurfaceError::Present(e.to_string()))?;
        if state.simulate_failure {
            return Err(SurfaceError::Present("simulated failure".into()));
        }
        state.presents += 1;
        state.last_frame = Some(frame.clone());
        Ok(())
    }
}

/// Geometry the painter works with once a surface is bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawContext {
    pub width: u32,
    pub height: u32,
    /// Device pixels per logical pixel
    pub scale: f32,
}

impl DrawContext {
    /// Logical length in device pixels, never below one.
    #[inline]
    pub fn px(&self, logical: f32) -> u32 {
        (logical * self.scale).round().max(1.0) as u32
    }
}

/// Pixels plus their sink. Sized in logical (css) units; the backing store is
/// allocated in device pixels when the worker binds it.
pub struct Surface {
    frame: VarFrameBuf<Rgb888>,
    css_width: u32,
    css_height: u32,
    dpr: f32,
    sink: Box<dyn SurfaceSink>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("css_width", &self.css_width)
            .field("css_height", &self.css_height)
            .field("dpr", &self.dpr)
            .field("backing", &(self.frame.width(), self.frame.height()))
            .finish()
    }
}

impl Surface {
    pub fn new(css_width: u32, css_height: u32, dpr: f32, sink: Box<dyn SurfaceSink>) -> Self {
        let dpr = if dpr.is_finite() && dpr > 0.0 { dpr } else { 1.0 };
        Self {
            frame: VarFrameBuf::empty(Rgb888::BLACK),
            css_width,
            css_height,
            dpr,
            sink,
        }
    }

    pub fn css_size(&self) -> (u32, u32) {
        (self.css_width, self.css_height)
    }

    pub fn dpr(&self) -> f32 {
        self.dpr
    }

    /// Device-pixel size for the current css size and ratio.
    pub fn device_size(&self) -> (u32, u32) {
        (
            (self.css_width as f32 * self.dpr).ceil() as u32,
            (self.css_height as f32 * self.dpr).ceil() as u32,
        )
    }

    /// Size the backing store for the device-pixel ratio and hand out the context.
    pub fn bind_context(&mut self) -> Result<DrawContext, SurfaceError> {
        let (w, h) = self.device_size();
        if w == 0 || h == 0 {
            return Err(SurfaceError::ContextUnavailable { width: w, height: h });
        }
        if self.frame.width() != w as usize || self.frame.height() != h as usize {
            self.frame.resize(w, h, Rgb888::BLACK);
        }
        Ok(DrawContext { width: w, height: h, scale: self.dpr })
    }

    pub fn set_css_size(&mut self, css_width: u32, css_height: u32, dpr: Option<f32>) {
        self.css_width = css_width;
        self.css_height = css_height;
        if let Some(d) = dpr.filter(|d| d.is_finite() && *d > 0.0) {
            self.dpr = d;
        }
    }

    pub fn frame(&self) -> &VarFrameBuf<Rgb888> {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut VarFrameBuf<Rgb888> {
        &mut self.frame
    }

    pub fn present(&mut self) -> Result<(), SurfaceError> {
        self.sink.present(&self.frame)
    }
}

/// Identity of one physical UI element. A recreated element gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ElementId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Ownership state of an element's surface.
#[derive(Debug)]
pub enum SurfaceSlot {
    Owned(Surface),
    Transferred,
}

impl SurfaceSlot {
    /// One-shot: yields the surface the first time, leaves `Transferred` behind.
    pub fn transfer(self) -> (Option<Surface>, SurfaceSlot) {
        match self {
            SurfaceSlot::Owned(s) => (Some(s), SurfaceSlot::Transferred),
            SurfaceSlot::Transferred => (None, SurfaceSlot::Transferred),
        }
    }
}

/// The UI-side element that owns a surface until it is handed off.
///
/// Cloning is deliberately not offered; identity is what the bridge keys on.
#[derive(Debug)]
pub struct CanvasElement {
    id: ElementId,
    slot: Mutex<SurfaceSlot>,
}

impl CanvasElement {
    pub fn new(surface: Surface) -> Self {
        Self { id: ElementId::next(), slot: Mutex::new(SurfaceSlot::Owned(surface)) }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn is_transferred(&self) -> bool {
        matches!(*self.lock_slot(), SurfaceSlot::Transferred)
    }

    /// Take the surface out for transfer. `None` once it has already gone.
    pub fn take_for_transfer(&self) -> Option<Surface> {
        let mut slot = self.lock_slot();
        let (surface, rest) = std::mem::replace(&mut *slot, SurfaceSlot::Transferred).transfer();
        *slot = rest;
        surface
    }

    /// Put a surface back after a transfer that never left this side.
    pub(crate) fn restore(&self, surface: Surface) {
        *self.lock_slot() = SurfaceSlot::Owned(surface);
    }

    /// Draw on the surface from the UI side; refused once transferred.
    pub fn with_surface<R>(&self, f: impl FnOnce(&mut Surface) -> R) -> Option<R> {
        match &mut *self.lock_slot() {
            SurfaceSlot::Owned(s) => Some(f(s)),
            SurfaceSlot::Transferred => None,
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, SurfaceSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_is_one_shot() {
        let el = CanvasElement::new(Surface::new(10, 20, 1.0, Box::new(NullSink)));
        assert!(!el.is_transferred());
        assert!(el.take_for_transfer().is_some());
        assert!(el.is_transferred());
        assert!(el.take_for_transfer().is_none());
        assert!(el.with_surface(|_| ()).is_none());
    }

    #[test]
    fn test_restore_after_failed_transfer() {
        let el = CanvasElement::new(Surface::new(10, 20, 1.0, Box::new(NullSink)));
        let s = el.take_for_transfer().unwrap();
        el.restore(s);
        assert_eq!(el.with_surface(|s| s.css_size()), Some((10, 20)));
    }

    #[test]
    fn test_elements_have_distinct_ids() {
        let a = CanvasElement::new(Surface::new(1, 1, 1.0, Box::new(NullSink)));
        let b = CanvasElement::new(Surface::new(1, 1, 1.0, Box::new(NullSink)));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_bind_context_scales_by_dpr() {
        let mut s = Surface::new(24, 100, 2.0, Box::new(NullSink));
        let ctx = s.bind_context().unwrap();
        assert_eq!((ctx.width, ctx.height), (48, 200));
        assert_eq!(s.frame().width(), 48);
        assert_eq!(ctx.px(1.0), 2);
    }

    #[test]
    fn test_zero_sized_surface_has_no_context() {
        let mut s = Surface::new(0, 100, 1.0, Box::new(NullSink));
        assert!(matches!(s.bind_context(), Err(SurfaceError::ContextUnavailable { .. })));
    }

    #[test]
    fn test_capture_sink_records_frames() {
        let sink = CaptureSink::new();
        let mut s = Surface::new(4, 4, 1.0, Box::new(sink.clone()));
        s.bind_context().unwrap();
        s.present().unwrap();
        assert_eq!(sink.presents(), 1);
        assert_eq!(sink.last_frame().unwrap().width(), 4);

        sink.state().lock().unwrap().simulate_failure = true;
        assert!(s.present().is_err());
        assert_eq!(sink.presents(), 1);
    }
}
