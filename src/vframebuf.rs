/*
 *  vframebuf.rs
 *
 *  meterbank - levels on the wire, bars on the glass
 *	(c) 2020-26 Stuart Hunter
 *
 *	Runtime-sized framebuffer backing every drawing surface
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
use embedded_graphics::geometry::{OriginDimensions, Size};
use embedded_graphics::pixelcolor::{PixelColor, Rgb888};
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;
use std::io::{self, Write};

/// A runtime-sized framebuffer for embedded-graphics.
#[derive(Debug, Clone, PartialEq)]
pub struct VarFrameBuf<C: PixelColor> {
    buf: Vec<C>,
    w: usize,
    h: usize,
}

impl<C: PixelColor + Clone> VarFrameBuf<C> {
    pub fn new(width: u32, height: u32, fill: C) -> Self {
        let (w, h) = (width as usize, height as usize);
        Self { buf: vec![fill; w * h], w, h }
    }

    /// Zero-sized buffer, sized later with [`VarFrameBuf::resize`].
    pub fn empty(fill: C) -> Self {
        Self::new(0, 0, fill)
    }

    pub fn width(&self) -> usize { self.w }
    pub fn height(&self) -> usize { self.h }
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn as_slice(&self) -> &[C] { &self.buf }

    /// Reallocate to a new size; contents are discarded.
    pub fn resize(&mut self, width: u32, height: u32, fill: C) {
        self.w = width as usize;
        self.h = height as usize;
        self.buf.clear();
        self.buf.resize(self.w * self.h, fill);
    }

    pub fn clear_color(&mut self, color: C) {
        self.buf.fill(color);
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<C> {
        self.idx(Point::new(x, y)).map(|i| self.buf[i])
    }

    /// Map (x,y) to linear index; returns None if out of bounds
    #[inline]
    fn idx(&self, p: Point) -> Option<usize> {
        if p.x >= 0 && p.y >= 0 {
            let (x, y) = (p.x as usize, p.y as usize);
            if x < self.w && y < self.h {
                return Some(y * self.w + x);
            }
        }
        None
    }
}

impl VarFrameBuf<Rgb888> {
    /// Mix `color` into every pixel of `area` (alpha 0..=255).
    pub fn blend_rect(&mut self, area: &Rectangle, color: Rgb888, alpha: u8) {
        let a = alpha as u32;
        let inv = 255 - a;
        let mix = |dst: u8, src: u8| ((dst as u32 * inv + src as u32 * a) / 255) as u8;
        let Some(bottom_right) = area.bottom_right() else { return };
        let x0 = area.top_left.x.max(0) as usize;
        let y0 = area.top_left.y.max(0) as usize;
        let x1 = (bottom_right.x.max(-1) + 1) as usize;
        let y1 = (bottom_right.y.max(-1) + 1) as usize;
        for y in y0..y1.min(self.h) {
            for x in x0..x1.min(self.w) {
                let p = &mut self.buf[y * self.w + x];
                *p = Rgb888::new(mix(p.r(), color.r()), mix(p.g(), color.g()), mix(p.b(), color.b()));
            }
        }
    }

    /// Binary PPM (P6) dump, handy for eyeballing a surface.
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.w, self.h)?;
        let mut bytes = Vec::with_capacity(self.buf.len() * 3);
        for p in &self.buf {
            bytes.extend_from_slice(&[p.r(), p.g(), p.b()]);
        }
        out.write_all(&bytes)
    }
}

impl<C: PixelColor> OriginDimensions for VarFrameBuf<C> {
    fn size(&self) -> Size {
        Size::new(self.w as u32, self.h as u32)
    }
}

impl<C: PixelColor + Clone> DrawTarget for VarFrameBuf<C> {
    type Color = C;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(p, c) in pixels {
            if let Some(i) = self.idx(p) {
                self.buf[i] = c;
            }
        }
        Ok(())
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.clear_color(color);
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        // clip once, then write whole rows
        let clipped = area.intersection(&self.bounding_box());
        let Some(bottom_right) = clipped.bottom_right() else { return Ok(()) };
        let (x0, y0) = (clipped.top_left.x as usize, clipped.top_left.y as usize);
        let x1 = bottom_right.x as usize + 1;
        for y in y0..=bottom_right.y as usize {
            let row = y * self.w;
            self.buf[row + x0..row + x1].fill(color);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_graphics::primitives::{Line, PrimitiveStyle};

    #[test]
    fn test_fill_solid_is_clipped() {
        let mut fb = VarFrameBuf::new(8, 4, Rgb888::BLACK);
        Rectangle::new(Point::new(-2, -2), Size::new(4, 4))
            .into_styled(PrimitiveStyle::with_fill(Rgb888::RED))
            .draw(&mut fb)
            .unwrap();
        assert_eq!(fb.pixel(0, 0), Some(Rgb888::RED));
        assert_eq!(fb.pixel(1, 1), Some(Rgb888::RED));
        assert_eq!(fb.pixel(2, 2), Some(Rgb888::BLACK));
        assert_eq!(fb.pixel(9, 0), None);
    }

    #[test]
    fn test_line_draws() {
        let mut fb = VarFrameBuf::new(4, 4, Rgb888::BLACK);
        Line::new(Point::new(0, 3), Point::new(3, 3))
            .into_styled(PrimitiveStyle::with_stroke(Rgb888::GREEN, 1))
            .draw(&mut fb)
            .unwrap();
        assert!((0..4).all(|x| fb.pixel(x, 3) == Some(Rgb888::GREEN)));
    }

    #[test]
    fn test_blend_rect_halves() {
        let mut fb = VarFrameBuf::new(2, 2, Rgb888::new(200, 100, 0));
        fb.blend_rect(&Rectangle::new(Point::zero(), Size::new(1, 1)), Rgb888::BLACK, 128);
        let p = fb.pixel(0, 0).unwrap();
        assert!(p.r() < 110 && p.r() > 90);
        assert_eq!(fb.pixel(1, 1), Some(Rgb888::new(200, 100, 0)));
    }

    #[test]
    fn test_resize_and_ppm() {
        let mut fb = VarFrameBuf::empty(Rgb888::BLACK);
        assert!(fb.is_empty());
        fb.resize(3, 2, Rgb888::WHITE);
        let mut out = Vec::new();
        fb.write_ppm(&mut out).unwrap();
        assert!(out.starts_with(b"P6\n3 2\n255\n"));
        assert_eq!(out.len(), 11 + 3 * 2 * 3);
    }
}
