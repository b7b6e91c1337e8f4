//! The display-driver interface and its framebuffer implementation.
//!
//! All primitives clamp to the target bitmap and to the clip rectangle they
//! receive; a fill with zero or negative dimensions is a no-op. `copy_rect`
//! picks its traversal direction per axis so a self-overlapping move never
//! reads a pixel it has already overwritten.

use crate::bitmap::ServerBitmap;
use crate::font::{self, FontId};
use core_geom::color::transparent;
use core_geom::{Color, ColorSpace, IPoint, IRect, Region};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrawingMode {
    /// Source replaces destination.
    Copy = 0,
    /// Source replaces destination except for the per-format transparent
    /// sentinel, which leaves the destination pixel alone.
    Overlay,
    /// 32-bit RGBA sources are alpha-composited onto the destination;
    /// other sources fall back to `Overlay`.
    Blend,
}

/// Source operand for `copy_rect`. `Same` blits within the destination
/// bitmap itself (scroll and move blits), which requires overlap handling.
pub enum BlitSource<'a> {
    Same,
    Bitmap(&'a ServerBitmap),
}

pub trait DisplayDriver {
    fn resolution(&self) -> IPoint;
    fn color_space(&self) -> ColorSpace;
    fn create_screen_bitmap(&self) -> ServerBitmap;

    fn write_pixel(&self, bitmap: &mut ServerBitmap, pos: IPoint, color: Color);
    fn fill_rect(&self, bitmap: &mut ServerBitmap, rect: IRect, color: Color);
    fn draw_line(
        &self,
        bitmap: &mut ServerBitmap,
        clip: IRect,
        p0: IPoint,
        p1: IPoint,
        color: Color,
        mode: DrawingMode,
    );
    fn fill_circle(
        &self,
        bitmap: &mut ServerBitmap,
        clip: IRect,
        center: IPoint,
        radius: i32,
        color: Color,
        mode: DrawingMode,
    );
    #[allow(clippy::too_many_arguments)]
    fn copy_rect(
        &self,
        dst: &mut ServerBitmap,
        src: BlitSource<'_>,
        bg: Color,
        fg: Color,
        src_rect: IRect,
        dst_pos: IPoint,
        mode: DrawingMode,
    );
    /// Render `text` at `pos` clipped to `clip`; returns the x coordinate of
    /// the pen after the last glyph.
    #[allow(clippy::too_many_arguments)]
    fn write_string(
        &self,
        bitmap: &mut ServerBitmap,
        pos: IPoint,
        text: &str,
        clip: IRect,
        bg: Color,
        fg: Color,
        font: FontId,
    ) -> i32;

    fn font_height(&self, font: FontId) -> f32 {
        font::height(font)
    }

    fn string_width(&self, font: FontId, text: &str) -> f32 {
        font::string_width(font, text)
    }
}

/// The one concrete driver: a plain memory framebuffer. Panel-specific
/// acceleration (hardware text, DMA blits) hangs off the same trait in the
/// device build.
#[derive(Debug)]
pub struct FramebufferDriver {
    resolution: IPoint,
    color_space: ColorSpace,
}

impl FramebufferDriver {
    pub fn new(resolution: IPoint, color_space: ColorSpace) -> Self {
        Self {
            resolution,
            color_space,
        }
    }
}

impl DisplayDriver for FramebufferDriver {
    fn resolution(&self) -> IPoint {
        self.resolution
    }

    fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    fn create_screen_bitmap(&self) -> ServerBitmap {
        ServerBitmap::new(self.resolution, self.color_space)
    }

    fn write_pixel(&self, bitmap: &mut ServerBitmap, pos: IPoint, color: Color) {
        if !bitmap.frame().contains(pos) {
            return;
        }
        put_pixel(bitmap, pos.x, pos.y, color);
    }

    fn fill_rect(&self, bitmap: &mut ServerBitmap, rect: IRect, color: Color) {
        let rect = rect & bitmap.frame();
        if !rect.is_valid() {
            return;
        }
        match bitmap.color_space() {
            ColorSpace::Rgb15 => fill_rows_u16(bitmap, rect, color.to_rgb15()),
            ColorSpace::Rgb16 => fill_rows_u16(bitmap, rect, color.to_rgb16()),
            ColorSpace::Rgb24 => {
                for y in rect.top..rect.bottom {
                    for x in rect.left..rect.right {
                        let off = bitmap.offset(x, y);
                        bitmap.put_u24(off, color.to_rgb24());
                    }
                }
            }
            ColorSpace::Rgb32 => {
                for y in rect.top..rect.bottom {
                    for x in rect.left..rect.right {
                        let off = bitmap.offset(x, y);
                        bitmap.put_u32(off, color.to_rgb32());
                    }
                }
            }
            cs => error!(target: "display", color_space = ?cs, "fill_rect: unsupported color space"),
        }
    }

    fn draw_line(
        &self,
        bitmap: &mut ServerBitmap,
        clip: IRect,
        p0: IPoint,
        p1: IPoint,
        color: Color,
        mode: DrawingMode,
    ) {
        let clip = clip & bitmap.frame();
        let mut a = p0;
        let mut b = p1;
        if !Region::clip_line(clip, &mut a, &mut b) {
            return;
        }
        let dx = (b.x - a.x).abs();
        let dy = -(b.y - a.y).abs();
        let sx = if a.x < b.x { 1 } else { -1 };
        let sy = if a.y < b.y { 1 } else { -1 };
        let mut err = dx + dy;
        let mut p = a;
        loop {
            plot(bitmap, p, color, mode);
            if p == b {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                p.x += sx;
            }
            if e2 <= dx {
                err += dx;
                p.y += sy;
            }
        }
    }

    fn fill_circle(
        &self,
        bitmap: &mut ServerBitmap,
        clip: IRect,
        center: IPoint,
        radius: i32,
        color: Color,
        _mode: DrawingMode,
    ) {
        let clip = clip & bitmap.frame();
        if !clip.is_valid() || radius < 0 {
            return;
        }
        let radius_sqr = radius * radius;
        // For each row of the upper half, find the first column inside the
        // circle and fill the mirrored horizontal spans.
        for y in -radius..=0 {
            for x in -radius..=0 {
                if x * x + y * y <= radius_sqr {
                    let top = IRect::new(center.x + x, center.y + y, center.x - x + 1, center.y + y + 1);
                    let bottom =
                        IRect::new(center.x + x, center.y - y, center.x - x + 1, center.y - y + 1);
                    let top = top & clip;
                    let bottom = bottom & clip;
                    if top.is_valid() {
                        self.fill_rect(bitmap, top, color);
                    }
                    if bottom.is_valid() && y != 0 {
                        self.fill_rect(bitmap, bottom, color);
                    }
                    break;
                }
            }
        }
    }

    fn copy_rect(
        &self,
        dst: &mut ServerBitmap,
        src: BlitSource<'_>,
        _bg: Color,
        _fg: Color,
        src_rect: IRect,
        dst_pos: IPoint,
        mode: DrawingMode,
    ) {
        let src_frame = match &src {
            BlitSource::Same => dst.frame(),
            BlitSource::Bitmap(b) => b.frame(),
        };
        // Clamp the source rectangle, then the destination, keeping the two
        // aligned so a partially off-screen blit copies the right pixels.
        let clamped_src = src_rect & src_frame;
        if !clamped_src.is_valid() {
            return;
        }
        let dst_pos = dst_pos + (clamped_src.top_left() - src_rect.top_left());
        let dst_rect = IRect::from_size(dst_pos, clamped_src.size()) & dst.frame();
        if !dst_rect.is_valid() {
            return;
        }
        let src_rect = IRect::from_size(
            clamped_src.top_left() + (dst_rect.top_left() - dst_pos),
            dst_rect.size(),
        );

        match (mode, src) {
            (DrawingMode::Copy, BlitSource::Same) => {
                blit_within(dst, src_rect, dst_rect.top_left());
            }
            (DrawingMode::Copy, BlitSource::Bitmap(src)) => {
                if src.color_space() == dst.color_space() {
                    blit_cross(dst, src, src_rect, dst_rect.top_left());
                } else {
                    convert_copy(dst, src, src_rect, dst_rect.top_left());
                }
            }
            (DrawingMode::Overlay, src) => {
                with_source(dst, src, src_rect, dst_rect.top_left(), overlay_pixel);
            }
            (DrawingMode::Blend, src) => {
                let src_space = match &src {
                    BlitSource::Same => dst.color_space(),
                    BlitSource::Bitmap(b) => b.color_space(),
                };
                if src_space == ColorSpace::Rgb32 {
                    with_source(dst, src, src_rect, dst_rect.top_left(), blend_pixel);
                } else {
                    with_source(dst, src, src_rect, dst_rect.top_left(), overlay_pixel);
                }
            }
        }
    }

    fn write_string(
        &self,
        bitmap: &mut ServerBitmap,
        pos: IPoint,
        text: &str,
        clip: IRect,
        bg: Color,
        _fg: Color,
        font: FontId,
    ) -> i32 {
        // The framebuffer fallback clears each glyph cell to the background
        // color with exact metrics; glyph rasterization belongs to the
        // panel's accelerated text path.
        let height = font::height(font) as i32;
        let mut pen_x = pos.x;
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            let advance = font::glyph_width(font, c);
            if advance > 0 {
                let cell = IRect::new(pen_x, pos.y, pen_x + advance, pos.y + height) & clip;
                if cell.is_valid() {
                    self.fill_rect(bitmap, cell, bg);
                }
                pen_x += advance;
            }
            if chars.peek().is_some() {
                pen_x += font::CHARACTER_SPACING;
            }
        }
        pen_x
    }
}

fn fill_rows_u16(bitmap: &mut ServerBitmap, rect: IRect, value: u16) {
    for y in rect.top..rect.bottom {
        for x in rect.left..rect.right {
            let off = bitmap.offset(x, y);
            bitmap.put_u16(off, value);
        }
    }
}

fn put_pixel(bitmap: &mut ServerBitmap, x: i32, y: i32, color: Color) {
    let off = bitmap.offset(x, y);
    match bitmap.color_space() {
        ColorSpace::Rgb15 => bitmap.put_u16(off, color.to_rgb15()),
        ColorSpace::Rgb16 => bitmap.put_u16(off, color.to_rgb16()),
        ColorSpace::Rgb24 => bitmap.put_u24(off, color.to_rgb24()),
        ColorSpace::Rgb32 => bitmap.put_u32(off, color.to_rgb32()),
        cs => error!(target: "display", color_space = ?cs, "write_pixel: unsupported color space"),
    }
}

fn get_pixel(bitmap: &ServerBitmap, x: i32, y: i32) -> Color {
    let off = bitmap.offset(x, y);
    match bitmap.color_space() {
        ColorSpace::Cmap8 => Color::from_cmap8(bitmap.raster()[off]),
        ColorSpace::Rgb15 => Color::from_rgb15(bitmap.get_u16(off)),
        ColorSpace::Rgb16 => Color::from_rgb16(bitmap.get_u16(off)),
        ColorSpace::Rgb24 => Color::from_rgb32(bitmap.get_u24(off) | 0xff00_0000),
        ColorSpace::Rgb32 => Color::from_rgb32(bitmap.get_u32(off)),
        ColorSpace::NoColorSpace => Color::rgb(0, 0, 0),
    }
}

/// Whether the pixel at (x, y) carries the format's transparent sentinel.
fn is_transparent(bitmap: &ServerBitmap, x: i32, y: i32) -> bool {
    let off = bitmap.offset(x, y);
    match bitmap.color_space() {
        ColorSpace::Cmap8 => bitmap.raster()[off] == transparent::CMAP8,
        ColorSpace::Rgb15 => bitmap.get_u16(off) == transparent::RGB15,
        ColorSpace::Rgb16 => bitmap.get_u16(off) == transparent::RGB16,
        ColorSpace::Rgb32 => bitmap.get_u32(off) == transparent::RGB32,
        _ => false,
    }
}

fn plot(bitmap: &mut ServerBitmap, p: IPoint, color: Color, mode: DrawingMode) {
    match mode {
        DrawingMode::Blend if color.a != 0xff => {
            let dst = get_pixel(bitmap, p.x, p.y);
            put_pixel(bitmap, p.x, p.y, composite(color, dst));
        }
        _ => put_pixel(bitmap, p.x, p.y, color),
    }
}

/// `src` over `dst`. Each term truncates through /256 separately, the way
/// the panel firmware computes it, so composited pixels match the device
/// bit for bit.
fn composite(src: Color, dst: Color) -> Color {
    let a = src.a as u32;
    let mix = |s: u8, d: u8| -> u8 { (d as u32 * (256 - a) / 256 + s as u32 * a / 256) as u8 };
    Color::rgb(mix(src.r, dst.r), mix(src.g, dst.g), mix(src.b, dst.b))
}

/// Same-bitmap block move. Rows are walked bottom-up when the destination
/// is below the source; horizontal overlap within a row is handled by the
/// memmove semantics of `copy_within`.
fn blit_within(bitmap: &mut ServerBitmap, src_rect: IRect, dst_pos: IPoint) {
    let bpp = bitmap.color_space().bytes_per_pixel();
    let width_bytes = src_rect.width() as usize * bpp;
    let height = src_rect.height();
    let rows: Box<dyn Iterator<Item = i32>> = if dst_pos.y > src_rect.top {
        Box::new((0..height).rev())
    } else {
        Box::new(0..height)
    };
    for row in rows {
        let src_off = bitmap.offset(src_rect.left, src_rect.top + row);
        let dst_off = bitmap.offset(dst_pos.x, dst_pos.y + row);
        bitmap
            .raster_mut()
            .copy_within(src_off..src_off + width_bytes, dst_off);
    }
}

/// Cross-bitmap block move with matching color spaces.
fn blit_cross(dst: &mut ServerBitmap, src: &ServerBitmap, src_rect: IRect, dst_pos: IPoint) {
    let bpp = dst.color_space().bytes_per_pixel();
    let width_bytes = src_rect.width() as usize * bpp;
    for row in 0..src_rect.height() {
        let src_off = src.offset(src_rect.left, src_rect.top + row);
        let dst_off = dst.offset(dst_pos.x, dst_pos.y + row);
        dst.raster_mut()[dst_off..dst_off + width_bytes]
            .copy_from_slice(&src.raster()[src_off..src_off + width_bytes]);
    }
}

/// Per-pixel format conversion copy.
fn convert_copy(dst: &mut ServerBitmap, src: &ServerBitmap, src_rect: IRect, dst_pos: IPoint) {
    for row in 0..src_rect.height() {
        for col in 0..src_rect.width() {
            let color = get_pixel(src, src_rect.left + col, src_rect.top + row);
            put_pixel(dst, dst_pos.x + col, dst_pos.y + row, color);
        }
    }
}

/// Run a per-pixel blit, materializing a temporary copy of the source area
/// when source and destination alias.
fn with_source(
    dst: &mut ServerBitmap,
    src: BlitSource<'_>,
    src_rect: IRect,
    dst_pos: IPoint,
    op: fn(&mut ServerBitmap, &ServerBitmap, i32, i32, i32, i32),
) {
    match src {
        BlitSource::Bitmap(src) => {
            for row in 0..src_rect.height() {
                for col in 0..src_rect.width() {
                    op(
                        dst,
                        src,
                        src_rect.left + col,
                        src_rect.top + row,
                        dst_pos.x + col,
                        dst_pos.y + row,
                    );
                }
            }
        }
        BlitSource::Same => {
            let mut staging = ServerBitmap::new(src_rect.size(), dst.color_space());
            blit_staging(&mut staging, dst, src_rect);
            for row in 0..src_rect.height() {
                for col in 0..src_rect.width() {
                    op(dst, &staging, col, row, dst_pos.x + col, dst_pos.y + row);
                }
            }
        }
    }
}

fn blit_staging(staging: &mut ServerBitmap, src: &ServerBitmap, src_rect: IRect) {
    let bpp = src.color_space().bytes_per_pixel();
    let width_bytes = src_rect.width() as usize * bpp;
    for row in 0..src_rect.height() {
        let src_off = src.offset(src_rect.left, src_rect.top + row);
        let dst_off = staging.offset(0, row);
        staging.raster_mut()[dst_off..dst_off + width_bytes]
            .copy_from_slice(&src.raster()[src_off..src_off + width_bytes]);
    }
}

fn overlay_pixel(dst: &mut ServerBitmap, src: &ServerBitmap, sx: i32, sy: i32, dx: i32, dy: i32) {
    if !is_transparent(src, sx, sy) {
        put_pixel(dst, dx, dy, get_pixel(src, sx, sy));
    }
}

fn blend_pixel(dst: &mut ServerBitmap, src: &ServerBitmap, sx: i32, sy: i32, dx: i32, dy: i32) {
    let color = Color::from_rgb32(src.get_u32(src.offset(sx, sy)));
    match color.a {
        0x00 => {}
        0xff => put_pixel(dst, dx, dy, color),
        _ => {
            let below = get_pixel(dst, dx, dy);
            put_pixel(dst, dx, dy, composite(color, below));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> FramebufferDriver {
        FramebufferDriver::new(IPoint::new(32, 32), ColorSpace::Rgb16)
    }

    fn bitmap32(cs: ColorSpace) -> ServerBitmap {
        ServerBitmap::new(IPoint::new(32, 32), cs)
    }

    #[test]
    fn fill_rect_clamps_and_ignores_empty() {
        let d = driver();
        let mut bm = bitmap32(ColorSpace::Rgb16);
        d.fill_rect(&mut bm, IRect::new(30, 30, 40, 40), Color::rgb(255, 0, 0));
        assert_ne!(bm.get_u16(bm.offset(31, 31)), 0);
        let before = bm.raster().to_vec();
        d.fill_rect(&mut bm, IRect::new(5, 5, 5, 10), Color::rgb(0, 255, 0));
        assert_eq!(bm.raster(), &before[..]);
    }

    #[test]
    fn draw_line_respects_clip() {
        let d = driver();
        let mut bm = bitmap32(ColorSpace::Rgb16);
        let clip = IRect::new(10, 10, 20, 20);
        d.draw_line(
            &mut bm,
            clip,
            IPoint::new(0, 15),
            IPoint::new(31, 15),
            Color::rgb(255, 255, 255),
            DrawingMode::Copy,
        );
        assert_eq!(bm.get_u16(bm.offset(9, 15)), 0);
        assert_ne!(bm.get_u16(bm.offset(10, 15)), 0);
        assert_ne!(bm.get_u16(bm.offset(19, 15)), 0);
        assert_eq!(bm.get_u16(bm.offset(20, 15)), 0);
    }

    #[test]
    fn overlapping_self_copy_moves_pixels_intact() {
        let d = driver();
        let mut bm = bitmap32(ColorSpace::Rgb16);
        // Paint a recognizable gradient block.
        for y in 0..8 {
            for x in 0..8 {
                let off = bm.offset(x, y);
                bm.put_u16(off, (x + y * 8) as u16 + 1);
            }
        }
        let snapshot: Vec<u16> = (0..8)
            .flat_map(|y| (0..8).map(move |x| (x, y)))
            .map(|(x, y)| bm.get_u16(bm.offset(x, y)))
            .collect();
        // Move down-right by (3, 3) with overlap.
        d.copy_rect(
            &mut bm,
            BlitSource::Same,
            Color::rgb(0, 0, 0),
            Color::rgb(0, 0, 0),
            IRect::new(0, 0, 8, 8),
            IPoint::new(3, 3),
            DrawingMode::Copy,
        );
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(
                    bm.get_u16(bm.offset(x + 3, y + 3)),
                    snapshot[(y * 8 + x) as usize],
                    "pixel ({x},{y}) corrupted by overlapping move"
                );
            }
        }
    }

    #[test]
    fn overlay_skips_transparent_sentinel() {
        let d = driver();
        let mut dst = bitmap32(ColorSpace::Rgb16);
        let mut src = bitmap32(ColorSpace::Rgb16);
        d.fill_rect(&mut dst, IRect::new(0, 0, 4, 1), Color::rgb(0, 0, 255));
        src.put_u16(src.offset(0, 0), transparent::RGB16);
        src.put_u16(src.offset(1, 0), Color::rgb(255, 0, 0).to_rgb16());
        d.copy_rect(
            &mut dst,
            BlitSource::Bitmap(&src),
            Color::rgb(0, 0, 0),
            Color::rgb(0, 0, 0),
            IRect::new(0, 0, 2, 1),
            IPoint::new(0, 0),
            DrawingMode::Overlay,
        );
        assert_eq!(dst.get_u16(dst.offset(0, 0)), Color::rgb(0, 0, 255).to_rgb16());
        assert_eq!(dst.get_u16(dst.offset(1, 0)), Color::rgb(255, 0, 0).to_rgb16());
    }

    #[test]
    fn blend_composites_rgba_source() {
        let d = FramebufferDriver::new(IPoint::new(32, 32), ColorSpace::Rgb32);
        let mut dst = bitmap32(ColorSpace::Rgb32);
        let mut src = bitmap32(ColorSpace::Rgb32);
        d.fill_rect(&mut dst, IRect::new(0, 0, 2, 1), Color::rgb(0, 0, 0));
        src.put_u32(src.offset(0, 0), Color::rgba(200, 100, 0, 128).to_rgb32());
        d.copy_rect(
            &mut dst,
            BlitSource::Bitmap(&src),
            Color::rgb(0, 0, 0),
            Color::rgb(0, 0, 0),
            IRect::new(0, 0, 1, 1),
            IPoint::new(0, 0),
            DrawingMode::Blend,
        );
        let out = Color::from_rgb32(dst.get_u32(dst.offset(0, 0)));
        assert_eq!(out.r, (200u32 * 128 / 256) as u8);
        assert_eq!(out.g, (100u32 * 128 / 256) as u8);
    }

    #[test]
    fn format_conversion_copy() {
        let d = driver();
        let mut dst = bitmap32(ColorSpace::Rgb16);
        let mut src = bitmap32(ColorSpace::Rgb32);
        src.put_u32(src.offset(0, 0), Color::rgb(255, 0, 0).to_rgb32());
        d.copy_rect(
            &mut dst,
            BlitSource::Bitmap(&src),
            Color::rgb(0, 0, 0),
            Color::rgb(0, 0, 0),
            IRect::new(0, 0, 1, 1),
            IPoint::new(0, 0),
            DrawingMode::Copy,
        );
        assert_eq!(dst.get_u16(dst.offset(0, 0)), Color::rgb(255, 0, 0).to_rgb16());
    }

    #[test]
    fn fill_circle_stays_in_clip() {
        let d = driver();
        let mut bm = bitmap32(ColorSpace::Rgb16);
        let clip = IRect::new(0, 0, 16, 16);
        d.fill_circle(
            &mut bm,
            clip,
            IPoint::new(16, 16),
            8,
            Color::rgb(255, 255, 255),
            DrawingMode::Copy,
        );
        assert_ne!(bm.get_u16(bm.offset(15, 15)), 0);
        for x in 16..32 {
            assert_eq!(bm.get_u16(bm.offset(x, 16)), 0);
        }
    }
}
