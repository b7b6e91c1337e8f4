//! Pixel work: server bitmaps, the display-driver interface and its
//! framebuffer implementation, and font metrics.
//!
//! The driver never writes outside the clip rectangle it is handed, and
//! fills with empty dimensions are no-ops. There is exactly one driver
//! implementation at runtime; the trait exists so the compositor can stay
//! independent of the panel hardware.

pub mod bitmap;
pub mod driver;
pub mod font;

pub use bitmap::ServerBitmap;
pub use driver::{BlitSource, DisplayDriver, DrawingMode, FramebufferDriver};
pub use font::{FontId, CHARACTER_SPACING};
