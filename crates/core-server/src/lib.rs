//! The application server: a single-process display compositor that
//! arbitrates the framebuffer between client applications.
//!
//! Clients talk to the server over message ports. The server thread owns
//! the view tree, all region state and the screen bitmap; clients never
//! touch any of it directly. After each message bundle the server runs one
//! region-rebuild pass and pushes the resulting paint requests, so no
//! primitive ever draws through a stale clip.

pub mod app;
pub mod port;
pub mod protocol;
pub mod server;
pub mod view;

pub use app::{ServerApplication, ViewDockType};
pub use port::{PortError, PortId, PortRegistry};
pub use protocol::{
    BundleReader, BundleWriter, Envelope, MessageCode, MotionEvent, PayloadReader, PayloadWriter,
};
pub use server::AppServer;
pub use view::{FocusKeyboardMode, ScreenContext, SendCtx, ServerView, ViewFlags, ViewHandle, ViewTree};
