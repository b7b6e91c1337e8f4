//! App-server message protocol: code space, envelope framing, and the
//! byte-level argument marshalling shared by server and clients.
//!
//! A port receives either a single envelope or a `MessageBundle` whose
//! payload is a concatenation of framed records `{length, target_handler,
//! code, args...}`. Each record must be at least header sized and fit the
//! remaining payload; a malformed frame aborts only its bundle. Multi-byte
//! fields are little-endian; server and clients share one address space, so
//! the layout never leaves the machine.

use core_geom::{Color, IPoint, IRect, Point, Rect};

/// One message as it travels through a port.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub target_handler: i32,
    pub code: i32,
    pub payload: Vec<u8>,
}

pub const BUNDLE_HEADER_SIZE: usize = 12;

/// Soft cap a client batches up to before flushing a bundle.
pub const MSG_BUFFER_SIZE: usize = 1024 * 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageCode {
    None = 0,
    // Appserver-bound:
    MessageBundle,
    RegisterApplication,
    // Application-bound:
    Sync,
    CreateView,
    DeleteView,
    FocusView,
    SetKeyboardFocus,
    CreateBitmap,
    DeleteBitmap,
    // View-scoped mutators:
    ViewSetFrame,
    ViewInvalidate,
    ViewAddChild,
    ViewSetDrawRegion,
    ViewSetShapeRegion,
    ViewToggleDepth,
    ViewBeginUpdate,
    ViewEndUpdate,
    ViewShow,
    ViewSetFocusKeyboardMode,
    ViewSetDrawingMode,
    ViewSetFgColor,
    ViewSetBgColor,
    ViewSetEraseColor,
    ViewSetFont,
    ViewMovePenTo,
    ViewSetPenWidth,
    ViewDrawLine1,
    ViewDrawLine2,
    ViewFillRect,
    ViewFillCircle,
    ViewDrawString,
    ViewScrollBy,
    ViewCopyRect,
    ViewDrawBitmap,
    ViewDrawScaledBitmap,
    ViewDebugDraw,
    // Server -> client replies:
    RegisterApplicationReply,
    CreateViewReply,
    CreateBitmapReply,
    PaintView,
    ViewFrameChanged,
    ViewFocusChanged,
    // Server <-> window manager:
    WindowManagerRegisterView,
    WindowManagerUnregisterView,
    WindowManagerEnableVKeyboard,
    WindowManagerDisableVKeyboard,
    // Server -> application:
    SyncReply,
    HandleMouseDown,
    HandleMouseUp,
    HandleMouseMove,
    // Input-driver messages (touch screen, keyboard):
    MouseDown = 0x1000,
    MouseUp,
    MouseMove,
    KeyDown,
    KeyUp,
    /// Shut the looper down (used by the diagnostic binary and tests).
    Quit = 0x2000,
}

impl MessageCode {
    pub fn from_i32(value: i32) -> Option<MessageCode> {
        use MessageCode::*;
        const CODES: &[MessageCode] = &[
            None,
            MessageBundle,
            RegisterApplication,
            Sync,
            CreateView,
            DeleteView,
            FocusView,
            SetKeyboardFocus,
            CreateBitmap,
            DeleteBitmap,
            ViewSetFrame,
            ViewInvalidate,
            ViewAddChild,
            ViewSetDrawRegion,
            ViewSetShapeRegion,
            ViewToggleDepth,
            ViewBeginUpdate,
            ViewEndUpdate,
            ViewShow,
            ViewSetFocusKeyboardMode,
            ViewSetDrawingMode,
            ViewSetFgColor,
            ViewSetBgColor,
            ViewSetEraseColor,
            ViewSetFont,
            ViewMovePenTo,
            ViewSetPenWidth,
            ViewDrawLine1,
            ViewDrawLine2,
            ViewFillRect,
            ViewFillCircle,
            ViewDrawString,
            ViewScrollBy,
            ViewCopyRect,
            ViewDrawBitmap,
            ViewDrawScaledBitmap,
            ViewDebugDraw,
            RegisterApplicationReply,
            CreateViewReply,
            CreateBitmapReply,
            PaintView,
            ViewFrameChanged,
            ViewFocusChanged,
            WindowManagerRegisterView,
            WindowManagerUnregisterView,
            WindowManagerEnableVKeyboard,
            WindowManagerDisableVKeyboard,
            SyncReply,
            HandleMouseDown,
            HandleMouseUp,
            HandleMouseMove,
            MouseDown,
            MouseUp,
            MouseMove,
            KeyDown,
            KeyUp,
            Quit,
        ];
        CODES.iter().copied().find(|&c| c as i32 == value)
    }
}

/// Pointing-device sample, as posted by the touch or mouse driver. Touch
/// IDs at or above `FIRST_TOUCH_ID` identify individual fingers; a plain
/// mouse reports button IDs below it and routes as device zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionEvent {
    pub event: MessageCode,
    pub button_id: i32,
    pub position: Point,
}

pub const FIRST_TOUCH_ID: i32 = 16;

/// Device ID a button/touch identifier routes under.
pub fn device_id_for_button(button_id: i32) -> i32 {
    if button_id < FIRST_TOUCH_ID {
        0
    } else {
        button_id
    }
}

// ---- argument marshalling ----------------------------------------------

/// Sequential little-endian writer for message payloads.
#[derive(Default)]
pub struct PayloadWriter {
    data: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.data.push(value as u8);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.data.extend_from_slice(value.as_bytes());
        self
    }

    pub fn put_point(&mut self, p: Point) -> &mut Self {
        self.put_f32(p.x).put_f32(p.y)
    }

    pub fn put_ipoint(&mut self, p: IPoint) -> &mut Self {
        self.put_i32(p.x).put_i32(p.y)
    }

    pub fn put_rect(&mut self, r: Rect) -> &mut Self {
        self.put_f32(r.left).put_f32(r.top).put_f32(r.right).put_f32(r.bottom)
    }

    pub fn put_irect(&mut self, r: IRect) -> &mut Self {
        self.put_i32(r.left).put_i32(r.top).put_i32(r.right).put_i32(r.bottom)
    }

    pub fn put_color(&mut self, c: Color) -> &mut Self {
        self.put_u32(c.to_rgb32())
    }
}

/// Sequential reader over a payload. Every accessor fails softly with
/// `None` past the end, so a truncated message never panics the server.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.take(4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32(&mut self) -> Option<f32> {
        self.take(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bool(&mut self) -> Option<bool> {
        self.take(1).map(|b| b[0] != 0)
    }

    pub fn str(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn point(&mut self) -> Option<Point> {
        Some(Point::new(self.f32()?, self.f32()?))
    }

    pub fn ipoint(&mut self) -> Option<IPoint> {
        Some(IPoint::new(self.i32()?, self.i32()?))
    }

    pub fn rect(&mut self) -> Option<Rect> {
        Some(Rect::new(self.f32()?, self.f32()?, self.f32()?, self.f32()?))
    }

    pub fn irect(&mut self) -> Option<IRect> {
        Some(IRect::new(self.i32()?, self.i32()?, self.i32()?, self.i32()?))
    }

    pub fn color(&mut self) -> Option<Color> {
        self.u32().map(Color::from_rgb32)
    }
}

// ---- bundle framing -----------------------------------------------------

/// Builds a `MessageBundle` payload out of framed records.
#[derive(Default)]
pub struct BundleWriter {
    data: Vec<u8>,
}

impl BundleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target_handler: i32, code: MessageCode, payload: &[u8]) {
        let length = (BUNDLE_HEADER_SIZE + payload.len()) as i32;
        self.data.extend_from_slice(&length.to_le_bytes());
        self.data.extend_from_slice(&target_handler.to_le_bytes());
        self.data.extend_from_slice(&(code as i32).to_le_bytes());
        self.data.extend_from_slice(payload);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// One framed record inside a bundle.
pub struct BundleRecord<'a> {
    pub target_handler: i32,
    pub code: i32,
    pub payload: &'a [u8],
}

/// Walks the framed records of a bundle payload. A record with a length
/// below the header size or past the end of the payload aborts the walk;
/// records already consumed stay processed.
pub struct BundleReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BundleReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn next(&mut self) -> Option<Result<BundleRecord<'a>, BundleError>> {
        if self.pos >= self.data.len() {
            return None;
        }
        if self.data.len() - self.pos < BUNDLE_HEADER_SIZE {
            return Some(Err(BundleError::Truncated));
        }
        let at = self.pos;
        let length = i32::from_le_bytes(self.data[at..at + 4].try_into().unwrap());
        let target = i32::from_le_bytes(self.data[at + 4..at + 8].try_into().unwrap());
        let code = i32::from_le_bytes(self.data[at + 8..at + 12].try_into().unwrap());
        if (length as usize) < BUNDLE_HEADER_SIZE || at + length as usize > self.data.len() {
            return Some(Err(BundleError::BadLength {
                code,
                length,
            }));
        }
        self.pos = at + length as usize;
        Some(Ok(BundleRecord {
            target_handler: target,
            code,
            payload: &self.data[at + BUNDLE_HEADER_SIZE..at + length as usize],
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleError {
    Truncated,
    BadLength { code: i32, length: i32 },
}

pub fn encode_motion_event(event: &MotionEvent) -> Vec<u8> {
    let mut writer = PayloadWriter::new();
    writer
        .put_i32(event.event as i32)
        .put_i32(event.button_id)
        .put_point(event.position);
    writer.into_bytes()
}

pub fn decode_motion_event(payload: &[u8]) -> Option<MotionEvent> {
    let mut reader = PayloadReader::new(payload);
    let event = MessageCode::from_i32(reader.i32()?)?;
    Some(MotionEvent {
        event,
        button_id: reader.i32()?,
        position: reader.point()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let mut w = PayloadWriter::new();
        w.put_i32(-5)
            .put_str("hello")
            .put_rect(Rect::new(1.0, 2.0, 3.0, 4.0))
            .put_bool(true);
        let bytes = w.into_bytes();
        let mut r = PayloadReader::new(&bytes);
        assert_eq!(r.i32(), Some(-5));
        assert_eq!(r.str().as_deref(), Some("hello"));
        assert_eq!(r.rect(), Some(Rect::new(1.0, 2.0, 3.0, 4.0)));
        assert_eq!(r.bool(), Some(true));
        assert_eq!(r.i32(), None);
    }

    #[test]
    fn bundle_frames_walk_in_order() {
        let mut w = BundleWriter::new();
        w.push(7, MessageCode::ViewShow, &[1]);
        w.push(9, MessageCode::ViewToggleDepth, &[]);
        let bytes = w.into_bytes();
        let mut reader = BundleReader::new(&bytes);
        let first = reader.next().unwrap().unwrap();
        assert_eq!(first.target_handler, 7);
        assert_eq!(first.code, MessageCode::ViewShow as i32);
        assert_eq!(first.payload, &[1]);
        let second = reader.next().unwrap().unwrap();
        assert_eq!(second.target_handler, 9);
        assert!(reader.next().is_none());
    }

    #[test]
    fn malformed_frame_aborts_bundle() {
        let mut w = BundleWriter::new();
        w.push(7, MessageCode::ViewShow, &[1]);
        let mut bytes = w.into_bytes();
        // Append a frame that claims to be longer than the payload.
        bytes.extend_from_slice(&100i32.to_le_bytes());
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        let mut reader = BundleReader::new(&bytes);
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(
            reader.next(),
            Some(Err(BundleError::BadLength { .. }))
        ));
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4i32.to_le_bytes()); // < header size
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        let mut reader = BundleReader::new(&bytes);
        assert!(matches!(
            reader.next(),
            Some(Err(BundleError::BadLength { .. }))
        ));
    }

    #[test]
    fn motion_event_round_trip() {
        let event = MotionEvent {
            event: MessageCode::MouseMove,
            button_id: 17,
            position: Point::new(12.0, 34.0),
        };
        let decoded = decode_motion_event(&encode_motion_event(&event)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn touch_ids_route_per_finger() {
        assert_eq!(device_id_for_button(0), 0);
        assert_eq!(device_id_for_button(3), 0);
        assert_eq!(device_id_for_button(FIRST_TOUCH_ID + 2), FIRST_TOUCH_ID + 2);
    }
}
