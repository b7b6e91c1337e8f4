//! The app-server looper.
//!
//! One thread owns the whole compositor state and reads framed messages
//! from one port: registrations, message bundles from clients, and input
//! events from the touch/keyboard drivers. Input is dispatched from the
//! idle path so a burst of `MouseMove` samples collapses to the newest one
//! before anyone sees it.

use crate::app::ServerApplication;
use crate::port::{PortId, PortRegistry};
use crate::protocol::{
    decode_motion_event, device_id_for_button, Envelope, MessageCode, MotionEvent, PayloadWriter,
};
use crate::view::{FocusKeyboardMode, ScreenContext, ServerView, ViewFlags, ViewHandle};
use ahash::AHashMap;
use core_display::{DisplayDriver, DrawingMode, FontId};
use core_geom::{Color, Point, Rect};
use crossbeam_channel::{Receiver, TryRecvError};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info, warn};

const KEYBOARD_SEND_TIMEOUT: Duration = Duration::from_millis(500);
const SERVER_PORT_CAPACITY: usize = 256;

pub struct AppServer {
    pub(crate) ports: PortRegistry,
    receiver: Receiver<Envelope>,
    port_id: PortId,
    pub tree: crate::view::ViewTree,
    pub screen: ScreenContext,
    pub(crate) apps: AHashMap<ViewHandle, ServerApplication>,
    next_handle: ViewHandle,
    mouse_queue: VecDeque<MotionEvent>,
    mouse_down_views: AHashMap<i32, ViewHandle>,
    focus_views: AHashMap<i32, ViewHandle>,
    keyboard_focus: Option<ViewHandle>,
    pub(crate) window_manager_port: Option<PortId>,
    quit: bool,
}

impl AppServer {
    /// Bring the server up on a fresh port: open the display, create the
    /// screen bitmap and the top view that owns the whole screen.
    pub fn new(driver: Box<dyn DisplayDriver>, ports: PortRegistry) -> Self {
        let (port_id, receiver) = ports.create_port(SERVER_PORT_CAPACITY);
        let bitmap = driver.create_screen_bitmap();
        let resolution = driver.resolution();
        let screen_frame = Rect::new(0.0, 0.0, resolution.x as f32, resolution.y as f32);

        let top_view = ServerView::new(
            "::topview::".to_owned(),
            screen_frame,
            Point::default(),
            ViewFlags::IGNORE_MOUSE,
            0,
            FocusKeyboardMode::None,
            DrawingMode::Copy,
            1.0,
            FontId::Large,
            Color::from_rgb32(0xffff_ffff),
            Color::from_rgb32(0xffff_ffff),
            Color::from_rgb32(0),
        );
        const TOP_HANDLE: ViewHandle = 1;

        info!(target: "appserver", ?resolution, "application server started");
        Self {
            ports,
            receiver,
            port_id,
            tree: crate::view::ViewTree::new(TOP_HANDLE, top_view),
            screen: ScreenContext { driver, bitmap },
            apps: AHashMap::new(),
            next_handle: TOP_HANDLE,
            mouse_queue: VecDeque::new(),
            mouse_down_views: AHashMap::new(),
            focus_views: AHashMap::new(),
            keyboard_focus: None,
            window_manager_port: None,
            quit: false,
        }
    }

    pub fn port(&self) -> PortId {
        self.port_id
    }

    pub fn set_window_manager_port(&mut self, port: Option<PortId>) {
        self.window_manager_port = port;
    }

    pub(crate) fn alloc_handle(&mut self) -> ViewHandle {
        self.next_handle += 1;
        self.next_handle
    }

    pub fn application(&self, handle: ViewHandle) -> Option<&ServerApplication> {
        self.apps.get(&handle)
    }

    /// In-process bitmap access for clients sharing our address space (the
    /// device hands out the raster pointer instead).
    pub fn application_bitmap_mut(
        &mut self,
        app: ViewHandle,
        bitmap: i32,
    ) -> Option<&mut core_display::ServerBitmap> {
        self.apps.get_mut(&app).and_then(|app| app.bitmaps.get_mut(&bitmap))
    }

    /// Run until the port closes or a `Quit` message arrives. Queued input
    /// is dispatched whenever the port drains.
    pub fn run(&mut self) {
        while !self.quit {
            match self.receiver.try_recv() {
                Ok(envelope) => self.handle_message(envelope),
                Err(TryRecvError::Empty) => {
                    if self.mouse_queue.is_empty() {
                        match self.receiver.recv() {
                            Ok(envelope) => self.handle_message(envelope),
                            Err(_) => break,
                        }
                    } else {
                        self.dispatch_pending_input();
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    pub fn handle_message(&mut self, envelope: Envelope) {
        match MessageCode::from_i32(envelope.code) {
            Some(MessageCode::RegisterApplication) => self.slot_register_application(&envelope),
            Some(MessageCode::MessageBundle) => {
                if self.apps.contains_key(&envelope.target_handler) {
                    self.handle_bundle(envelope.target_handler, &envelope.payload);
                } else {
                    error!(
                        target: "appserver",
                        handler = envelope.target_handler,
                        "bundle for unknown application"
                    );
                }
            }
            Some(MessageCode::MouseDown) | Some(MessageCode::MouseUp) => {
                if let Some(event) = decode_motion_event(&envelope.payload) {
                    self.mouse_queue.push_back(event);
                }
            }
            Some(MessageCode::MouseMove) => {
                if let Some(event) = decode_motion_event(&envelope.payload) {
                    // Consecutive moves collapse; only the newest position
                    // matters by the time anyone looks.
                    match self.mouse_queue.back_mut() {
                        Some(back) if back.event == MessageCode::MouseMove => *back = event,
                        _ => self.mouse_queue.push_back(event),
                    }
                }
            }
            Some(MessageCode::KeyDown) | Some(MessageCode::KeyUp) => {
                if let Some(focus) = self.keyboard_focus {
                    let view = self.tree.view(focus);
                    if let (Some(port), Some(client)) = (view.client_port, view.client_handle) {
                        let forwarded = Envelope {
                            target_handler: client,
                            code: envelope.code,
                            payload: envelope.payload.clone(),
                        };
                        if let Err(err) = self.ports.send(port, forwarded, KEYBOARD_SEND_TIMEOUT) {
                            error!(target: "appserver", ?err, "failed to forward key event");
                        }
                    }
                }
            }
            Some(MessageCode::Quit) => self.quit = true,
            other => {
                warn!(target: "appserver", code = ?other, raw = envelope.code, "unhandled message");
            }
        }
    }

    /// Drain the coalesced input queue (the looper's idle work).
    pub fn dispatch_pending_input(&mut self) {
        while let Some(event) = self.mouse_queue.pop_front() {
            match event.event {
                MessageCode::MouseDown => self.handle_mouse_down(&event),
                MessageCode::MouseUp => self.handle_mouse_up(&event),
                MessageCode::MouseMove => self.handle_mouse_move(&event),
                _ => {}
            }
        }
    }

    fn slot_register_application(&mut self, envelope: &Envelope) {
        let mut args = crate::protocol::PayloadReader::new(&envelope.payload);
        let (Some(reply_port), Some(client_port), Some(name)) =
            (args.u32(), args.u32(), args.str())
        else {
            error!(target: "appserver", "malformed application registration");
            return;
        };
        let handle = self.alloc_handle();
        info!(target: "appserver", name = %name, handle, "registering application");
        self.apps
            .insert(handle, ServerApplication::new(handle, name, client_port));

        let mut payload = PayloadWriter::new();
        payload.put_i32(handle);
        self.post(
            reply_port,
            -1,
            MessageCode::RegisterApplicationReply,
            payload.into_bytes(),
        );
    }

    // ---- pointer routing -------------------------------------------------

    fn send_mouse_event(
        &self,
        view: ViewHandle,
        code: MessageCode,
        button: i32,
        position: Point,
    ) {
        let v = self.tree.view(view);
        let (Some(port), Some(client)) = (v.client_port, v.client_handle) else {
            return;
        };
        let mut payload = PayloadWriter::new();
        payload.put_i32(button).put_point(position);
        self.post(port, client, code, payload.into_bytes());
    }

    fn handle_mouse_down(&mut self, event: &MotionEvent) {
        let Some((view, local)) = self.tree.mouse_claim_target(self.tree.top, event.position)
        else {
            return;
        };
        // The window manager hears about presses on managed views first.
        if let Some(manager) = self.tree.view(view).manager_handle {
            if let Some(port) = self.window_manager_port {
                let mut payload = PayloadWriter::new();
                payload.put_i32(event.button_id).put_point(local);
                self.post(port, manager, MessageCode::HandleMouseDown, payload.into_bytes());
            }
        }
        self.send_mouse_event(view, MessageCode::HandleMouseDown, event.button_id, local);
        self.set_mouse_down_view(event.button_id, Some(view));
    }

    fn handle_mouse_up(&mut self, event: &MotionEvent) {
        let down_view = self.mouse_down_view(event.button_id);
        if let Some(view) = down_view {
            let local = self.tree.convert_from_root(view, event.position);
            self.send_mouse_event(view, MessageCode::HandleMouseUp, event.button_id, local);
            self.set_mouse_down_view(event.button_id, None);
        }
        if let Some(focus) = self.focus_view(event.button_id) {
            if Some(focus) != down_view {
                let local = self.tree.convert_from_root(focus, event.position);
                self.send_mouse_event(focus, MessageCode::HandleMouseUp, event.button_id, local);
            }
        }
    }

    fn handle_mouse_move(&mut self, event: &MotionEvent) {
        let focus = self.focus_view(event.button_id);
        if let Some(view) = focus {
            let local = self.tree.convert_from_root(view, event.position);
            self.send_mouse_event(view, MessageCode::HandleMouseMove, event.button_id, local);
        }
        if let Some(keyboard) = self.keyboard_focus {
            if Some(keyboard) != focus {
                let local = self.tree.convert_from_root(keyboard, event.position);
                self.send_mouse_event(keyboard, MessageCode::HandleMouseMove, event.button_id, local);
            }
        }
    }

    pub fn set_mouse_down_view(&mut self, button: i32, view: Option<ViewHandle>) {
        let device = device_id_for_button(button);
        match view {
            Some(view) => {
                self.mouse_down_views.insert(device, view);
            }
            None => {
                self.mouse_down_views.remove(&device);
            }
        }
    }

    pub fn mouse_down_view(&self, button: i32) -> Option<ViewHandle> {
        self.mouse_down_views
            .get(&device_id_for_button(button))
            .copied()
    }

    pub fn set_focus_view(&mut self, button: i32, view: ViewHandle, focus: bool) {
        let device = device_id_for_button(button);
        if focus {
            self.focus_views.insert(device, view);
        } else if self.focus_views.get(&device) == Some(&view) {
            self.focus_views.remove(&device);
        }
    }

    pub fn focus_view(&self, button: i32) -> Option<ViewHandle> {
        self.focus_views.get(&device_id_for_button(button)).copied()
    }

    pub fn keyboard_focus(&self) -> Option<ViewHandle> {
        self.keyboard_focus
    }

    pub fn set_keyboard_focus(&mut self, view: Option<ViewHandle>, focus: bool) {
        if focus {
            self.keyboard_focus = view;
            if let Some(view) = view {
                if self.tree.view(view).focus_keyboard_mode != FocusKeyboardMode::None {
                    self.post_vkeyboard_request(view);
                }
            }
        } else if view == self.keyboard_focus {
            self.keyboard_focus = None;
            self.post_to_window_manager(
                MessageCode::WindowManagerDisableVKeyboard,
                Vec::new(),
            );
        }
    }

    /// React to a focus-mode change on the view currently holding keyboard
    /// focus.
    pub(crate) fn update_view_focus_mode(&mut self, view: ViewHandle) {
        if Some(view) != self.keyboard_focus {
            return;
        }
        if self.tree.view(view).focus_keyboard_mode != FocusKeyboardMode::None {
            self.post_vkeyboard_request(view);
        } else {
            self.post_to_window_manager(MessageCode::WindowManagerDisableVKeyboard, Vec::new());
        }
    }

    fn post_vkeyboard_request(&self, view: ViewHandle) {
        let v = self.tree.view(view);
        let frame = Rect::new(
            v.screen_pos.x,
            v.screen_pos.y,
            v.screen_pos.x + v.frame.width(),
            v.screen_pos.y + v.frame.height(),
        );
        let mut payload = PayloadWriter::new();
        payload
            .put_rect(frame)
            .put_bool(v.focus_keyboard_mode == FocusKeyboardMode::Numeric);
        self.post_to_window_manager(MessageCode::WindowManagerEnableVKeyboard, payload.into_bytes());
    }

    /// Purge a dying view from every routing table.
    pub(crate) fn view_destructed(&mut self, view: ViewHandle) {
        self.mouse_down_views.retain(|_, &mut v| v != view);
        self.focus_views.retain(|_, &mut v| v != view);
        if self.keyboard_focus == Some(view) {
            self.keyboard_focus = None;
        }
    }
}
