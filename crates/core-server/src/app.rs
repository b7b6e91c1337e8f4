//! Per-application server handler: bundle processing and the slots behind
//! every application-bound protocol message.
//!
//! A bundle is processed atomically with respect to other server work, and
//! one region-rebuild pass runs after it drains, so a `set_frame` followed
//! by a drawing op in the same bundle observes the new frame for clipping.

use crate::port::PortId;
use crate::protocol::{
    BundleReader, Envelope, MessageCode, PayloadReader, PayloadWriter,
};
use crate::server::AppServer;
use crate::view::{
    FocusKeyboardMode, SendCtx, ServerView, ViewFlags, ViewHandle,
};
use ahash::AHashMap;
use core_display::{DrawingMode, FontId, ServerBitmap};
use core_geom::{ColorSpace, IPoint, Region};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Where a freshly created view docks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDockType {
    /// Child of an existing server view.
    ChildView,
    /// Child of the top view, managed by the window manager.
    RootLevelView,
    /// The top view itself (server internal).
    TopLevelView,
}

impl ViewDockType {
    pub fn from_i32(value: i32) -> ViewDockType {
        match value {
            1 => ViewDockType::RootLevelView,
            2 => ViewDockType::TopLevelView,
            _ => ViewDockType::ChildView,
        }
    }
}

/// Server-side state for one registered application.
pub struct ServerApplication {
    pub handle: ViewHandle,
    pub name: String,
    pub client_port: PortId,
    pub bitmaps: AHashMap<i32, ServerBitmap>,
    next_bitmap_handle: i32,
    pub have_invalid_regions: bool,
}

impl ServerApplication {
    pub fn new(handle: ViewHandle, name: String, client_port: PortId) -> Self {
        Self {
            handle,
            name,
            client_port,
            bitmaps: AHashMap::new(),
            next_bitmap_handle: 0,
            have_invalid_regions: false,
        }
    }

    pub fn bitmap(&self, handle: i32) -> Option<&ServerBitmap> {
        self.bitmaps.get(&handle)
    }
}

impl AppServer {
    /// Process a `MessageBundle`: walk the framed records, dispatch each,
    /// then run the region-rebuild pass. A malformed frame aborts the rest
    /// of its bundle only.
    pub(crate) fn handle_bundle(&mut self, app_handle: ViewHandle, payload: &[u8]) {
        let data = payload.to_vec();
        let mut reader = BundleReader::new(&data);
        while let Some(record) = reader.next() {
            match record {
                Ok(record) => {
                    self.process_app_message(
                        app_handle,
                        record.target_handler,
                        record.code,
                        record.payload,
                    );
                }
                Err(err) => {
                    error!(target: "appserver", ?err, "malformed message in bundle");
                    break;
                }
            }
        }
        self.run_region_update(app_handle);
    }

    pub(crate) fn run_region_update(&mut self, app_handle: ViewHandle) {
        let ctx = SendCtx {
            ports: &self.ports,
            window_manager_port: self.window_manager_port,
        };
        self.tree
            .update_regions(self.tree.top, &mut self.screen, &ctx);
        if let Some(app) = self.apps.get_mut(&app_handle) {
            app.have_invalid_regions = false;
        }
    }

    fn process_app_message(
        &mut self,
        app_handle: ViewHandle,
        target_handler: ViewHandle,
        code: i32,
        payload: &[u8],
    ) {
        let Some(code) = MessageCode::from_i32(code) else {
            warn!(target: "appserver", code, "unknown message code in bundle");
            return;
        };
        let mut args = PayloadReader::new(payload);
        match code {
            MessageCode::Sync => {
                if let Some(reply_port) = args.u32() {
                    self.post(reply_port, -1, MessageCode::SyncReply, Vec::new());
                }
            }
            MessageCode::CreateView => self.slot_create_view(app_handle, &mut args),
            MessageCode::DeleteView => self.slot_delete_view(&mut args),
            MessageCode::FocusView => {
                if let (Some(view), Some(button), Some(focus)) =
                    (args.i32(), args.i32(), args.bool())
                {
                    if self.tree.contains(view) {
                        self.set_focus_view(button, view, focus);
                    }
                }
            }
            MessageCode::SetKeyboardFocus => {
                if let (Some(view), Some(focus)) = (args.i32(), args.bool()) {
                    if self.tree.contains(view) {
                        self.set_keyboard_focus(Some(view), focus);
                    }
                }
            }
            MessageCode::CreateBitmap => self.slot_create_bitmap(app_handle, &mut args),
            MessageCode::DeleteBitmap => {
                if let Some(handle) = args.i32() {
                    let Some(app) = self.apps.get_mut(&app_handle) else {
                        return;
                    };
                    if app.bitmaps.remove(&handle).is_none() {
                        error!(target: "appserver", handle, "delete of unknown bitmap handle");
                    }
                }
            }
            MessageCode::ViewSetFrame => {
                if let (Some(frame), Some(requesting)) = (args.rect(), args.i32()) {
                    if !self.tree.contains(target_handler) {
                        error!(target: "appserver", view = target_handler, "set_frame on unknown view");
                        return;
                    }
                    let prev = self.tree.view(target_handler).iframe();
                    let ctx = SendCtx {
                        ports: &self.ports,
                        window_manager_port: self.window_manager_port,
                    };
                    let requesting = (requesting >= 0).then_some(requesting);
                    self.tree.set_frame(target_handler, frame, requesting, &ctx);
                    let mut modified = prev | self.tree.view(target_handler).iframe();
                    let start = self.tree.view(target_handler).parent.unwrap_or(target_handler);
                    let opaque = self.tree.opaque_parent(start, &mut modified);
                    self.tree.mark_modified(opaque, modified);
                    self.mark_app_invalid(app_handle);
                }
            }
            MessageCode::ViewInvalidate => {
                if let Some(rect) = args.irect() {
                    if !self.tree.contains(target_handler) {
                        error!(target: "appserver", view = target_handler, "invalidate on unknown view");
                        return;
                    }
                    let scroll = IPoint::from(self.tree.view(target_handler).scroll_offset);
                    let mut invalid = rect + scroll;
                    let opaque = self.tree.opaque_parent(target_handler, &mut invalid);
                    self.tree.add_damage(opaque, invalid);
                    self.mark_app_invalid(app_handle);
                }
            }
            MessageCode::ViewAddChild => {
                if let (Some(index), Some(parent), Some(child), Some(manager)) =
                    (args.u32(), args.i32(), args.i32(), args.i32())
                {
                    self.slot_add_child(app_handle, index, parent, child, manager);
                }
            }
            MessageCode::ViewSetDrawRegion => {
                if let Some(region) = read_region(&mut args) {
                    if self.tree.contains(target_handler) {
                        self.tree.set_draw_region(target_handler, region);
                        self.mark_app_invalid(app_handle);
                    }
                }
            }
            MessageCode::ViewSetShapeRegion => {
                if let Some(region) = read_region(&mut args) {
                    if self.tree.contains(target_handler) {
                        self.tree.set_shape_region(target_handler, region);
                        self.mark_app_invalid(app_handle);
                    }
                }
            }
            MessageCode::ViewToggleDepth => {
                if self.tree.contains(target_handler) {
                    let ctx = SendCtx {
                        ports: &self.ports,
                        window_manager_port: self.window_manager_port,
                    };
                    self.tree.toggle_depth(target_handler, &mut self.screen, &ctx);
                }
            }
            MessageCode::ViewBeginUpdate => {
                if self.tree.contains(target_handler) {
                    self.tree.begin_update(target_handler);
                }
            }
            MessageCode::ViewEndUpdate => {
                if self.tree.contains(target_handler) {
                    let ctx = SendCtx {
                        ports: &self.ports,
                        window_manager_port: self.window_manager_port,
                    };
                    self.tree.end_update(target_handler, &ctx);
                }
            }
            MessageCode::ViewShow => {
                if let Some(show) = args.bool() {
                    self.slot_show_view(app_handle, target_handler, show);
                }
            }
            MessageCode::ViewSetFocusKeyboardMode => {
                if let Some(mode) = args.i32() {
                    if self.tree.contains(target_handler) {
                        let mode = FocusKeyboardMode::from_i32(mode);
                        if self.tree.view(target_handler).focus_keyboard_mode != mode {
                            self.tree.view_mut(target_handler).focus_keyboard_mode = mode;
                            self.update_view_focus_mode(target_handler);
                        }
                    }
                }
            }
            MessageCode::ViewSetDrawingMode => {
                if let Some(mode) = args.i32() {
                    if self.tree.contains(target_handler) {
                        self.tree.view_mut(target_handler).drawing_mode = match mode {
                            1 => DrawingMode::Overlay,
                            2 => DrawingMode::Blend,
                            _ => DrawingMode::Copy,
                        };
                    }
                }
            }
            MessageCode::ViewSetFgColor => {
                if let Some(color) = args.color() {
                    if self.tree.contains(target_handler) {
                        self.tree.view_mut(target_handler).fg_color = color;
                    }
                }
            }
            MessageCode::ViewSetBgColor => {
                if let Some(color) = args.color() {
                    if self.tree.contains(target_handler) {
                        self.tree.view_mut(target_handler).bg_color = color;
                    }
                }
            }
            MessageCode::ViewSetEraseColor => {
                if let Some(color) = args.color() {
                    if self.tree.contains(target_handler) {
                        self.tree.view_mut(target_handler).erase_color = color;
                    }
                }
            }
            MessageCode::ViewSetFont => {
                if let Some(font) = args.i32() {
                    if self.tree.contains(target_handler) {
                        if let Some(font) = FontId::from_raw(font) {
                            self.tree.view_mut(target_handler).font = font;
                        }
                    }
                }
            }
            MessageCode::ViewMovePenTo => {
                if let Some(pos) = args.point() {
                    if self.tree.contains(target_handler) {
                        self.tree.view_mut(target_handler).pen_position = pos;
                    }
                }
            }
            MessageCode::ViewSetPenWidth => {
                if let Some(width) = args.f32() {
                    if self.tree.contains(target_handler) {
                        self.tree.view_mut(target_handler).pen_width = width;
                    }
                }
            }
            MessageCode::ViewDrawLine1 => {
                if let Some(to) = args.point() {
                    if self.tree.contains(target_handler) {
                        self.tree.draw_line_from_pen(target_handler, &mut self.screen, to);
                    }
                }
            }
            MessageCode::ViewDrawLine2 => {
                if let (Some(from), Some(to)) = (args.point(), args.point()) {
                    if self.tree.contains(target_handler) {
                        self.tree.draw_line(target_handler, &mut self.screen, from, to);
                    }
                }
            }
            MessageCode::ViewFillRect => {
                if let (Some(rect), Some(color)) = (args.rect(), args.color()) {
                    if self.tree.contains(target_handler) {
                        self.tree.fill_rect(target_handler, &mut self.screen, rect, color);
                    }
                }
            }
            MessageCode::ViewFillCircle => {
                if let (Some(center), Some(radius)) = (args.point(), args.f32()) {
                    if self.tree.contains(target_handler) {
                        self.tree.fill_circle(target_handler, &mut self.screen, center, radius);
                    }
                }
            }
            MessageCode::ViewDrawString => {
                if let Some(text) = args.str() {
                    if self.tree.contains(target_handler) {
                        self.tree.draw_string(target_handler, &mut self.screen, &text);
                    }
                }
            }
            MessageCode::ViewScrollBy => {
                if let Some(delta) = args.point() {
                    if self.tree.contains(target_handler) {
                        let ctx = SendCtx {
                            ports: &self.ports,
                            window_manager_port: self.window_manager_port,
                        };
                        self.tree.scroll_by(target_handler, &mut self.screen, delta, &ctx);
                    }
                }
            }
            MessageCode::ViewCopyRect => {
                if let (Some(src), Some(dst)) = (args.rect(), args.point()) {
                    if self.tree.contains(target_handler) {
                        let ctx = SendCtx {
                            ports: &self.ports,
                            window_manager_port: self.window_manager_port,
                        };
                        self.tree.copy_rect(target_handler, &mut self.screen, src, dst, &ctx);
                    }
                }
            }
            MessageCode::ViewDrawBitmap => {
                if let (Some(bitmap), Some(src), Some(dst)) =
                    (args.i32(), args.rect(), args.point())
                {
                    if !self.tree.contains(target_handler) {
                        return;
                    }
                    let Some(app) = self.apps.remove(&app_handle) else {
                        return;
                    };
                    if let Some(bitmap) = app.bitmap(bitmap) {
                        self.tree
                            .draw_bitmap(target_handler, &mut self.screen, bitmap, src, dst);
                    } else {
                        error!(target: "appserver", bitmap, "draw of unknown bitmap handle");
                    }
                    self.apps.insert(app_handle, app);
                }
            }
            MessageCode::ViewDrawScaledBitmap => {
                if let (Some(bitmap), Some(src), Some(dst)) = (args.i32(), args.rect(), args.rect())
                {
                    // The framebuffer driver has no scaler; place the
                    // unscaled source at the destination origin.
                    debug!(target: "appserver", "scaled blit downgraded to unscaled copy");
                    if !self.tree.contains(target_handler) {
                        return;
                    }
                    let Some(app) = self.apps.remove(&app_handle) else {
                        return;
                    };
                    if let Some(bitmap) = app.bitmap(bitmap) {
                        self.tree.draw_bitmap(
                            target_handler,
                            &mut self.screen,
                            bitmap,
                            src,
                            dst.top_left(),
                        );
                    }
                    self.apps.insert(app_handle, app);
                }
            }
            MessageCode::ViewDebugDraw => {
                if let (Some(color), Some(flags)) = (args.color(), args.u32()) {
                    if self.tree.contains(target_handler) {
                        self.tree.debug_draw(
                            target_handler,
                            &mut self.screen,
                            color,
                            flags & 0x1 != 0,
                            flags & 0x2 != 0,
                            flags & 0x4 != 0,
                        );
                    }
                }
            }
            other => {
                warn!(target: "appserver", code = ?other, "unexpected code inside bundle");
            }
        }
    }

    fn slot_create_view(&mut self, app_handle: ViewHandle, args: &mut PayloadReader<'_>) {
        let Some(client_port) = args.u32() else { return };
        let Some(reply_port) = args.u32() else { return };
        let Some(reply_target) = args.i32() else { return };
        let Some(parent_handle) = args.i32() else { return };
        let Some(dock_type) = args.i32().map(ViewDockType::from_i32) else { return };
        let Some(index) = args.i32() else { return };
        let Some(name) = args.str() else { return };
        let Some(frame) = args.rect() else { return };
        let Some(scroll_offset) = args.point() else { return };
        let Some(flags) = args.u32() else { return };
        let Some(hide_count) = args.i32() else { return };
        let Some(focus_mode) = args.i32() else { return };
        let Some(drawing_mode) = args.i32() else { return };
        let Some(pen_width) = args.f32() else { return };
        let Some(font) = args.i32() else { return };
        let Some(erase_color) = args.color() else { return };
        let Some(bg_color) = args.color() else { return };
        let Some(fg_color) = args.color() else { return };

        let parent = match dock_type {
            ViewDockType::RootLevelView | ViewDockType::TopLevelView => Some(self.tree.top),
            ViewDockType::ChildView => {
                if self.tree.contains(parent_handle) {
                    Some(parent_handle)
                } else {
                    let mut payload = PayloadWriter::new();
                    payload.put_i32(-1);
                    self.post(reply_port, -1, MessageCode::CreateViewReply, payload.into_bytes());
                    return;
                }
            }
        };

        let view = ServerView::new(
            name.clone(),
            frame,
            scroll_offset,
            ViewFlags::from_bits_truncate(flags),
            hide_count,
            FocusKeyboardMode::from_i32(focus_mode),
            match drawing_mode {
                1 => DrawingMode::Overlay,
                2 => DrawingMode::Blend,
                _ => DrawingMode::Copy,
            },
            pen_width,
            FontId::from_raw(font).unwrap_or(FontId::Large),
            erase_color,
            bg_color,
            fg_color,
        );
        let handle = self.alloc_handle();
        self.tree.insert(handle, view);

        match parent {
            Some(parent) => {
                let index = (index >= 0).then_some(index as usize);
                self.tree.add_child(parent, handle, index);
            }
            None => {
                self.tree.view_mut(handle).is_window_manager_controlled = true;
                let mut payload = PayloadWriter::new();
                payload
                    .put_i32(handle)
                    .put_i32(0)
                    .put_str(&name)
                    .put_rect(frame);
                self.post_to_window_manager(
                    MessageCode::WindowManagerRegisterView,
                    payload.into_bytes(),
                );
            }
        }
        {
            let view = self.tree.view_mut(handle);
            view.client_port = Some(client_port);
            view.client_handle = Some(reply_target);
        }

        let mut payload = PayloadWriter::new();
        payload.put_i32(handle);
        self.post(reply_port, -1, MessageCode::CreateViewReply, payload.into_bytes());

        self.tree.invalidate_all(handle, true);
        if let Some(parent) = parent {
            let mut modified = self.tree.view(handle).iframe();
            let opaque = self.tree.opaque_parent(parent, &mut modified);
            self.tree.mark_modified(opaque, modified);
            self.mark_app_invalid(app_handle);
        }
    }

    fn slot_delete_view(&mut self, args: &mut PayloadReader<'_>) {
        let Some(handle) = args.i32() else { return };
        if !self.tree.contains(handle) || handle == self.tree.top {
            error!(target: "appserver", view = handle, "delete of unknown view");
            return;
        }
        let mut modified = self.tree.view(handle).iframe();
        let start = self.tree.view(handle).parent;
        if self.tree.view(handle).is_window_manager_controlled {
            let mut payload = PayloadWriter::new();
            payload.put_i32(handle);
            self.post_to_window_manager(
                MessageCode::WindowManagerUnregisterView,
                payload.into_bytes(),
            );
        }
        let removed = self.tree.remove_subtree(handle);
        for view in removed {
            self.view_destructed(view);
        }
        if let Some(start) = start {
            let opaque = self.tree.opaque_parent(start, &mut modified);
            self.tree.mark_modified(opaque, modified);
            self.mark_all_apps_invalid();
        }
    }

    fn slot_add_child(
        &mut self,
        app_handle: ViewHandle,
        index: u32,
        parent: ViewHandle,
        child: ViewHandle,
        manager_handle: ViewHandle,
    ) {
        if !self.tree.contains(parent) || !self.tree.contains(child) {
            return;
        }
        self.tree.view_mut(child).manager_handle = (manager_handle >= 0).then_some(manager_handle);
        let index = (index != u32::MAX).then_some(index as usize);
        self.tree.add_child(parent, child, index);

        let mut modified = self.tree.view(parent).iframe();
        let start = self.tree.view(parent).parent.unwrap_or(parent);
        let opaque = self.tree.opaque_parent(start, &mut modified);
        self.tree.mark_modified(opaque, modified);
        self.mark_app_invalid(app_handle);
    }

    fn slot_show_view(&mut self, app_handle: ViewHandle, handle: ViewHandle, show: bool) {
        if !self.tree.contains(handle) {
            error!(target: "appserver", view = handle, "show on unknown view");
            return;
        }
        // Regions must be current before the visibility flip so the old
        // coverage is accounted for.
        if self
            .apps
            .get(&app_handle)
            .is_some_and(|app| app.have_invalid_regions)
        {
            self.run_region_update(app_handle);
        }
        let was_visible = self.tree.view(handle).is_visible();
        self.tree.show(handle, show);
        if self.tree.view(handle).is_visible() != was_visible {
            if let Some(parent) = self.tree.view(handle).parent {
                let mut modified = self.tree.view(handle).iframe();
                let opaque = self.tree.opaque_parent(parent, &mut modified);
                self.tree.mark_modified(opaque, modified);
                self.mark_app_invalid(app_handle);
            }
        }
    }

    fn slot_create_bitmap(&mut self, app_handle: ViewHandle, args: &mut PayloadReader<'_>) {
        let Some(reply_port) = args.u32() else { return };
        let Some(width) = args.i32() else { return };
        let Some(height) = args.i32() else { return };
        let Some(color_space) = args.i32() else { return };
        let Some(_flags) = args.u32() else { return };

        let color_space = match color_space {
            1 => ColorSpace::Cmap8,
            2 => ColorSpace::Rgb15,
            3 => ColorSpace::Rgb16,
            4 => ColorSpace::Rgb24,
            _ => ColorSpace::Rgb32,
        };
        let bitmap = ServerBitmap::new(IPoint::new(width, height), color_space);
        let bytes_per_row = bitmap.bytes_per_line();

        let Some(app) = self.apps.get_mut(&app_handle) else {
            return;
        };
        app.next_bitmap_handle += 1;
        let handle = app.next_bitmap_handle;
        app.bitmaps.insert(handle, bitmap);

        let mut payload = PayloadWriter::new();
        payload.put_i32(handle).put_u32(bytes_per_row as u32);
        self.post(reply_port, -1, MessageCode::CreateBitmapReply, payload.into_bytes());
    }

    pub(crate) fn post(&self, port: PortId, target: ViewHandle, code: MessageCode, payload: Vec<u8>) {
        let envelope = Envelope {
            target_handler: target,
            code: code as i32,
            payload,
        };
        if let Err(err) = self.ports.send(port, envelope, Duration::ZERO) {
            error!(target: "appserver", ?err, ?code, "failed to send message");
        }
    }

    pub(crate) fn post_to_window_manager(&self, code: MessageCode, payload: Vec<u8>) {
        if let Some(port) = self.window_manager_port {
            self.post(port, -1, code, payload);
        }
    }

    pub(crate) fn mark_app_invalid(&mut self, app_handle: ViewHandle) {
        if let Some(app) = self.apps.get_mut(&app_handle) {
            app.have_invalid_regions = true;
        }
    }

    fn mark_all_apps_invalid(&mut self) {
        for app in self.apps.values_mut() {
            app.have_invalid_regions = true;
        }
    }
}

/// Regions travel as a rectangle count followed by that many IRects.
fn read_region(args: &mut PayloadReader<'_>) -> Option<Option<Region>> {
    let count = args.u32()?;
    if count == u32::MAX {
        return Some(None); // Explicit "clear the constraint".
    }
    let mut region = Region::empty();
    for _ in 0..count {
        region.include(args.irect()?);
    }
    Some(Some(region))
}
