//! The server-side view tree.
//!
//! Views are arena-allocated and addressed by the same integer handles the
//! wire protocol uses. The tree is only ever touched from the server
//! thread; a single region-rebuild pass runs after each message bundle, so
//! nothing paints through stale clipping.
//!
//! Region invariants:
//! * `visible_reg ⊆ full_reg`, both in view-local coordinates.
//! * `active_damage_reg ⊆ visible_reg` while a client is repainting.
//! * A hidden view has no region caches at all.
//! * `screen_pos` is the absolute position of the view's content origin:
//!   `parent.screen_pos + parent.scroll_offset + frame.top_left`.

use crate::port::{PortId, PortRegistry};
use crate::protocol::{Envelope, MessageCode, PayloadWriter};
use ahash::AHashMap;
use bitflags::bitflags;
use core_display::{BlitSource, DisplayDriver, DrawingMode, FontId, ServerBitmap};
use core_geom::{Color, IPoint, IRect, Point, Rect, Region};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::error;

pub type ViewHandle = i32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ViewFlags: u32 {
        /// The view does not occlude what is behind it.
        const TRANSPARENT            = 0x01;
        /// Paint over children instead of clipping them out.
        const DRAW_ON_CHILDREN       = 0x02;
        const FULL_UPDATE_ON_RESIZE_H = 0x04;
        const FULL_UPDATE_ON_RESIZE_V = 0x08;
        const IGNORE_MOUSE           = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FocusKeyboardMode {
    None = 0,
    Alphanumeric,
    Numeric,
}

impl FocusKeyboardMode {
    pub fn from_i32(value: i32) -> FocusKeyboardMode {
        match value {
            1 => FocusKeyboardMode::Alphanumeric,
            2 => FocusKeyboardMode::Numeric,
            _ => FocusKeyboardMode::None,
        }
    }
}

/// Everything that gets painted on: the display driver plus the screen
/// bitmap it composites into.
pub struct ScreenContext {
    pub driver: Box<dyn DisplayDriver>,
    pub bitmap: ServerBitmap,
}

/// Outbound-messaging context for tree operations that notify clients.
pub struct SendCtx<'a> {
    pub ports: &'a PortRegistry,
    pub window_manager_port: Option<PortId>,
}

impl SendCtx<'_> {
    /// Fire-and-forget client send; failures are logged, never propagated.
    fn post(&self, port: PortId, target: ViewHandle, code: MessageCode, payload: Vec<u8>) {
        let envelope = Envelope {
            target_handler: target,
            code: code as i32,
            payload,
        };
        if let Err(err) = self.ports.send(port, envelope, Duration::ZERO) {
            error!(target: "appserver", ?err, ?code, "failed to send message to client");
        }
    }

    fn post_to_window_manager(&self, target: ViewHandle, code: MessageCode, payload: Vec<u8>) {
        if let Some(port) = self.window_manager_port {
            self.post(port, target, code, payload);
        }
    }
}

pub struct ServerView {
    pub name: String,
    pub frame: Rect,
    pub scroll_offset: Point,
    pub flags: ViewFlags,
    /// Visible iff zero. Show decrements, Hide increments, and the value
    /// propagates to descendants.
    pub hide_count: i32,
    pub erase_color: Color,
    pub bg_color: Color,
    pub fg_color: Color,
    pub drawing_mode: DrawingMode,
    pub font: FontId,
    pub pen_position: Point,
    pub pen_width: f32,
    pub focus_keyboard_mode: FocusKeyboardMode,

    pub parent: Option<ViewHandle>,
    /// Back-to-front; the last child is topmost.
    pub children: Vec<ViewHandle>,

    pub client_port: Option<PortId>,
    pub client_handle: Option<ViewHandle>,
    pub manager_handle: Option<ViewHandle>,
    pub is_window_manager_controlled: bool,

    pub draw_constrain_reg: Option<Region>,
    pub shape_constrain_reg: Option<Region>,
    pub visible_reg: Option<Region>,
    pub full_reg: Option<Region>,
    pub prev_visible_reg: Option<Region>,
    pub prev_full_reg: Option<Region>,
    pub draw_reg: Option<Region>,
    pub damage_reg: Option<Region>,
    pub active_damage_reg: Option<Region>,

    pub delta_move: IPoint,
    pub delta_size: IPoint,
    pub has_invalid_regs: bool,
    pub is_updating: bool,

    pub screen_pos: Point,
}

impl ServerView {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        frame: Rect,
        scroll_offset: Point,
        flags: ViewFlags,
        hide_count: i32,
        focus_keyboard_mode: FocusKeyboardMode,
        drawing_mode: DrawingMode,
        pen_width: f32,
        font: FontId,
        erase_color: Color,
        bg_color: Color,
        fg_color: Color,
    ) -> Self {
        Self {
            name,
            frame,
            scroll_offset,
            flags,
            hide_count,
            erase_color,
            bg_color,
            fg_color,
            drawing_mode,
            font,
            pen_position: Point::default(),
            pen_width,
            focus_keyboard_mode,
            parent: None,
            children: Vec::new(),
            client_port: None,
            client_handle: None,
            manager_handle: None,
            is_window_manager_controlled: false,
            draw_constrain_reg: None,
            shape_constrain_reg: None,
            visible_reg: None,
            full_reg: None,
            prev_visible_reg: None,
            prev_full_reg: None,
            draw_reg: None,
            damage_reg: None,
            active_damage_reg: None,
            delta_move: IPoint::default(),
            delta_size: IPoint::default(),
            has_invalid_regs: true,
            is_updating: false,
            screen_pos: Point::default(),
        }
    }

    pub fn iframe(&self) -> IRect {
        self.frame.into()
    }

    pub fn is_visible(&self) -> bool {
        self.hide_count == 0
    }

    fn i_scroll(&self) -> IPoint {
        IPoint::from(self.scroll_offset)
    }

    fn i_screen_pos(&self) -> IPoint {
        IPoint::from(self.screen_pos)
    }

    fn normalized_bounds(&self) -> IRect {
        self.iframe().bounds()
    }

    /// The region a client may paint into right now, in view-local
    /// coordinates: visible area, restricted to the active damage while an
    /// update is running, and to the user draw constraint always. `None`
    /// silently drops the primitive.
    fn effective_clip(&mut self) -> Option<Region> {
        if self.hide_count > 0 {
            return None;
        }
        if self.is_updating && self.active_damage_reg.is_none() {
            return None;
        }
        if !self.is_updating {
            match &self.draw_constrain_reg {
                None => return self.visible_reg.clone(),
                Some(constrain) => {
                    if self.draw_reg.is_none() {
                        let mut draw = self.visible_reg.clone()?;
                        draw.intersect(constrain);
                        self.draw_reg = Some(draw);
                    }
                }
            }
        } else if self.draw_reg.is_none() {
            let mut draw = self.visible_reg.clone()?;
            draw.intersect(self.active_damage_reg.as_ref()?);
            if let Some(constrain) = &self.draw_constrain_reg {
                draw.intersect(constrain);
            }
            draw.optimize();
            self.draw_reg = Some(draw);
        }
        self.draw_reg.clone()
    }
}

/// Order blit rectangles so a self-overlapping move never overwrites
/// pixels it has not copied yet: moving down processes bottom rows first,
/// moving right processes right columns first.
fn blit_order(a: &IRect, b: &IRect, delta: IPoint) -> Ordering {
    let vertical = if delta.y < 0 {
        a.top.cmp(&b.top)
    } else {
        b.top.cmp(&a.top)
    };
    vertical.then_with(|| {
        if delta.x < 0 {
            a.left.cmp(&b.left)
        } else {
            b.left.cmp(&a.left)
        }
    })
}

pub struct ViewTree {
    views: AHashMap<ViewHandle, ServerView>,
    pub top: ViewHandle,
}

impl ViewTree {
    pub fn new(top_handle: ViewHandle, top_view: ServerView) -> Self {
        let mut views = AHashMap::new();
        views.insert(top_handle, top_view);
        Self {
            views,
            top: top_handle,
        }
    }

    pub fn insert(&mut self, handle: ViewHandle, view: ServerView) {
        self.views.insert(handle, view);
    }

    pub fn contains(&self, handle: ViewHandle) -> bool {
        self.views.contains_key(&handle)
    }

    pub fn view(&self, handle: ViewHandle) -> &ServerView {
        self.views.get(&handle).expect("stale view handle")
    }

    pub fn view_mut(&mut self, handle: ViewHandle) -> &mut ServerView {
        self.views.get_mut(&handle).expect("stale view handle")
    }

    pub fn get(&self, handle: ViewHandle) -> Option<&ServerView> {
        self.views.get(&handle)
    }

    // ---- structure -------------------------------------------------------

    /// Link `child` under `parent` at `index` (append when absent or out of
    /// range). A child added to a hidden parent inherits one hide level.
    pub fn add_child(&mut self, parent: ViewHandle, child: ViewHandle, index: Option<usize>) {
        {
            let parent_view = self.view_mut(parent);
            let index = index
                .filter(|&i| i <= parent_view.children.len())
                .unwrap_or(parent_view.children.len());
            parent_view.children.insert(index, child);
        }
        self.view_mut(child).parent = Some(parent);
        self.update_screen_pos(child);
        if !self.view(parent).is_visible() {
            self.show(child, false);
        }
    }

    /// Unlink `child` from `parent`. Leaving a hidden parent sheds the
    /// inherited hide level.
    pub fn remove_child(&mut self, parent: ViewHandle, child: ViewHandle) {
        let parent_view = self.view_mut(parent);
        parent_view.children.retain(|&c| c != child);
        self.view_mut(child).parent = None;
        if !self.view(parent).is_visible() {
            self.show(child, true);
        }
    }

    /// Detach `handle` from its parent and drop its whole subtree. Returns
    /// every removed handle so the caller can clean its dispatch tables.
    pub fn remove_subtree(&mut self, handle: ViewHandle) -> Vec<ViewHandle> {
        if let Some(parent) = self.view(handle).parent {
            self.remove_child(parent, handle);
        }
        let mut removed = Vec::new();
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            if let Some(view) = self.views.remove(&h) {
                stack.extend(view.children);
                removed.push(h);
            }
        }
        removed
    }

    pub fn update_screen_pos(&mut self, handle: ViewHandle) {
        let pos = match self.view(handle).parent {
            None => self.view(handle).frame.top_left(),
            Some(parent) => {
                let p = self.view(parent);
                Point::new(
                    p.screen_pos.x + p.scroll_offset.x + self.view(handle).frame.left,
                    p.screen_pos.y + p.scroll_offset.y + self.view(handle).frame.top,
                )
            }
        };
        self.view_mut(handle).screen_pos = pos;
        let children = self.view(handle).children.clone();
        for child in children {
            self.update_screen_pos(child);
        }
    }

    /// Nearest non-transparent ancestor, translating `frame` into its
    /// coordinate system along the way.
    pub fn opaque_parent(&self, start: ViewHandle, frame: &mut IRect) -> ViewHandle {
        let mut handle = start;
        loop {
            let view = self.view(handle);
            if !view.flags.contains(ViewFlags::TRANSPARENT) {
                return handle;
            }
            let Some(parent) = view.parent else {
                return handle;
            };
            *frame += view.iframe().top_left() + self.view(parent).i_scroll();
            handle = parent;
        }
    }

    // ---- invalidation ----------------------------------------------------

    /// Add `rect` (view-local) to the damage region.
    pub fn add_damage(&mut self, handle: ViewHandle, rect: IRect) {
        let view = self.view_mut(handle);
        if view.hide_count == 0 {
            match &mut view.damage_reg {
                Some(damage) => damage.include(rect),
                None => view.damage_reg = Some(Region::new(rect)),
            }
        }
    }

    /// Damage the whole view, optionally recursing into children.
    pub fn invalidate_all(&mut self, handle: ViewHandle, recursive: bool) {
        let view = self.view_mut(handle);
        if view.hide_count == 0 {
            view.damage_reg = Some(Region::new(view.normalized_bounds()));
            if recursive {
                let children = view.children.clone();
                for child in children {
                    self.invalidate_all(child, true);
                }
            }
        }
    }

    /// Propagate "regions need rebuilding" down from `handle` wherever
    /// `rect` (local coordinates) touches the subtree.
    pub fn mark_modified(&mut self, handle: ViewHandle, rect: IRect) {
        let (intersects, children, scroll) = {
            let view = self.view(handle);
            (
                view.normalized_bounds().intersects(&rect),
                view.children.clone(),
                view.i_scroll(),
            )
        };
        if intersects {
            self.view_mut(handle).has_invalid_regs = true;
            for child in children {
                let top_left = self.view(child).iframe().top_left();
                self.mark_modified(child, rect - top_left - scroll);
            }
        }
    }

    pub fn set_dirty_reg_flags(&mut self, handle: ViewHandle) {
        self.view_mut(handle).has_invalid_regs = true;
        let children = self.view(handle).children.clone();
        for child in children {
            self.set_dirty_reg_flags(child);
        }
    }

    // ---- show / hide -----------------------------------------------------

    pub fn show(&mut self, handle: ViewHandle, do_show: bool) {
        let was_visible = self.view(handle).is_visible();
        {
            let view = self.view_mut(handle);
            if do_show {
                view.hide_count -= 1;
            } else {
                view.hide_count += 1;
            }
        }
        let is_visible = self.view(handle).is_visible();
        if is_visible == was_visible {
            return;
        }
        if let Some(parent) = self.view(handle).parent {
            let mut frame = self.view(handle).iframe();
            let opaque = self.opaque_parent(parent, &mut frame);
            self.set_dirty_reg_flags(opaque);
            let iframe = self.view(handle).iframe();
            let siblings = self.view(parent).children.clone();
            for sibling in siblings {
                let sibling_frame = self.view(sibling).iframe();
                if sibling_frame.intersects(&iframe) {
                    self.mark_modified(sibling, iframe - sibling_frame.top_left());
                }
            }
        }
        let children = self.view(handle).children.clone();
        for child in children.into_iter().rev() {
            self.show(child, is_visible);
        }
        self.invalidate_all(handle, true);
    }

    // ---- frame and constraint changes ------------------------------------

    pub fn set_frame(
        &mut self,
        handle: ViewHandle,
        frame: Rect,
        requesting_client: Option<ViewHandle>,
        ctx: &SendCtx<'_>,
    ) {
        let prev_iframe = self.view(handle).iframe();
        self.view_mut(handle).frame = frame;
        self.update_screen_pos(handle);
        let iframe = self.view(handle).iframe();
        if iframe == prev_iframe {
            return;
        }

        let parent = self.view(handle).parent;
        if self.view(handle).is_visible() {
            {
                let view = self.view_mut(handle);
                view.delta_move += iframe.top_left() - prev_iframe.top_left();
                view.delta_size +=
                    IPoint::new(iframe.width(), iframe.height())
                        - IPoint::new(prev_iframe.width(), prev_iframe.height());
            }
            if let Some(parent) = parent {
                let mut probe = iframe;
                let opaque = self.opaque_parent(parent, &mut probe);
                self.set_dirty_reg_flags(opaque);

                // Siblings below us see both the vacated and the newly
                // covered area.
                let siblings = self.view(parent).children.clone();
                let my_pos = siblings.iter().position(|&s| s == handle);
                if let Some(my_pos) = my_pos {
                    for &sibling in &siblings[..my_pos] {
                        let sibling_frame = self.view(sibling).iframe();
                        if sibling_frame.intersects(&prev_iframe) || sibling_frame.intersects(&iframe)
                        {
                            self.mark_modified(sibling, prev_iframe - sibling_frame.top_left());
                            self.mark_modified(sibling, iframe - sibling_frame.top_left());
                        }
                    }
                }
            }
        }

        if let Some(requesting) = requesting_client {
            let view = self.view(handle);
            let mut payload = PayloadWriter::new();
            payload.put_rect(view.frame);
            if Some(requesting) == view.client_handle {
                if let Some(manager) = view.manager_handle {
                    ctx.post_to_window_manager(
                        manager,
                        MessageCode::ViewFrameChanged,
                        payload.into_bytes(),
                    );
                }
            } else if let (Some(port), Some(client)) = (view.client_port, view.client_handle) {
                ctx.post(port, client, MessageCode::ViewFrameChanged, payload.into_bytes());
            }
        }

        if parent.is_none() {
            self.invalidate_all(handle, false);
        }
    }

    pub fn set_draw_region(&mut self, handle: ViewHandle, region: Option<Region>) {
        {
            let view = self.view_mut(handle);
            view.draw_constrain_reg = region;
            view.draw_reg = None;
        }
        if self.view(handle).is_visible() {
            self.set_dirty_reg_flags(handle);
        }
    }

    pub fn set_shape_region(&mut self, handle: ViewHandle, region: Option<Region>) {
        self.view_mut(handle).shape_constrain_reg = region;
        if !self.view(handle).is_visible() {
            return;
        }
        if let Some(parent) = self.view(handle).parent {
            let mut probe = self.view(handle).iframe();
            let opaque = self.opaque_parent(parent, &mut probe);
            self.set_dirty_reg_flags(opaque);

            let iframe = self.view(handle).iframe();
            let siblings = self.view(parent).children.clone();
            let my_pos = siblings.iter().position(|&s| s == handle);
            if let Some(my_pos) = my_pos {
                for &sibling in &siblings[..my_pos] {
                    let sibling_frame = self.view(sibling).iframe();
                    if sibling_frame.intersects(&iframe) {
                        self.mark_modified(sibling, iframe - sibling_frame.top_left());
                    }
                }
            }
        }
    }

    pub fn toggle_depth(&mut self, handle: ViewHandle, screen: &mut ScreenContext, ctx: &SendCtx<'_>) {
        let Some(parent) = self.view(handle).parent else {
            return;
        };
        {
            let parent_view = self.view_mut(parent);
            let was_topmost = parent_view.children.last() == Some(&handle);
            parent_view.children.retain(|&c| c != handle);
            if was_topmost {
                parent_view.children.insert(0, handle);
            } else {
                parent_view.children.push(handle);
            }
        }
        let mut probe = self.view(handle).iframe();
        let opaque = self.opaque_parent(parent, &mut probe);
        self.set_dirty_reg_flags(opaque);

        let iframe = self.view(handle).iframe();
        let siblings = self.view(parent).children.clone();
        for sibling in siblings {
            let sibling_frame = self.view(sibling).iframe();
            if sibling_frame.intersects(&iframe) {
                self.mark_modified(sibling, iframe - sibling_frame.top_left());
            }
        }
        self.update_regions(opaque, screen, ctx);
    }

    // ---- region rebuild --------------------------------------------------

    /// Depth-first rebuild of `full_reg`/`visible_reg` for every view with
    /// `has_invalid_regs` set under `handle`.
    pub fn rebuild_region(&mut self, handle: ViewHandle) {
        let (hidden, has_invalid, children) = {
            let view = self.view(handle);
            (view.hide_count > 0, view.has_invalid_regs, view.children.clone())
        };
        if hidden {
            if self.view(handle).visible_reg.is_some() {
                self.delete_regions(handle);
            }
            return;
        }
        if has_invalid {
            {
                let view = self.view_mut(handle);
                view.draw_reg = None;
                debug_assert!(view.prev_visible_reg.is_none());
                debug_assert!(view.prev_full_reg.is_none());
                view.prev_visible_reg = view.visible_reg.take();
                view.prev_full_reg = view.full_reg.take();
            }
            let full = self.compute_full_region(handle);
            let visible = self.compute_visible_region(handle, &full);
            let view = self.view_mut(handle);
            view.full_reg = Some(full);
            view.visible_reg = Some(visible);
        }
        for child in children {
            self.rebuild_region(child);
        }
    }

    fn compute_full_region(&self, handle: ViewHandle) -> Region {
        let view = self.view(handle);
        let iframe = view.iframe();
        let Some(parent) = view.parent else {
            return Region::new(iframe);
        };
        let parent_view = self.view(parent);
        let mut full = match &parent_view.full_reg {
            Some(parent_full) => {
                Region::clone_clipped(parent_full, iframe + parent_view.i_scroll(), true)
            }
            None => Region::new(iframe.bounds()),
        };
        if let Some(shape) = &view.shape_constrain_reg {
            full.intersect(shape);
        }
        let top_left = iframe.top_left();
        if let Some(my_pos) = parent_view.children.iter().position(|&c| c == handle) {
            for &sibling in &parent_view.children[my_pos + 1..] {
                let sibling_view = self.view(sibling);
                if sibling_view.hide_count == 0 && sibling_view.iframe().intersects(&iframe) {
                    self.exclude_view(sibling, &mut full, -top_left);
                }
            }
        }
        full.optimize();
        full
    }

    fn compute_visible_region(&self, handle: ViewHandle, full: &Region) -> Region {
        let view = self.view(handle);
        let mut visible = full.clone();
        if !view.flags.contains(ViewFlags::DRAW_ON_CHILDREN) {
            let scroll = view.i_scroll();
            let mut modified = false;
            for &child in &view.children {
                if self.exclude_view(child, &mut visible, scroll) {
                    modified = true;
                }
            }
            if modified {
                visible.optimize();
            }
        }
        visible
    }

    /// Subtract the opaque area of `handle` (its frame, or its shape
    /// region) from `region`. Transparent views pass through to their
    /// opaque descendants.
    fn exclude_view(&self, handle: ViewHandle, region: &mut Region, offset: IPoint) -> bool {
        let view = self.view(handle);
        if view.hide_count != 0 {
            return false;
        }
        if !view.flags.contains(ViewFlags::TRANSPARENT) {
            match &view.shape_constrain_reg {
                None => region.exclude(view.iframe() + offset),
                Some(shape) => {
                    region.exclude_region(shape, view.iframe().top_left() + offset);
                }
            }
            return true;
        }
        let mut modified = false;
        let frame_pos = view.iframe().top_left();
        let scroll = view.i_scroll();
        for &child in &view.children {
            if self.exclude_view(child, region, offset + frame_pos + scroll) {
                modified = true;
            }
        }
        modified
    }

    /// Salvage still-visible pixels of moved children with screen blits
    /// before anything repaints.
    fn blit_moved_children(&mut self, handle: ViewHandle, screen: &mut ScreenContext) {
        let (hidden, has_invalid, children) = {
            let view = self.view(handle);
            (view.hide_count > 0, view.has_invalid_regs, view.children.clone())
        };
        if hidden {
            return;
        }
        if has_invalid {
            for &child in &children {
                let (delta, has_regions) = {
                    let c = self.view(child);
                    (
                        c.delta_move,
                        c.full_reg.is_some() && c.prev_full_reg.is_some(),
                    )
                };
                if delta.is_zero() || !has_regions {
                    continue;
                }
                let (mut region, child_offset) = {
                    let c = self.view(child);
                    let mut region = c.prev_full_reg.clone().unwrap();
                    region.intersect(c.full_reg.as_ref().unwrap());
                    (region, c.i_screen_pos())
                };
                if region.is_empty() {
                    continue;
                }
                // Into absolute screen coordinates, destination-most first.
                region.translate(child_offset);
                let mut rects: Vec<IRect> = region.rects().to_vec();
                rects.sort_by(|a, b| blit_order(a, b, delta));
                let (bg, fg) = {
                    let view = self.view(handle);
                    (view.bg_color, view.fg_color)
                };
                for rect in rects {
                    screen.driver.copy_rect(
                        &mut screen.bitmap,
                        BlitSource::Same,
                        bg,
                        fg,
                        rect - delta,
                        rect.top_left(),
                        DrawingMode::Copy,
                    );
                }
            }

            // A shrinking parent exposes the moved view's right/bottom
            // edge; those bands cannot be blitted from anywhere.
            let parent = self.view(handle).parent;
            let delta_move = self.view(handle).delta_move;
            if let Some(parent) = parent {
                if !delta_move.is_zero() {
                    let parent_delta = self.view(parent).delta_size;
                    let parent_iframe = self.view(parent).iframe();
                    let iframe = self.view(handle).iframe();
                    let bounds = self.view(handle).normalized_bounds();
                    if parent_delta.x < 0 {
                        let mut rect = bounds;
                        rect.left = rect.right + parent_delta.x + parent_iframe.width() - iframe.right;
                        if rect.is_valid() {
                            self.add_damage(handle, rect);
                        }
                    }
                    if parent_delta.y < 0 {
                        let mut rect = bounds;
                        rect.top = rect.bottom + parent_delta.y + parent_iframe.height() - iframe.bottom;
                        if rect.is_valid() {
                            self.add_damage(handle, rect);
                        }
                    }
                }
            }
            self.view_mut(handle).prev_full_reg = None;
        }
        for child in children {
            self.blit_moved_children(child, screen);
        }
    }

    /// Fold newly exposed areas into the damage region and retire the
    /// rebuild bookkeeping.
    fn invalidate_new_areas(&mut self, handle: ViewHandle) {
        let (hidden, has_invalid, children) = {
            let view = self.view(handle);
            (view.hide_count > 0, view.has_invalid_regs, view.children.clone())
        };
        if hidden {
            return;
        }
        if has_invalid {
            let full_update = {
                let view = self.view(handle);
                (view.flags.contains(ViewFlags::FULL_UPDATE_ON_RESIZE_H) && view.delta_size.x != 0)
                    || (view.flags.contains(ViewFlags::FULL_UPDATE_ON_RESIZE_V)
                        && view.delta_size.y != 0)
            };
            if full_update {
                self.invalidate_all(handle, false);
            } else if self.view(handle).visible_reg.is_some() {
                let mut exposed = self.view(handle).visible_reg.clone().unwrap();
                if let Some(prev) = &self.view(handle).prev_visible_reg {
                    exposed.exclude_region(prev, IPoint::default());
                }
                if self.view(handle).damage_reg.is_none() {
                    if !exposed.is_empty() {
                        self.view_mut(handle).damage_reg = Some(exposed);
                    }
                } else {
                    for rect in exposed.rects().to_vec() {
                        self.add_damage(handle, rect);
                    }
                }
            }
            let view = self.view_mut(handle);
            view.prev_visible_reg = None;
            view.delta_move = IPoint::default();
            view.delta_size = IPoint::default();
        }
        for child in children {
            self.invalidate_new_areas(child);
        }
    }

    fn clear_dirty_flags(&mut self, handle: ViewHandle) {
        self.view_mut(handle).has_invalid_regs = false;
        let children = self.view(handle).children.clone();
        for child in children {
            self.clear_dirty_flags(child);
        }
    }

    pub fn delete_regions(&mut self, handle: ViewHandle) {
        {
            let view = self.view_mut(handle);
            debug_assert!(view.prev_visible_reg.is_none());
            debug_assert!(view.prev_full_reg.is_none());
            view.visible_reg = None;
            view.full_reg = None;
            view.draw_reg = None;
            view.damage_reg = None;
            view.active_damage_reg = None;
        }
        let children = self.view(handle).children.clone();
        for child in children {
            self.delete_regions(child);
        }
    }

    /// The one region-rebuild pass: rebuild, blit moved children, expand
    /// damage, erase the top view's background, request paints, clear
    /// flags.
    pub fn update_regions(&mut self, handle: ViewHandle, screen: &mut ScreenContext, ctx: &SendCtx<'_>) {
        self.rebuild_region(handle);
        self.blit_moved_children(handle, screen);
        self.invalidate_new_areas(handle);

        if handle == self.top && self.view(handle).damage_reg.is_some() {
            // Only the top view erases; everything else paints client-side.
            let (erase, screen_pos, fill) = {
                let view = self.view(handle);
                let fill = match (&view.visible_reg, &view.damage_reg) {
                    (Some(visible), Some(damage)) => {
                        let mut fill = visible.clone();
                        fill.intersect(damage);
                        Some(fill)
                    }
                    _ => None,
                };
                (view.erase_color, view.i_screen_pos(), fill)
            };
            if let Some(fill) = fill {
                for rect in fill.rects() {
                    screen.driver.fill_rect(&mut screen.bitmap, *rect + screen_pos, erase);
                }
            }
            self.view_mut(handle).damage_reg = None;
        }
        self.request_paint_if_needed(handle, ctx);
        self.clear_dirty_flags(handle);
    }

    // ---- paint requests --------------------------------------------------

    fn send_paint(&self, handle: ViewHandle, update_rect: IRect, ctx: &SendCtx<'_>) {
        let view = self.view(handle);
        if view.hide_count > 0 || view.is_updating {
            return;
        }
        let (Some(port), Some(client)) = (view.client_port, view.client_handle) else {
            return;
        };
        let rect = Rect::from(update_rect - view.i_scroll());
        let mut payload = PayloadWriter::new();
        payload.put_rect(rect);
        ctx.post(port, client, MessageCode::PaintView, payload.into_bytes());
    }

    pub fn request_paint_if_needed(&mut self, handle: ViewHandle, ctx: &SendCtx<'_>) {
        if self.view(handle).hide_count > 0 {
            return;
        }
        if self.view(handle).damage_reg.is_some() && self.view(handle).active_damage_reg.is_none() {
            let mut active = self.view_mut(handle).damage_reg.take().unwrap();
            active.optimize();
            let bounds = active.bounds();
            self.view_mut(handle).active_damage_reg = Some(active);
            self.send_paint(handle, bounds, ctx);
        }
        let children = self.view(handle).children.clone();
        for child in children {
            self.request_paint_if_needed(child, ctx);
        }
    }

    pub fn begin_update(&mut self, handle: ViewHandle) {
        let view = self.view_mut(handle);
        if view.visible_reg.is_some() {
            view.is_updating = true;
        }
    }

    pub fn end_update(&mut self, handle: ViewHandle, ctx: &SendCtx<'_>) {
        {
            let view = self.view_mut(handle);
            view.active_damage_reg = None;
            view.draw_reg = None;
            view.is_updating = false;
        }
        if self.view(handle).damage_reg.is_some() {
            let active = self.view_mut(handle).damage_reg.take().unwrap();
            let bounds = active.bounds();
            self.view_mut(handle).active_damage_reg = Some(active);
            self.send_paint(handle, bounds, ctx);
        }
    }

    // ---- clipped primitives ----------------------------------------------

    pub fn draw_line(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        from: Point,
        to: Point,
    ) {
        let clip = self.view_mut(handle).effective_clip();
        if let Some(region) = clip {
            let view = self.view(handle);
            let screen_pos = view.i_screen_pos();
            let mut from_scr = IPoint::from(Point::new(
                from.x + view.scroll_offset.x,
                from.y + view.scroll_offset.y,
            ));
            let mut to_scr = IPoint::from(Point::new(
                to.x + view.scroll_offset.x,
                to.y + view.scroll_offset.y,
            ));
            if from_scr.x > to_scr.x {
                std::mem::swap(&mut from_scr, &mut to_scr);
            }
            let bounding = IRect::new(
                from_scr.x,
                from_scr.y.min(to_scr.y),
                to_scr.x + 1,
                from_scr.y.max(to_scr.y) + 1,
            );
            let mut p0 = from_scr + screen_pos;
            let mut p1 = to_scr + screen_pos;
            let (color, mode) = (view.fg_color, view.drawing_mode);
            if Region::clip_line(screen.bitmap.frame(), &mut p0, &mut p1) {
                for rect in region.rects() {
                    if rect.intersects(&bounding) {
                        screen.driver.draw_line(
                            &mut screen.bitmap,
                            *rect + screen_pos,
                            p0,
                            p1,
                            color,
                            mode,
                        );
                    }
                }
            }
        }
        self.view_mut(handle).pen_position = to;
    }

    pub fn draw_line_from_pen(&mut self, handle: ViewHandle, screen: &mut ScreenContext, to: Point) {
        let from = self.view(handle).pen_position;
        self.draw_line(handle, screen, from, to);
    }

    /// Outline `frame` with four pen lines.
    pub fn draw_rect(&mut self, handle: ViewHandle, screen: &mut ScreenContext, frame: Rect) {
        let tl = Point::new(frame.left, frame.top);
        let tr = Point::new(frame.right - 1.0, frame.top);
        let br = Point::new(frame.right - 1.0, frame.bottom - 1.0);
        let bl = Point::new(frame.left, frame.bottom - 1.0);
        self.draw_line(handle, screen, tl, tr);
        self.draw_line(handle, screen, tr, br);
        self.draw_line(handle, screen, br, bl);
        self.draw_line(handle, screen, bl, tl);
    }

    pub fn fill_rect(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        rect: Rect,
        color: Color,
    ) {
        let Some(region) = self.view_mut(handle).effective_clip() else {
            return;
        };
        let view = self.view(handle);
        let screen_pos = view.i_screen_pos();
        let rect_scr = IRect::from(rect + view.scroll_offset);
        for clip in region.rects() {
            let clipped = rect_scr & *clip;
            if clipped.is_valid() {
                screen
                    .driver
                    .fill_rect(&mut screen.bitmap, clipped + screen_pos, color);
            }
        }
    }

    pub fn fill_circle(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        center: Point,
        radius: f32,
    ) {
        let Some(region) = self.view_mut(handle).effective_clip() else {
            return;
        };
        let view = self.view(handle);
        let screen_pos = view.i_screen_pos();
        let center_scr = IPoint::from(center + view.scroll_offset) + screen_pos;
        let r = (radius + 0.5) as i32;
        let bounding = IRect::new(
            center_scr.x - r - 2,
            center_scr.y - r - 2,
            center_scr.x + r + 2,
            center_scr.y + r + 2,
        );
        let (color, mode) = (view.fg_color, view.drawing_mode);
        for clip in region.rects() {
            let clip_scr = *clip + screen_pos;
            if !bounding.intersects(&clip_scr) {
                continue;
            }
            screen.driver.fill_circle(
                &mut screen.bitmap,
                clip_scr,
                center_scr,
                radius.round() as i32,
                color,
                mode,
            );
        }
    }

    pub fn draw_string(&mut self, handle: ViewHandle, screen: &mut ScreenContext, text: &str) {
        let Some(region) = self.view_mut(handle).effective_clip() else {
            return;
        };
        let (screen_pos, pen, bg, fg, font) = {
            let view = self.view(handle);
            (
                view.i_screen_pos(),
                IPoint::from(view.pen_position + view.scroll_offset),
                view.bg_color,
                view.fg_color,
                view.font,
            )
        };
        let width = screen.driver.string_width(font, text) as i32;
        let height = screen.driver.font_height(font) as i32;
        let bounding = IRect::new(pen.x, pen.y, pen.x + width, pen.y + height);
        let pen_scr = pen + screen_pos;
        for clip in region.rects() {
            if clip.intersects(&bounding) {
                screen.driver.write_string(
                    &mut screen.bitmap,
                    pen_scr,
                    text,
                    *clip + screen_pos,
                    bg,
                    fg,
                    font,
                );
            }
        }
        self.view_mut(handle).pen_position.x += bounding.width() as f32;
    }

    /// Screen-to-screen copy inside the view, with damage bookkeeping: the
    /// moved pixels carry their pending damage along, and destination areas
    /// with no valid source get invalidated for a repaint.
    pub fn copy_rect(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        src_rect: Rect,
        dst_pos: Point,
        ctx: &SendCtx<'_>,
    ) {
        if self.view(handle).visible_reg.is_none() {
            return;
        }
        let mut int_src = IRect::from(src_rect);
        let delta = IPoint::from(dst_pos) - int_src.top_left();
        if delta.is_zero() {
            return;
        }
        let scroll = self.view(handle).i_scroll();
        int_src += scroll;
        let dst_rect = int_src + delta;

        let visible = self.view(handle).visible_reg.clone().unwrap();
        let mut damage = Region::clone_clipped(&visible, int_src, false);
        let mut blits: Vec<IRect> = Vec::new();
        for src_clip in visible.rects() {
            let src = int_src & *src_clip;
            if !src.is_valid() {
                continue;
            }
            let moved = src + delta;
            for dst_clip in visible.rects() {
                let dst = moved & *dst_clip;
                if dst.is_valid() {
                    damage.exclude(dst);
                    blits.push(dst);
                }
            }
        }

        if blits.is_empty() {
            self.add_damage(handle, dst_rect);
            self.request_paint_if_needed(handle, ctx);
            return;
        }

        blits.sort_by(|a, b| blit_order(a, b, delta));
        let screen_pos = self.view(handle).i_screen_pos();
        let (bg, fg, mode) = {
            let view = self.view(handle);
            (view.bg_color, view.fg_color, view.drawing_mode)
        };
        for rect in &blits {
            let rect = *rect + screen_pos;
            screen.driver.copy_rect(
                &mut screen.bitmap,
                BlitSource::Same,
                bg,
                fg,
                rect - delta,
                rect.top_left(),
                mode,
            );
        }

        // Pending damage inside the source area follows the content.
        if self.view(handle).damage_reg.is_some() {
            let pending = self.view(handle).damage_reg.clone().unwrap();
            let moved = Region::clone_clipped(&pending, int_src, false);
            for dmg in moved.rects() {
                let target = (*dmg + delta) & dst_rect;
                self.add_damage(handle, target);
                if let Some(active) = &mut self.view_mut(handle).active_damage_reg {
                    active.exclude(target);
                }
            }
        }
        if self.view(handle).active_damage_reg.is_some() {
            let active = self.view(handle).active_damage_reg.clone().unwrap();
            let moved = Region::clone_clipped(&active, int_src, false);
            if !moved.is_empty() {
                for dmg in moved.rects() {
                    let target = (*dmg + delta) & dst_rect;
                    if let Some(active) = &mut self.view_mut(handle).active_damage_reg {
                        active.exclude(target);
                    }
                    self.add_damage(handle, target);
                }
            }
        }
        for rect in damage.rects().to_vec() {
            self.add_damage(handle, rect);
        }
        if let Some(damage) = &mut self.view_mut(handle).damage_reg {
            damage.optimize();
        }
        if let Some(active) = &mut self.view_mut(handle).active_damage_reg {
            active.optimize();
        }
        self.request_paint_if_needed(handle, ctx);
    }

    pub fn draw_bitmap(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        bitmap: &ServerBitmap,
        src_rect: Rect,
        dst_pos: Point,
    ) {
        let Some(region) = self.view_mut(handle).effective_clip() else {
            return;
        };
        let view = self.view(handle);
        let screen_pos = view.i_screen_pos();
        let int_src = IRect::from(src_rect);
        let mut int_dst = IPoint::from(dst_pos + view.scroll_offset);

        let clipped_src = int_src & bitmap.frame();
        if !clipped_src.is_valid() {
            return;
        }
        int_dst += clipped_src.top_left() - int_src.top_left();
        let dst_rect = clipped_src.bounds() + int_dst;
        let src_pos = clipped_src.top_left();
        let (bg, fg, mode) = (view.bg_color, view.fg_color, view.drawing_mode);

        for clip in region.rects() {
            let rect = dst_rect & *clip;
            if rect.is_valid() {
                let dst = rect.top_left() + screen_pos;
                let src = rect - int_dst + src_pos;
                screen.driver.copy_rect(
                    &mut screen.bitmap,
                    BlitSource::Bitmap(bitmap),
                    bg,
                    fg,
                    src,
                    dst,
                    mode,
                );
            }
        }
    }

    /// Scroll the content, salvaging still-visible pixels with blits and
    /// invalidating the revealed band.
    pub fn scroll_by(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        delta: Point,
        ctx: &SendCtx<'_>,
    ) {
        if self.view(handle).parent.is_none() {
            return;
        }
        let old_offset = self.view(handle).i_scroll();
        {
            let view = self.view_mut(handle);
            view.scroll_offset.x += delta.x;
            view.scroll_offset.y += delta.y;
        }
        let new_offset = self.view(handle).i_scroll();
        if new_offset == old_offset {
            return;
        }
        self.update_screen_pos(handle);
        let int_offset = new_offset - old_offset;
        if self.view(handle).hide_count > 0 {
            return;
        }
        self.set_dirty_reg_flags(handle);
        self.update_regions(handle, screen, ctx);

        if self.view(handle).full_reg.is_none() {
            return;
        }
        let screen_pos = self.view(handle).i_screen_pos();
        let bounds = self.view(handle).normalized_bounds();
        let full = self.view(handle).full_reg.clone().unwrap();
        let mut damage = self.view(handle).visible_reg.clone().unwrap_or_default();

        let mut blits: Vec<IRect> = Vec::new();
        for src_clip in full.rects() {
            let src = bounds & *src_clip;
            if !src.is_valid() {
                continue;
            }
            let moved = src + int_offset;
            for dst_clip in full.rects() {
                let dst = moved & *dst_clip;
                if dst.is_valid() {
                    damage.exclude(dst);
                    blits.push(dst);
                }
            }
        }

        if blits.is_empty() {
            self.add_damage(handle, bounds);
            self.request_paint_if_needed(handle, ctx);
            return;
        }

        blits.sort_by(|a, b| blit_order(a, b, int_offset));
        let (bg, fg) = {
            let view = self.view(handle);
            (view.bg_color, view.fg_color)
        };
        for rect in &blits {
            let rect = *rect + screen_pos;
            screen.driver.copy_rect(
                &mut screen.bitmap,
                BlitSource::Same,
                bg,
                fg,
                rect - int_offset,
                rect.top_left(),
                DrawingMode::Copy,
            );
        }

        // Carried damage scrolls with the content.
        if let Some(damage_reg) = &mut self.view_mut(handle).damage_reg {
            damage_reg.translate(int_offset);
        }
        if let Some(active) = &mut self.view_mut(handle).active_damage_reg {
            active.translate(int_offset);
        }
        for rect in damage.rects().to_vec() {
            self.add_damage(handle, rect);
        }
        self.request_paint_if_needed(handle, ctx);
    }

    pub fn debug_draw(
        &mut self,
        handle: ViewHandle,
        screen: &mut ScreenContext,
        color: Color,
        draw_frame: bool,
        draw_visible: bool,
        draw_damage: bool,
    ) {
        let screen_pos = self.view(handle).i_screen_pos();
        let mut outline = |screen: &mut ScreenContext, rect: IRect| {
            let p1 = IPoint::new(rect.left, rect.top);
            let p2 = IPoint::new(rect.right - 1, rect.top);
            let p3 = IPoint::new(rect.right - 1, rect.bottom - 1);
            let p4 = IPoint::new(rect.left, rect.bottom - 1);
            for (a, b) in [(p1, p2), (p2, p3), (p4, p3), (p1, p4)] {
                screen
                    .driver
                    .draw_line(&mut screen.bitmap, rect, a, b, color, DrawingMode::Copy);
            }
        };
        if draw_frame {
            let rect = self.view(handle).normalized_bounds() + screen_pos;
            outline(screen, rect);
        }
        if draw_visible {
            if let Some(visible) = self.view(handle).visible_reg.clone() {
                for rect in visible.rects() {
                    outline(screen, *rect + screen_pos);
                }
            }
        }
        if draw_damage {
            if let Some(region) = self.view_mut(handle).effective_clip() {
                for rect in region.rects() {
                    outline(screen, *rect + screen_pos);
                }
            }
        }
    }

    // ---- pointer routing -------------------------------------------------

    /// Walk children topmost-first looking for the view that claims a
    /// press: the first client-bound view without `IGNORE_MOUSE` on the
    /// path. Returns the claiming view and the position in its local
    /// coordinates.
    pub fn mouse_claim_target(
        &self,
        handle: ViewHandle,
        position: Point,
    ) -> Option<(ViewHandle, Point)> {
        let view = self.view(handle);
        if !view.is_visible() {
            return None;
        }
        if view.client_handle.is_some() && !view.flags.contains(ViewFlags::IGNORE_MOUSE) {
            return Some((handle, position));
        }
        let scroll = view.scroll_offset;
        for &child in view.children.iter().rev() {
            let child_view = self.view(child);
            let child_frame = child_view.frame + scroll;
            if position.x >= child_frame.left
                && position.x < child_frame.right
                && position.y >= child_frame.top
                && position.y < child_frame.bottom
            {
                let local = Point::new(
                    position.x - child_view.frame.left - scroll.x,
                    position.y - child_view.frame.top - scroll.y,
                );
                if let Some(hit) = self.mouse_claim_target(child, local) {
                    return Some(hit);
                }
            }
        }
        None
    }

    /// Absolute position -> the view's local coordinates.
    pub fn convert_from_root(&self, handle: ViewHandle, position: Point) -> Point {
        let view = self.view(handle);
        Point::new(position.x - view.screen_pos.x, position.y - view.screen_pos.y)
    }
}
