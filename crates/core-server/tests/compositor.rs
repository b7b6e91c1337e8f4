//! End-to-end compositor scenarios: clipping under overlap, scroll damage,
//! and input coalescing, driven through the real message protocol.

use core_display::FramebufferDriver;
use core_geom::{Color, ColorSpace, IPoint, IRect, Point, Rect, Region};
use core_server::{
    AppServer, BundleWriter, Envelope, MessageCode, MotionEvent, PayloadReader, PayloadWriter,
    PortRegistry, ViewHandle,
};
use crossbeam_channel::Receiver;
use std::time::Duration;

struct Harness {
    server: AppServer,
    client_port: u32,
    client_rx: Receiver<Envelope>,
    app: ViewHandle,
}

impl Harness {
    fn new(width: i32, height: i32) -> Self {
        let ports = PortRegistry::new();
        let driver = FramebufferDriver::new(IPoint::new(width, height), ColorSpace::Rgb16);
        let mut server = AppServer::new(Box::new(driver), ports.clone());

        let (client_port, client_rx) = ports.create_port(128);
        let mut payload = PayloadWriter::new();
        payload.put_u32(client_port).put_u32(client_port).put_str("test-app");
        server.handle_message(Envelope {
            target_handler: -1,
            code: MessageCode::RegisterApplication as i32,
            payload: payload.into_bytes(),
        });
        let reply = client_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.code, MessageCode::RegisterApplicationReply as i32);
        let app = PayloadReader::new(&reply.payload).i32().unwrap();

        Self {
            server,
            client_port,
            client_rx,
            app,
        }
    }

    fn send_bundle(&mut self, bundle: BundleWriter) {
        self.server.handle_message(Envelope {
            target_handler: self.app,
            code: MessageCode::MessageBundle as i32,
            payload: bundle.into_bytes(),
        });
    }

    /// Create a root-level opaque view bound to the test client.
    fn create_view(&mut self, name: &str, frame: Rect, flags: u32) -> ViewHandle {
        let mut create = PayloadWriter::new();
        create
            .put_u32(self.client_port)
            .put_u32(self.client_port)
            .put_i32(7000) // client-side handler id, unused by these tests
            .put_i32(-1)
            .put_i32(1) // dock as root-level view
            .put_i32(-1)
            .put_str(name)
            .put_rect(frame)
            .put_point(Point::new(0.0, 0.0))
            .put_u32(flags)
            .put_i32(0)
            .put_i32(0)
            .put_i32(0)
            .put_f32(1.0)
            .put_i32(2)
            .put_color(Color::rgb(255, 255, 255))
            .put_color(Color::rgb(0, 0, 0))
            .put_color(Color::rgb(255, 255, 255));
        let mut bundle = BundleWriter::new();
        bundle.push(self.app, MessageCode::CreateView, &create.into_bytes());
        self.send_bundle(bundle);

        loop {
            let reply = self.client_rx.recv_timeout(Duration::from_secs(1)).unwrap();
            if reply.code == MessageCode::CreateViewReply as i32 {
                let handle = PayloadReader::new(&reply.payload).i32().unwrap();
                assert!(handle > 0, "view creation failed");
                return handle;
            }
        }
    }

    fn drain_client(&self) -> Vec<Envelope> {
        let mut drained = Vec::new();
        while let Ok(envelope) = self.client_rx.try_recv() {
            drained.push(envelope);
        }
        drained
    }

    fn post_motion(&mut self, code: MessageCode, button: i32, x: f32, y: f32) {
        let event = MotionEvent {
            event: code,
            button_id: button,
            position: Point::new(x, y),
        };
        self.server.handle_message(Envelope {
            target_handler: -1,
            code: code as i32,
            payload: core_server::protocol::encode_motion_event(&event),
        });
    }
}

fn region_covers_same(region: &Region, rects: &[IRect]) -> bool {
    let mut expected = Region::empty();
    for r in rects {
        expected.include(*r);
    }
    if region.area() != expected.area() {
        return false;
    }
    let mut probe = region.clone();
    probe.intersect(&expected);
    probe.area() == expected.area()
}

#[test]
fn overlapping_siblings_clip_each_other() {
    let mut h = Harness::new(800, 600);
    let a = h.create_view("A", Rect::new(0.0, 0.0, 400.0, 300.0), 0);
    let b = h.create_view("B", Rect::new(200.0, 150.0, 600.0, 450.0), 0);

    let a_visible = h.server.tree.view(a).visible_reg.clone().expect("A has regions");
    let b_visible = h.server.tree.view(b).visible_reg.clone().expect("B has regions");

    // B is topmost and keeps its full frame.
    assert!(region_covers_same(
        &b_visible,
        &[IRect::new(0, 0, 400, 300)]
    ));
    // A loses the overlap: the top band plus the left block remain.
    assert!(region_covers_same(
        &a_visible,
        &[IRect::new(0, 0, 400, 150), IRect::new(0, 150, 200, 300)]
    ));

    // Sibling visible regions are disjoint in parent coordinates.
    let mut a_parent = a_visible.clone();
    a_parent.translate(IPoint::new(0, 0)); // A sits at the origin
    let mut b_parent = b_visible.clone();
    b_parent.translate(IPoint::new(200, 150));
    a_parent.intersect(&b_parent);
    assert!(a_parent.is_empty(), "sibling visible regions overlap");
}

#[test]
fn visible_is_subset_of_full() {
    let mut h = Harness::new(800, 600);
    let a = h.create_view("A", Rect::new(0.0, 0.0, 400.0, 300.0), 0);
    let _b = h.create_view("B", Rect::new(200.0, 150.0, 600.0, 450.0), 0);

    let view = h.server.tree.view(a);
    let visible = view.visible_reg.clone().unwrap();
    let full = view.full_reg.clone().unwrap();
    let mut probe = visible.clone();
    probe.intersect(&full);
    assert_eq!(probe.area(), visible.area(), "visible_reg must be within full_reg");
    let bounds = full.bounds();
    assert!(IRect::new(0, 0, 400, 300).intersects(&bounds) || full.is_empty());
}

#[test]
fn scroll_reveals_top_band_as_damage() {
    let mut h = Harness::new(800, 600);
    let v = h.create_view("V", Rect::new(0.0, 0.0, 100.0, 100.0), 0);
    h.drain_client();

    // Acknowledge the initial paint so no stale damage is outstanding.
    let mut bundle = BundleWriter::new();
    bundle.push(v, MessageCode::ViewBeginUpdate, &[]);
    bundle.push(v, MessageCode::ViewEndUpdate, &[]);
    h.send_bundle(bundle);
    h.drain_client();

    let mut bundle = BundleWriter::new();
    let mut scroll = PayloadWriter::new();
    scroll.put_point(Point::new(0.0, 10.0));
    bundle.push(v, MessageCode::ViewScrollBy, &scroll.into_bytes());
    h.send_bundle(bundle);

    // The revealed strip is pending repaint (promoted to the active damage
    // when the paint request went out).
    let view = h.server.tree.view(v);
    let mut pending = view.active_damage_reg.clone().unwrap_or_default();
    if let Some(damage) = &view.damage_reg {
        for rect in damage.rects() {
            pending.include(*rect);
        }
    }
    assert!(!pending.is_empty(), "scroll must leave damage");
    for x in [0, 50, 99] {
        for y in [0, 5, 9] {
            assert!(
                pending.contains(IPoint::new(x, y)),
                "revealed band pixel ({x},{y}) not damaged"
            );
        }
    }

    // A paint request went to the client for it.
    let paints: Vec<Envelope> = h
        .drain_client()
        .into_iter()
        .filter(|e| e.code == MessageCode::PaintView as i32)
        .collect();
    assert!(!paints.is_empty(), "no paint request after scroll");
}

#[test]
fn mouse_moves_coalesce_to_latest() {
    let mut h = Harness::new(800, 600);
    let v = h.create_view("V", Rect::new(0.0, 0.0, 400.0, 300.0), 0);
    h.drain_client();

    // Give the view pointer focus so moves route somewhere.
    let mut bundle = BundleWriter::new();
    let mut focus = PayloadWriter::new();
    focus.put_i32(v).put_i32(0).put_bool(true);
    bundle.push(h.app, MessageCode::FocusView, &focus.into_bytes());
    h.send_bundle(bundle);
    h.drain_client();

    h.post_motion(MessageCode::MouseDown, 0, 10.0, 10.0);
    h.post_motion(MessageCode::MouseMove, 0, 11.0, 11.0);
    h.post_motion(MessageCode::MouseMove, 0, 12.0, 12.0);
    h.post_motion(MessageCode::MouseMove, 0, 13.0, 13.0);
    h.server.dispatch_pending_input();

    let events = h.drain_client();
    let downs: Vec<&Envelope> = events
        .iter()
        .filter(|e| e.code == MessageCode::HandleMouseDown as i32)
        .collect();
    let moves: Vec<&Envelope> = events
        .iter()
        .filter(|e| e.code == MessageCode::HandleMouseMove as i32)
        .collect();
    assert_eq!(downs.len(), 1, "exactly one down event");
    assert_eq!(moves.len(), 1, "moves must coalesce to one event");

    let mut reader = PayloadReader::new(&downs[0].payload);
    reader.i32().unwrap();
    assert_eq!(reader.point().unwrap(), Point::new(10.0, 10.0));
    let mut reader = PayloadReader::new(&moves[0].payload);
    reader.i32().unwrap();
    assert_eq!(reader.point().unwrap(), Point::new(13.0, 13.0));
}

#[test]
fn mouse_up_routes_to_down_view() {
    let mut h = Harness::new(800, 600);
    let v = h.create_view("V", Rect::new(0.0, 0.0, 400.0, 300.0), 0);
    h.drain_client();

    h.post_motion(MessageCode::MouseDown, 0, 50.0, 50.0);
    h.server.dispatch_pending_input();
    assert_eq!(h.server.mouse_down_view(0), Some(v));

    h.post_motion(MessageCode::MouseUp, 0, 55.0, 55.0);
    h.server.dispatch_pending_input();
    assert_eq!(h.server.mouse_down_view(0), None);

    let ups: Vec<Envelope> = h
        .drain_client()
        .into_iter()
        .filter(|e| e.code == MessageCode::HandleMouseUp as i32)
        .collect();
    assert_eq!(ups.len(), 1);
}

#[test]
fn touch_ids_track_independent_down_views() {
    let mut h = Harness::new(800, 600);
    let a = h.create_view("A", Rect::new(0.0, 0.0, 200.0, 300.0), 0);
    let b = h.create_view("B", Rect::new(400.0, 0.0, 600.0, 300.0), 0);
    h.drain_client();

    h.post_motion(MessageCode::MouseDown, 16, 50.0, 50.0);
    h.post_motion(MessageCode::MouseDown, 17, 450.0, 50.0);
    h.server.dispatch_pending_input();

    assert_eq!(h.server.mouse_down_view(16), Some(a));
    assert_eq!(h.server.mouse_down_view(17), Some(b));
}

#[test]
fn hidden_view_has_no_regions_and_takes_no_events() {
    let mut h = Harness::new(800, 600);
    let v = h.create_view("V", Rect::new(0.0, 0.0, 400.0, 300.0), 0);
    h.drain_client();

    let mut bundle = BundleWriter::new();
    let mut show = PayloadWriter::new();
    show.put_bool(false);
    bundle.push(v, MessageCode::ViewShow, &show.into_bytes());
    h.send_bundle(bundle);

    let view = h.server.tree.view(v);
    assert!(view.visible_reg.is_none());
    assert!(view.full_reg.is_none());

    h.post_motion(MessageCode::MouseDown, 0, 50.0, 50.0);
    h.server.dispatch_pending_input();
    assert_eq!(h.server.mouse_down_view(0), None);
}

#[test]
fn malformed_bundle_frame_stops_only_that_bundle() {
    let mut h = Harness::new(800, 600);
    let v = h.create_view("V", Rect::new(0.0, 0.0, 100.0, 100.0), 0);
    h.drain_client();

    // A valid pen move, then a frame lying about its length.
    let mut pen = PayloadWriter::new();
    pen.put_point(Point::new(5.0, 5.0));
    let mut bundle = BundleWriter::new();
    bundle.push(v, MessageCode::ViewMovePenTo, &pen.into_bytes());
    let mut bytes = bundle.into_bytes();
    bytes.extend_from_slice(&1000i32.to_le_bytes());
    bytes.extend_from_slice(&v.to_le_bytes());
    bytes.extend_from_slice(&(MessageCode::ViewShow as i32).to_le_bytes());
    h.server.handle_message(Envelope {
        target_handler: h.app,
        code: MessageCode::MessageBundle as i32,
        payload: bytes,
    });

    // The first record was processed, the malformed one dropped, and the
    // server is still alive for the next bundle.
    assert_eq!(h.server.tree.view(v).pen_position, Point::new(5.0, 5.0));
    let mut bundle = BundleWriter::new();
    let mut pen = PayloadWriter::new();
    pen.put_point(Point::new(7.0, 7.0));
    bundle.push(v, MessageCode::ViewMovePenTo, &pen.into_bytes());
    h.send_bundle(bundle);
    assert_eq!(h.server.tree.view(v).pen_position, Point::new(7.0, 7.0));
}

#[test]
fn top_view_erases_damage_with_erase_color() {
    let mut h = Harness::new(64, 64);
    // Creating a view dirties the top; the rebuild pass erased the screen
    // with the top view's white erase color outside the opaque child.
    let _v = h.create_view("V", Rect::new(0.0, 0.0, 16.0, 16.0), 0);
    let bitmap = &h.server.screen.bitmap;
    let white = Color::rgb(255, 255, 255).to_rgb16();
    assert_eq!(bitmap.get_u16(bitmap.offset(40, 40)), white);
}
