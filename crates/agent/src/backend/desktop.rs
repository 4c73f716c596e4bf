//! Desktop backend (spec.md §6): display resize, input injection, and
//! cursor tracking as one small trait, condensing the teacher's
//! `display.rs`/`input.rs`/`cursor.rs`/`capture.rs` into the seam the rest
//! of the agent talks to. Screen *pixel* capture is no longer a Rust-side
//! concern here — it now lives inside the GStreamer pipeline description
//! itself (an `ximagesrc`/`pulsesrc` element), per spec.md §6's
//! `create_pipeline(description)` boundary; see DESIGN.md.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use beam_protocol::InputEvent;
use input_linux::sys::input_event;
use input_linux::{
    AbsoluteAxis, AbsoluteEvent, AbsoluteInfo, AbsoluteInfoSetup, EventKind, EventTime, InputId,
    Key, KeyEvent, KeyState, RelativeAxis, RelativeEvent, SynchronizeEvent, UInputHandle,
};
use std::fs::{File, OpenOptions};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xfixes;
use x11rb::rust_connection::RustConnection;

/// Matches `AbsoluteAxis`'s configured range and the wire format's
/// `0..=0xFFFF` absolute coordinate space (spec.md §6), so mouse-move
/// events need no rescaling between the data channel and uinput.
const ABS_MAX: i32 = 0xFFFF;

/// A held key past this age gets a synthetic release (spec.md §6/§7's
/// `check_keys(ttl=10s)`): protects against a dropped key-up losing the
/// browser tab focus or a crashed peer leaving a key stuck down.
const KEY_DEBOUNCE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum CursorUpdate {
    Position { x: u16, y: u16 },
    Image {
        width: u16,
        height: u16,
        xhot: u16,
        yhot: u16,
        pixels: Vec<u8>,
    },
}

/// Clamp and normalize resize dimensions for safe use with xrandr and
/// H.264. `None` if out of the valid range (320..=7680, 240..=4320).
pub fn clamp_resize_dimensions(
    w: u32,
    h: u32,
    max_width: u32,
    max_height: u32,
) -> Option<(u32, u32)> {
    if !(320..=7680).contains(&w) || !(240..=4320).contains(&h) {
        return None;
    }
    let cw = if max_width > 0 { w.min(max_width) } else { w };
    let ch = if max_height > 0 { h.min(max_height) } else { h };
    let cw = cw.max(640) & !1;
    let ch = ch.max(480) & !1;
    Some((cw, ch))
}

pub trait DesktopService: Send + Sync {
    fn resize(&self, width: u32, height: u32) -> anyhow::Result<()>;
    fn inject_input(&self, event: &InputEvent) -> anyhow::Result<()>;
    /// Spawns the background watcher thread once; returns its update
    /// channel. Calling more than once is a logic error the caller must
    /// avoid — there is exactly one cursor to watch per display.
    fn watch_cursor(&self) -> anyhow::Result<mpsc::Receiver<CursorUpdate>>;
}

pub struct X11Desktop {
    display: String,
    injector: Arc<Mutex<InputInjector>>,
}

impl X11Desktop {
    pub fn new(display: &str) -> anyhow::Result<Self> {
        let injector = InputInjector::new().context("failed to create virtual input devices")?;
        let injector = Arc::new(Mutex::new(injector));
        spawn_key_debounce(Arc::clone(&injector));
        Ok(Self {
            display: display.to_string(),
            injector,
        })
    }
}

/// Background sweep releasing any key held past `KEY_DEBOUNCE_TTL`
/// (spec.md §6/§7). Runs for the process's whole lifetime; there's exactly
/// one virtual keyboard to debounce.
fn spawn_key_debounce(injector: Arc<Mutex<InputInjector>>) {
    std::thread::Builder::new()
        .name("key-debounce".into())
        .spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            if let Ok(mut guard) = injector.lock() {
                guard.check_keys(KEY_DEBOUNCE_TTL);
            }
        })
        .expect("failed to spawn key-debounce thread");
}

impl DesktopService for X11Desktop {
    fn resize(&self, width: u32, height: u32) -> anyhow::Result<()> {
        set_display_resolution(&self.display, width, height)
    }

    fn inject_input(&self, event: &InputEvent) -> anyhow::Result<()> {
        let mut injector = self
            .injector
            .lock()
            .map_err(|_| anyhow::anyhow!("input injector mutex poisoned"))?;
        match *event {
            InputEvent::Key { c, d } => injector.inject_key(c, d),
            InputEvent::MouseMove { x, y } => injector.inject_mouse_move_abs(x, y),
            InputEvent::Button { b, d } => injector.inject_button(b, d),
            InputEvent::Scroll { dx, dy } => injector.inject_scroll(dx, dy),
            InputEvent::Touch { x, y, .. } => injector.inject_mouse_move_abs(x, y),
            InputEvent::Resize { .. } => Ok(()),
        }
    }

    fn watch_cursor(&self) -> anyhow::Result<mpsc::Receiver<CursorUpdate>> {
        let display = self.display.clone();
        let (tx, rx) = mpsc::channel(16);
        std::thread::Builder::new()
            .name("cursor-watch".into())
            .spawn(move || {
                if let Err(e) = cursor_watch_loop(&display, tx) {
                    warn!("cursor watch exited: {e:#}");
                }
            })
            .context("failed to spawn cursor watch thread")?;
        Ok(rx)
    }
}

fn set_display_resolution(x_display: &str, width: u32, height: u32) -> anyhow::Result<()> {
    use std::process::Command;
    let mode_name = format!("{width}x{height}");
    let modeline = generate_modeline(width, height, 60);

    let _ = Command::new("xrandr")
        .env("DISPLAY", format!(":{x_display}"))
        .args(["--newmode", &mode_name])
        .args(modeline.split_whitespace())
        .output();
    let _ = Command::new("xrandr")
        .env("DISPLAY", format!(":{x_display}"))
        .args(["--addmode", "DUMMY0", &mode_name])
        .output();
    let output = Command::new("xrandr")
        .env("DISPLAY", format!(":{x_display}"))
        .args(["--output", "DUMMY0", "--mode", &mode_name])
        .output()
        .context("failed to run xrandr --output")?;
    if !output.status.success() {
        anyhow::bail!(
            "xrandr failed to set {mode_name}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    info!(x_display, width, height, "display resolution changed");
    Ok(())
}

fn generate_modeline(width: u32, height: u32, refresh: u32) -> String {
    let pixel_clock = (width as f64 * height as f64 * refresh as f64) / 1_000_000.0 * 1.2;
    format!(
        "{:.2} {} {} {} {} {} {} {} {} +hsync +vsync",
        pixel_clock,
        width,
        width + 48,
        width + 48 + 32,
        width + 48 + 32 + 80,
        height,
        height + 3,
        height + 3 + 5,
        height + 3 + 5 + 25,
    )
}

/// Watches XFixes cursor-change notifications and pushes both the cursor's
/// hotspot-adjusted pixel image (spec.md's `CURSOR_IMAGE` frame) and its
/// position. Grounded in the teacher's `cursor.rs` event loop, extended to
/// carry the actual ARGB pixel data instead of a CSS cursor name, since the
/// wire format sends real bitmaps (`internal/webrtc/payload/send.go`).
fn cursor_watch_loop(display: &str, tx: mpsc::Sender<CursorUpdate>) -> anyhow::Result<()> {
    let (conn, screen_num) = RustConnection::connect(Some(display))
        .map_err(|e| anyhow::anyhow!("X11 connect: {e}"))?;
    let screen = &conn.setup().roots[screen_num];
    let root = screen.root;

    let version = xfixes::query_version(&conn, 4, 0)?.reply()?;
    if version.major_version < 4 {
        anyhow::bail!(
            "XFixes version {}.{} too old (need >= 4.0)",
            version.major_version,
            version.minor_version
        );
    }

    xfixes::select_cursor_input(&conn, root, xfixes::CursorNotifyMask::DISPLAY_CURSOR)?;
    conn.flush()?;

    let mut last_serial: u32 = 0;
    send_cursor_image(&conn, &tx, &mut last_serial)?;

    loop {
        let event = conn.wait_for_event()?;
        if let Event::XfixesCursorNotify(notify) = event {
            if notify.cursor_serial == last_serial {
                continue;
            }
            if send_cursor_image(&conn, &tx, &mut last_serial).is_err() {
                break;
            }
        }

        if let Ok(reply) = x11rb::protocol::xproto::query_pointer(&conn, root)?.reply() {
            let position = CursorUpdate::Position {
                x: reply.root_x.max(0) as u16,
                y: reply.root_y.max(0) as u16,
            };
            if tx.blocking_send(position).is_err() {
                break;
            }
        }
    }

    Ok(())
}

fn send_cursor_image(
    conn: &RustConnection,
    tx: &mpsc::Sender<CursorUpdate>,
    last_serial: &mut u32,
) -> anyhow::Result<()> {
    let reply = xfixes::get_cursor_image(conn)?.reply()?;
    *last_serial = reply.cursor_serial;

    // XFixes hands back premultiplied ARGB32 words; re-pack into plain
    // RGBA8 bytes, the pixel layout the data channel wire format expects.
    let mut pixels = Vec::with_capacity(reply.cursor_image.len() * 4);
    for argb in &reply.cursor_image {
        let a = (argb >> 24) as u8;
        let r = (argb >> 16) as u8;
        let g = (argb >> 8) as u8;
        let b = *argb as u8;
        pixels.extend_from_slice(&[r, g, b, a]);
    }

    debug!(
        width = reply.width,
        height = reply.height,
        "cursor image changed"
    );

    let update = CursorUpdate::Image {
        width: reply.width,
        height: reply.height,
        xhot: reply.xhot,
        yhot: reply.yhot,
        pixels,
    };
    if tx.blocking_send(update).is_err() {
        anyhow::bail!("cursor update receiver dropped");
    }
    Ok(())
}

fn expired_keys(pressed: &HashMap<u16, Instant>, now: Instant, ttl: Duration) -> Vec<u16> {
    pressed
        .iter()
        .filter(|(_, &since)| now.duration_since(since) >= ttl)
        .map(|(&code, _)| code)
        .collect()
}

/// Virtual keyboard/mouse via `uinput`, grounded verbatim in the teacher's
/// `input.rs` device setup (separate absolute and relative mouse devices
/// so libinput doesn't misclassify either one).
struct InputInjector {
    keyboard: UInputHandle<File>,
    mouse: UInputHandle<File>,
    scroll_accum_x: f64,
    scroll_accum_y: f64,
    pressed_keys: HashMap<u16, Instant>,
}

impl InputInjector {
    fn new() -> anyhow::Result<Self> {
        let keyboard = Self::create_keyboard().context("failed to create virtual keyboard")?;
        let mouse = Self::create_mouse().context("failed to create virtual mouse")?;
        Ok(Self {
            keyboard,
            mouse,
            scroll_accum_x: 0.0,
            scroll_accum_y: 0.0,
            pressed_keys: HashMap::new(),
        })
    }

    fn open_uinput() -> anyhow::Result<File> {
        OpenOptions::new()
            .write(true)
            .open("/dev/uinput")
            .context("failed to open /dev/uinput (check permissions)")
    }

    fn create_keyboard() -> anyhow::Result<UInputHandle<File>> {
        let file = Self::open_uinput()?;
        let handle = UInputHandle::new(file);
        handle.set_evbit(EventKind::Key)?;
        handle.set_evbit(EventKind::Synchronize)?;
        for code in 1..=248u16 {
            if let Ok(key) = Key::from_code(code) {
                handle.set_keybit(key)?;
            }
        }
        let id = InputId {
            bustype: 0x03,
            vendor: 0x1234,
            product: 0x5678,
            version: 1,
        };
        handle.create(&id, b"Agent Virtual Keyboard\0", 0, &[])?;
        Ok(handle)
    }

    fn create_mouse() -> anyhow::Result<UInputHandle<File>> {
        let file = Self::open_uinput()?;
        let handle = UInputHandle::new(file);
        handle.set_evbit(EventKind::Key)?;
        handle.set_evbit(EventKind::Absolute)?;
        handle.set_evbit(EventKind::Relative)?;
        handle.set_evbit(EventKind::Synchronize)?;
        handle.set_keybit(Key::ButtonLeft)?;
        handle.set_keybit(Key::ButtonRight)?;
        handle.set_keybit(Key::ButtonMiddle)?;
        handle.set_absbit(AbsoluteAxis::X)?;
        handle.set_absbit(AbsoluteAxis::Y)?;
        handle.set_relbit(RelativeAxis::Wheel)?;
        handle.set_relbit(RelativeAxis::HorizontalWheel)?;
        handle.set_relbit(RelativeAxis::WheelHiRes)?;
        handle.set_relbit(RelativeAxis::HorizontalWheelHiRes)?;

        let abs_info = |axis| AbsoluteInfoSetup {
            axis,
            info: AbsoluteInfo {
                value: 0,
                minimum: 0,
                maximum: ABS_MAX,
                fuzz: 0,
                flat: 0,
                resolution: 0,
            },
        };
        let id = InputId {
            bustype: 0x03,
            vendor: 0x1234,
            product: 0x5679,
            version: 1,
        };
        handle.create(
            &id,
            b"Agent Virtual Mouse\0",
            0,
            &[abs_info(AbsoluteAxis::X), abs_info(AbsoluteAxis::Y)],
        )?;
        Ok(handle)
    }

    fn inject_key(&mut self, code: u16, pressed: bool) -> anyhow::Result<()> {
        let key = Key::from_code(code).map_err(|_| anyhow::anyhow!("invalid key code: {code}"))?;
        let time = EventTime::default();
        let events = [
            KeyEvent::new(time, key, KeyState::pressed(pressed))
                .into_event()
                .into_raw(),
            SynchronizeEvent::report(time).into_event().into_raw(),
        ];
        self.keyboard.write(&events)?;
        if pressed {
            self.pressed_keys.insert(code, Instant::now());
        } else {
            self.pressed_keys.remove(&code);
        }
        Ok(())
    }

    /// Synthesizes a release for every key held past `ttl` (spec.md §6/§7).
    /// Called periodically from a background sweep, not from the data
    /// channel, so a peer that vanishes mid-keypress can't leave a key
    /// stuck down forever.
    fn check_keys(&mut self, ttl: Duration) {
        for code in expired_keys(&self.pressed_keys, Instant::now(), ttl) {
            debug!(code, "key held past ttl, synthesizing release");
            if let Err(e) = self.inject_key(code, false) {
                warn!("debounce release failed for key {code}: {e:#}");
                self.pressed_keys.remove(&code);
            }
        }
    }

    fn inject_mouse_move_abs(&mut self, x: u16, y: u16) -> anyhow::Result<()> {
        let time = EventTime::default();
        let events: [input_event; 3] = [
            AbsoluteEvent::new(time, AbsoluteAxis::X, x as i32)
                .into_event()
                .into_raw(),
            AbsoluteEvent::new(time, AbsoluteAxis::Y, y as i32)
                .into_event()
                .into_raw(),
            SynchronizeEvent::report(time).into_event().into_raw(),
        ];
        self.mouse.write(&events)?;
        Ok(())
    }

    fn map_button(button: u8) -> anyhow::Result<Key> {
        match button {
            0 => Ok(Key::ButtonLeft),
            1 => Ok(Key::ButtonMiddle),
            2 => Ok(Key::ButtonRight),
            _ => anyhow::bail!("unknown mouse button: {button}"),
        }
    }

    fn inject_button(&mut self, button: u8, pressed: bool) -> anyhow::Result<()> {
        let key = Self::map_button(button)?;
        let time = EventTime::default();
        let events = [
            KeyEvent::new(time, key, KeyState::pressed(pressed))
                .into_event()
                .into_raw(),
            SynchronizeEvent::report(time).into_event().into_raw(),
        ];
        self.mouse.write(&events)?;
        Ok(())
    }

    fn pixel_to_hires(pixels: f64) -> i32 {
        (pixels / 30.0 * 120.0) as i32
    }

    fn accumulate_scroll(accum: &mut f64, pixels_per_notch: f64) -> i32 {
        *accum += pixels_per_notch;
        let discrete = *accum as i32;
        if discrete != 0 {
            *accum -= discrete as f64;
        }
        discrete
    }

    fn inject_scroll(&mut self, dx: i32, dy: i32) -> anyhow::Result<()> {
        let time = EventTime::default();
        let mut events = Vec::with_capacity(5);
        let dx = dx as f64;
        let dy = dy as f64;

        if dy.abs() > 0.5 {
            let hires = Self::pixel_to_hires(-dy);
            if hires != 0 {
                events.push(
                    RelativeEvent::new(time, RelativeAxis::WheelHiRes, hires)
                        .into_event()
                        .into_raw(),
                );
            }
            let discrete = Self::accumulate_scroll(&mut self.scroll_accum_y, -dy / 30.0);
            if discrete != 0 {
                events.push(
                    RelativeEvent::new(time, RelativeAxis::Wheel, discrete)
                        .into_event()
                        .into_raw(),
                );
            }
        }
        if dx.abs() > 0.5 {
            let hires = Self::pixel_to_hires(dx);
            if hires != 0 {
                events.push(
                    RelativeEvent::new(time, RelativeAxis::HorizontalWheelHiRes, hires)
                        .into_event()
                        .into_raw(),
                );
            }
            let discrete = Self::accumulate_scroll(&mut self.scroll_accum_x, dx / 30.0);
            if discrete != 0 {
                events.push(
                    RelativeEvent::new(time, RelativeAxis::HorizontalWheel, discrete)
                        .into_event()
                        .into_raw(),
                );
            }
        }
        if !events.is_empty() {
            events.push(SynchronizeEvent::report(time).into_event().into_raw());
            self.mouse.write(&events)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_resize_rejects_too_small() {
        assert_eq!(clamp_resize_dimensions(100, 100, 0, 0), None);
    }

    #[test]
    fn clamp_resize_rejects_too_large() {
        assert_eq!(clamp_resize_dimensions(7681, 1080, 0, 0), None);
    }

    #[test]
    fn clamp_resize_enforces_max_bounds() {
        let (w, h) = clamp_resize_dimensions(2560, 1440, 1920, 1080).unwrap();
        assert_eq!((w, h), (1920, 1080));
    }

    #[test]
    fn clamp_resize_enforces_even_dimensions() {
        let (w, h) = clamp_resize_dimensions(1921, 1081, 0, 0).unwrap();
        assert_eq!((w, h), (1920, 1080));
    }

    #[test]
    fn button_mapping() {
        assert!(matches!(InputInjector::map_button(0), Ok(Key::ButtonLeft)));
        assert!(matches!(
            InputInjector::map_button(2),
            Ok(Key::ButtonRight)
        ));
        assert!(InputInjector::map_button(9).is_err());
    }

    #[test]
    fn accumulate_scroll_fractional_notch() {
        let mut accum = 0.0;
        assert_eq!(InputInjector::accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(InputInjector::accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(InputInjector::accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(InputInjector::accumulate_scroll(&mut accum, 0.3), 1);
    }

    #[test]
    fn pixel_to_hires_one_notch() {
        assert_eq!(InputInjector::pixel_to_hires(30.0), 120);
    }

    #[test]
    fn expired_keys_finds_only_keys_past_ttl() {
        let start = Instant::now();
        let mut pressed = HashMap::new();
        pressed.insert(30u16, start);
        pressed.insert(31u16, start + Duration::from_secs(9));
        let now = start + Duration::from_secs(10);
        let mut expired = expired_keys(&pressed, now, KEY_DEBOUNCE_TTL);
        expired.sort();
        assert_eq!(expired, vec![30]);
    }

    #[test]
    fn expired_keys_empty_when_nothing_is_pressed() {
        assert!(expired_keys(&HashMap::new(), Instant::now(), KEY_DEBOUNCE_TTL).is_empty());
    }
}
