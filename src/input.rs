use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use enigo::{Button, Coordinate, Direction, Enigo, Keyboard, Mouse, Settings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::Point;

/// Pointer travel is split into steps of roughly this length.
const MOVE_STEP: Duration = Duration::from_millis(10);

/// How long each press is held for emulator-style clicks.
const EMULATOR_HOLD: Duration = Duration::from_millis(40);

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input backend unavailable: {0}")]
    Unavailable(String),

    #[error("input simulation failed: {0}")]
    Simulation(String),
}

/// How a click is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickType {
    /// Plain double click.
    #[default]
    Default,
    /// Double click with held presses and a pause afterwards; emulators drop
    /// events that arrive too quickly.
    Emulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Press,
    Release,
    Click,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Tab,
    Space,
    Backspace,
    Delete,
    Shift,
    Control,
    Alt,
    Meta,
    Escape,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    F(u8),
}

impl Key {
    /// Parse a key name such as `enter`, `ctrl` or `f2` (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let key = match lower.as_str() {
            "enter" | "return" => Key::Enter,
            "tab" => Key::Tab,
            "space" => Key::Space,
            "backspace" => Key::Backspace,
            "delete" | "del" => Key::Delete,
            "shift" => Key::Shift,
            "ctrl" | "control" => Key::Control,
            "alt" => Key::Alt,
            "meta" | "win" | "super" | "cmd" => Key::Meta,
            "escape" | "esc" => Key::Escape,
            "home" => Key::Home,
            "end" => Key::End,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            "up" => Key::Up,
            "down" => Key::Down,
            "left" => Key::Left,
            "right" => Key::Right,
            other => {
                let n: u8 = other.strip_prefix('f')?.parse().ok()?;
                if !(1..=12).contains(&n) {
                    return None;
                }
                Key::F(n)
            }
        };
        Some(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keystroke {
    Key(Key),
    Text(String),
}

/// Single characters and known key names become key presses; any other
/// token is typed out as text.
pub fn parse_keystrokes<S: AsRef<str>>(tokens: &[S]) -> Vec<Keystroke> {
    tokens
        .iter()
        .map(|t| {
            let t = t.as_ref();
            let mut chars = t.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Keystroke::Key(Key::Char(c)),
                _ => match Key::from_name(t) {
                    Some(key) => Keystroke::Key(key),
                    None => Keystroke::Text(t.to_string()),
                },
            }
        })
        .collect()
}

/// Low-level pointer and keyboard primitives.
pub trait InputDriver: Send + Sync {
    fn cursor(&self) -> Result<(i32, i32), InputError>;
    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError>;
    fn button(&self, action: Action) -> Result<(), InputError>;
    fn key(&self, key: Key, action: Action) -> Result<(), InputError>;
    fn text(&self, text: &str) -> Result<(), InputError>;
}

/// Move the pointer to `target` over `duration` in small linear steps.
pub fn smooth_move(driver: &dyn InputDriver, target: Point, duration: Duration) -> Result<(), InputError> {
    let (tx, ty) = (target.x as i32, target.y as i32);
    let steps = (duration.as_millis() / MOVE_STEP.as_millis()).max(1) as i32;

    if steps == 1 {
        return driver.move_cursor(tx, ty);
    }

    let (sx, sy) = driver.cursor()?;
    let pause = duration / steps as u32;
    for i in 1..=steps {
        let x = sx + (tx - sx) * i / steps;
        let y = sy + (ty - sy) * i / steps;
        driver.move_cursor(x, y)?;
        thread::sleep(pause);
    }
    Ok(())
}

/// Move to `point` and double click it.
pub fn click_at(
    driver: &dyn InputDriver,
    point: Point,
    click_type: ClickType,
    move_duration: Duration,
    delay: Duration,
) -> Result<(), InputError> {
    smooth_move(driver, point, move_duration)?;

    match click_type {
        ClickType::Default => {
            driver.button(Action::Click)?;
            driver.button(Action::Click)?;
        }
        ClickType::Emulator => {
            for _ in 0..2 {
                driver.button(Action::Press)?;
                thread::sleep(EMULATOR_HOLD);
                driver.button(Action::Release)?;
                thread::sleep(EMULATOR_HOLD);
            }
            thread::sleep(delay);
        }
    }

    tracing::info!("clicked at ({}, {}) using {click_type:?} method", point.x, point.y);
    Ok(())
}

/// Type a sequence of keystrokes, pausing `interval` after each one. With a
/// non-zero interval text is typed one character at a time.
pub fn type_keystrokes(
    driver: &dyn InputDriver,
    strokes: &[Keystroke],
    interval: Duration,
) -> Result<(), InputError> {
    tracing::debug!("typing {strokes:?}");
    for stroke in strokes {
        match stroke {
            Keystroke::Key(key) => driver.key(*key, Action::Click)?,
            Keystroke::Text(text) if interval.is_zero() => driver.text(text)?,
            Keystroke::Text(text) => {
                for c in text.chars() {
                    driver.key(Key::Char(c), Action::Click)?;
                    thread::sleep(interval);
                }
            }
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    tracing::info!("typed {} keystroke(s)", strokes.len());
    Ok(())
}

/// Press keys in order and release them in reverse, e.g. ctrl+shift+h.
pub fn key_combination(driver: &dyn InputDriver, keys: &[Key]) -> Result<(), InputError> {
    for key in keys {
        driver.key(*key, Action::Press)?;
    }
    for key in keys.iter().rev() {
        driver.key(*key, Action::Release)?;
    }
    Ok(())
}

/// Input simulation backed by enigo.
pub struct EnigoDriver {
    enigo: Mutex<Enigo>,
}

impl EnigoDriver {
    pub fn new() -> Result<Self, InputError> {
        let enigo = Enigo::new(&Settings::default()).map_err(|e| InputError::Unavailable(e.to_string()))?;
        Ok(Self {
            enigo: Mutex::new(enigo),
        })
    }

    fn with_enigo<T>(
        &self,
        f: impl FnOnce(&mut Enigo) -> Result<T, enigo::InputError>,
    ) -> Result<T, InputError> {
        let mut enigo = self
            .enigo
            .lock()
            .map_err(|e| InputError::Simulation(format!("input driver lock poisoned: {e}")))?;
        f(&mut enigo).map_err(|e| InputError::Simulation(e.to_string()))
    }
}

fn direction(action: Action) -> Direction {
    match action {
        Action::Press => Direction::Press,
        Action::Release => Direction::Release,
        Action::Click => Direction::Click,
    }
}

fn enigo_key(key: Key) -> Result<enigo::Key, InputError> {
    use enigo::Key as E;
    Ok(match key {
        Key::Char(c) => E::Unicode(c),
        Key::Enter => E::Return,
        Key::Tab => E::Tab,
        Key::Space => E::Space,
        Key::Backspace => E::Backspace,
        Key::Delete => E::Delete,
        Key::Shift => E::Shift,
        Key::Control => E::Control,
        Key::Alt => E::Alt,
        Key::Meta => E::Meta,
        Key::Escape => E::Escape,
        Key::Home => E::Home,
        Key::End => E::End,
        Key::PageUp => E::PageUp,
        Key::PageDown => E::PageDown,
        Key::Up => E::UpArrow,
        Key::Down => E::DownArrow,
        Key::Left => E::LeftArrow,
        Key::Right => E::RightArrow,
        Key::F(1) => E::F1,
        Key::F(2) => E::F2,
        Key::F(3) => E::F3,
        Key::F(4) => E::F4,
        Key::F(5) => E::F5,
        Key::F(6) => E::F6,
        Key::F(7) => E::F7,
        Key::F(8) => E::F8,
        Key::F(9) => E::F9,
        Key::F(10) => E::F10,
        Key::F(11) => E::F11,
        Key::F(12) => E::F12,
        Key::F(n) => return Err(InputError::Simulation(format!("unsupported key F{n}"))),
    })
}

impl InputDriver for EnigoDriver {
    fn cursor(&self) -> Result<(i32, i32), InputError> {
        self.with_enigo(|e| e.location())
    }

    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError> {
        self.with_enigo(|e| e.move_mouse(x, y, Coordinate::Abs))
    }

    fn button(&self, action: Action) -> Result<(), InputError> {
        self.with_enigo(|e| e.button(Button::Left, direction(action)))
    }

    fn key(&self, key: Key, action: Action) -> Result<(), InputError> {
        let key = enigo_key(key)?;
        self.with_enigo(|e| e.key(key, direction(action)))
    }

    fn text(&self, text: &str) -> Result<(), InputError> {
        self.with_enigo(|e| e.text(text))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Move(i32, i32),
        Button(Action),
        Key(Key, Action),
        Text(String),
    }

    /// Records every primitive instead of touching the real devices.
    #[derive(Default)]
    pub struct RecordingDriver {
        pub events: Mutex<Vec<Event>>,
        pub position: Mutex<(i32, i32)>,
    }

    impl RecordingDriver {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        /// Pointer positions at which a double click finished.
        pub fn clicks(&self) -> Vec<(i32, i32)> {
            let mut pos = (0, 0);
            let mut presses = 0;
            let mut out = Vec::new();
            for e in self.events() {
                match e {
                    Event::Move(x, y) => {
                        pos = (x, y);
                        presses = 0;
                    }
                    Event::Button(Action::Click) | Event::Button(Action::Release) => {
                        presses += 1;
                        if presses == 2 {
                            out.push(pos);
                            presses = 0;
                        }
                    }
                    _ => {}
                }
            }
            out
        }
    }

    impl InputDriver for RecordingDriver {
        fn cursor(&self) -> Result<(i32, i32), InputError> {
            Ok(*self.position.lock().unwrap())
        }

        fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError> {
            *self.position.lock().unwrap() = (x, y);
            self.events.lock().unwrap().push(Event::Move(x, y));
            Ok(())
        }

        fn button(&self, action: Action) -> Result<(), InputError> {
            self.events.lock().unwrap().push(Event::Button(action));
            Ok(())
        }

        fn key(&self, key: Key, action: Action) -> Result<(), InputError> {
            self.events.lock().unwrap().push(Event::Key(key, action));
            Ok(())
        }

        fn text(&self, text: &str) -> Result<(), InputError> {
            self.events.lock().unwrap().push(Event::Text(text.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(Key::from_name("Enter"), Some(Key::Enter));
        assert_eq!(Key::from_name("ctrl"), Some(Key::Control));
        assert_eq!(Key::from_name("PAGEDOWN"), Some(Key::PageDown));
        assert_eq!(Key::from_name("f3"), Some(Key::F(3)));
        assert_eq!(Key::from_name("f13"), None);
        assert_eq!(Key::from_name("hello"), None);
    }

    #[test]
    fn test_parse_keystrokes() {
        let strokes = parse_keystrokes(&["B", "enter", "hello", "tab"]);
        assert_eq!(
            strokes,
            vec![
                Keystroke::Key(Key::Char('B')),
                Keystroke::Key(Key::Enter),
                Keystroke::Text("hello".into()),
                Keystroke::Key(Key::Tab),
            ]
        );
    }

    #[test]
    fn test_smooth_move_ends_on_target() {
        let driver = RecordingDriver::default();
        smooth_move(&driver, Point::new(100, 50), Duration::from_millis(50)).unwrap();
        let events = driver.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events.last(), Some(&Event::Move(100, 50)));
        assert_eq!(events[0], Event::Move(20, 10));
    }

    #[test]
    fn test_instant_move_for_short_duration() {
        let driver = RecordingDriver::default();
        smooth_move(&driver, Point::new(7, 9), Duration::ZERO).unwrap();
        assert_eq!(driver.events(), vec![Event::Move(7, 9)]);
    }

    #[test]
    fn test_default_click_is_double_click() {
        let driver = RecordingDriver::default();
        click_at(&driver, Point::new(30, 40), ClickType::Default, Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(
            driver.events(),
            vec![
                Event::Move(30, 40),
                Event::Button(Action::Click),
                Event::Button(Action::Click),
            ]
        );
        assert_eq!(driver.clicks(), vec![(30, 40)]);
    }

    #[test]
    fn test_emulator_click_holds_presses() {
        let driver = RecordingDriver::default();
        click_at(&driver, Point::new(5, 5), ClickType::Emulator, Duration::ZERO, Duration::ZERO).unwrap();
        let buttons: Vec<_> = driver
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Button(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(buttons, vec![Action::Press, Action::Release, Action::Press, Action::Release]);
        assert_eq!(driver.clicks(), vec![(5, 5)]);
    }

    #[test]
    fn test_type_keystrokes_expands_text_with_interval() {
        let driver = RecordingDriver::default();
        let strokes = parse_keystrokes(&["ab", "enter"]);
        type_keystrokes(&driver, &strokes, Duration::from_millis(1)).unwrap();
        assert_eq!(
            driver.events(),
            vec![
                Event::Key(Key::Char('a'), Action::Click),
                Event::Key(Key::Char('b'), Action::Click),
                Event::Key(Key::Enter, Action::Click),
            ]
        );
    }

    #[test]
    fn test_type_keystrokes_sends_text_at_once_without_interval() {
        let driver = RecordingDriver::default();
        let strokes = parse_keystrokes(&["bluestacks", "enter"]);
        type_keystrokes(&driver, &strokes, Duration::ZERO).unwrap();
        assert_eq!(
            driver.events(),
            vec![Event::Text("bluestacks".into()), Event::Key(Key::Enter, Action::Click)]
        );
    }

    #[test]
    fn test_key_combination_releases_in_reverse() {
        let driver = RecordingDriver::default();
        key_combination(&driver, &[Key::Control, Key::Shift, Key::Char('h')]).unwrap();
        assert_eq!(
            driver.events(),
            vec![
                Event::Key(Key::Control, Action::Press),
                Event::Key(Key::Shift, Action::Press),
                Event::Key(Key::Char('h'), Action::Press),
                Event::Key(Key::Char('h'), Action::Release),
                Event::Key(Key::Shift, Action::Release),
                Event::Key(Key::Control, Action::Release),
            ]
        );
    }

    #[test]
    fn test_click_type_serde_names() {
        assert_eq!(serde_json::to_string(&ClickType::Emulator).unwrap(), "\"emulator\"");
        let parsed: ClickType = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(parsed, ClickType::Default);
    }
}
