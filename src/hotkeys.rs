use std::thread;

use rdev::{EventType, Key};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    /// F2
    TogglePause,
    /// F3
    Shutdown,
}

pub fn map_key(key: Key) -> Option<HotkeyEvent> {
    match key {
        Key::F2 => Some(HotkeyEvent::TogglePause),
        Key::F3 => Some(HotkeyEvent::Shutdown),
        _ => None,
    }
}

/// Listen for global key presses on a background thread and forward hotkey
/// events. The thread lives until the process exits; `rdev::listen` offers
/// no way to stop it.
pub fn spawn_listener(tx: UnboundedSender<HotkeyEvent>) {
    let spawned = thread::Builder::new()
        .name("hotkeys".into())
        .spawn(move || {
            tracing::info!("hotkeys active: F2 pause/resume, F3 stop");
            let result = rdev::listen(move |event| {
                if let EventType::KeyPress(key) = event.event_type
                    && let Some(hotkey) = map_key(key)
                {
                    tracing::debug!("hotkey {hotkey:?}");
                    let _ = tx.send(hotkey);
                }
            });
            if let Err(e) = result {
                tracing::error!("hotkey listener failed: {e:?}");
            }
        });

    if let Err(e) = spawned {
        tracing::error!("failed to start hotkey listener: {e}");
    }
}
