use std::sync::{Arc, Mutex};

use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::{Display, GlobalManager};

use crate::types::config::VideoOutputSize;
use crate::types::error::{Error, Result};

/// Which display server the session runs against. The pair (desktop, GPU)
/// selects the concrete video capture variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desktop {
    X11,
    Wayland,
}

pub fn detect() -> Result<Desktop> {
    if std::env::var_os("WAYLAND_DISPLAY").is_some() {
        return Ok(Desktop::Wayland);
    }
    if std::env::var_os("DISPLAY").is_some() {
        return Ok(Desktop::X11);
    }
    Err(Error::Config(
        "no supported desktop found; neither WAYLAND_DISPLAY nor DISPLAY is set".into(),
    ))
}

/// The current mode of the first Wayland output.
pub fn wayland_output_size() -> Result<VideoOutputSize> {
    let display = Display::connect_to_env()
        .map_err(|err| Error::Capture(format!("failed to connect to Wayland: {err}")))?;

    let mut event_queue = display.create_event_queue();
    let attached = display.attach(event_queue.token());
    let globals = GlobalManager::new(&attached);
    event_queue.sync_roundtrip(&mut (), |_, _, _| {})?;

    let output = globals
        .instantiate_exact::<WlOutput>(2)
        .map_err(|err| Error::Capture(format!("no wl_output advertised: {err}")))?;

    let mode = Arc::new(Mutex::new(None));
    {
        let mode = Arc::clone(&mode);
        output.quick_assign(move |_, event, _| {
            if let wl_output::Event::Mode {
                flags,
                width,
                height,
                ..
            } = event
            {
                if flags.contains(wl_output::Mode::Current) {
                    *mode.lock().unwrap() = Some((width, height));
                }
            }
        });
    }
    event_queue.sync_roundtrip(&mut (), |_, _, _| {})?;

    let (width, height) = mode
        .lock()
        .unwrap()
        .take()
        .ok_or_else(|| Error::Capture("Wayland output reported no current mode".into()))?;
    VideoOutputSize::new(width as u32, height as u32)
}
