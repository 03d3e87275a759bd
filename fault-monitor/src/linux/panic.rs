//! Capture of panics, through a hook that runs before whatever hook was
//! installed previously.

use std::panic::PanicHookInfo;

pub(super) fn install() {
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        on_panic(info);
        previous(info);
    }));
}

fn on_panic(info: &PanicHookInfo<'_>) {
    let payload = info.payload();
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    };

    let location = info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

    super::state::capture_panic(message, location.as_deref());
}
