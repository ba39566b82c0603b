use evdev::KeyCode;
use std::collections::BTreeSet;
use std::str::FromStr;

/// An unordered set of kernel key codes.
///
/// A hotkey triggers when the set of currently-pressed keys is exactly equal
/// to it, so a superset press (extra keys held) never matches.
pub type Hotkey = BTreeSet<u16>;

/// Resolve symbolic key names ("KEY_LEFTCTRL") to a hotkey.
///
/// Returns `None` when the list is empty or any name fails to resolve, so
/// that downstream comparisons against live pressed-key sets can never match.
/// Resolution failure is non-fatal: the hotkey degrades to unavailable.
pub fn resolve<S: AsRef<str>>(names: &[S]) -> Option<Hotkey> {
    if names.is_empty() {
        return None;
    }

    let mut keys = Hotkey::new();
    for name in names {
        match KeyCode::from_str(name.as_ref()) {
            Ok(code) => {
                keys.insert(code.code());
            }
            Err(_) => {
                log::warn!(
                    "Unable to match all keys in hotkey {:?} to key codes. \
                     Hotkey will be unavailable.",
                    names.iter().map(|n| n.as_ref()).collect::<Vec<_>>(),
                );
                return None;
            }
        }
    }

    Some(keys)
}
