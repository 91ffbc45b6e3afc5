//! Mode selection, kept free of kernel types so the rules are unit-testable.

/// One connector mode reduced to the fields selection cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeCandidate {
    pub width: u32,
    pub height: u32,
    pub hz: f32,
    pub interlaced: bool,
    pub preferred: bool,
}

/// Pick the best scanout mode for a `width`x`height` source at `hz`.
///
/// Preference order: exact geometry with matching rate, exact geometry at any
/// rate, same width with smaller height (letterboxable), the connector's
/// preferred mode, then mode zero. Interlaced modes are never selected unless
/// nothing else exists.
///
/// # Example
/// ```rust
/// use visor_display::mode::{ModeCandidate, select_best};
///
/// let modes = [ModeCandidate {
///     width: 1920,
///     height: 1080,
///     hz: 60.0,
///     interlaced: false,
///     preferred: true,
/// }];
/// assert_eq!(select_best(&modes, 1920, 1080, 60.0), Some(0));
/// ```
pub fn select_best(modes: &[ModeCandidate], width: u32, height: u32, hz: f32) -> Option<usize> {
    let mut best: Option<usize> = None;
    let mut closest: Option<usize> = None;
    let mut preferred: Option<usize> = None;

    for (index, mode) in modes.iter().enumerate() {
        if mode.interlaced {
            continue;
        }
        if mode.width == width && mode.height == height {
            best = Some(index);
            if hz > 0.0 && mode.hz == hz {
                break;
            }
        }
        if mode.width == width && mode.height < height {
            let keep = match closest {
                Some(i) => modes[i].hz != hz,
                None => true,
            };
            if keep {
                closest = Some(index);
            }
        }
        if preferred.is_none() && mode.preferred {
            preferred = Some(index);
        }
    }

    best.or(closest)
        .or(preferred)
        .or(if modes.is_empty() { None } else { Some(0) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(width: u32, height: u32, hz: f32) -> ModeCandidate {
        ModeCandidate {
            width,
            height,
            hz,
            interlaced: false,
            preferred: false,
        }
    }

    #[test]
    fn exact_geometry_and_rate_wins() {
        let modes = [
            mode(1920, 1080, 30.0),
            mode(1920, 1080, 60.0),
            mode(1280, 720, 60.0),
        ];
        assert_eq!(select_best(&modes, 1920, 1080, 60.0), Some(1));
    }

    #[test]
    fn exact_geometry_any_rate_beats_letterbox() {
        let modes = [mode(1920, 1080, 30.0), mode(1920, 900, 60.0)];
        assert_eq!(select_best(&modes, 1920, 1080, 60.0), Some(0));
    }

    #[test]
    fn letterbox_same_width_smaller_height() {
        // 1920x1200 source onto a display that tops out at 1080 rows.
        let modes = [mode(1280, 720, 60.0), mode(1920, 1080, 60.0)];
        assert_eq!(select_best(&modes, 1920, 1200, 60.0), Some(1));
    }

    #[test]
    fn interlaced_modes_are_discarded() {
        let mut interlaced = mode(1920, 1080, 60.0);
        interlaced.interlaced = true;
        let modes = [interlaced, mode(1280, 720, 60.0)];
        assert_eq!(select_best(&modes, 1920, 1080, 60.0), Some(1));
    }

    #[test]
    fn preferred_mode_as_fallback() {
        let mut pref = mode(1280, 720, 60.0);
        pref.preferred = true;
        let modes = [mode(800, 600, 60.0), pref];
        assert_eq!(select_best(&modes, 640, 240, 60.0), Some(1));
    }

    #[test]
    fn mode_zero_as_last_resort() {
        let modes = [mode(800, 600, 60.0)];
        assert_eq!(select_best(&modes, 640, 480, 60.0), Some(0));
        assert_eq!(select_best(&[], 640, 480, 60.0), None);
    }
}
