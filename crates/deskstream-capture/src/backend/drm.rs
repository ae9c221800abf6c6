//! Connected display discovery from the DRM sysfs tree.
//!
//! Each connector appears as `/sys/class/drm/card<N>-<connector>/` with a
//! `status` file (`connected` / `disconnected`) and a `modes` file listing
//! `WIDTHxHEIGHT` entries, preferred mode first.

use std::path::Path;

use deskstream_core::MonitorInfo;
use tracing::debug;

pub const DRM_SYSFS: &str = "/sys/class/drm";

/// Connected monitors in connector-name order.
pub fn connected_monitors() -> Vec<MonitorInfo> {
    scan(Path::new(DRM_SYSFS))
}

pub fn scan(root: &Path) -> Vec<MonitorInfo> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut connectors: Vec<(String, u32, u32)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let dir = entry.file_name().into_string().ok()?;
            // card0-HDMI-A-1 → HDMI-A-1; bare card0 / renderD128 have no connector
            let (_, connector) = dir.split_once('-')?;
            if connector.starts_with("Writeback") {
                return None;
            }
            let status = std::fs::read_to_string(entry.path().join("status")).ok()?;
            if status.trim() != "connected" {
                return None;
            }
            let modes = std::fs::read_to_string(entry.path().join("modes")).unwrap_or_default();
            let (w, h) = modes.lines().find_map(parse_mode).unwrap_or((0, 0));
            Some((connector.to_string(), w, h))
        })
        .collect();
    connectors.sort_by(|a, b| a.0.cmp(&b.0));

    // Lay displays out left to right; DRM has no notion of desktop origin
    let mut x = 0i32;
    connectors
        .into_iter()
        .enumerate()
        .map(|(i, (name, width, height))| {
            debug!("DRM connector {} connected ({}x{})", name, width, height);
            let info = MonitorInfo {
                id: i as u32,
                name,
                width,
                height,
                x,
                y: 0,
                refresh_rate: 0.0,
                is_primary: i == 0,
            };
            x += width as i32;
            info
        })
        .collect()
}

/// Parse one `modes` line such as `1920x1080` or `1920x1080i`.
pub fn parse_mode(line: &str) -> Option<(u32, u32)> {
    let (w, h) = line.trim().split_once('x')?;
    let h: String = h.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((w.parse().ok()?, h.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_progressive_and_interlaced_modes() {
        assert_eq!(parse_mode("2560x1440"), Some((2560, 1440)));
        assert_eq!(parse_mode("1920x1080i\n"), Some((1920, 1080)));
        assert_eq!(parse_mode("garbage"), None);
    }

    #[test]
    fn scan_lists_only_connected_connectors() {
        let root = std::env::temp_dir().join(format!("deskstream-drm-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let connector = |name: &str, status: &str, modes: &str| {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("status"), status).unwrap();
            fs::write(dir.join("modes"), modes).unwrap();
        };
        connector("card0-HDMI-A-1", "connected\n", "1920x1080\n1280x720\n");
        connector("card0-DP-1", "connected\n", "2560x1440\n");
        connector("card0-DP-2", "disconnected\n", "");
        connector("card0-Writeback-1", "connected\n", "");
        fs::create_dir_all(root.join("card0")).unwrap();

        let monitors = scan(&root);
        fs::remove_dir_all(&root).unwrap();

        let names: Vec<&str> = monitors.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["DP-1", "HDMI-A-1"]);
        assert!(monitors[0].is_primary);
        assert_eq!((monitors[0].width, monitors[0].height), (2560, 1440));
        assert_eq!(monitors[1].x, 2560);
    }

    #[test]
    fn missing_root_yields_nothing() {
        assert!(scan(Path::new("/nonexistent/deskstream/drm")).is_empty());
    }
}
