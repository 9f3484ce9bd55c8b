use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use directories::BaseDirs;
use tracing::{info, warn};

/// Mapping from device model (as adb reports it) to serial number.
pub type DeviceMap = HashMap<String, String>;

/// Everything discovered once at startup; read-only for the rest of the run.
#[derive(Debug, Clone)]
pub struct Environment {
    pub changelist: String,
    pub output_dir: PathBuf,
    pub scratch_base: PathBuf,
    pub devices: DeviceMap,
}

impl Environment {
    /// Probe the change-list tool, the home directory, and the connected
    /// device fleet, then lay out the per-run output directory.
    pub fn discover() -> Result<Self> {
        let changelist_tool = resolve_tool("BENCHFLEET_CHANGELIST", "changelist")?;
        let changelist = probe_changelist(&changelist_tool)?;

        let base_dirs = BaseDirs::new().context("unable to determine the user home directory")?;
        let home = base_dirs.home_dir();

        let adb = resolve_tool("BENCHFLEET_ADB", "adb")?;
        let listing = capture_stdout(&adb, &["devices", "-l"])
            .context("device listing probe failed")?;
        let devices = parse_device_listing(&listing)?;

        let output_dir = output_dir_for(home, &changelist, Utc::now());
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

        info!(
            changelist = %changelist,
            output_dir = %output_dir.display(),
            devices = devices.len(),
            "environment discovered"
        );

        Ok(Self {
            changelist,
            output_dir,
            scratch_base: home.join("blaze_output"),
            devices,
        })
    }
}

/// Resolve an external tool: explicit env override first, then PATH lookup.
pub fn resolve_tool(override_var: &str, default_name: &str) -> Result<PathBuf> {
    if let Ok(path) = env::var(override_var) {
        return Ok(PathBuf::from(path));
    }
    which::which(default_name).with_context(|| {
        format!("{default_name} not found on PATH; set {override_var} to its location")
    })
}

fn capture_stdout(binary: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .with_context(|| format!("failed to spawn {}", binary.display()))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn probe_changelist(binary: &Path) -> Result<String> {
    let output = Command::new(binary)
        .output()
        .with_context(|| format!("change-list probe failed to spawn {}", binary.display()))?;
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || id.is_empty() || id == "-1" {
        bail!("no pending change; create one before benchmarking");
    }
    Ok(id)
}

/// Parse `adb devices -l` style output: one header line, then one row per
/// device (serial followed by `key:value` attributes), then a blank line.
pub fn parse_device_listing(listing: &str) -> Result<DeviceMap> {
    let mut rows: Vec<&str> = listing.lines().skip(1).collect();
    if rows.last().is_some_and(|line| line.trim().is_empty()) {
        rows.pop();
    }

    let mut devices = DeviceMap::new();
    for row in rows {
        let mut fields = row.split_whitespace();
        let Some(serial) = fields.next() else {
            continue;
        };
        let mut model = None;
        for attribute in fields {
            let Some((key, value)) = attribute.split_once(':') else {
                bail!("unparsable device listing line: {row:?}");
            };
            if key == "model" {
                model = Some(value.to_string());
            }
        }
        let Some(model) = model else {
            continue;
        };
        if let Some(existing) = devices.get(&model) {
            warn!(model = %model, kept = %existing, ignored = %serial, "duplicate device model in listing");
            continue;
        }
        devices.insert(model, serial.to_string());
    }
    Ok(devices)
}

/// `<home>/upb_android_benchmarks/<cl>/<yyyy-mm-dd_HH-MM-SS>`
pub fn output_dir_for(home: &Path, changelist: &str, now: DateTime<Utc>) -> PathBuf {
    home.join("upb_android_benchmarks")
        .join(changelist)
        .join(now.format("%Y-%m-%d_%H-%M-%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LISTING: &str = "List of devices attached\n\
        48121FDAQ0019C         usb:1-4 product:p9a model:Pixel_9a device:tegu transport_id:3\n\
        9B081FFAZ002ZL         usb:1-5 product:mokey model:mokey device:mokey transport_id:5\n\
        \n";

    #[test]
    fn listing_skips_header_and_trailing_blank() {
        let devices = parse_device_listing(LISTING).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices["Pixel_9a"], "48121FDAQ0019C");
        assert_eq!(devices["mokey"], "9B081FFAZ002ZL");
    }

    #[test]
    fn listing_without_devices_is_empty() {
        let devices = parse_device_listing("List of devices attached\n\n").unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn attribute_without_separator_is_rejected() {
        let listing = "List of devices attached\nABC123 unauthorized\n";
        let err = parse_device_listing(listing).unwrap_err();
        assert!(err.to_string().contains("unparsable device listing line"));
    }

    #[test]
    fn duplicate_model_keeps_first_serial() {
        let listing = "List of devices attached\n\
            SERIAL_A model:Pixel_9a\n\
            SERIAL_B model:Pixel_9a\n";
        let devices = parse_device_listing(listing).unwrap();
        assert_eq!(devices["Pixel_9a"], "SERIAL_A");
    }

    #[test]
    fn rows_without_model_are_ignored() {
        let listing = "List of devices attached\nABC123 product:p9a\n";
        let devices = parse_device_listing(listing).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn output_dir_layout() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let dir = output_dir_for(Path::new("/home/dev"), "12345678", now);
        assert_eq!(
            dir,
            PathBuf::from("/home/dev/upb_android_benchmarks/12345678/2025-03-14_09-26-53")
        );
    }
}
