//! Argument parsing and report helpers for the subcommands.

use std::time::Duration;

use anyhow::{anyhow, bail};

use midi_protocol::identity::DeviceDescriptor;

/// Parse hex byte arguments. Accepts `90`, `0x90` and `903C7F` runs.
pub fn parse_bytes(args: &[String]) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for arg in args {
        let digits = arg.trim_start_matches("0x").trim_start_matches("0X");
        if digits.is_empty() || digits.len() % 2 != 0 {
            bail!("'{}' is not a whole number of hex bytes", arg);
        }
        for i in (0..digits.len()).step_by(2) {
            let pair = digits.get(i..i + 2).ok_or_else(|| anyhow!("'{}' is not ASCII hex", arg))?;
            let byte = u8::from_str_radix(pair, 16).map_err(|_| anyhow!("'{}' is not hex", arg))?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

/// Pick a device by enumeration index, exact name, or unique
/// case-insensitive name fragment.
pub fn find_device(devices: &[DeviceDescriptor], query: &str) -> anyhow::Result<DeviceDescriptor> {
    if let Ok(index) = query.parse::<usize>() {
        return devices
            .iter()
            .find(|d| d.index == index)
            .cloned()
            .ok_or_else(|| anyhow!("No device at index {}", index));
    }
    if let Some(d) = devices.iter().find(|d| d.name == query) {
        return Ok(d.clone());
    }

    let needle = query.to_lowercase();
    let matches: Vec<&DeviceDescriptor> = devices
        .iter()
        .filter(|d| d.name.to_lowercase().contains(&needle))
        .collect();
    match matches.as_slice() {
        [d] => Ok((*d).clone()),
        [] => bail!("No device matches '{}'", query),
        _ => bail!(
            "'{}' is ambiguous: {}",
            query,
            matches.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        ),
    }
}

pub fn format_bytes(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

/// Summary of measured tick gaps against the requested interval.
#[derive(Debug, PartialEq, Eq)]
pub struct GapReport {
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    /// Gaps shorter than the interval
    pub early: usize,
}

impl GapReport {
    pub fn new(gaps: &[Duration], interval: Duration) -> Option<Self> {
        let min = *gaps.iter().min()?;
        let max = *gaps.iter().max()?;
        let total: Duration = gaps.iter().sum();
        Some(Self {
            min,
            max,
            mean: total / gaps.len() as u32,
            early: gaps.iter().filter(|&&g| g < interval).count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use midi_protocol::identity::Direction;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn devices() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor::new(Direction::Output, 0, 10, "Loopback Cable 1"),
            DeviceDescriptor::new(Direction::Output, 1, 11, "Loopback Cable 2"),
            DeviceDescriptor::new(Direction::Output, 2, 12, "Synth"),
        ]
    }

    #[test]
    fn parses_separate_and_packed_hex() {
        assert_eq!(parse_bytes(&strings(&["90", "0x3C", "7f"])).unwrap(), vec![0x90, 0x3C, 0x7F]);
        assert_eq!(parse_bytes(&strings(&["F07E7F0601F7"])).unwrap(), vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
    }

    #[test]
    fn rejects_odd_or_non_hex() {
        assert!(parse_bytes(&strings(&["9"])).is_err());
        assert!(parse_bytes(&strings(&["zz"])).is_err());
        assert!(parse_bytes(&strings(&["0x"])).is_err());
    }

    #[test]
    fn finds_by_index_name_and_fragment() {
        let devices = devices();
        assert_eq!(find_device(&devices, "2").unwrap().name, "Synth");
        assert_eq!(find_device(&devices, "Loopback Cable 2").unwrap().endpoint, 11);
        assert_eq!(find_device(&devices, "synth").unwrap().endpoint, 12);
        assert!(find_device(&devices, "loopback").is_err());
        assert!(find_device(&devices, "9").is_err());
    }

    #[test]
    fn formats_upper_hex() {
        assert_eq!(format_bytes(&[0xF0, 0x0A, 0xF7]), "F0 0A F7");
    }

    #[test]
    fn gap_report_counts_early_ticks() {
        let ms = Duration::from_millis;
        let report = GapReport::new(&[ms(10), ms(12), ms(9), ms(13)], ms(10)).unwrap();
        assert_eq!(report.min, ms(9));
        assert_eq!(report.max, ms(13));
        assert_eq!(report.mean, Duration::from_micros(11_000));
        assert_eq!(report.early, 1);
        assert!(GapReport::new(&[], ms(10)).is_none());
    }
}
