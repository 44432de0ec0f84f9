pub mod backup;
pub mod list;
pub mod restore;
pub mod retention;
pub mod verify;

pub use backup::run_backup;
pub use list::run_list;
pub use restore::run_restore;
pub use retention::{run_delete, run_prune};
pub use verify::run_verify;

use anyhow::Result;
use keeper::manifest::ClassFailure;
use serde::Serialize;

/// Print a report as pretty JSON on stdout.
pub fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Format a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn describe_failure(failure: &ClassFailure) -> String {
    format!("{}/{}: {}", failure.stage, failure.kind, failure.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
