//! Verify command implementation.

use harbor_storage::{verify_log, FileLog, LogReport, StoreDir};
use serde::Serialize;
use std::path::Path;

/// Verification result.
#[derive(Debug, Serialize)]
pub struct VerifyResult {
    /// Frame statistics, when every frame checked out.
    pub report: Option<LogReport>,
    /// The corruption found, if any.
    pub error: Option<String>,
}

impl VerifyResult {
    /// True when no frame is corrupt. A torn tail is not corruption: it is
    /// cut off the next time the store opens.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Checks the log of the store at `path` without replaying or repairing it.
pub fn check(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let dir = StoreDir::open(path, false)?;
    let log = FileLog::open(&dir.log_path())?;
    Ok(match verify_log(&log) {
        Ok(report) => VerifyResult {
            report: Some(report),
            error: None,
        },
        Err(err) => VerifyResult {
            report: None,
            error: Some(err.to_string()),
        },
    })
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?}", path);
    println!();

    let result = check(path)?;
    if let Some(report) = &result.report {
        println!("  Frames:      {}", report.frames);
        println!("  Operations:  {}", report.operations);
        println!("  Valid bytes: {}", report.valid_bytes);
        if report.torn_bytes > 0 {
            println!(
                "  Torn tail:   {} bytes (discarded on next open)",
                report.torn_bytes
            );
        }
    }
    if let Some(error) = &result.error {
        println!("  Error: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}
