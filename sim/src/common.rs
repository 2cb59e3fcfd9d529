//! Shared helpers for the `mcl-sim` binary: logger setup and path checks.

use anyhow::{Context, Result, bail};
use std::path::Path;

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or a logger is already installed.
pub fn init_logger(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        ensure_parent_dir(log_path)?;
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Check that an input table exists and is a regular file.
pub fn validate_input_file(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("Input path '{}' does not exist.", input.display());
    }
    if !input.is_file() {
        bail!("Input path '{}' is not a file.", input.display());
    }
    Ok(())
}

/// Create the parent directory of an output file if it is missing.
pub fn ensure_parent_dir(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_input_file() {
        let dir = std::env::temp_dir().join("mcl_sim_common_input");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("map.csv");
        std::fs::write(&file, "id,x,y\n").unwrap();
        assert!(validate_input_file(&file).is_ok());
        assert!(validate_input_file(&dir).is_err());
        assert!(validate_input_file(&dir.join("missing.csv")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_ensure_parent_dir() {
        let dir = std::env::temp_dir().join("mcl_sim_common_output");
        let _ = std::fs::remove_dir_all(&dir);
        let file = dir.join("nested").join("result.csv");
        ensure_parent_dir(&file).unwrap();
        assert!(dir.join("nested").is_dir());
        assert!(ensure_parent_dir(Path::new("result.csv")).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
