use crate::errors::CliError;
use camino::{Utf8Path, Utf8PathBuf};
use miette::{IntoDiagnostic, Result};

pub mod config;

#[macro_export]
macro_rules! println_pad {
    ($($arg:tt)*) => {{
        let __s = format!($($arg)*);
        for __line in __s.lines() {
            println!("    {}", __line);
        }
    }};
}

/// Resolves `path` against the current directory.
pub fn absolute_path(path: &str) -> Result<Utf8PathBuf> {
    let path = Utf8Path::new(path);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let cwd = std::env::current_dir().into_diagnostic()?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| miette::miette!("current directory is not UTF-8: {}", p.display()))?;
    Ok(cwd.join(path))
}

/// Like [`absolute_path`], but fails when nothing exists at `path`.
pub fn existing_path(path: &str) -> Result<Utf8PathBuf> {
    let path = absolute_path(path)?;
    if !path.exists() {
        return Err(CliError::file_not_found(path).into());
    }
    Ok(path)
}

/// Human readable byte size.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    match unit {
        0 => format!("{} {}", bytes, UNITS[0]),
        _ => format!("{:.1} {}", size, UNITS[unit]),
    }
}
