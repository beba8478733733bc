//! Configuration CLI commands

use std::path::{Path, PathBuf};

use crate::cli::commands::load_config;
use crate::cli::error::CliError;
use crate::config::{CONFIG_FILENAME, sample_config};

/// Write a commented sample configuration
///
/// Prints to stdout when `output` is `-`.
pub fn handle_config_sample(output: &Path, force: bool) -> Result<(), CliError> {
    if output == Path::new("-") {
        print!("{}", sample_config());
        return Ok(());
    }
    if output.exists() && !force {
        return Err(CliError::FileExists(output.to_path_buf()));
    }
    std::fs::write(output, sample_config())
        .map_err(|e| CliError::FileWriteError(output.to_path_buf(), e.to_string()))?;
    eprintln!("Wrote {}", output.display());
    Ok(())
}

/// Print the effective configuration, passwords omitted
pub fn handle_config_show(config: Option<PathBuf>) -> Result<(), CliError> {
    let config = load_config(config.as_deref())?;
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Default path for `config sample`
pub fn default_sample_path() -> PathBuf {
    PathBuf::from(CONFIG_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sample_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);

        handle_config_sample(&path, false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, sample_config());

        assert!(matches!(
            handle_config_sample(&path, false),
            Err(CliError::FileExists(_))
        ));
        handle_config_sample(&path, true).unwrap();
    }

    #[test]
    fn test_show_reads_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, sample_config()).unwrap();

        handle_config_show(Some(path)).unwrap();
        assert!(handle_config_show(Some(dir.path().join("missing.toml"))).is_err());
    }
}
