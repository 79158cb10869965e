use std::path::Path;

use eyre::Result;
use helm_core::config::HelmConfig;

/// Load, apply `HELM_*` overrides, then the command-line level, and validate.
pub fn load_config(path: Option<&Path>, log_level: Option<&str>, json_logs: bool) -> Result<HelmConfig> {
    let mut config = HelmConfig::load(path)?;
    if let Some(level) = log_level {
        config.log.level = level.to_string();
    }
    if json_logs {
        config.log.json = true;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn command_line_overrides_the_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nlevel = \"warn\"\n\n[engine]\nmax_steps = 12").unwrap();

        let config = load_config(Some(file.path()), Some("debug"), true).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        assert_eq!(config.engine.max_steps, 12);
    }

    #[test]
    fn invalid_files_are_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nmax_steps = 0").unwrap();
        assert!(load_config(Some(file.path()), None, false).is_err());
    }
}
