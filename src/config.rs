//! Config file loading and CLI value parsing
//!
//! The config file has one `name,log-path` row per monitored application.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use prometheuslog_logs::ApplicationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open the conf file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected 2 columns (name, log path), found {found}")]
    ColumnCount { line: usize, found: usize },

    #[error("line {line}: application name is empty")]
    EmptyName { line: usize },

    #[error("line {line}: log path is empty")]
    EmptyPath { line: usize },
}

/// Load and parse the config file at `path`
pub fn load_config(path: &Path) -> Result<Vec<ApplicationConfig>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents)
}

/// Parse config rows. Blank lines and `#` comments are skipped; ids are
/// assigned in row order. Fields may be double-quoted to contain commas,
/// with `""` standing for a literal quote.
pub fn parse_config(contents: &str) -> Result<Vec<ApplicationConfig>, ConfigError> {
    let mut applications = Vec::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let fields = split_row(trimmed);
        let [name, log_path] = &fields[..] else {
            return Err(ConfigError::ColumnCount {
                line,
                found: fields.len(),
            });
        };
        if name.is_empty() {
            return Err(ConfigError::EmptyName { line });
        }
        if log_path.is_empty() {
            return Err(ConfigError::EmptyPath { line });
        }

        applications.push(ApplicationConfig::new(applications.len(), name, log_path));
    }

    Ok(applications)
}

/// Split one row on commas outside double quotes. Quotes are removed and
/// whitespace around unquoted text is trimmed.
fn split_row(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = row.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            c => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

/// Parse a duration such as `500ms`, `2s`, `5m` or `1h`. A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(60 * 60)),
        _ => return Err(format!("unknown duration unit '{unit}' in '{value}'")),
    };
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_rows() {
        let contents = "app1,/var/log/app1.log\n\n# comment\n\"app 2\" , \"/var/log/app2.log\"\n";
        let apps = parse_config(contents).unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0], ApplicationConfig::new(0, "app1", "/var/log/app1.log"));
        assert_eq!(apps[1], ApplicationConfig::new(1, "app 2", "/var/log/app2.log"));
    }

    #[test]
    fn test_quoted_field_with_comma() {
        let apps = parse_config("\"billing, eu\",\"/var/log/a,b.log\"\n").unwrap();
        assert_eq!(apps[0].name, "billing, eu");
        assert_eq!(apps[0].log_path, PathBuf::from("/var/log/a,b.log"));

        let apps = parse_config("\"say \"\"hi\"\"\",/log\n").unwrap();
        assert_eq!(apps[0].name, "say \"hi\"");
    }

    #[test]
    fn test_wrong_column_count_is_fatal() {
        let err = parse_config("app1,/var/log/app1.log\napp2\n").unwrap_err();
        assert!(matches!(err, ConfigError::ColumnCount { line: 2, found: 1 }));

        let err = parse_config("a,b,c\n").unwrap_err();
        assert!(matches!(err, ConfigError::ColumnCount { line: 1, found: 3 }));
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert!(matches!(
            parse_config(",/log\n"),
            Err(ConfigError::EmptyName { line: 1 })
        ));
        assert!(matches!(
            parse_config("app,\n"),
            Err(ConfigError::EmptyPath { line: 1 })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("missing.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prometheuslog.conf");
        std::fs::write(&path, "app1,/tmp/app1.log\r\n").unwrap();
        let apps = load_config(&path).unwrap();
        assert_eq!(apps[0].log_path, PathBuf::from("/tmp/app1.log"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("15"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_duration("1m"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("2d").is_err());
        assert!(parse_duration("fast").is_err());
    }
}
