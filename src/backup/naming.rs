use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use std::fmt::Display;

use crate::errors::ConfigError;

/// Suffix appended to compressed backup objects.
pub const COMPRESSED_SUFFIX: &str = ".gz";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Time(String),
    Database,
}

/// Backup filename pattern: chrono `strftime` specifiers plus `%s` for the
/// database name, e.g. `%s_%Y-%m-%d_%H%M%S.sql`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    pattern: String,
    segments: Vec<Segment>,
}

impl FilenameTemplate {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('s') => {
                    if !literal.is_empty() {
                        segments.push(Segment::Time(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Database);
                }
                Some(other) => {
                    literal.push('%');
                    literal.push(other);
                }
                None => literal.push('%'),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Time(literal));
        }

        if !segments.contains(&Segment::Database) {
            return Err(ConfigError::Invalid(format!(
                "backup_format {pattern:?} must contain %s for the database name"
            )));
        }
        for segment in &segments {
            if let Segment::Time(spec) = segment {
                if StrftimeItems::new(spec).any(|item| matches!(item, Item::Error)) {
                    return Err(ConfigError::Invalid(format!(
                        "backup_format {pattern:?} is not a valid time format"
                    )));
                }
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Renders the pattern at `at`, substituting the database name.
    pub fn render<Tz>(&self, database: &str, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut name = String::new();
        for segment in &self.segments {
            match segment {
                // Time segments were checked for invalid items in `parse`.
                Segment::Time(spec) => name.push_str(&at.format(spec).to_string()),
                Segment::Database => name.push_str(database),
            }
        }
        name
    }

    /// Destination key for a database. Appends [`COMPRESSED_SUFFIX`] when
    /// compressing, unless the pattern already produced it.
    pub fn filename<Tz>(&self, database: &str, compressed: bool, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut name = self.render(database, at);
        if compressed && !name.ends_with(COMPRESSED_SUFFIX) {
            name.push_str(COMPRESSED_SUFFIX);
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap()
    }

    #[test]
    fn renders_time_and_database() -> anyhow::Result<()> {
        let template = FilenameTemplate::parse("%s_%Y-%m-%d_%H%M%S.sql")?;
        assert_eq!(template.render("users", &at()), "users_2021-03-04_050607.sql");
        Ok(())
    }

    #[test]
    fn compressed_suffix_is_appended_once() -> anyhow::Result<()> {
        let plain = FilenameTemplate::parse("%s_2020-01-01.sql")?;
        let suffixed = FilenameTemplate::parse("%s_2020-01-01.sql.gz")?;

        assert_eq!(plain.filename("users", true, &at()), "users_2020-01-01.sql.gz");
        assert_eq!(suffixed.filename("users", true, &at()), "users_2020-01-01.sql.gz");
        assert_eq!(plain.filename("users", false, &at()), "users_2020-01-01.sql");
        assert_eq!(suffixed.filename("users", false, &at()), "users_2020-01-01.sql.gz");

        let once = plain.filename("users", true, &at());
        assert!(!once.ends_with(".gz.gz"));
        Ok(())
    }

    #[test]
    fn escaped_percent_is_not_a_database_placeholder() -> anyhow::Result<()> {
        let template = FilenameTemplate::parse("%s-100%%s.sql")?;
        assert_eq!(template.render("db", &at()), "db-100%s.sql");
        Ok(())
    }

    #[test]
    fn rejects_patterns_without_database_or_with_bad_specifiers() {
        assert!(FilenameTemplate::parse("%Y-%m-%d.sql").is_err());
        assert!(FilenameTemplate::parse("%s_%Q.sql").is_err());
        assert!(FilenameTemplate::parse("%s_trailing%").is_err());
    }
}
