use std::env;

/// Configuration for the durable store backend.
///
/// Reads `CORRAL_DATABASE_URL`, falling back to
/// `postgresql://localhost:5432/corral` when unset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Upper bound on rows returned by one `find` call.
    pub page_cap: usize,
}

impl StoreConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/corral";

    /// The default per-query page cap.
    pub const DEFAULT_PAGE_CAP: usize = 1000;

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        let database_url =
            env::var("CORRAL_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self {
            database_url,
            page_cap: Self::DEFAULT_PAGE_CAP,
        }
    }

    /// Build a config from an explicit URL (tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            page_cap: Self::DEFAULT_PAGE_CAP,
        }
    }

    /// Extract the database name from the URL.
    pub fn database_name(&self) -> Option<&str> {
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host, used to issue `CREATE DATABASE` for a missing target.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_extraction() {
        let cfg = StoreConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_name(), Some("mydb"));
    }

    #[test]
    fn maintenance_url_replaces_db() {
        let cfg = StoreConfig::new("postgresql://localhost:5432/corral");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://localhost:5432/postgres"
        );
    }
}
