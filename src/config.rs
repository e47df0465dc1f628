use anyhow::{Context, Result};
use clap::Args;
use dialoguer::Password;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection settings for the ALM command-line front end
#[derive(Args, Debug, Clone)]
pub struct CliArgs {
    /// ALM server address (just the https://host part, without /qcbin)
    #[arg(short, long, env = "ALM_URL")]
    pub url: String,

    /// ALM user name
    #[arg(short = 'U', long, env = "ALM_USERNAME")]
    pub username: String,

    /// ALM password (prompted when absent)
    #[arg(short = 'P', long, env = "ALM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// ALM domain
    #[arg(short, long, env = "ALM_DOMAIN")]
    pub domain: String,

    /// ALM project
    #[arg(short, long, env = "ALM_PROJECT")]
    pub project: String,

    /// Path to the backend profiles file
    #[arg(long, env = "ALM_PROFILES_FILE", default_value = "config/profiles.toml")]
    pub profiles: String,

    /// Backend version profile to use (highest configured version when absent)
    #[arg(long, env = "ALM_VERSION")]
    pub backend_version: Option<String>,

    /// Return failure values instead of raising ALM errors
    #[arg(long, env = "ALM_HIDE_ERRORS", default_value = "false")]
    pub hide_errors: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// HTTP max retries for transient network failures
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "2")]
    pub http_retries: u32,
}

/// Options for a single ALM client instance
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Server address without the /qcbin base path
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub project: String,

    /// "Hide custom errors" mode: operations return failure values instead of errors
    pub hide_custom_errors: bool,

    // HTTP client
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl ClientOptions {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            project: project.into(),
            hide_custom_errors: false,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }

    pub fn with_hidden_errors(mut self, hide: bool) -> Self {
        self.hide_custom_errors = hide;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Fully resolved settings for the binary
#[derive(Clone, Debug)]
pub struct Settings {
    pub options: ClientOptions,
    pub profile: BackendProfile,
    pub log_level: String,
}

impl Settings {
    /// Resolve settings with priority: CLI > ENV > .env file > defaults.
    /// The caller is expected to have loaded `.env` before parsing arguments.
    pub fn load(args: CliArgs) -> Result<Self> {
        let password = match args.password {
            Some(password) => password,
            None => Password::new()
                .with_prompt(format!("ALM password for {}", args.username))
                .interact()
                .context("Failed to read ALM password")?,
        };

        let catalog = ProfileCatalog::from_file(&expand_tilde(&args.profiles))?;
        let profile = catalog
            .select(args.backend_version.as_deref())
            .context("Failed to select backend profile")?
            .clone();

        let options = ClientOptions {
            hide_custom_errors: args.hide_errors,
            request_timeout: Duration::from_secs(args.http_timeout),
            max_retries: args.http_retries,
            ..ClientOptions::new(
                args.url,
                args.username,
                password,
                args.domain,
                args.project,
            )
        };

        Ok(Self {
            options,
            profile,
            log_level: args.log_level,
        })
    }
}

// === Backend profiles ===

/// Numeric backend version, ordered by (major, minor)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendVersion {
    pub major: u32,
    pub minor: u32,
}

impl BackendVersion {
    /// Parse "12", "12.0" or "12.50"; a missing minor means 0
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };

        Ok(Self {
            major: major
                .parse()
                .with_context(|| format!("Invalid major version in '{}'", s))?,
            minor: minor
                .parse()
                .with_context(|| format!("Invalid minor version in '{}'", s))?,
        })
    }
}

impl Ord for BackendVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl PartialOrd for BackendVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Address templates for one backend version.
/// Templates may contain `{domain}`, `{project}`, `{Entity Type}` and `{Entity ID}`.
#[derive(Clone, Debug, Deserialize)]
pub struct Addresses {
    pub login: String,
    pub logout: String,
    pub is_authenticated: String,
    pub session: String,
    pub entity_collection: String,
    pub entity: String,
    pub lock_entity: String,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    version: String,
    is_session_required: bool,
    is_logout_required: bool,
    token_cookie_name: String,
    session_cookie_name: String,
    addresses: Addresses,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    profiles: Vec<RawProfile>,
}

/// Validated settings for one backend version
#[derive(Clone, Debug)]
pub struct BackendProfile {
    pub version: BackendVersion,
    pub addresses: Addresses,
    pub is_session_required: bool,
    pub is_logout_required: bool,
    pub token_cookie_name: String,
    pub session_cookie_name: String,
}

impl BackendProfile {
    fn from_raw(raw: RawProfile) -> Result<Self> {
        let version = BackendVersion::parse(&raw.version)?;

        let required = [
            ("login", &raw.addresses.login),
            ("logout", &raw.addresses.logout),
            ("is_authenticated", &raw.addresses.is_authenticated),
            ("session", &raw.addresses.session),
            ("entity_collection", &raw.addresses.entity_collection),
            ("entity", &raw.addresses.entity),
            ("lock_entity", &raw.addresses.lock_entity),
            ("token_cookie_name", &raw.token_cookie_name),
            ("session_cookie_name", &raw.session_cookie_name),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("Profile {} has an empty '{}' setting", version, key);
            }
        }

        Ok(Self {
            version,
            addresses: raw.addresses,
            is_session_required: raw.is_session_required,
            is_logout_required: raw.is_logout_required,
            token_cookie_name: raw.token_cookie_name,
            session_cookie_name: raw.session_cookie_name,
        })
    }

    /// Read-only lookup by the historical setting key names
    pub fn lookup(&self, key: &str) -> Option<String> {
        let value = match key {
            "Login" => self.addresses.login.clone(),
            "Logout" => self.addresses.logout.clone(),
            "IsAuthenticated" => self.addresses.is_authenticated.clone(),
            "SessionAddress" => self.addresses.session.clone(),
            "EntityCollection" => self.addresses.entity_collection.clone(),
            "Entity" => self.addresses.entity.clone(),
            "LockEntity" => self.addresses.lock_entity.clone(),
            "TokenCookieName" => self.token_cookie_name.clone(),
            "SessionCookieName" => self.session_cookie_name.clone(),
            "IsSessionRequired" => self.is_session_required.to_string(),
            "IsLogoutRequired" => self.is_logout_required.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// All configured backend profiles, validated once at startup
#[derive(Clone, Debug)]
pub struct ProfileCatalog {
    profiles: Vec<BackendProfile>,
}

impl ProfileCatalog {
    /// Load profiles from a file; the format follows the file extension
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading backend profiles from {}", path.display());
        let source = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("Failed to read profiles file: {}", path.display()))?;
        Self::from_config(source)
    }

    /// Load profiles from an in-memory TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .context("Failed to parse profiles")?;
        Self::from_config(source)
    }

    fn from_config(source: config::Config) -> Result<Self> {
        let raw: RawCatalog = source
            .try_deserialize()
            .context("Profiles file is missing required settings")?;

        let mut profiles = Vec::with_capacity(raw.profiles.len());
        for raw_profile in raw.profiles {
            let profile = BackendProfile::from_raw(raw_profile)?;
            if profiles
                .iter()
                .any(|p: &BackendProfile| p.version == profile.version)
            {
                anyhow::bail!("Duplicate backend profile for version {}", profile.version);
            }
            profiles.push(profile);
        }

        if profiles.is_empty() {
            anyhow::bail!("No backend profiles configured");
        }

        Ok(Self { profiles })
    }

    /// Pick a profile by version, or the highest configured version
    pub fn select(&self, version: Option<&str>) -> Result<&BackendProfile> {
        match version {
            Some(v) if !v.trim().is_empty() => {
                let wanted = BackendVersion::parse(v)?;
                self.profiles
                    .iter()
                    .find(|p| p.version == wanted)
                    .with_context(|| format!("No backend profile for version {}", wanted))
            }
            _ => self
                .profiles
                .iter()
                .max_by_key(|p| p.version)
                .context("No backend profiles configured"),
        }
    }

    pub fn versions(&self) -> Vec<BackendVersion> {
        self.profiles.iter().map(|p| p.version).collect()
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
pub(crate) const TEST_PROFILES: &str = r#"
[[profiles]]
version = "11.0"
is_session_required = false
is_logout_required = false
token_cookie_name = "LWSSO_COOKIE_KEY"
session_cookie_name = "QCSession"

[profiles.addresses]
login = "authentication-point/authenticate"
logout = "authentication-point/logout"
is_authenticated = "rest/is-authenticated"
session = "rest/site-session"
entity_collection = "/qcbin/rest/domains/{domain}/projects/{project}/{Entity Type}"
entity = "/qcbin/rest/domains/{domain}/projects/{project}/{Entity Type}/{Entity ID}"
lock_entity = "/qcbin/rest/domains/{domain}/projects/{project}/{Entity Type}/{Entity ID}/lock"

[[profiles]]
version = "12.0"
is_session_required = true
is_logout_required = true
token_cookie_name = "LWSSO_COOKIE_KEY"
session_cookie_name = "QCSession"

[profiles.addresses]
login = "authentication-point/authenticate"
logout = "authentication-point/logout"
is_authenticated = "rest/is-authenticated"
session = "rest/site-session"
entity_collection = "rest/domains/{domain}/projects/{project}/{Entity Type}"
entity = "rest/domains/{domain}/projects/{project}/{Entity Type}/{Entity ID}"
lock_entity = "rest/domains/{domain}/projects/{project}/{Entity Type}/{Entity ID}/lock"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/profiles.toml");
        assert!(path.to_string_lossy().ends_with("profiles.toml"));
        assert!(!path.to_string_lossy().starts_with('~'));

        assert_eq!(expand_tilde("/etc/alm.toml"), PathBuf::from("/etc/alm.toml"));
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_version_parsing_and_ordering() {
        let v = BackendVersion::parse("12").unwrap();
        assert_eq!(v, BackendVersion { major: 12, minor: 0 });
        assert_eq!(v.to_string(), "12.0");

        assert!(BackendVersion::parse("12.50").unwrap() > BackendVersion::parse("12.5").unwrap());
        assert!(BackendVersion::parse("9.0").unwrap() < BackendVersion::parse("11.0").unwrap());
        assert!(BackendVersion::parse("twelve").is_err());
    }

    #[test]
    fn test_select_highest_version_by_default() {
        let catalog = ProfileCatalog::from_toml_str(TEST_PROFILES).unwrap();
        let profile = catalog.select(None).unwrap();
        assert_eq!(profile.version.to_string(), "12.0");
        assert!(profile.is_session_required);

        let profile = catalog.select(Some("11")).unwrap();
        assert!(!profile.is_logout_required);

        assert!(catalog.select(Some("10.0")).is_err());
    }

    #[test]
    fn test_lookup_uses_setting_key_names() {
        let catalog = ProfileCatalog::from_toml_str(TEST_PROFILES).unwrap();
        let profile = catalog.select(Some("12.0")).unwrap();

        assert_eq!(profile.lookup("SessionAddress").as_deref(), Some("rest/site-session"));
        assert_eq!(profile.lookup("TokenCookieName").as_deref(), Some("LWSSO_COOKIE_KEY"));
        assert_eq!(profile.lookup("IsSessionRequired").as_deref(), Some("true"));
        assert_eq!(profile.lookup("Unknown"), None);
    }

    #[test]
    fn test_missing_required_setting_fails_fast() {
        let toml = r#"
[[profiles]]
version = "12.0"
is_session_required = true
is_logout_required = true
token_cookie_name = "LWSSO_COOKIE_KEY"

[profiles.addresses]
login = "a"
logout = "b"
is_authenticated = "c"
session = "d"
entity_collection = "e"
entity = "f"
lock_entity = "g"
"#;
        assert!(ProfileCatalog::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_empty_setting_and_duplicates_rejected() {
        let empty = TEST_PROFILES.replacen(
            "login = \"authentication-point/authenticate\"",
            "login = \"\"",
            1,
        );
        assert!(ProfileCatalog::from_toml_str(&empty).is_err());

        let duplicate = TEST_PROFILES.replace("version = \"11.0\"", "version = \"12\"");
        assert!(ProfileCatalog::from_toml_str(&duplicate).is_err());
    }

    #[test]
    fn test_client_options_defaults() {
        let options = ClientOptions::new("https://alm", "user", "secret", "DOM", "PROJ");
        assert!(!options.hide_custom_errors);
        assert_eq!(options.max_retries, 2);

        let options = options.with_hidden_errors(true).with_max_retries(0);
        assert!(options.hide_custom_errors);
        assert_eq!(options.max_retries, 0);
    }
}
