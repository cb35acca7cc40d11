//! Shared pieces of the popwatch startup gate: configuration assembly and
//! the interactive license key prompt.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use popwatch_license::{AuthorizationDecision, LicenseClient, LicenseConfig, LicenseKey, VerificationKey};
use tracing::{debug, info};

/// Keys the operator may try before the gate gives up.
pub const MAX_KEY_ATTEMPTS: u32 = 3;

/// Command-line settings that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub public_key: Option<String>,
}

/// Build the license configuration from an optional TOML file plus
/// command-line overrides.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<LicenseConfig> {
    let mut config = match path {
        Some(path) => {
            debug!("Loading config from {:?}", path);
            LicenseConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => LicenseConfig::default(),
    };

    if let Some(url) = overrides.server_url {
        config.server_url = url;
    }
    if let Some(dir) = overrides.cache_dir {
        config.cache_dir = Some(dir);
    }
    if let Some(public_key) = overrides.public_key {
        config.verification_key = Some(VerificationKey::Ed25519 { public_key });
    }

    config.validate().context("Invalid license configuration")?;
    Ok(config)
}

/// Ask for a license key until one activates, the operator quits, or
/// [`MAX_KEY_ATTEMPTS`] keys have been tried.
///
/// An empty line, `q`, or end of input quits. Every denial prompts except
/// `DeniedIdentityUnavailable`, which no key can fix.
pub async fn prompt_for_key<R, W>(
    client: &LicenseClient,
    mut decision: AuthorizationDecision,
    input: &mut R,
    output: &mut W,
) -> io::Result<AuthorizationDecision>
where
    R: BufRead,
    W: Write,
{
    let mut attempts = 0;
    while attempts < MAX_KEY_ATTEMPTS && decision.needs_license_key() {
        writeln!(output, "{}", decision.message())?;
        write!(output, "Enter license key (q to quit): ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() || line.eq_ignore_ascii_case("q") {
            break;
        }

        attempts += 1;
        decision = match LicenseKey::parse(line) {
            Ok(key) => client.activate(&key).await,
            Err(e) => {
                debug!("Rejected key input: {}", e);
                AuthorizationDecision::DeniedInvalidKey
            }
        };
        info!("Key attempt {}/{}: {}", attempts, MAX_KEY_ATTEMPTS, decision.kind());
    }
    Ok(decision)
}
