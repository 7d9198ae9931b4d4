mod decrypt;
mod license;

pub use decrypt::Decrypt;
pub use license::License;

use anyhow::{Result, bail};
use clap::{ArgAction, ColorChoice, Parser, Subcommand};
use log::LevelFilter;
use ssd_cenc::KeyId;

/// Run DRM license exchanges and decrypt CENC/CBCS protected MP4 fragments.
#[derive(Debug, Clone, Parser)]
#[command(version, author = "clitic <clitic21@gmail.com>", about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// When to output colored text.
    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Increase logging verbosity. Use twice for trace output.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }

        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Decrypt(Decrypt),
    License(License),
}

/// Parse a `KEY:VALUE` pair as curl does.
fn parse_header(value: &str) -> Result<(String, String)> {
    if let Some((k, v)) = value.split_once(':') {
        Ok((k.trim().to_owned(), v.trim().to_owned()))
    } else {
        bail!("Expected 'KEY:VALUE' but found '{}'.", value);
    }
}

/// Parse a `KID:KEY` pair of hex strings.
fn parse_key(value: &str) -> Result<(KeyId, [u8; 16])> {
    let Some((kid, key)) = value.split_once(':') else {
        bail!("Expected 'KID:KEY' but found '{}'.", value);
    };

    let Ok(key) = <[u8; 16]>::try_from(hex::decode(key.trim())?) else {
        bail!("Content key '{}' is not 16 bytes long.", key);
    };

    Ok((kid.trim().parse()?, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers() {
        assert_eq!(
            parse_header("Authorization: Bearer abc").unwrap(),
            ("Authorization".to_owned(), "Bearer abc".to_owned())
        );
        assert!(parse_header("Authorization").is_err());
    }

    #[test]
    fn keys() {
        let (kid, key) = parse_key(
            "eb676abb-cb34-5e96-bbcf-616630f1a3da:100b6c20940f779a4589152b57d2dacb",
        )
        .unwrap();
        assert_eq!(kid.to_string(), "eb676abbcb345e96bbcf616630f1a3da");
        assert_eq!(key[0], 0x10);
        assert!(parse_key("eb676abbcb345e96bbcf616630f1a3da").is_err());
        assert!(parse_key("eb676abbcb345e96bbcf616630f1a3da:100b").is_err());
        assert!(parse_key("zz:100b6c20940f779a4589152b57d2dacb").is_err());
    }

    #[test]
    fn verbosity() {
        let args = Args::parse_from(["ssd", "-vv", "license", "AAAA", "--license-url", "x"]);
        assert_eq!(args.log_level(), LevelFilter::Trace);
        let args = Args::parse_from(["ssd", "-q", "license", "AAAA", "--license-url", "x"]);
        assert_eq!(args.log_level(), LevelFilter::Error);
    }
}
