//! Command-line front-end: generate keys, sign OTVIDs, and verify tokens.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use open_trust::{
    fetch_keys, new_private_key, parse_key, parse_keys, Error, HttpClient, Otid, Otvid,
};

#[derive(Parser)]
#[command(name = "otrust", version, about = "Open Trust command-line tool")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the otrust version.
    Version,
    /// Generate a new private key, or derive the public key from a private key.
    Key {
        /// Algorithm for a new private key: one of RS256, RS384, RS512,
        /// PS256, PS384, PS512, ES256, ES384, ES512.
        #[arg(long)]
        alg: Option<String>,
        /// A private key as a JWK file path or inline JSON. When given,
        /// --alg is ignored and the public key is derived.
        #[arg(long)]
        jwk: Option<String>,
        /// Write the result to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Sign an OTVID with the given private key and payload.
    Sign {
        /// The signing key as a JWK file path or inline JSON.
        #[arg(long)]
        jwk: String,
        /// Subject OTID.
        #[arg(long)]
        sub: String,
        /// Issuer OTID.
        #[arg(long)]
        iss: String,
        /// Audience OTID.
        #[arg(long)]
        aud: String,
        /// Expiry in seconds from now.
        #[arg(long, default_value_t = 600)]
        exp: u64,
        /// Write the token to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Parse and verify an OTVID with the given public key(s).
    Verify {
        /// Public key(s) as a JWK file path, inline JSON, or a JWK set URL.
        #[arg(long)]
        jwk: String,
        /// The OTVID token.
        token: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    if let Err(err) = run(Args::parse()).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    match args.cmd {
        Command::Version => {
            println!(
                "otrust version {} {}/{}",
                open_trust::VERSION,
                std::env::consts::OS,
                std::env::consts::ARCH
            );
            Ok(())
        }
        Command::Key { alg, jwk, out } => match (jwk, alg) {
            (Some(jwk), _) => {
                let key = parse_key(&load_arg(&jwk)?)?;
                let public = key.to_public_key()?;
                output(out.as_deref(), &serde_json::to_string(&public)?)
            }
            (None, Some(alg)) => {
                let key = new_private_key(alg.parse()?)?;
                output(out.as_deref(), &serde_json::to_string(&key)?)
            }
            (None, None) => Err(Error::InvalidKey(
                "one of --alg or --jwk is required".to_string(),
            )),
        },
        Command::Sign { jwk, sub, iss, aud, exp, out } => {
            if exp == 0 {
                return Err(Error::ClaimMismatch("the --exp value is invalid".to_string()));
            }
            let key = parse_key(&load_arg(&jwk)?)?;
            let mut vid = Otvid::new(Otid::parse(&sub)?, Otid::parse(&iss)?, Otid::parse(&aud)?);
            vid.expiry = Some(SystemTime::now() + Duration::from_secs(exp));
            let token = vid.sign(&key)?;
            output(out.as_deref(), &token)
        }
        Command::Verify { jwk, token } => {
            let keys = if jwk.starts_with("http") {
                fetch_keys(&HttpClient::new()?, &jwk).await?
            } else {
                parse_keys(&load_arg(&jwk)?)?
            };

            let vid = Otvid::parse_insecure(&token)?;
            println!("{}", serde_json::to_string_pretty(&vid.to_claims())?);
            vid.verify(&keys, &vid.issuer, &vid.audience)?;
            println!("\nVerify success!");
            Ok(())
        }
    }
}

// A JWK argument is inline JSON when it starts with '{', else a file path.
fn load_arg(arg: &str) -> Result<String, Error> {
    if arg.starts_with('{') {
        return Ok(arg.to_string());
    }
    std::fs::read_to_string(arg)
        .map_err(|e| Error::InvalidKey(format!("read key file '{arg}': {e}")))
}

fn output(out: Option<&std::path::Path>, data: &str) -> Result<(), Error> {
    match out {
        Some(path) => std::fs::write(path, data)
            .map_err(|e| Error::Transport(format!("write '{}': {e}", path.display()))),
        None => {
            println!("{data}");
            Ok(())
        }
    }
}
