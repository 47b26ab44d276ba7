//! Command-line interface for the appsign re-signing engine.
//!
//! Signs unpacked `.app` bundles and edits dylib load commands in Mach-O
//! executables using PKCS#12 or PEM-format credentials.

use appsign::{SignCoordinator, SignOptions, SigningIdentity};
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "appsign")]
#[command(about = "iOS application re-signing tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign an unpacked .app bundle in place.
    Sign {
        /// Path to the .app directory
        app: PathBuf,

        /// PKCS#12 file (.p12) holding certificate and private key
        #[arg(short = 'k', long)]
        pkcs12: Option<PathBuf>,

        /// Certificate file (PEM) when not using PKCS#12
        #[arg(short = 'c', long, requires = "private_key")]
        certificate: Option<PathBuf>,

        /// Private key file (PEM PKCS#8) when not using PKCS#12
        #[arg(long, requires = "certificate")]
        private_key: Option<PathBuf>,

        /// Provisioning profile (.mobileprovision)
        #[arg(short = 'm', long)]
        profile: PathBuf,

        /// Password for the PKCS#12 file
        #[arg(short = 'p', long, default_value = "")]
        password: String,

        /// Entitlements plist overriding those from the profile
        #[arg(short = 'e', long)]
        entitlements: Option<PathBuf>,

        /// Replace the bundle identifier
        #[arg(short = 'b', long)]
        bundle_id: Option<String>,

        /// Replace the display name
        #[arg(short = 'n', long)]
        display_name: Option<String>,

        /// Replace the bundle version
        #[arg(short = 'v', long)]
        bundle_version: Option<String>,

        /// Copy this dylib into the bundle and load it from the main executable
        #[arg(short = 'l', long)]
        dylib: Option<PathBuf>,

        /// Inject the dylib with LC_LOAD_WEAK_DYLIB
        #[arg(short = 'w', long)]
        weak: bool,

        /// Do not write embedded.mobileprovision into the bundle
        #[arg(long)]
        no_embed_profile: bool,
    },

    /// Append a dylib load command to a Mach-O executable.
    Inject {
        /// Mach-O executable to modify
        executable: PathBuf,
        /// Install path to reference (e.g. @executable_path/libdemo.dylib)
        dylib: String,
        /// Use LC_LOAD_WEAK_DYLIB
        #[arg(short = 'w', long)]
        weak: bool,
        /// Only refresh an existing reference; do not add a new one
        #[arg(long)]
        no_create: bool,
    },

    /// List dylib install paths referenced by a Mach-O executable.
    List {
        /// Mach-O executable to inspect
        executable: PathBuf,
    },

    /// Remove dylib load commands matching the given basenames.
    Uninstall {
        /// Mach-O executable to modify
        executable: PathBuf,
        /// Dylib basenames to remove (e.g. libdemo.dylib)
        names: Vec<String>,
    },

    /// Rewrite a dylib install path.
    ChangePath {
        /// Mach-O executable to modify
        executable: PathBuf,
        /// Existing install path
        old: String,
        /// Replacement install path
        new: String,
    },
}

fn run(cli: Cli) -> appsign::Result<()> {
    match cli.command {
        Command::Sign {
            app,
            pkcs12,
            certificate,
            private_key,
            profile,
            password,
            entitlements,
            bundle_id,
            display_name,
            bundle_version,
            dylib,
            weak,
            no_embed_profile,
        } => {
            let password = SecretString::new(password);
            let mut identity = match (&pkcs12, &certificate, &private_key) {
                (Some(p12_path), _, _) => {
                    let p12 = std::fs::read(p12_path)?;
                    SigningIdentity::from_p12(&p12, password.expose_secret())?
                }
                (None, Some(cert_path), Some(key_path)) => {
                    let cert = std::fs::read(cert_path)?;
                    let key = std::fs::read(key_path)?;
                    SigningIdentity::from_pem(&cert, &key)?
                }
                _ => {
                    return Err(appsign::Error::Identity(
                        "provide either --pkcs12 or --certificate with --private-key".into(),
                    ));
                }
            };

            identity = identity.with_provisioning_profile(std::fs::read(&profile)?)?;
            if let Some(ent_path) = entitlements {
                identity = identity.with_entitlements(std::fs::read(ent_path)?)?;
            }

            let options = SignOptions {
                bundle_id,
                display_name,
                bundle_version,
                dylib_file: dylib,
                weak_inject: weak,
                suppress_embedded_profile: no_embed_profile,
            };
            SignCoordinator::new(&identity, options).sign(&app)?;
            println!("Signed: {}", app.display());
            Ok(())
        }
        Command::Inject {
            executable,
            dylib,
            weak,
            no_create,
        } => {
            let changed = appsign::inject_dylib(&executable, &dylib, weak, !no_create)?;
            println!(
                "{}: {}",
                executable.display(),
                if changed { "injected" } else { "unchanged" }
            );
            Ok(())
        }
        Command::List { executable } => {
            for path in appsign::list_dylibs(&executable)? {
                println!("{}", path);
            }
            Ok(())
        }
        Command::Uninstall { executable, names } => {
            let changed = appsign::uninstall_dylibs(&executable, &names)?;
            println!(
                "{}: {}",
                executable.display(),
                if changed { "removed" } else { "unchanged" }
            );
            Ok(())
        }
        Command::ChangePath {
            executable,
            old,
            new,
        } => {
            let changed = appsign::change_dylib_path(&executable, &old, &new)?;
            println!(
                "{}: {}",
                executable.display(),
                if changed { "rewritten" } else { "unchanged" }
            );
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            eprintln!("error: {}", err);
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
