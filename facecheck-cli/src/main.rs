use anyhow::Context;
use clap::{Parser, Subcommand};
use facecheck_core::config::Config;
use facecheck_core::store::FileIdentityStore;
use facecheck_core::{EnrollRequest, Envelope, FaceService, LocationHints, RawImage, VerifyRequest};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facecheck")]
#[command(about = "Face enrollment and verification", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to /etc then ~/.config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face image for an identity
    Enroll {
        identity: String,
        /// Image file
        image: PathBuf,
        /// The file holds base64 text instead of image bytes
        #[arg(long)]
        base64: bool,
    },
    /// Verify a face image against an enrolled identity
    Verify {
        identity: String,
        /// Image file
        image: PathBuf,
        /// The file holds base64 text instead of image bytes
        #[arg(long)]
        base64: bool,
        /// Latitude of the check-in
        #[arg(long, allow_negative_numbers = true)]
        lat: Option<f64>,
        /// Longitude of the check-in
        #[arg(long, allow_negative_numbers = true)]
        lon: Option<f64>,
        /// Client IP recorded with the check-in
        #[arg(long)]
        ip: Option<String>,
        /// Site the check-in belongs to
        #[arg(long)]
        site: Option<String>,
        /// Display name recorded with the check-in
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the stored record for an identity
    Show { identity: String },
    /// Remove an identity record
    Remove { identity: String },
    /// List stored identities
    List,
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logger
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll {
            identity,
            image,
            base64,
        } => cmd_enroll(config, identity, &image, base64),
        Commands::Verify {
            identity,
            image,
            base64,
            lat,
            lon,
            ip,
            site,
            name,
        } => {
            let hints = LocationHints {
                latitude: lat,
                longitude: lon,
                client_ip: ip,
                site_id: site,
                display_name: name,
            };
            cmd_verify(config, identity, &image, base64, hints)
        }
        Commands::Show { identity } => cmd_show(&config, &identity),
        Commands::Remove { identity } => cmd_remove(&config, &identity),
        Commands::List => cmd_list(&config),
        Commands::Config { validate } => cmd_config(&config, validate),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::load()?),
    }
}

fn read_image(path: &Path, base64: bool) -> anyhow::Result<RawImage> {
    if base64 {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(RawImage::Base64(text))
    } else {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(RawImage::Bytes(bytes))
    }
}

/// 0 on success, otherwise one code per status class.
fn exit_status(envelope: &Envelope) -> u8 {
    match (envelope.success, envelope.status) {
        (true, _) => 0,
        (false, 404) => 4,
        (false, 500) => 5,
        (false, _) => 1,
    }
}

fn print_envelope(envelope: &Envelope) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(ExitCode::from(exit_status(envelope)))
}

fn cmd_enroll(
    config: Config,
    identity: String,
    image: &Path,
    base64: bool,
) -> anyhow::Result<ExitCode> {
    let image = read_image(image, base64)?;
    let service = FaceService::new(config)?;

    let outcome = service.enroll(&EnrollRequest {
        identity_id: identity,
        image,
    });
    print_envelope(&Envelope::from_enrollment(&outcome))
}

fn cmd_verify(
    config: Config,
    identity: String,
    image: &Path,
    base64: bool,
    hints: LocationHints,
) -> anyhow::Result<ExitCode> {
    let image = read_image(image, base64)?;
    let service = FaceService::new(config)?;

    let outcome = service.verify(&VerifyRequest {
        identity_id: identity,
        image,
        hints,
    });
    print_envelope(&Envelope::from_verification(&outcome))
}

fn cmd_show(config: &Config, identity: &str) -> anyhow::Result<ExitCode> {
    let store = FileIdentityStore::from_config(&config.storage);

    let Some(record) = store.load(identity)? else {
        println!("No record for identity: {}", identity);
        return Ok(ExitCode::from(4));
    };

    let dimension = match &record.face {
        Some(serde_json::Value::Array(values)) => values.len(),
        _ => 0,
    };
    let summary = serde_json::json!({
        "identity_id": record.identity_id,
        "enrolled": record.has_encoding(),
        "encoding_dimension": dimension,
        "media_reference": record.media_reference,
        "updated_at": record.updated_at,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_remove(config: &Config, identity: &str) -> anyhow::Result<ExitCode> {
    let store = FileIdentityStore::from_config(&config.storage);

    if store.remove(identity)? {
        println!("✓ Removed identity {}", identity);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("No record for identity: {}", identity);
        Ok(ExitCode::from(4))
    }
}

fn cmd_list(config: &Config) -> anyhow::Result<ExitCode> {
    let store = FileIdentityStore::from_config(&config.storage);
    let ids = store.list()?;

    if ids.is_empty() {
        println!("No identities stored in {}", config.storage.identity_dir.display());
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<40} {:<10} {}", "Identity", "Enrolled", "Updated At");
    println!("{}", "-".repeat(72));
    for id in ids {
        let Some(record) = store.load(&id)? else {
            continue;
        };
        let updated = record
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "—".to_string());
        let enrolled = if record.has_encoding() { "yes" } else { "no" };
        println!("{:<40} {:<10} {}", id, enrolled, updated);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(config: &Config, validate: bool) -> anyhow::Result<ExitCode> {
    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Configuration:");
    println!();

    println!("[normalize]");
    println!(
        "  max_size = {}x{}",
        config.normalize.max_width, config.normalize.max_height
    );
    println!("  jpeg_quality = {}", config.normalize.jpeg_quality);
    println!(
        "  crop_export_to_face = {}",
        config.normalize.crop_export_to_face
    );
    println!();

    println!("[detection]");
    println!("  model = {:?}", config.detection.model_path);
    println!(
        "  confidence_threshold = {}",
        config.detection.confidence_threshold
    );
    println!("  nms_threshold = {}", config.detection.nms_threshold);
    println!(
        "  profile = {:?} ({}px)",
        config.detection.profile,
        config.detection.profile.input_size()
    );
    println!("  selection = {:?}", config.detection.selection);
    println!();

    println!("[encoding]");
    println!("  model = {:?}", config.encoding.model_path);
    println!("  dimension = {}", config.encoding.dimension);
    println!();

    println!("[matching]");
    println!("  tolerance = {}", config.matching.tolerance);
    println!();

    println!("[cache]");
    println!("  capacity = {}", config.cache.capacity);
    println!();

    println!("[runtime]");
    println!("  intra_threads = {}", config.runtime.intra_threads);
    println!();

    println!("[storage]");
    println!("  identity_dir = {:?}", config.storage.identity_dir);
    println!("  media_dir = {:?}", config.storage.media_dir);
    println!("  checkin_log = {:?}", config.storage.checkin_log);
    println!();

    println!("[debug]");
    println!("  save_visualizations = {}", config.debug.save_visualizations);
    println!("  output_dir = {:?}", config.debug.output_dir);

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verify_with_hints() {
        let cli = Cli::try_parse_from([
            "facecheck", "verify", "alice", "face.jpg", "--lat", "-33.9", "--lon", "18.4", "--site",
            "shop-1",
        ])
        .unwrap();

        match cli.command {
            Commands::Verify {
                identity,
                lat,
                lon,
                site,
                base64,
                ..
            } => {
                assert_eq!(identity, "alice");
                assert_eq!(lat, Some(-33.9));
                assert_eq!(lon, Some(18.4));
                assert_eq!(site.as_deref(), Some("shop-1"));
                assert!(!base64);
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["facecheck", "list", "--config", "/tmp/facecheck.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/facecheck.toml")));
    }

    #[test]
    fn test_exit_codes_follow_status_class() {
        use facecheck_core::outcome::VerifyStage;
        use facecheck_core::{Failure, FailureKind};

        let failure =
            |kind| Envelope::failure(&Failure::new(kind, VerifyStage::Fetching, "x"));

        assert_eq!(exit_status(&failure(FailureKind::IdentityNotFound)), 4);
        assert_eq!(exit_status(&failure(FailureKind::Internal)), 5);
        assert_eq!(exit_status(&failure(FailureKind::FaceMismatch)), 1);
        assert_eq!(exit_status(&failure(FailureKind::NoFaceDetected)), 1);
    }

    #[test]
    fn test_read_image_modes() {
        let path = std::env::temp_dir().join(format!("facecheck-cli-{}.b64", std::process::id()));
        std::fs::write(&path, "aGVsbG8=").unwrap();

        assert!(matches!(read_image(&path, true).unwrap(), RawImage::Base64(t) if t == "aGVsbG8="));
        assert!(matches!(read_image(&path, false).unwrap(), RawImage::Bytes(b) if b == b"aGVsbG8="));
        std::fs::remove_file(&path).unwrap();
    }
}
