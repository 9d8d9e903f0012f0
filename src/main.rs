use async_trait::async_trait;
use clap::Parser;
use receipt_scan::config::Config;
use receipt_scan::error::ScanError;
use receipt_scan::llm_extract::{HttpTransport, ReceiptExtractor};
use receipt_scan::scan::{ScanOrchestrator, TextRecognizer};
use receipt_scan::store::{ReceiptStore, SqliteStore};
use receipt_scan::transcript::RecognizedText;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Turn a photographed paper receipt into a structured, validated purchase
/// record.
#[derive(Parser)]
#[command(name = "receipt_scan")]
struct Cli {
    /// Path to the captured receipt photo
    #[arg(long)]
    image: PathBuf,

    /// Path to the recognition output for the photo: a JSON dump of text
    /// fragments with normalized boxes and the capture orientation
    #[arg(long)]
    fragments: PathBuf,

    /// Path to the TOML config file
    #[arg(long, default_value = ".config/receipt_scan.toml")]
    config: PathBuf,

    /// Assemble and print the receipt without persisting it
    #[arg(long)]
    no_store: bool,
}

/// Adapts a pre-recorded recognition dump to the recognizer interface. The
/// image bytes are ignored; the dump already belongs to this capture.
struct FileRecognizer {
    page: RecognizedText,
}

#[async_trait]
impl TextRecognizer for FileRecognizer {
    async fn recognize(&self, _image: &[u8]) -> Result<RecognizedText, ScanError> {
        Ok(self.page.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter("info")
        .init();

    let cli = Cli::parse();

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(error = %err, "Could not read config file, using defaults");
            Config::default()
        }
    };

    let image = fs::read(&cli.image)?;
    let page: RecognizedText = serde_json::from_str(&fs::read_to_string(&cli.fragments)?)?;
    info!(
        fragments = page.fragments.len(),
        orientation = page.orientation,
        "Recognition dump loaded"
    );

    let transport = HttpTransport::from_config(&cfg.llm)?;
    let extractor = ReceiptExtractor::new(Arc::new(transport), &cfg.llm);
    let store: Arc<dyn ReceiptStore> = if cli.no_store {
        Arc::new(SqliteStore::in_memory()?)
    } else {
        Arc::new(SqliteStore::new(&cfg.db_path)?)
    };

    let orchestrator = ScanOrchestrator::new(
        Arc::new(FileRecognizer { page }),
        Arc::new(extractor),
        store,
        cfg.debug_overlay,
    );

    match orchestrator.scan(image).await {
        Ok(outcome) => {
            for warning in &outcome.warnings {
                warn!(%warning, "Assembly warning");
            }
            info!(
                id = %outcome.receipt.id,
                store = %outcome.receipt.store_name,
                items = outcome.receipt.items.len(),
                total = outcome.receipt.total,
                currency = %outcome.receipt.currency,
                "Receipt assembled"
            );
            println!("{}", serde_json::to_string_pretty(&outcome.receipt)?);
            Ok(())
        }
        Err(err) => {
            error!(kind = err.kind(), error = %err, "Scan failed");
            Err(err.into())
        }
    }
}
