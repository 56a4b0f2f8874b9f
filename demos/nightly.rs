//! Nightly load driven by a YAML config.
//!
//! ```text
//! cargo run --example nightly -- dimload.yaml            # schedule from config
//! cargo run --example nightly -- dimload.yaml --once     # one manual run
//! cargo run --example nightly -- dimload.yaml --recover  # replay the last partial run
//! ```
use chrono::NaiveDate;
use dimload::core::{logging, metrics};
use dimload::{load_config, DimloadFlow, Orchestrator, RecoveryRequest, TriggerRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| "dimload.yaml".to_string());
    let flags: Vec<String> = args.collect();
    let config = load_config(&path)?;

    if flags.iter().any(|f| f == "--recover") {
        let orchestrator = Orchestrator::from_config(&config)?;
        let response = orchestrator.recover(RecoveryRequest::default()).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if flags.iter().any(|f| f == "--once") {
        let start_date = flags
            .iter()
            .position(|f| f == "--start")
            .and_then(|i| flags.get(i + 1))
            .map(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .transpose()?;

        let orchestrator = Orchestrator::from_config(&config)?;
        let response = orchestrator
            .trigger(TriggerRequest { start_date, ..TriggerRequest::default() })
            .await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        println!("{}", metrics::gather_text());
        return Ok(());
    }

    DimloadFlow::from_config(&config)?.run().await?;
    Ok(())
}
