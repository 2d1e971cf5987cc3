use clap::Parser;
use rohdescope::domain::model::ModelSelection;
use rohdescope::utils::error::{ErrorSeverity, ScopeError};
use rohdescope::utils::{logger, validation::Validate};
use rohdescope::{
    AcquisitionEngine, CliConfig, LocalStorage, ScopeCommand, ScopeConfig, ScopeConnection,
    Vxi11Connector, Vxi11Scope,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting rohdescope {}", rohdescope::VERSION);
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let config = match cli.resolve().and_then(|config| config.validate().map(|_| config)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Configuration validation failed: {}", e);
            tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(1);
        }
    };

    if let Err(e) = execute(&cli.command, config).await {
        tracing::error!(
            "❌ Command failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 Suggestion: {}", e.recovery_suggestion());

        // 根據錯誤嚴重程度決定退出碼
        let exit_code = match e.severity() {
            ErrorSeverity::Low => 4,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        };
        std::process::exit(exit_code);
    }
}

async fn open_scope(config: &ScopeConfig) -> Result<Vxi11Scope, ScopeError> {
    let connector = Vxi11Connector::new(config.scope.host.clone(), config.vxi11_options());
    let settings = config.connection_settings();

    let scope = match config.model_selection()? {
        ModelSelection::Auto => ScopeConnection::auto_detect(connector, settings).await?,
        ModelSelection::Fixed(model) => ScopeConnection::new(model, connector, settings),
    };
    scope.connect().await?;
    Ok(scope)
}

async fn acquire(scope: Arc<Vxi11Scope>, config: ScopeConfig) -> Result<String, ScopeError> {
    let storage = LocalStorage::new(config.output.path.clone());
    let engine = AcquisitionEngine::new(scope, storage, config);
    let report = engine.run().await?;

    tracing::info!("✅ Acquisition completed successfully!");
    let mut message = format!(
        "✅ {} acquisition(s) saved to: {}",
        report.summary.acquisitions.len(),
        report.output_path
    );
    if report.summary.skipped > 0 {
        message.push_str(&format!(
            "\n⚠️  {} acquisition(s) returned no data",
            report.summary.skipped
        ));
    }
    Ok(message)
}

async fn execute(command: &ScopeCommand, config: ScopeConfig) -> Result<(), ScopeError> {
    tracing::info!("📡 Connecting to {}", config.scope.host);
    let scope = Arc::new(open_scope(&config).await?);

    let result = match command {
        ScopeCommand::Idn => scope.get_identifier().await,
        ScopeCommand::Status => scope.get_status().await,
        ScopeCommand::Send { command } => scope.issue_command(command).await,
        ScopeCommand::Reset => scope.issue_reset().await.map(|_| "Reset issued.".to_string()),
        ScopeCommand::Autoset => scope
            .issue_autoset()
            .await
            .map(|_| "Autoset issued.".to_string()),
        ScopeCommand::Run => scope.issue_run().await.map(|_| "Acquisition running.".to_string()),
        ScopeCommand::Stop => scope.issue_stop().await.map(|_| "Acquisition stopped.".to_string()),
        ScopeCommand::Clear => scope.device_clear().await.map(|_| "Device cleared.".to_string()),
        ScopeCommand::Acquire { .. } => acquire(Arc::clone(&scope), config).await,
    };

    // 無論成功與否都釋放連結
    let message = scope.disconnect_after(result).await?;
    println!("{}", message);
    Ok(())
}
