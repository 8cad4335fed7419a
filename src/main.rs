// src/main.rs

use std::str::FromStr;

use scanstage::config::Config;
use scanstage::services::scan::ScanService;
use scanstage::state::AppState;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load configuration from environment (and .env if present)
    let config = Config::from_env();

    let file_appender = tracing_appender::rolling::daily("logs", "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::new(&config.rust_log);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    // Initialize Tracing (Logging)
    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Open the staging database
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .expect("DATABASE_URL is not a valid sqlite URL")
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .expect("Failed to open the staging database");

    tracing::info!("Database connected...");

    // Run Migrations Automatically
    tracing::info!("Running migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Migrations applied successfully.");

    let state = AppState {
        pool,
        config: config.clone(),
    };

    // Print the staging status overview, one row per bundle.
    let scanner = ScanService::new(state);
    match scanner.staging_status_summary().await {
        Ok(summary) => {
            println!(
                "{:<20} {:>4} {:>12} {:>8} {:>6} {:>14} {:>8} {:>6} {:>16} {:>6}  {}",
                "Bundle name",
                "Id",
                "Total Pages",
                "Unknowns",
                "Knowns",
                "Extra (w data)",
                "Discards",
                "Error",
                "QR read",
                "Pushed",
                "Uploaded by"
            );
            for row in summary {
                println!(
                    "{:<20} {:>4} {:>12} {:>8} {:>6} {:>14} {:>8} {:>6} {:>16} {:>6}  {}",
                    row.slug,
                    row.id,
                    row.total_pages,
                    row.n_unknowns,
                    row.n_knowns,
                    row.n_extras_with_data,
                    row.n_discards,
                    row.n_errors,
                    row.qr_read,
                    row.pushed,
                    row.uploaded_by
                );
            }
        }
        Err(e) => {
            tracing::error!("Failed to read staging status: {:?}", e);
            std::process::exit(1);
        }
    }
}
