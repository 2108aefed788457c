mod app;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use audit_trail_s3::config::{
    AUDITLOG_GENERATE_CORRELATION_ID, AUDITLOG_S3_BUCKET, AUDITLOG_S3_DIRECTORY,
    AUDITLOG_S3_ENDPOINT, AUDITLOG_S3_REGION, DEFAULT_BUCKET, DEFAULT_DIRECTORY, DEFAULT_REGION,
};
use audit_trail_s3::{AuditLogger, AuditOptions};
use clap::Args;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Args)]
pub struct ServeCommand {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1:8000", env = "AUDIT_TRAIL_ADDRESS")]
    pub address: String,

    /// Bucket receiving audit records
    #[arg(long, default_value = DEFAULT_BUCKET, env = AUDITLOG_S3_BUCKET)]
    pub s3_bucket: String,

    /// Key prefix for audit records
    #[arg(long, default_value = DEFAULT_DIRECTORY, env = AUDITLOG_S3_DIRECTORY)]
    pub s3_directory: String,

    /// Region of the audit bucket
    #[arg(long, default_value = DEFAULT_REGION, env = AUDITLOG_S3_REGION)]
    pub s3_region: String,

    /// Custom S3 endpoint (MinIO, LocalStack)
    #[arg(long, env = AUDITLOG_S3_ENDPOINT)]
    pub s3_endpoint: Option<String>,

    /// Generate a correlation id for requests that carry none
    #[arg(long, env = AUDITLOG_GENERATE_CORRELATION_ID)]
    pub generate_correlation_id: bool,

    /// Seconds to wait for queued audit records on shutdown
    #[arg(long, default_value_t = 10, env = "AUDITLOG_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout_secs: u64,
}

impl ServeCommand {
    fn audit_options(&self) -> AuditOptions {
        let mut options = AuditOptions::new(&self.s3_bucket, &self.s3_directory, &self.s3_region)
            .with_generated_correlation_id(self.generate_correlation_id);
        if let Some(endpoint) = self.s3_endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            options = options.with_endpoint(endpoint);
        }
        options
    }

    pub fn execute(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run())
    }

    async fn run(self) -> anyhow::Result<()> {
        let options = self.audit_options();
        debug!("Audit options: {:?}", options);

        let logger = Arc::new(
            AuditLogger::from_options(options.clone())
                .await
                .context("Failed to configure audit logger")?,
        );
        logger.start()?;

        let app = app::build_router(Arc::clone(&logger), options.generate_correlation_id);

        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind {}", self.address))?;
        info!("Audit trail server listening on {}", self.address);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown::shutdown_signal())
            .await;

        let timeout = Duration::from_secs(self.shutdown_timeout_secs);
        let dropped = logger.stop_with_timeout(timeout).await;
        if dropped > 0 {
            warn!("{} audit records were not written before shutdown", dropped);
        }

        served?;
        info!("Audit trail server exited");
        Ok(())
    }
}
