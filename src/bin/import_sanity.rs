//! Smoke run of the import engine against an in-memory store and a stub
//! record service. Useful for eyeballing logs and event flow without a
//! database or a downstream service.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use bulk_importer::domain::job::{FileReference, JobConfig};
use bulk_importer::domain::services::{
    RecordRequest, RecordResponse, RecordService, RecordServiceError,
};
use bulk_importer::import_engine::validator::{FieldRule, FieldType};
use bulk_importer::infrastructure::{
    init_logging, ImporterConfig, LocalSourceStorage, MemoryJobStore,
};
use bulk_importer::ImporterService;

struct StubRecords;

#[async_trait]
impl RecordService for StubRecords {
    async fn submit(
        &self,
        request: &RecordRequest,
    ) -> Result<RecordResponse, RecordServiceError> {
        Ok(RecordResponse::Created {
            record_id: format!("rec-{}", request.ordinal),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let workdir = std::env::temp_dir().join("bulk-importer-sanity");
    std::fs::create_dir_all(&workdir)?;

    let mut config = ImporterConfig::default();
    config.logging.dir = workdir.join("logs");
    init_logging(&config.logging)?;

    std::fs::write(
        workdir.join("products.csv"),
        "sku,name,price\nA-100,Widget,9.99\nA-101,Gadget,14.50\nA-102,Sprocket,3.25\n",
    )?;

    let service = ImporterService::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(StubRecords),
        Arc::new(LocalSourceStorage::new(&workdir)),
        config,
    );

    let job_config = JobConfig {
        rules: vec![
            FieldRule {
                field: "sku".to_string(),
                required: true,
                field_type: FieldType::Text,
                pattern: Some("^[A-Z]-[0-9]+$".to_string()),
            },
            FieldRule {
                field: "price".to_string(),
                required: true,
                field_type: FieldType::Float,
                pattern: None,
            },
        ],
        ..JobConfig::default()
    };

    let job = service
        .create_job(
            "sanity products",
            FileReference::new("products.csv"),
            job_config,
            Some("sanity".to_string()),
        )
        .await?;

    service.start(job.id).await?;

    loop {
        let status = service.job_status(job.id).await?;
        let snapshot = service.progress(job.id).await?;
        println!(
            "state={} {}/{} done ({:.0}%)",
            status.state,
            snapshot.succeeded + snapshot.failed + snapshot.skipped,
            snapshot.total,
            snapshot.percent
        );
        if status.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for unit in service.list_units(job.id).await? {
        println!(
            "unit {} -> {} (record: {:?})",
            unit.ordinal, unit.state, unit.record_id
        );
    }

    service.shutdown().await;
    Ok(())
}
