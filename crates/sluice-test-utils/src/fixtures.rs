use std::path::{Path, PathBuf};

use sluice_core::config::{
    LoadConfig, PipelineConfig, PipelineSection, ProjectConfig, SensorConfig, SourceConfig,
    TransformConfig, WarehouseConfig,
};
use sluice_core::types::JoinPolicy;

pub const SAMPLE_BUCKET: &str = "bkt-src-global-health-data";
pub const SAMPLE_OBJECT: &str = "global_health_data.csv";

/// A slice of the global health dataset: three countries, mixed vaccine
/// availability, one jagged row.
pub const SAMPLE_CSV: &str = "\
Country,Year,Disease Name,Disease Category,Prevalence Rate,Incidence Rate,Availability of Vaccines Treatment
USA,2019,Malaria,Infectious,0.5,0.1,False
USA,2020,Diabetes,Chronic,9.8,1.2,True
USA,2021,Dengue,Infectious,1.25,0.4,False
India,2019,Malaria,Infectious,12.5,3.3,False
India,2020,Tuberculosis,Infectious,18.1,2.9,True
Germany,2020,Influenza,Infectious,3.4,2.2,False
Germany,2021,Asthma,Respiratory
";

/// Pipeline config with test-friendly defaults and the given partitions.
pub fn test_config(partitions: &[&str]) -> PipelineConfig {
    PipelineConfig {
        pipeline: PipelineSection {
            name: "test_pipeline".to_string(),
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            retries: 1,
            join_policy: JoinPolicy::Strict,
        },
        source: SourceConfig {
            bucket: SAMPLE_BUCKET.to_string(),
            object: SAMPLE_OBJECT.to_string(),
        },
        sensor: SensorConfig::default(),
        load: LoadConfig::default(),
        transform: TransformConfig::default(),
        project: ProjectConfig::default(),
        warehouse: WarehouseConfig::default(),
    }
}

/// Write `SAMPLE_CSV` under `<root>/<bucket>/<object>`.
pub fn write_sample_source(root: &Path) -> std::io::Result<PathBuf> {
    let dir = root.join(SAMPLE_BUCKET);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(SAMPLE_OBJECT);
    std::fs::write(&path, SAMPLE_CSV)?;
    Ok(path)
}
