pub mod charges;
pub mod job;
pub mod limits;
pub mod structure;

// 重新导出核心类型
pub use charges::{
    CalculationOptions, ChargeRequest, ChargesPayload, MoleculeCharges, SuitableMethod,
};
pub use job::{JobId, JobOutcome, JobRecord, JobState, JobSummary};
pub use limits::{QuotaSnapshot, RemovalPolicy, StructureFileInfo, UploadOutcome};
pub use structure::{StructureFormat, StructureInfo, StructureRecord};
