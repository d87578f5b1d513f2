pub mod calculator;
pub mod quota;
pub mod reaper;
pub mod scheduler;
pub mod upstream;

pub use calculator::{ChargeCalculator, CommandCalculator, MethodCandidates};
pub use quota::{QuotaPolicy, QuotaTracker, UsageSnapshot};
pub use reaper::{ExpiryReaper, SweepReport};
pub use scheduler::BackgroundScheduler;
pub use upstream::{HttpStructureFetcher, RemoteSource, StructureFetcher};
