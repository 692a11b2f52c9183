//! Scan pipeline services

pub mod alert_dispatcher;
pub mod consent_gate;
pub mod credentials;
pub mod digest_aggregator;
pub mod poll_worker;
pub mod quota_ledger;
pub mod resolution_client;
pub mod scan_orchestrator;
pub mod threshold_resolver;

pub use alert_dispatcher::{AlertDispatcher, ChannelKind, ChannelOutcome, DispatchReport};
pub use consent_gate::ConsentGate;
pub use credentials::{Credential, CredentialProvider, CredentialSource};
pub use digest_aggregator::{fingerprint, DigestAggregator, DigestCandidate, DigestRunReport};
pub use poll_worker::PollWorker;
pub use quota_ledger::{QuotaLedger, QuotaReservation};
pub use resolution_client::{
    PollBackoff, ResolutionClient, ResolutionError, ResolutionResult, Resolver, Submission,
};
pub use scan_orchestrator::{ScanOrchestrator, ScanOutcome, ScanRequest};
pub use threshold_resolver::{GlobalThresholdCache, ThresholdResolver};
