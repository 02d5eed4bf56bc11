//! Job direction, per-direction status sequences, and the service selector.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use portage_core::DomainError;

/// Whether a job moves data in or out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Import,
    Export,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Import => "import",
            Direction::Export => "export",
        }
    }
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(Direction::Import),
            "export" => Ok(Direction::Export),
            other => Err(DomainError::validation(format!("unknown direction '{other}'"))),
        }
    }
}

/// Import lifecycle, in sequence order.
///
/// `PreProcessing` ranks after `Processing`: a deferred job jumps from
/// `Mapping` straight to `PreProcessing`, an inline job passes through
/// `Processing`, and both move forward from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Uploading,
    Mapping,
    Processing,
    PreProcessing,
    Imported,
}

/// Export lifecycle, in sequence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Selecting,
    Processing,
    PreProcessing,
    Exported,
}

impl ImportStatus {
    pub const SEQUENCE: [ImportStatus; 5] = [
        ImportStatus::Uploading,
        ImportStatus::Mapping,
        ImportStatus::Processing,
        ImportStatus::PreProcessing,
        ImportStatus::Imported,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::Uploading => "uploading",
            ImportStatus::Mapping => "mapping",
            ImportStatus::Processing => "processing",
            ImportStatus::PreProcessing => "pre_processing",
            ImportStatus::Imported => "imported",
        }
    }
}

impl ExportStatus {
    pub const SEQUENCE: [ExportStatus; 4] = [
        ExportStatus::Selecting,
        ExportStatus::Processing,
        ExportStatus::PreProcessing,
        ExportStatus::Exported,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExportStatus::Selecting => "selecting",
            ExportStatus::Processing => "processing",
            ExportStatus::PreProcessing => "pre_processing",
            ExportStatus::Exported => "exported",
        }
    }
}

/// Status of a job, tagged by its direction.
///
/// The variant fixes the direction for the lifetime of the job: transitions
/// only ever replace the inner status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", content = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Import(ImportStatus),
    Export(ExportStatus),
}

impl JobStatus {
    /// First status of a freshly created job.
    pub fn initial(direction: Direction) -> Self {
        match direction {
            Direction::Import => JobStatus::Import(ImportStatus::Uploading),
            Direction::Export => JobStatus::Export(ExportStatus::Selecting),
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            JobStatus::Import(_) => Direction::Import,
            JobStatus::Export(_) => Direction::Export,
        }
    }

    /// Position in the direction's sequence (0-based).
    pub fn rank(self) -> usize {
        match self {
            JobStatus::Import(s) => s as usize,
            JobStatus::Export(s) => s as usize,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Import(s) => s.as_str(),
            JobStatus::Export(s) => s.as_str(),
        }
    }

    /// Queued or running heavy processing.
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            JobStatus::Import(ImportStatus::PreProcessing | ImportStatus::Processing)
                | JobStatus::Export(ExportStatus::PreProcessing | ExportStatus::Processing)
        )
    }

    /// Reached the direction's terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Import(ImportStatus::Imported) | JobStatus::Export(ExportStatus::Exported)
        )
    }

    /// Precedes `pre_processing` in the direction's sequence.
    pub fn needs_data(self) -> bool {
        match self {
            JobStatus::Import(s) => s < ImportStatus::PreProcessing,
            JobStatus::Export(s) => s < ExportStatus::PreProcessing,
        }
    }

    /// Parse a persisted `(direction, status)` pair.
    pub fn parse(direction: Direction, status: &str) -> Result<Self, DomainError> {
        let parsed = match direction {
            Direction::Import => ImportStatus::SEQUENCE
                .into_iter()
                .find(|s| s.as_str() == status)
                .map(JobStatus::Import),
            Direction::Export => ExportStatus::SEQUENCE
                .into_iter()
                .find(|s| s.as_str() == status)
                .map(JobStatus::Export),
        };
        parsed.ok_or_else(|| {
            DomainError::validation(format!("'{status}' is not an {direction} status"))
        })
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Foreign service whose payload format a job speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    #[default]
    Teambox,
    Basecamp,
}

impl Service {
    pub fn as_str(self) -> &'static str {
        match self {
            Service::Teambox => "teambox",
            Service::Basecamp => "basecamp",
        }
    }
}

impl core::fmt::Display for Service {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "teambox" => Ok(Service::Teambox),
            "basecamp" => Ok(Service::Basecamp),
            other => Err(DomainError::validation(format!("Unknown service {other}"))),
        }
    }
}

/// The service a job was created with, as requested.
///
/// Unrecognized names are kept verbatim so validation can report them; they
/// can never be dispatched to a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestedService {
    Known(Service),
    Unrecognized(String),
}

impl RequestedService {
    /// Resolve a requested name, defaulting to `teambox` when unset.
    pub fn resolve(name: Option<&str>) -> Self {
        match name {
            None => RequestedService::Known(Service::default()),
            Some(name) => name
                .parse()
                .map(RequestedService::Known)
                .unwrap_or_else(|_| RequestedService::Unrecognized(name.to_string())),
        }
    }

    pub fn known(&self) -> Result<Service, DomainError> {
        match self {
            RequestedService::Known(service) => Ok(*service),
            RequestedService::Unrecognized(name) => {
                Err(DomainError::validation(format!("Unknown service {name}")))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RequestedService::Known(service) => service.as_str(),
            RequestedService::Unrecognized(name) => name,
        }
    }
}

impl Default for RequestedService {
    fn default() -> Self {
        RequestedService::Known(Service::default())
    }
}

impl From<Service> for RequestedService {
    fn from(value: Service) -> Self {
        RequestedService::Known(value)
    }
}

impl From<String> for RequestedService {
    fn from(value: String) -> Self {
        RequestedService::resolve(Some(&value))
    }
}

impl From<RequestedService> for String {
    fn from(value: RequestedService) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_rank_in_declared_order() {
        let ranks: Vec<_> = ImportStatus::SEQUENCE
            .into_iter()
            .map(|s| JobStatus::Import(s).rank())
            .collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);

        assert!(ExportStatus::Selecting < ExportStatus::Processing);
        assert!(ExportStatus::Processing < ExportStatus::PreProcessing);
        assert!(ExportStatus::PreProcessing < ExportStatus::Exported);
    }

    #[test]
    fn processing_covers_both_processing_states() {
        assert!(JobStatus::Import(ImportStatus::PreProcessing).is_processing());
        assert!(JobStatus::Import(ImportStatus::Processing).is_processing());
        assert!(!JobStatus::Import(ImportStatus::Mapping).is_processing());
        assert!(JobStatus::Export(ExportStatus::PreProcessing).is_processing());
        assert!(!JobStatus::Export(ExportStatus::Exported).is_processing());
    }

    #[test]
    fn needs_data_stops_at_pre_processing() {
        assert!(JobStatus::Import(ImportStatus::Uploading).needs_data());
        assert!(JobStatus::Import(ImportStatus::Mapping).needs_data());
        assert!(!JobStatus::Import(ImportStatus::PreProcessing).needs_data());
        assert!(JobStatus::Export(ExportStatus::Selecting).needs_data());
        assert!(!JobStatus::Export(ExportStatus::Exported).needs_data());
    }

    #[test]
    fn parse_rejects_status_of_the_other_direction() {
        assert_eq!(
            JobStatus::parse(Direction::Export, "exported").unwrap(),
            JobStatus::Export(ExportStatus::Exported)
        );
        assert!(JobStatus::parse(Direction::Export, "mapping").is_err());
        assert!(JobStatus::parse(Direction::Import, "selecting").is_err());
    }

    #[test]
    fn status_serializes_tagged_by_direction() {
        let json = serde_json::to_value(JobStatus::Import(ImportStatus::PreProcessing)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"direction": "import", "status": "pre_processing"})
        );
    }

    #[test]
    fn requested_service_defaults_to_teambox() {
        assert_eq!(
            RequestedService::resolve(None),
            RequestedService::Known(Service::Teambox)
        );
        assert_eq!(
            RequestedService::resolve(Some("basecamp")),
            RequestedService::Known(Service::Basecamp)
        );
        assert_eq!(Service::default(), Service::Teambox);
        assert_eq!(RequestedService::default(), RequestedService::Known(Service::Teambox));
    }

    #[test]
    fn unrecognized_service_keeps_its_name() {
        let requested = RequestedService::resolve(Some("acme"));
        assert_eq!(requested.as_str(), "acme");
        assert!(requested.known().is_err());

        let json = serde_json::to_string(&requested).unwrap();
        assert_eq!(json, "\"acme\"");
    }
}
