//! DIMSE status vocabulary shared by the query and retrieve roles.
//!
//! Codes follow PS3.7 annex C and the service-specific
//! tables of PS3.4 annex C (Query/Retrieve service class).
use std::fmt;

/// The status of a C-FIND or C-MOVE response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// Matches are continuing (FF00)
    Pending,
    /// Matches are continuing,
    /// but one or more optional keys were not supported (FF01)
    PendingWarning,
    /// Terminated due to a cancel request (FE00)
    Cancel,
    /// Operation complete with no failures (0000)
    Success,
    /// Operation complete with warnings,
    /// e.g. sub-operations with failures (B000)
    Warning(u16),
    /// The operation failed
    Failure(FailureKind),
}

/// The kind of failure reported in a terminal response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Refused: out of resources (A700)
    OutOfResources,
    /// Refused: out of resources, unable to calculate number of matches (A701)
    OutOfResourcesMatches,
    /// Refused: out of resources, unable to perform sub-operations (A702)
    OutOfResourcesSubOperations,
    /// Refused: move destination unknown (A801)
    MoveDestinationUnknown,
    /// Identifier does not match SOP class (A900)
    IdentifierDoesNotMatchSopClass,
    /// Unable to process (C000)
    UnableToProcess,
    /// SOP class not supported (0122)
    SopClassNotSupported,
    /// Processing failure (0110)
    ProcessingFailure,
    /// Any other failure code
    Other(u16),
}

impl FailureKind {
    /// The status code of this failure kind.
    pub fn code(self) -> u16 {
        match self {
            FailureKind::OutOfResources => 0xA700,
            FailureKind::OutOfResourcesMatches => 0xA701,
            FailureKind::OutOfResourcesSubOperations => 0xA702,
            FailureKind::MoveDestinationUnknown => 0xA801,
            FailureKind::IdentifierDoesNotMatchSopClass => 0xA900,
            FailureKind::UnableToProcess => 0xC000,
            FailureKind::SopClassNotSupported => 0x0122,
            FailureKind::ProcessingFailure => 0x0110,
            FailureKind::Other(code) => code,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            0xA700 => FailureKind::OutOfResources,
            0xA701 => FailureKind::OutOfResourcesMatches,
            0xA702 => FailureKind::OutOfResourcesSubOperations,
            0xA801 => FailureKind::MoveDestinationUnknown,
            0xA900 => FailureKind::IdentifierDoesNotMatchSopClass,
            0xC000 => FailureKind::UnableToProcess,
            0x0122 => FailureKind::SopClassNotSupported,
            0x0110 => FailureKind::ProcessingFailure,
            other => FailureKind::Other(other),
        }
    }
}

impl Status {
    /// The status code to place in the _Status_ command attribute.
    pub fn code(self) -> u16 {
        match self {
            Status::Pending => 0xFF00,
            Status::PendingWarning => 0xFF01,
            Status::Cancel => 0xFE00,
            Status::Success => 0x0000,
            Status::Warning(code) => code,
            Status::Failure(kind) => kind.code(),
        }
    }

    /// Interpret a status code received from a peer.
    ///
    /// Every code maps to some status:
    /// codes which are neither success, pending, cancel nor a known warning
    /// are treated as failures.
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Status::Success,
            0xFF00 => Status::Pending,
            0xFF01 => Status::PendingWarning,
            0xFE00 => Status::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Status::Warning(code),
            _ => Status::Failure(FailureKind::from_code(code)),
        }
    }

    /// Whether more responses are to follow this one.
    pub fn is_pending(self) -> bool {
        matches!(self, Status::Pending | Status::PendingWarning)
    }

    /// Whether this status terminates the message exchange.
    pub fn is_final(self) -> bool {
        !self.is_pending()
    }

    /// Whether this status reports a failure.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failure(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => f.write_str("Pending"),
            Status::PendingWarning => {
                f.write_str("Pending (one or more optional keys not supported)")
            }
            Status::Cancel => f.write_str("Sub-operations terminated due to cancel indication"),
            Status::Success => f.write_str("Success"),
            Status::Warning(0xB000) => {
                f.write_str("Sub-operations complete with one or more failures")
            }
            Status::Warning(code) => write!(f, "Warning (status code {:04X}H)", code),
            Status::Failure(kind) => fmt::Display::fmt(kind, f),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::OutOfResources => f.write_str("Out of resources"),
            FailureKind::OutOfResourcesMatches => {
                f.write_str("Out of resources (number of matches)")
            }
            FailureKind::OutOfResourcesSubOperations => {
                f.write_str("Out of resources (sub-operations)")
            }
            FailureKind::MoveDestinationUnknown => f.write_str("Move destination unknown"),
            FailureKind::IdentifierDoesNotMatchSopClass => {
                f.write_str("Identifier does not match SOP class")
            }
            FailureKind::UnableToProcess => f.write_str("Unable to process"),
            FailureKind::SopClassNotSupported => f.write_str("SOP class not supported"),
            FailureKind::ProcessingFailure => f.write_str("Processing failure"),
            FailureKind::Other(code) => write!(f, "Failure (status code {:04X}H)", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureKind, Status};

    #[test]
    fn known_codes() {
        assert_eq!(Status::Pending.code(), 0xFF00);
        assert_eq!(Status::PendingWarning.code(), 0xFF01);
        assert_eq!(Status::Cancel.code(), 0xFE00);
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(
            Status::Failure(FailureKind::UnableToProcess).code(),
            0xC000
        );
    }

    #[test]
    fn classify_peer_codes() {
        assert_eq!(Status::from_code(0xFF01), Status::PendingWarning);
        assert_eq!(Status::from_code(0xB000), Status::Warning(0xB000));
        assert_eq!(
            Status::from_code(0xA801),
            Status::Failure(FailureKind::MoveDestinationUnknown)
        );
        assert_eq!(
            Status::from_code(0xC123),
            Status::Failure(FailureKind::Other(0xC123))
        );
        assert!(Status::from_code(0xFF00).is_pending());
        assert!(Status::from_code(0xFE00).is_final());
        assert!(!Status::from_code(0xFE00).is_failure());
    }
}
